//! Per-recipient serialization of outbound sends.
//!
//! Runs and arbitrations may target the same phone concurrently; this wrapper
//! keeps at most one in-flight gateway call per recipient.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use crate::channels::OutboundSender;
use crate::error::ChannelError;

pub struct SerializedSender<S> {
    inner: S,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl<S: OutboundSender> SerializedSender<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, phone: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Drop locks nobody holds any more
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(phone.to_string()).or_default())
    }
}

#[async_trait]
impl<S: OutboundSender> OutboundSender for SerializedSender<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send(&self, phone: &str, text: &str) -> Result<(), ChannelError> {
        let lock = self.lock_for(phone);
        let _guard = lock.lock().await;
        self.inner.send(phone, text).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct SlowSender {
        in_flight: AtomicUsize,
        max_seen: AtomicUsize,
    }

    #[async_trait]
    impl OutboundSender for SlowSender {
        fn name(&self) -> &str {
            "slow"
        }

        async fn send(&self, _phone: &str, _text: &str) -> Result<(), ChannelError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn same_phone_never_overlaps() {
        let sender = Arc::new(SerializedSender::new(SlowSender::default()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let sender = Arc::clone(&sender);
            handles.push(tokio::spawn(async move {
                sender.send("5511988887777", &format!("msg {i}")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(sender.inner.max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_phones_run_concurrently() {
        let sender = Arc::new(SerializedSender::new(SlowSender::default()));
        let a = {
            let sender = Arc::clone(&sender);
            tokio::spawn(async move { sender.send("5511900000001", "a").await })
        };
        let b = {
            let sender = Arc::clone(&sender);
            tokio::spawn(async move { sender.send("5511900000002", "b").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(sender.inner.max_seen.load(Ordering::SeqCst), 2);
    }
}
