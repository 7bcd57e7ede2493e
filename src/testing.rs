//! Shared test doubles.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::channels::OutboundSender;
use crate::clock::ManualClock;
use crate::config::RuntimeSettings;
use crate::error::{ChannelError, LlmError};
use crate::events::EventBus;
use crate::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use crate::store::{Database, LibSqlBackend};

/// Records every send; fails for phones in `failing`.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(String, String)>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make sends to `phone` (gateway form) fail.
    pub fn fail_for(&self, phone: &str) {
        self.failing.lock().unwrap().insert(phone.to_string());
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn texts_to(&self, phone: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(p, _)| p == phone)
            .map(|(_, t)| t)
            .collect()
    }
}

#[async_trait]
impl OutboundSender for RecordingSender {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, phone: &str, text: &str) -> Result<(), ChannelError> {
        if self.failing.lock().unwrap().contains(phone) {
            return Err(ChannelError::SendFailed {
                name: "recording".into(),
                reason: "gateway said no".into(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((phone.to_string(), text.to_string()));
        Ok(())
    }
}

/// What the stub LLM does on each call.
#[derive(Clone)]
pub enum StubReply {
    Text(String),
    RateLimited,
    Quota,
    Broken,
}

pub struct StubLlm {
    reply: Mutex<StubReply>,
    calls: AtomicUsize,
    last_request: Mutex<Option<CompletionRequest>>,
}

impl StubLlm {
    pub fn replying(text: &str) -> Arc<Self> {
        Self::with(StubReply::Text(text.to_string()))
    }

    pub fn with(reply: StubReply) -> Arc<Self> {
        Arc::new(Self {
            reply: Mutex::new(reply),
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request);
        let reply = self.reply.lock().unwrap().clone();
        match reply {
            StubReply::Text(content) => Ok(CompletionResponse {
                content,
                input_tokens: 10,
                output_tokens: 5,
                finish_reason: FinishReason::Stop,
            }),
            StubReply::RateLimited => Err(LlmError::RateLimited {
                provider: "stub".into(),
                retry_after: None,
            }),
            StubReply::Quota => Err(LlmError::QuotaExceeded {
                provider: "stub".into(),
                reason: "out of credits".into(),
            }),
            StubReply::Broken => Err(LlmError::RequestFailed {
                provider: "stub".into(),
                reason: "connection reset".into(),
            }),
        }
    }
}

/// In-memory store, settings, manual clock, recording sender and event bus.
pub struct Harness {
    /// Same database as `store`, for tests that tamper with the schema.
    pub backend: Arc<LibSqlBackend>,
    pub store: Arc<dyn Database>,
    pub settings: Arc<RuntimeSettings>,
    pub clock: Arc<ManualClock>,
    pub sender: Arc<RecordingSender>,
    pub events: Arc<EventBus>,
}

impl Harness {
    pub async fn new() -> Self {
        let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let store: Arc<dyn Database> = backend.clone();
        let settings = RuntimeSettings::load(Arc::clone(&store)).await.unwrap();
        Self {
            backend,
            store,
            settings,
            clock: ManualClock::starting_now(),
            sender: RecordingSender::new(),
            events: EventBus::new(),
        }
    }
}
