//! Response arbitration: wait out a grace period, then reply automatically
//! unless a human operator (or another automated reply) got there first.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::arbitration::context::CustomerContext;
use crate::channels::OutboundSender;
use crate::clock::Clock;
use crate::config::RuntimeSettings;
use crate::conversations::model::{Conversation, Message, MessageSender};
use crate::error::{DatabaseError, LlmError, Result};
use crate::events::{DomainEvent, EventBus, ReplyOrigin};
use crate::llm::LlmProvider;
use crate::phone;
use crate::store::Database;

/// Which canned text replaced an AI reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackKind {
    /// Provider rate-limited us: "try again later".
    RateLimited,
    /// Quota or credentials exhausted: "contact support".
    Unavailable,
}

/// How one arbitration ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ArbitrationOutcome {
    /// Automation is off globally, or no AI provider is configured.
    Disabled,
    /// The conversation's automation switch is off.
    ConversationPaused,
    /// An operator wrote after the triggering message.
    OperatorTookOver,
    /// An automated reply already followed the triggering message.
    DuplicateSuppressed,
    Replied { message_id: Uuid },
    FallbackSent { kind: FallbackKind, message_id: Uuid },
    Failed { reason: String },
}

impl ArbitrationOutcome {
    /// Whether something was sent to the customer.
    pub fn reply_sent(&self) -> bool {
        matches!(self, Self::Replied { .. } | Self::FallbackSent { .. })
    }
}

pub struct ResponseArbiter {
    store: Arc<dyn Database>,
    sender: Arc<dyn OutboundSender>,
    llm: Option<Arc<dyn LlmProvider>>,
    settings: Arc<RuntimeSettings>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
}

impl ResponseArbiter {
    pub fn new(
        store: Arc<dyn Database>,
        sender: Arc<dyn OutboundSender>,
        llm: Option<Arc<dyn LlmProvider>>,
        settings: Arc<RuntimeSettings>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            sender,
            llm,
            settings,
            clock,
            events,
        }
    }

    /// Arbitrate a reply to `trigger`, a customer message already appended
    /// to `conversation_id`.
    pub async fn arbitrate(&self, conversation_id: Uuid, trigger: &Message) -> Result<ArbitrationOutcome> {
        let outcome = self.decide(conversation_id, trigger).await?;
        info!(%conversation_id, ?outcome, "Arbitration finished");
        self.events.publish(DomainEvent::ArbitrationFinished {
            conversation_id,
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    async fn decide(&self, conversation_id: Uuid, trigger: &Message) -> Result<ArbitrationOutcome> {
        let Some(llm) = self.llm.as_ref() else {
            return Ok(ArbitrationOutcome::Disabled);
        };
        if let Some(stop) = self.hard_stop(conversation_id).await? {
            return Ok(stop);
        }

        let delay = self.settings.arbitration().await.response_delay();
        debug!(%conversation_id, delay_secs = delay.as_secs(), "Grace period before automated reply");
        self.clock.sleep(delay).await;

        // Everything below reflects what happened during the sleep.
        if let Some(stop) = self.hard_stop(conversation_id).await? {
            return Ok(stop);
        }
        let latest = self.store.latest_message(conversation_id).await?;
        if latest.is_some_and(|m| m.sender == MessageSender::Operator)
            || self
                .store
                .has_message_from_after(conversation_id, MessageSender::Operator, trigger.created_at)
                .await?
        {
            return Ok(ArbitrationOutcome::OperatorTookOver);
        }
        if self
            .store
            .has_message_from_after(conversation_id, MessageSender::Automation, trigger.created_at)
            .await?
        {
            return Ok(ArbitrationOutcome::DuplicateSuppressed);
        }

        let conversation = self.conversation(conversation_id).await?;
        let assistant = self.settings.assistant().await;
        let context = CustomerContext::gather(self.store.as_ref(), conversation.clone()).await?;
        let request = context.to_request(&assistant.system_prompt);

        match llm.complete(request).await {
            Ok(response) => {
                let text = response.content.trim();
                if text.is_empty() {
                    warn!(%conversation_id, "AI returned an empty reply");
                    return Ok(ArbitrationOutcome::Failed {
                        reason: "empty reply".into(),
                    });
                }
                debug!(
                    %conversation_id,
                    model = llm.model_name(),
                    input_tokens = response.input_tokens,
                    output_tokens = response.output_tokens,
                    "AI reply generated"
                );
                Ok(match self.deliver(&conversation, text, ReplyOrigin::Automation).await {
                    Ok(message_id) => ArbitrationOutcome::Replied { message_id },
                    Err(reason) => ArbitrationOutcome::Failed { reason },
                })
            }
            Err(e) => {
                let (kind, text) = match &e {
                    LlmError::RateLimited { .. } => (FallbackKind::RateLimited, assistant.rate_limited_reply),
                    LlmError::QuotaExceeded { .. } | LlmError::AuthFailed { .. } => {
                        (FallbackKind::Unavailable, assistant.quota_reply)
                    }
                    _ => {
                        warn!(%conversation_id, error = %e, "AI request failed, no reply sent");
                        return Ok(ArbitrationOutcome::Failed { reason: e.to_string() });
                    }
                };
                warn!(%conversation_id, error = %e, ?kind, "AI unavailable, sending fallback");
                Ok(match self.deliver(&conversation, &text, ReplyOrigin::Fallback).await {
                    Ok(message_id) => ArbitrationOutcome::FallbackSent { kind, message_id },
                    Err(reason) => ArbitrationOutcome::Failed { reason },
                })
            }
        }
    }

    /// Global and per-conversation switches.
    async fn hard_stop(&self, conversation_id: Uuid) -> Result<Option<ArbitrationOutcome>> {
        if !self.settings.arbitration().await.globally_enabled {
            return Ok(Some(ArbitrationOutcome::Disabled));
        }
        if !self.conversation(conversation_id).await?.automation_active {
            return Ok(Some(ArbitrationOutcome::ConversationPaused));
        }
        Ok(None)
    }

    async fn conversation(&self, id: Uuid) -> Result<Conversation> {
        Ok(self
            .store
            .get_conversation(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "conversation".into(),
                id: id.to_string(),
            })?)
    }

    /// Send `text` and append it as an automation message. A send failure
    /// comes back as the reason string.
    async fn deliver(
        &self,
        conversation: &Conversation,
        text: &str,
        origin: ReplyOrigin,
    ) -> std::result::Result<Uuid, String> {
        if let Err(e) = self
            .sender
            .send(&phone::to_outbound(&conversation.phone), text)
            .await
        {
            warn!(conversation_id = %conversation.id, error = %e, "Automated reply send failed");
            return Err(e.to_string());
        }
        self.events.publish(DomainEvent::ReplySent {
            phone: conversation.phone.clone(),
            origin,
        });

        let message = Message::new(conversation.id, MessageSender::Automation, text, self.clock.now());
        if let Err(e) = self.store.append_message(&message).await {
            // Already delivered; the duplicate guard just won't see it.
            warn!(conversation_id = %conversation.id, error = %e, "Failed to store automated reply");
            return Ok(message.id);
        }
        self.events.publish(DomainEvent::MessageAppended {
            conversation_id: conversation.id,
            message_id: message.id,
            sender: MessageSender::Automation,
        });
        Ok(message.id)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::FutureExt;

    use super::*;
    use crate::config::ArbitrationSettings;
    use crate::dispatch::model::{SendRecord, SendStatus};
    use crate::eligibility::SendPath;
    use crate::orders::OrderContext;
    use crate::testing::{Harness, StubLlm, StubReply};

    fn arbiter(h: &Harness, llm: Option<Arc<StubLlm>>) -> ResponseArbiter {
        ResponseArbiter::new(
            Arc::clone(&h.store),
            h.sender.clone(),
            llm.map(|l| l as Arc<dyn LlmProvider>),
            Arc::clone(&h.settings),
            h.clock.clone(),
            Arc::clone(&h.events),
        )
    }

    async fn inbound(h: &Harness, text: &str) -> (Conversation, Message) {
        let conv = h.store.ensure_conversation("11988887777", Some("Ana")).await.unwrap();
        let msg = Message::new(conv.id, MessageSender::Customer, text, h.clock.now());
        h.store.append_message(&msg).await.unwrap();
        (conv, msg)
    }

    #[tokio::test]
    async fn replies_after_grace_period() {
        let h = Harness::new().await;
        let record = SendRecord::new(
            None,
            SendPath::Campaign,
            "11988887777",
            "Ana",
            "saiu para entrega",
            SendStatus::Sent,
            None,
            Some(OrderContext::new("PX-77")),
            h.clock.now(),
        );
        h.store.insert_send_record(&record).await.unwrap();
        let llm = StubLlm::replying("Seu pedido PX-77 chega hoje.");
        let arbiter = arbiter(&h, Some(Arc::clone(&llm)));
        let (conv, trigger) = inbound(&h, "quando chega?").await;

        let outcome = arbiter.arbitrate(conv.id, &trigger).await.unwrap();
        assert!(matches!(outcome, ArbitrationOutcome::Replied { .. }));
        assert!(outcome.reply_sent());
        assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(5)]);
        assert_eq!(
            h.sender.texts_to("5511988887777"),
            vec!["Seu pedido PX-77 chega hoje.".to_string()]
        );

        let request = llm.last_request().unwrap();
        assert!(request.messages[0].content.contains("pedido PX-77"));
        let latest = h.store.latest_message(conv.id).await.unwrap().unwrap();
        assert_eq!(latest.sender, MessageSender::Automation);
    }

    #[tokio::test]
    async fn globally_disabled_never_calls_ai() {
        let h = Harness::new().await;
        h.settings
            .set_arbitration(ArbitrationSettings {
                globally_enabled: false,
                response_delay_seconds: 5,
            })
            .await
            .unwrap();
        let llm = StubLlm::replying("oi");
        let arbiter = arbiter(&h, Some(Arc::clone(&llm)));
        let (conv, trigger) = inbound(&h, "oi").await;

        assert_eq!(
            arbiter.arbitrate(conv.id, &trigger).await.unwrap(),
            ArbitrationOutcome::Disabled
        );
        assert_eq!(llm.calls(), 0);
        assert!(h.clock.sleeps().is_empty());
        assert!(h.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn paused_conversation_never_calls_ai() {
        let h = Harness::new().await;
        let llm = StubLlm::replying("oi");
        let arbiter = arbiter(&h, Some(Arc::clone(&llm)));
        let (conv, trigger) = inbound(&h, "oi").await;
        h.store.set_conversation_automation(conv.id, false).await.unwrap();

        assert_eq!(
            arbiter.arbitrate(conv.id, &trigger).await.unwrap(),
            ArbitrationOutcome::ConversationPaused
        );
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn no_provider_is_disabled() {
        let h = Harness::new().await;
        let arbiter = arbiter(&h, None);
        let (conv, trigger) = inbound(&h, "oi").await;
        assert_eq!(
            arbiter.arbitrate(conv.id, &trigger).await.unwrap(),
            ArbitrationOutcome::Disabled
        );
    }

    #[tokio::test]
    async fn operator_reply_during_grace_period_wins() {
        let h = Harness::new().await;
        let llm = StubLlm::replying("resposta automática");
        let arbiter = arbiter(&h, Some(Arc::clone(&llm)));
        let (conv, trigger) = inbound(&h, "preciso de ajuda").await;

        let store = Arc::clone(&h.store);
        let clock = h.clock.clone();
        let conv_id = conv.id;
        h.clock.on_sleep(Arc::new(move |_| {
            let store = Arc::clone(&store);
            let now = clock.now();
            async move {
                let msg = Message::new(conv_id, MessageSender::Operator, "Oi Ana, já vejo", now);
                store.append_message(&msg).await.unwrap();
            }
            .boxed()
        }));

        assert_eq!(
            arbiter.arbitrate(conv.id, &trigger).await.unwrap(),
            ArbitrationOutcome::OperatorTookOver
        );
        assert_eq!(llm.calls(), 0);
        assert!(h.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn automation_reply_after_trigger_is_not_repeated() {
        let h = Harness::new().await;
        let llm = StubLlm::replying("de novo");
        let arbiter = arbiter(&h, Some(Arc::clone(&llm)));
        let (conv, trigger) = inbound(&h, "oi").await;
        h.clock.advance(chrono::Duration::seconds(1));
        let earlier = Message::new(conv.id, MessageSender::Automation, "já respondi", h.clock.now());
        h.store.append_message(&earlier).await.unwrap();

        assert_eq!(
            arbiter.arbitrate(conv.id, &trigger).await.unwrap(),
            ArbitrationOutcome::DuplicateSuppressed
        );
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn rate_limit_sends_try_later_text() {
        let h = Harness::new().await;
        let arbiter = arbiter(&h, Some(StubLlm::with(StubReply::RateLimited)));
        let (conv, trigger) = inbound(&h, "oi").await;

        let outcome = arbiter.arbitrate(conv.id, &trigger).await.unwrap();
        assert!(matches!(
            outcome,
            ArbitrationOutcome::FallbackSent {
                kind: FallbackKind::RateLimited,
                ..
            }
        ));
        let expected = h.settings.assistant().await.rate_limited_reply;
        assert_eq!(h.sender.texts_to("5511988887777"), vec![expected]);
    }

    #[tokio::test]
    async fn quota_sends_contact_support_text() {
        let h = Harness::new().await;
        let arbiter = arbiter(&h, Some(StubLlm::with(StubReply::Quota)));
        let (conv, trigger) = inbound(&h, "oi").await;

        let outcome = arbiter.arbitrate(conv.id, &trigger).await.unwrap();
        assert!(matches!(
            outcome,
            ArbitrationOutcome::FallbackSent {
                kind: FallbackKind::Unavailable,
                ..
            }
        ));
        let expected = h.settings.assistant().await.quota_reply;
        assert_eq!(h.sender.texts_to("5511988887777"), vec![expected]);
    }

    #[tokio::test]
    async fn other_ai_failure_sends_nothing() {
        let h = Harness::new().await;
        let arbiter = arbiter(&h, Some(StubLlm::with(StubReply::Broken)));
        let (conv, trigger) = inbound(&h, "oi").await;

        let outcome = arbiter.arbitrate(conv.id, &trigger).await.unwrap();
        assert!(matches!(outcome, ArbitrationOutcome::Failed { .. }));
        assert!(!outcome.reply_sent());
        assert!(h.sender.sent().is_empty());
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let json = serde_json::to_value(ArbitrationOutcome::FallbackSent {
            kind: FallbackKind::RateLimited,
            message_id: Uuid::nil(),
        })
        .unwrap();
        assert_eq!(json["outcome"], "fallback_sent");
        assert_eq!(json["kind"], "rate_limited");
    }
}
