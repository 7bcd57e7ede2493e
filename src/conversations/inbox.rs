//! Inbound routing: every customer message is stored, confirms the latest
//! delivery, and then goes either to the open survey or to arbitration.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::arbitration::{ArbitrationOutcome, ResponseArbiter};
use crate::channels::OutboundSender;
use crate::clock::Clock;
use crate::conversations::model::{Conversation, Message, MessageSender};
use crate::error::{DatabaseError, Result};
use crate::events::{DomainEvent, EventBus, ReplyOrigin};
use crate::phone;
use crate::store::Database;
use crate::survey::SurveyService;

/// What an inbound message caused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundOutcome {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    /// A survey changed status.
    pub state_changed: bool,
    /// Something was sent back to the customer.
    pub reply_sent: bool,
    /// Set when the message went to the automated responder.
    pub arbitration: Option<ArbitrationOutcome>,
    /// The responder runs in the background; watch for
    /// `arbitration_finished`.
    pub arbitration_queued: bool,
}

/// Where a stored customer message goes next.
enum Route {
    Survey(InboundOutcome),
    Arbitrate(Message),
}

pub struct Inbox {
    store: Arc<dyn Database>,
    sender: Arc<dyn OutboundSender>,
    surveys: Arc<SurveyService>,
    arbiter: Arc<ResponseArbiter>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
}

impl Inbox {
    pub fn new(
        store: Arc<dyn Database>,
        sender: Arc<dyn OutboundSender>,
        surveys: Arc<SurveyService>,
        arbiter: Arc<ResponseArbiter>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            sender,
            surveys,
            arbiter,
            clock,
            events,
        }
    }

    /// Entry point for the chat gateway: find or create the conversation for
    /// `raw_phone`, then handle the message.
    pub async fn receive(&self, raw_phone: &str, display_name: Option<&str>, text: &str) -> Result<InboundOutcome> {
        let conversation = self.store.ensure_conversation(raw_phone, display_name).await?;
        self.handle(conversation, text).await
    }

    /// Handle a customer message on an existing conversation.
    pub async fn handle_inbound_message(&self, conversation_id: Uuid, text: &str) -> Result<InboundOutcome> {
        let conversation = self.conversation(conversation_id).await?;
        self.handle(conversation, text).await
    }

    /// Like [`Inbox::receive`], but returns once the message is stored and
    /// survey routing is done. Arbitration continues on its own task.
    pub async fn accept(&self, raw_phone: &str, display_name: Option<&str>, text: &str) -> Result<InboundOutcome> {
        let conversation = self.store.ensure_conversation(raw_phone, display_name).await?;
        let message = match self.route(&conversation, text).await? {
            Route::Survey(outcome) => return Ok(outcome),
            Route::Arbitrate(message) => message,
        };

        let outcome = InboundOutcome {
            conversation_id: conversation.id,
            message_id: message.id,
            state_changed: false,
            reply_sent: false,
            arbitration: None,
            arbitration_queued: true,
        };
        let arbiter = Arc::clone(&self.arbiter);
        tokio::spawn(async move {
            if let Err(e) = arbiter.arbitrate(message.conversation_id, &message).await {
                warn!(
                    conversation_id = %message.conversation_id,
                    message_id = %message.id,
                    error = %e,
                    "Background arbitration failed"
                );
            }
        });
        Ok(outcome)
    }

    async fn handle(&self, conversation: Conversation, text: &str) -> Result<InboundOutcome> {
        let message = match self.route(&conversation, text).await? {
            Route::Survey(outcome) => return Ok(outcome),
            Route::Arbitrate(message) => message,
        };
        let outcome = self.arbiter.arbitrate(conversation.id, &message).await?;
        Ok(InboundOutcome {
            conversation_id: conversation.id,
            message_id: message.id,
            state_changed: false,
            reply_sent: outcome.reply_sent(),
            arbitration: Some(outcome),
            arbitration_queued: false,
        })
    }

    /// Store the message, confirm the latest delivery and offer it to the
    /// open survey.
    async fn route(&self, conversation: &Conversation, text: &str) -> Result<Route> {
        let now = self.clock.now();
        let message = Message::new(conversation.id, MessageSender::Customer, text, now);
        self.append(&message).await?;

        if let Some(record_id) = self
            .store
            .confirm_latest_send_record(&conversation.phone, now)
            .await?
        {
            debug!(%record_id, phone = %conversation.phone, "Delivery confirmed by reply");
        }

        let Some(reply) = self.surveys.handle_reply(&conversation.phone, text).await? else {
            return Ok(Route::Arbitrate(message));
        };
        if reply.reply_sent
            && let Some(text) = &reply.reply
        {
            let auto = Message::new(conversation.id, MessageSender::Automation, text, self.clock.now());
            if let Err(e) = self.append(&auto).await {
                warn!(conversation_id = %conversation.id, error = %e, "Failed to store survey reply");
            }
        }
        Ok(Route::Survey(InboundOutcome {
            conversation_id: conversation.id,
            message_id: message.id,
            state_changed: reply.state_changed,
            reply_sent: reply.reply_sent,
            arbitration: None,
            arbitration_queued: false,
        }))
    }

    /// Send a message as the human operator. Nothing is stored if the send
    /// fails.
    pub async fn send_operator_message(&self, conversation_id: Uuid, text: &str) -> Result<Message> {
        let conversation = self.conversation(conversation_id).await?;
        self.sender
            .send(&phone::to_outbound(&conversation.phone), text)
            .await?;
        self.events.publish(DomainEvent::ReplySent {
            phone: conversation.phone.clone(),
            origin: ReplyOrigin::Operator,
        });
        let message = Message::new(conversation.id, MessageSender::Operator, text, self.clock.now());
        self.append(&message).await?;
        info!(%conversation_id, "Operator message sent");
        Ok(message)
    }

    /// Flip the per-conversation automation switch.
    pub async fn set_automation(&self, conversation_id: Uuid, active: bool) -> Result<()> {
        if !self
            .store
            .set_conversation_automation(conversation_id, active)
            .await?
        {
            return Err(not_found(conversation_id).into());
        }
        info!(%conversation_id, active, "Conversation automation switched");
        Ok(())
    }

    async fn conversation(&self, id: Uuid) -> Result<Conversation> {
        Ok(self
            .store
            .get_conversation(id)
            .await?
            .ok_or_else(|| not_found(id))?)
    }

    async fn append(&self, message: &Message) -> Result<()> {
        self.store.append_message(message).await?;
        self.events.publish(DomainEvent::MessageAppended {
            conversation_id: message.conversation_id,
            message_id: message.id,
            sender: message.sender,
        });
        Ok(())
    }
}

fn not_found(id: Uuid) -> DatabaseError {
    DatabaseError::NotFound {
        entity: "conversation".into(),
        id: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::model::{SendRecord, SendStatus};
    use crate::eligibility::SendPath;
    use crate::error::Error;
    use crate::llm::LlmProvider;
    use crate::survey::SurveyStatus;
    use crate::testing::{Harness, StubLlm};

    fn inbox(h: &Harness, llm: Arc<StubLlm>) -> (Inbox, Arc<SurveyService>) {
        let surveys = Arc::new(SurveyService::new(
            Arc::clone(&h.store),
            h.sender.clone(),
            Arc::clone(&h.settings),
            h.clock.clone(),
            Arc::clone(&h.events),
        ));
        let arbiter = Arc::new(ResponseArbiter::new(
            Arc::clone(&h.store),
            h.sender.clone(),
            Some(llm as Arc<dyn LlmProvider>),
            Arc::clone(&h.settings),
            h.clock.clone(),
            Arc::clone(&h.events),
        ));
        let inbox = Inbox::new(
            Arc::clone(&h.store),
            h.sender.clone(),
            Arc::clone(&surveys),
            arbiter,
            h.clock.clone(),
            Arc::clone(&h.events),
        );
        (inbox, surveys)
    }

    async fn delivered(h: &Harness) -> SendRecord {
        let record = SendRecord::new(
            None,
            SendPath::Campaign,
            "11988887777",
            "Ana",
            "Pedido entregue",
            SendStatus::Sent,
            None,
            None,
            h.clock.now(),
        );
        h.store.insert_send_record(&record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn survey_reply_is_not_arbitrated() {
        let h = Harness::new().await;
        let llm = StubLlm::replying("nunca");
        let (inbox, surveys) = inbox(&h, Arc::clone(&llm));
        let record = delivered(&h).await;
        let survey = surveys.dispatch_survey(record.id).await.unwrap();

        let out = inbox.receive("+55 11 98888-7777", Some("Ana"), "5").await.unwrap();
        assert!(out.state_changed);
        assert!(out.reply_sent);
        assert!(out.arbitration.is_none());
        assert!(!out.arbitration_queued);
        assert_eq!(llm.calls(), 0);

        let stored = h.store.get_survey(survey.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SurveyStatus::AwaitingFeedback);
        let latest = h.store.latest_message(out.conversation_id).await.unwrap().unwrap();
        assert_eq!(latest.sender, MessageSender::Automation);
    }

    #[tokio::test]
    async fn plain_message_goes_to_arbitration_and_confirms_delivery() {
        let h = Harness::new().await;
        let llm = StubLlm::replying("Olá! Como posso ajudar?");
        let (inbox, _) = inbox(&h, Arc::clone(&llm));
        let record = delivered(&h).await;

        let out = inbox.receive("11988887777", None, "bom dia").await.unwrap();
        assert!(!out.state_changed);
        assert!(out.reply_sent);
        assert!(matches!(out.arbitration, Some(ArbitrationOutcome::Replied { .. })));
        assert_eq!(llm.calls(), 1);

        let record = h.store.get_send_record(record.id).await.unwrap().unwrap();
        assert!(record.confirmed_at.is_some());
    }

    #[tokio::test]
    async fn accepted_message_is_arbitrated_in_background() {
        let h = Harness::new().await;
        let llm = StubLlm::replying("Olá! Como posso ajudar?");
        let (inbox, _) = inbox(&h, Arc::clone(&llm));
        let mut rx = h.events.subscribe();

        let out = inbox.accept("11988887777", Some("Ana"), "bom dia").await.unwrap();
        assert!(out.arbitration_queued);
        assert!(out.arbitration.is_none());
        assert!(!out.reply_sent);

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if let DomainEvent::ArbitrationFinished { conversation_id, outcome } = rx.recv().await.unwrap()
                    && conversation_id == out.conversation_id
                {
                    return outcome;
                }
            }
        })
        .await
        .unwrap();
        assert!(matches!(outcome, ArbitrationOutcome::Replied { .. }));
        assert_eq!(llm.calls(), 1);
        assert_eq!(h.sender.texts_to("5511988887777").len(), 1);

        let messages = h.store.list_recent_messages(out.conversation_id, 10).await.unwrap();
        let senders: Vec<_> = messages.iter().map(|m| m.sender).collect();
        assert_eq!(senders, vec![MessageSender::Customer, MessageSender::Automation]);
        assert_eq!(messages[0].id, out.message_id);
    }

    #[tokio::test]
    async fn accepted_survey_reply_is_answered_inline() {
        let h = Harness::new().await;
        let llm = StubLlm::replying("nunca");
        let (inbox, surveys) = inbox(&h, Arc::clone(&llm));
        let record = delivered(&h).await;
        surveys.dispatch_survey(record.id).await.unwrap();

        let out = inbox.accept("11988887777", None, "4").await.unwrap();
        assert!(!out.arbitration_queued);
        assert!(out.state_changed);
        assert!(out.reply_sent);
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn operator_message_is_sent_and_stored() {
        let h = Harness::new().await;
        let (inbox, _) = inbox(&h, StubLlm::replying("x"));
        let conv = h.store.ensure_conversation("11988887777", None).await.unwrap();

        let msg = inbox.send_operator_message(conv.id, "Oi, aqui é a Júlia").await.unwrap();
        assert_eq!(msg.sender, MessageSender::Operator);
        assert_eq!(h.sender.texts_to("5511988887777"), vec!["Oi, aqui é a Júlia".to_string()]);

        h.sender.fail_for("5511988887777");
        assert!(matches!(
            inbox.send_operator_message(conv.id, "de novo").await,
            Err(Error::Channel(_))
        ));
        let latest = h.store.latest_message(conv.id).await.unwrap().unwrap();
        assert_eq!(latest.id, msg.id);
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let h = Harness::new().await;
        let (inbox, _) = inbox(&h, StubLlm::replying("x"));
        assert!(matches!(
            inbox.set_automation(Uuid::new_v4(), false).await,
            Err(Error::Database(DatabaseError::NotFound { .. }))
        ));
        assert!(inbox.handle_inbound_message(Uuid::new_v4(), "oi").await.is_err());
    }
}
