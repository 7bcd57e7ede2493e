//! Domain event bus with broadcast fan-out of core state changes.
//!
//! The core never talks to a notification transport directly; it publishes
//! here and subscribers (the WebSocket feed, logs, tests) decide what to do.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::arbitration::ArbitrationOutcome;
use crate::conversations::model::MessageSender;
use crate::dispatch::model::{RunKind, RunStatus, SendStatus};
use crate::survey::state::SurveyStatus;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 512;

/// A state change emitted by the core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    RunStarted {
        run_id: Uuid,
        kind: RunKind,
        total_recipients: u32,
    },
    SendRecorded {
        run_id: Option<Uuid>,
        record_id: Uuid,
        phone: String,
        status: SendStatus,
        reason: Option<String>,
    },
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
    },
    SurveyTransitioned {
        survey_id: Uuid,
        from: SurveyStatus,
        to: SurveyStatus,
    },
    MessageAppended {
        conversation_id: Uuid,
        message_id: Uuid,
        sender: MessageSender,
    },
    ArbitrationFinished {
        conversation_id: Uuid,
        outcome: ArbitrationOutcome,
    },
    /// A reply went out to a customer outside of a send run.
    ReplySent {
        phone: String,
        origin: ReplyOrigin,
    },
}

/// Who produced a [`DomainEvent::ReplySent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyOrigin {
    /// Survey follow-up, reminder or thank-you.
    Survey,
    /// AI-generated reply.
    Automation,
    /// Canned text sent because the AI provider was unavailable.
    Fallback,
    Operator,
}

/// Broadcast bus for [`DomainEvent`]s.
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self { tx })
    }

    /// Subscribe to all subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Fine if nobody is listening.
    pub fn publish(&self, event: DomainEvent) {
        let _ = self.tx.send(event);
    }
}
