//! The operational surface of the service.
//!
//! Wires the store, runtime settings, event bus and the four engines together
//! and exposes the entry points the HTTP layer (and tests) call.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::arbitration::ResponseArbiter;
use crate::channels::OutboundSender;
use crate::clock::Clock;
use crate::config::{RuntimeSettings, SurveyPolicy};
use crate::conversations::{InboundOutcome, Inbox, Message};
use crate::dispatch::{CancelOutcome, RunKind, RunSummary, SendRun, SendRunController};
use crate::error::{ConfigError, DatabaseError, DispatchError, Result};
use crate::events::EventBus;
use crate::llm::LlmProvider;
use crate::orders::{OrderSource, Recipient, recipients_from_orders};
use crate::store::Database;
use crate::survey::{SatisfactionSurvey, SurveyService, SurveySweeper, spawn_sweepers};

/// External collaborators the core is built from.
pub struct CoreDeps {
    pub store: Arc<dyn Database>,
    pub sender: Arc<dyn OutboundSender>,
    /// `None` turns the automated responder off.
    pub llm: Option<Arc<dyn LlmProvider>>,
    pub order_source: Option<Arc<dyn OrderSource>>,
    pub clock: Arc<dyn Clock>,
    pub survey_policy: SurveyPolicy,
}

/// A run with its per-status counts.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: SendRun,
    pub summary: RunSummary,
}

/// Counts from one pass of both survey sweeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub finalized: usize,
}

pub struct Core {
    store: Arc<dyn Database>,
    settings: Arc<RuntimeSettings>,
    events: Arc<EventBus>,
    order_source: Option<Arc<dyn OrderSource>>,
    controller: Arc<SendRunController>,
    surveys: Arc<SurveyService>,
    sweeper: Arc<SurveySweeper>,
    inbox: Arc<Inbox>,
}

impl Core {
    /// Load runtime settings and build every engine.
    pub async fn new(deps: CoreDeps) -> Result<Arc<Self>> {
        let CoreDeps {
            store,
            sender,
            llm,
            order_source,
            clock,
            survey_policy,
        } = deps;

        let settings = RuntimeSettings::load(Arc::clone(&store)).await?;
        let events = EventBus::new();

        let surveys = Arc::new(SurveyService::new(
            Arc::clone(&store),
            Arc::clone(&sender),
            Arc::clone(&settings),
            Arc::clone(&clock),
            Arc::clone(&events),
        ));
        let controller = Arc::new(SendRunController::new(
            Arc::clone(&store),
            Arc::clone(&sender),
            Arc::clone(&settings),
            Arc::clone(&clock),
            Arc::clone(&events),
            Arc::clone(&surveys),
        ));
        let sweeper = Arc::new(SurveySweeper::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&events),
            survey_policy,
        ));
        let arbiter = Arc::new(ResponseArbiter::new(
            Arc::clone(&store),
            Arc::clone(&sender),
            llm,
            Arc::clone(&settings),
            Arc::clone(&clock),
            Arc::clone(&events),
        ));
        let inbox = Arc::new(Inbox::new(
            Arc::clone(&store),
            sender,
            Arc::clone(&surveys),
            arbiter,
            clock,
            Arc::clone(&events),
        ));

        Ok(Arc::new(Self {
            store,
            settings,
            events,
            order_source,
            controller,
            surveys,
            sweeper,
            inbox,
        }))
    }

    pub fn store(&self) -> &Arc<dyn Database> {
        &self.store
    }

    pub fn settings(&self) -> &Arc<RuntimeSettings> {
        &self.settings
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // ── Send runs ───────────────────────────────────────────────────

    /// Start a run in the background; returns as soon as it exists.
    pub async fn start_send_run(&self, kind: RunKind, recipients: Vec<Recipient>, template: &str) -> Result<Uuid> {
        self.controller.start(kind, recipients, template).await
    }

    /// Start a run over every order delivered between `from` and `to`.
    pub async fn start_send_run_from_orders(
        &self,
        kind: RunKind,
        from: NaiveDate,
        to: NaiveDate,
        template: &str,
    ) -> Result<Uuid> {
        let source = self.order_source.as_ref().ok_or(DispatchError::NoOrderSource)?;
        let orders = source.orders_between(from, to).await?;
        let recipients = recipients_from_orders(orders);
        info!(%from, %to, recipients = recipients.len(), "Loaded recipients from order source");
        self.start_send_run(kind, recipients, template).await
    }

    pub async fn cancel_send_run(&self, run_id: Uuid) -> Result<CancelOutcome> {
        self.controller.cancel(run_id).await
    }

    pub async fn run_report(&self, run_id: Uuid) -> Result<RunReport> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(DispatchError::RunNotFound { id: run_id })?;
        let summary = self.store.count_send_records_by_status(run_id).await?;
        Ok(RunReport { run, summary })
    }

    // ── Surveys ─────────────────────────────────────────────────────

    pub async fn dispatch_survey(&self, send_record_id: Uuid) -> Result<SatisfactionSurvey> {
        self.surveys.dispatch_survey(send_record_id).await
    }

    pub async fn dispatch_manual_survey(&self, recipient: &Recipient) -> Result<SatisfactionSurvey> {
        self.surveys.dispatch_manual_survey(recipient).await
    }

    pub async fn sweep_expired_surveys(&self) -> Result<usize> {
        self.sweeper.sweep_expired().await
    }

    pub async fn sweep_finalize_surveys(&self) -> Result<usize> {
        self.sweeper.sweep_finalize().await
    }

    /// Run both sweeps now.
    pub async fn sweep_surveys(&self) -> Result<SweepReport> {
        Ok(SweepReport {
            expired: self.sweep_expired_surveys().await?,
            finalized: self.sweep_finalize_surveys().await?,
        })
    }

    /// Start the scheduled sweeps.
    pub fn spawn_sweepers(&self) -> std::result::Result<JoinHandle<()>, ConfigError> {
        spawn_sweepers(Arc::clone(&self.sweeper))
    }

    // ── Conversations ───────────────────────────────────────────────

    pub async fn handle_inbound_message(&self, conversation_id: Uuid, text: &str) -> Result<InboundOutcome> {
        self.inbox.handle_inbound_message(conversation_id, text).await
    }

    /// Inbound message addressed by phone, as delivered by the gateway webhook.
    pub async fn receive_message(&self, phone: &str, display_name: Option<&str>, text: &str) -> Result<InboundOutcome> {
        self.inbox.receive(phone, display_name, text).await
    }

    /// Same as [`Core::receive_message`], without waiting for the automated
    /// responder.
    pub async fn accept_message(&self, phone: &str, display_name: Option<&str>, text: &str) -> Result<InboundOutcome> {
        self.inbox.accept(phone, display_name, text).await
    }

    pub async fn send_operator_message(&self, conversation_id: Uuid, text: &str) -> Result<Message> {
        self.inbox.send_operator_message(conversation_id, text).await
    }

    pub async fn set_conversation_automation(&self, conversation_id: Uuid, active: bool) -> Result<()> {
        self.inbox.set_automation(conversation_id, active).await
    }

    // ── Rule tables ─────────────────────────────────────────────────
    //
    // Running runs keep the snapshot they started with.

    pub async fn add_blacklist_entry(&self, phone: &str, reason: Option<&str>) -> Result<()> {
        self.store.add_blacklist_entry(phone, reason).await?;
        info!(phone = %crate::phone::normalize(phone), "Phone blacklisted");
        Ok(())
    }

    pub async fn remove_blacklist_entry(&self, phone: &str) -> Result<()> {
        if !self.store.remove_blacklist_entry(phone).await? {
            return Err(not_found("blacklist entry", phone).into());
        }
        info!(phone = %crate::phone::normalize(phone), "Phone removed from blacklist");
        Ok(())
    }

    pub async fn add_restricted_driver(&self, name: &str) -> Result<()> {
        self.store.add_restricted_driver(name).await?;
        info!(driver = %name.trim(), "Driver restricted");
        Ok(())
    }

    pub async fn remove_restricted_driver(&self, name: &str) -> Result<()> {
        if !self.store.remove_restricted_driver(name).await? {
            return Err(not_found("restricted driver", name).into());
        }
        Ok(())
    }

    pub async fn add_restricted_prefix(&self, prefix: &str) -> Result<()> {
        self.store.add_restricted_prefix(prefix).await?;
        info!(prefix = %prefix.trim(), "Order prefix restricted");
        Ok(())
    }

    pub async fn remove_restricted_prefix(&self, prefix: &str) -> Result<()> {
        if !self.store.remove_restricted_prefix(prefix).await? {
            return Err(not_found("restricted prefix", prefix).into());
        }
        Ok(())
    }
}

fn not_found(entity: &str, id: &str) -> DatabaseError {
    DatabaseError::NotFound {
        entity: entity.into(),
        id: id.into(),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::clock::ManualClock;
    use crate::dispatch::RunStatus;
    use crate::error::{ChannelError, Error};
    use crate::orders::{OrderContext, OrderRecord};
    use crate::store::LibSqlBackend;
    use crate::testing::RecordingSender;

    struct FixedOrders(Vec<OrderRecord>);

    #[async_trait]
    impl OrderSource for FixedOrders {
        async fn orders_between(&self, _from: NaiveDate, _to: NaiveDate) -> std::result::Result<Vec<OrderRecord>, ChannelError> {
            Ok(self.0.clone())
        }
    }

    async fn core(order_source: Option<Arc<dyn OrderSource>>) -> (Arc<Core>, Arc<RecordingSender>) {
        let sender = RecordingSender::new();
        let core = Core::new(CoreDeps {
            store: Arc::new(LibSqlBackend::new_memory().await.unwrap()),
            sender: sender.clone(),
            llm: None,
            order_source,
            clock: ManualClock::starting_now(),
            survey_policy: SurveyPolicy::default(),
        })
        .await
        .unwrap();
        (core, sender)
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
    }

    #[tokio::test]
    async fn run_from_orders_groups_by_phone() {
        let orders = vec![
            OrderRecord {
                customer_name: "Ana".into(),
                customer_phone: "(11) 98888-7777".into(),
                order: OrderContext::new("PX-1"),
            },
            OrderRecord {
                customer_name: "Ana".into(),
                customer_phone: "5511988887777".into(),
                order: OrderContext::new("PX-2"),
            },
        ];
        let (core, sender) = core(Some(Arc::new(FixedOrders(orders)))).await;
        let mut rx = core.events().subscribe();

        let run_id = core
            .start_send_run_from_orders(RunKind::Campaign, day(1), day(2), "Pedido {order}")
            .await
            .unwrap();
        loop {
            if let crate::events::DomainEvent::RunFinished { .. } = rx.recv().await.unwrap() {
                break;
            }
        }
        let report = core.run_report(run_id).await.unwrap();
        assert_eq!(report.run.status, RunStatus::Completed);
        assert_eq!(report.summary.sent, 1);
        assert_eq!(sender.texts_to("5511988887777"), vec!["Pedido PX-1".to_string()]);
    }

    #[tokio::test]
    async fn run_from_orders_needs_a_source() {
        let (core, _) = core(None).await;
        assert!(matches!(
            core.start_send_run_from_orders(RunKind::Campaign, day(1), day(2), "Oi").await,
            Err(Error::Dispatch(DispatchError::NoOrderSource))
        ));
    }

    #[tokio::test]
    async fn removing_unknown_rule_is_not_found() {
        let (core, _) = core(None).await;
        core.add_restricted_prefix("PX").await.unwrap();
        core.remove_restricted_prefix("px").await.unwrap();
        assert!(core.remove_restricted_prefix("PX").await.is_err());
        assert!(core.remove_blacklist_entry("11988887777").await.is_err());
    }

    #[tokio::test]
    async fn sweeps_report_counts() {
        let (core, _) = core(None).await;
        assert_eq!(core.sweep_surveys().await.unwrap(), SweepReport::default());
    }
}
