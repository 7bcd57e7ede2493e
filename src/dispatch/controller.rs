//! Send run controller.
//!
//! A run walks its recipients one at a time on its own task: re-check the run
//! status, filter, render, send, record, then wait a randomized gap before the
//! next attempted send. Cancellation is a compare-and-set on the run row that
//! the loop observes at the next recipient boundary.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::OutboundSender;
use crate::clock::Clock;
use crate::config::RuntimeSettings;
use crate::dispatch::model::{CancelOutcome, RunKind, RunStatus, RunSummary, SendRecord, SendRun, SendStatus};
use crate::dispatch::rate_limiter::RateLimiter;
use crate::dispatch::template;
use crate::eligibility::{RuleSnapshot, SendPath, Verdict};
use crate::error::{DispatchError, Result};
use crate::events::{DomainEvent, EventBus};
use crate::orders::{Recipient, dedupe_recipients};
use crate::phone;
use crate::store::Database;
use crate::survey::SurveyService;

/// A run that has been persisted but not yet driven.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub run: SendRun,
    pub recipients: Vec<Recipient>,
}

pub struct SendRunController {
    store: Arc<dyn Database>,
    sender: Arc<dyn OutboundSender>,
    settings: Arc<RuntimeSettings>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    surveys: Arc<SurveyService>,
}

impl SendRunController {
    pub fn new(
        store: Arc<dyn Database>,
        sender: Arc<dyn OutboundSender>,
        settings: Arc<RuntimeSettings>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        surveys: Arc<SurveyService>,
    ) -> Self {
        Self {
            store,
            sender,
            settings,
            clock,
            events,
            surveys,
        }
    }

    /// Create a run and drive it on a background task. Returns the run id as
    /// soon as the run row exists.
    pub async fn start(
        self: &Arc<Self>,
        kind: RunKind,
        recipients: Vec<Recipient>,
        template: &str,
    ) -> Result<Uuid> {
        let plan = self.create_run(kind, recipients, template).await?;
        let run_id = plan.run.id;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.drive(plan).await {
                error!(%run_id, error = %e, "Send run aborted");
            }
        });
        Ok(run_id)
    }

    /// Create and drive a run on the calling task.
    pub async fn run_to_completion(
        &self,
        kind: RunKind,
        recipients: Vec<Recipient>,
        template: &str,
    ) -> Result<(Uuid, RunSummary)> {
        let plan = self.create_run(kind, recipients, template).await?;
        let run_id = plan.run.id;
        let summary = self.drive(plan).await?;
        Ok((run_id, summary))
    }

    /// Validate inputs, dedupe recipients by phone and persist the run in
    /// `running`.
    pub async fn create_run(
        &self,
        kind: RunKind,
        recipients: Vec<Recipient>,
        template: &str,
    ) -> Result<RunPlan> {
        if template.trim().is_empty() {
            return Err(DispatchError::EmptyTemplate.into());
        }
        let recipients = dedupe_recipients(recipients);
        if recipients.is_empty() {
            return Err(DispatchError::EmptyRecipients.into());
        }

        let total = u32::try_from(recipients.len()).unwrap_or(u32::MAX);
        let run = SendRun::new(kind, template, total, self.clock.now());
        self.store.insert_run(&run).await?;
        self.events.publish(DomainEvent::RunStarted {
            run_id: run.id,
            kind,
            total_recipients: total,
        });
        info!(run_id = %run.id, %kind, total, "Send run created");
        Ok(RunPlan { run, recipients })
    }

    /// Iterate the run's recipients until done or cancelled.
    ///
    /// A run that cannot be driven at all (rules unreadable, run row gone) is
    /// moved to `cancelled` before the error is returned, so it never stays
    /// `running`.
    pub async fn drive(&self, plan: RunPlan) -> Result<RunSummary> {
        let run_id = plan.run.id;
        match self.drive_recipients(plan).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                self.abandon(run_id).await;
                Err(e)
            }
        }
    }

    async fn drive_recipients(&self, plan: RunPlan) -> Result<RunSummary> {
        let RunPlan { run, recipients } = plan;
        let rules = RuleSnapshot::load(self.store.as_ref()).await?;
        let mut limiter = RateLimiter::new(Arc::clone(&self.settings));
        let mut summary = RunSummary::default();

        for (index, recipient) in recipients.iter().enumerate() {
            match self.store.get_run_status(run.id).await {
                Ok(Some(RunStatus::Running)) => {}
                Ok(Some(status)) => {
                    info!(run_id = %run.id, %status, processed = index, "Send run stopped");
                    return Ok(summary);
                }
                Ok(None) => return Err(DispatchError::RunNotFound { id: run.id }.into()),
                // Checked again at the next boundary.
                Err(e) => warn!(run_id = %run.id, error = %e, "Could not re-read run status"),
            }

            let status = self.attempt(&run, recipient, &rules).await;
            summary.record(status);

            let has_next = index + 1 < recipients.len();
            if status != SendStatus::Skipped && has_next {
                let delay = limiter.next_delay().await;
                debug!(run_id = %run.id, delay_ms = delay.as_millis() as u64, "Waiting before next send");
                self.clock.sleep(delay).await;
            }
        }

        if self
            .store
            .transition_run(run.id, RunStatus::Completed, self.clock.now())
            .await?
        {
            self.events.publish(DomainEvent::RunFinished {
                run_id: run.id,
                status: RunStatus::Completed,
            });
            info!(
                run_id = %run.id,
                sent = summary.sent,
                skipped = summary.skipped,
                failed = summary.failed,
                "Send run completed"
            );
        } else {
            // Cancelled after the last recipient was processed.
            info!(run_id = %run.id, "Run left running before completion, keeping its status");
        }
        Ok(summary)
    }

    /// Move a run that can no longer be driven out of `running`.
    async fn abandon(&self, run_id: Uuid) {
        match self
            .store
            .transition_run(run_id, RunStatus::Cancelled, self.clock.now())
            .await
        {
            Ok(true) => {
                self.events.publish(DomainEvent::RunFinished {
                    run_id,
                    status: RunStatus::Cancelled,
                });
                if let Err(e) = self.surveys.cancel_pending_for_run(run_id).await {
                    warn!(%run_id, error = %e, "Failed to cancel surveys of aborted run");
                }
                warn!(%run_id, "Aborted send run marked cancelled");
            }
            Ok(false) => {}
            Err(e) => error!(%run_id, error = %e, "Failed to close aborted send run"),
        }
    }

    /// One recipient: filter, then render, send and record. A record that
    /// cannot be stored counts as a failure.
    async fn attempt(&self, run: &SendRun, recipient: &Recipient, rules: &RuleSnapshot) -> SendStatus {
        let order = recipient.primary_order().cloned();

        let (content, status, reason) = match rules.evaluate_recipient(recipient, SendPath::Campaign) {
            Verdict::Rejected(reason) => {
                debug!(run_id = %run.id, phone = %recipient.phone, %reason, "Recipient skipped");
                (String::new(), SendStatus::Skipped, Some(reason.to_string()))
            }
            Verdict::Eligible => {
                let text = template::render(&run.template, recipient);
                match self.sender.send(&phone::to_outbound(&recipient.phone), &text).await {
                    Ok(()) => (text, SendStatus::Sent, None),
                    Err(e) => {
                        warn!(run_id = %run.id, phone = %recipient.phone, error = %e, "Send failed");
                        (text, SendStatus::Failed, Some(e.to_string()))
                    }
                }
            }
        };

        let record = SendRecord::new(
            Some(run.id),
            SendPath::Campaign,
            recipient.phone.clone(),
            recipient.name.clone(),
            content,
            status,
            reason.clone(),
            order,
            self.clock.now(),
        );
        if let Err(e) = self.store.insert_send_record(&record).await {
            error!(run_id = %run.id, phone = %recipient.phone, %status, error = %e, "Failed to store send record");
            return SendStatus::Failed;
        }

        if run.kind == RunKind::Survey
            && status == SendStatus::Sent
            && let Err(e) = self.surveys.open_dispatched(&record).await
        {
            error!(run_id = %run.id, record_id = %record.id, error = %e, "Failed to open survey");
        }

        self.events.publish(DomainEvent::SendRecorded {
            run_id: Some(run.id),
            record_id: record.id,
            phone: record.phone.clone(),
            status,
            reason,
        });
        status
    }

    /// Request cancellation. Takes effect at the next recipient boundary.
    pub async fn cancel(&self, run_id: Uuid) -> Result<CancelOutcome> {
        if self
            .store
            .transition_run(run_id, RunStatus::Cancelled, self.clock.now())
            .await?
        {
            self.events.publish(DomainEvent::RunFinished {
                run_id,
                status: RunStatus::Cancelled,
            });
            let surveys = self.surveys.cancel_pending_for_run(run_id).await?;
            info!(%run_id, surveys, "Send run cancelled");
            return Ok(CancelOutcome::Cancelled);
        }

        match self.store.get_run_status(run_id).await? {
            Some(status) => {
                info!(%run_id, %status, "Cancel ignored, run already finished");
                Ok(CancelOutcome::AlreadyFinished(status))
            }
            None => Err(DispatchError::RunNotFound { id: run_id }.into()),
        }
    }
}
