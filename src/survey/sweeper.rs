//! Background sweeps closing surveys nobody answered.
//!
//! Sweep A expires `pending`/`sent` surveys whose question went unanswered for
//! `expire_after`. Sweep B finalizes `awaiting_feedback` surveys whose rating
//! is older than `finalize_after`, leaving feedback empty. Each sweep writes
//! its whole batch in one transaction.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::SurveyPolicy;
use crate::error::{ConfigError, Result};
use crate::events::{DomainEvent, EventBus};
use crate::store::{Database, SurveyUpdate};
use crate::survey::model::SatisfactionSurvey;
use crate::survey::state::{SurveyEvent, SurveyStatus};

/// Runs the expiry and finalize sweeps.
pub struct SurveySweeper {
    store: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    policy: SurveyPolicy,
}

impl SurveySweeper {
    pub fn new(
        store: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        policy: SurveyPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            policy,
        }
    }

    /// Expire unanswered surveys. Returns how many were expired.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let cutoff = now - self.policy.expire_after;
        let candidates = self
            .store
            .list_surveys_by_status(&[SurveyStatus::Pending, SurveyStatus::Sent])
            .await?;
        let due = candidates
            .into_iter()
            .filter(|s| s.expiry_anchor() < cutoff);
        let count = self
            .apply(due, SurveyEvent::TimedOutWithoutRating, now)
            .await?;
        if count > 0 {
            info!(count, "Expired unanswered surveys");
        }
        Ok(count)
    }

    /// Close rated surveys whose feedback never came. Returns how many.
    pub async fn sweep_finalize(&self) -> Result<usize> {
        let now = self.clock.now();
        let cutoff = now - self.policy.finalize_after;
        let candidates = self
            .store
            .list_surveys_by_status(&[SurveyStatus::AwaitingFeedback])
            .await?;
        let due = candidates
            .into_iter()
            .filter(|s| s.responded_at.unwrap_or(s.created_at) < cutoff);
        let count = self
            .apply(due, SurveyEvent::TimedOutWithoutFeedback, now)
            .await?;
        if count > 0 {
            info!(count, "Finalized surveys without feedback");
        }
        Ok(count)
    }

    async fn apply(
        &self,
        due: impl Iterator<Item = SatisfactionSurvey>,
        event: SurveyEvent,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut updates = Vec::new();
        let mut from = Vec::new();
        for survey in due {
            match survey.apply(&event, now) {
                Ok(next) => {
                    from.push((survey.id, survey.status, next.status));
                    updates.push(SurveyUpdate {
                        expected: survey.status,
                        survey: next,
                    });
                }
                // Listed by status, so this only happens on a corrupt row.
                Err(e) => warn!(survey_id = %survey.id, error = %e, "Skipping survey in sweep"),
            }
        }
        if updates.is_empty() {
            return Ok(0);
        }

        let applied: Vec<Uuid> = self.store.apply_survey_batch(&updates).await?;
        for (id, before, after) in from {
            if applied.contains(&id) {
                self.events.publish(DomainEvent::SurveyTransitioned {
                    survey_id: id,
                    from: before,
                    to: after,
                });
            } else {
                debug!(survey_id = %id, "Survey changed before sweep write, left alone");
            }
        }
        Ok(applied.len())
    }

    /// Run both sweeps once. Errors are logged, not returned.
    async fn tick(&self) {
        if let Err(e) = self.sweep_expired().await {
            error!(error = %e, "Survey expiry sweep failed");
        }
        if let Err(e) = self.sweep_finalize().await {
            error!(error = %e, "Survey finalize sweep failed");
        }
    }
}

/// Spawn the sweep loop, firing at every occurrence of the policy's cron
/// schedule.
pub fn spawn_sweepers(sweeper: Arc<SurveySweeper>) -> std::result::Result<JoinHandle<()>, ConfigError> {
    let schedule = cron::Schedule::from_str(&sweeper.policy.sweep_schedule).map_err(|e| {
        ConfigError::InvalidValue {
            key: "sweep_schedule".into(),
            message: e.to_string(),
        }
    })?;

    Ok(tokio::spawn(async move {
        info!(schedule = %sweeper.policy.sweep_schedule, "Survey sweepers started");
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("Sweep schedule has no upcoming fire time, stopping");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
            sweeper.tick().await;
        }
    }))
}
