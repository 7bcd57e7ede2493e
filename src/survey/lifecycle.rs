//! Survey service: dispatch, reply handling and run cancellation.
//!
//! Every status write goes through [`SatisfactionSurvey::apply`] and is then
//! persisted as a compare-and-set on the previous status, so a reply racing a
//! sweep can never resurrect a closed survey.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::OutboundSender;
use crate::clock::Clock;
use crate::config::RuntimeSettings;
use crate::dispatch::model::{SendRecord, SendStatus};
use crate::dispatch::template;
use crate::eligibility::{RejectReason, RuleSnapshot, SendPath, Verdict};
use crate::error::{DatabaseError, DispatchError, Error, Result, SurveyError};
use crate::events::{DomainEvent, EventBus, ReplyOrigin};
use crate::orders::Recipient;
use crate::phone;
use crate::store::{Database, SurveyUpdate};
use crate::survey::model::SatisfactionSurvey;
use crate::survey::reply::classify_rating;
use crate::survey::state::{InvalidTransition, SurveyEvent, SurveyStatus};

/// What a customer reply did to their open survey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SurveyReplyOutcome {
    pub survey_id: Uuid,
    pub state_changed: bool,
    /// Text we answered with, if any.
    pub reply: Option<String>,
    pub reply_sent: bool,
}

pub struct SurveyService {
    store: Arc<dyn Database>,
    sender: Arc<dyn OutboundSender>,
    settings: Arc<RuntimeSettings>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
}

fn invalid(id: Uuid, e: InvalidTransition) -> Error {
    SurveyError::InvalidTransition {
        id,
        from: e.from.to_string(),
        event: e.event.to_string(),
    }
    .into()
}

/// Rebuild the recipient a send record was addressed to.
fn recipient_of(record: &SendRecord) -> Recipient {
    Recipient {
        phone: record.phone.clone(),
        name: record.recipient_name.clone(),
        orders: record.order_snapshot.iter().cloned().collect(),
    }
}

impl SurveyService {
    pub fn new(
        store: Arc<dyn Database>,
        sender: Arc<dyn OutboundSender>,
        settings: Arc<RuntimeSettings>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            sender,
            settings,
            clock,
            events,
        }
    }

    fn publish_transition(&self, survey_id: Uuid, from: SurveyStatus, to: SurveyStatus) {
        self.events.publish(DomainEvent::SurveyTransitioned {
            survey_id,
            from,
            to,
        });
    }

    /// Open a survey for a record whose question was just delivered by a
    /// survey run. The survey starts in `sent`.
    pub async fn open_dispatched(&self, record: &SendRecord) -> Result<SatisfactionSurvey> {
        let survey = SatisfactionSurvey::sent(record.id, record.phone.clone(), self.clock.now());
        self.store.insert_survey(&survey).await?;
        self.publish_transition(survey.id, SurveyStatus::Pending, SurveyStatus::Sent);
        debug!(survey_id = %survey.id, record_id = %record.id, "Survey opened");
        Ok(survey)
    }

    /// Send the survey question for an already delivered send record.
    ///
    /// A record that already has a survey past `pending` is rejected; a
    /// `pending` survey (earlier send failed) is re-sent. When the send fails
    /// the survey stays `pending` and the channel error is returned.
    pub async fn dispatch_survey(&self, send_record_id: Uuid) -> Result<SatisfactionSurvey> {
        let record = self
            .store
            .get_send_record(send_record_id)
            .await?
            .ok_or(DispatchError::RecordNotFound { id: send_record_id })?;

        if record.status != SendStatus::Sent {
            return Err(SurveyError::NotDispatchable {
                send_record_id,
                reason: format!("send record is {}", record.status),
            }
            .into());
        }

        let rules = RuleSnapshot::load(self.store.as_ref()).await?;
        match rules.is_eligible(&record.phone, record.order_snapshot.as_ref(), record.path) {
            Verdict::Eligible => {}
            Verdict::Rejected(RejectReason::Blacklisted) => {
                return Err(SurveyError::Blacklisted {
                    phone: record.phone.clone(),
                }
                .into());
            }
            Verdict::Rejected(reason) => {
                return Err(SurveyError::NotDispatchable {
                    send_record_id,
                    reason: reason.to_string(),
                }
                .into());
            }
        }

        let survey = match self.store.get_survey_for_record(send_record_id).await? {
            Some(existing) if existing.status != SurveyStatus::Pending => {
                return Err(SurveyError::AlreadyExists {
                    send_record_id,
                    survey_id: existing.id,
                    status: existing.status.to_string(),
                }
                .into());
            }
            Some(existing) => existing,
            None => {
                let survey =
                    SatisfactionSurvey::pending(send_record_id, record.phone.clone(), self.clock.now());
                match self.store.insert_survey(&survey).await {
                    Ok(()) => survey,
                    Err(DatabaseError::Constraint(_)) => {
                        // Lost a race with another dispatch for the same record.
                        let winner = self.store.get_survey_for_record(send_record_id).await?;
                        return Err(match winner {
                            Some(w) => SurveyError::AlreadyExists {
                                send_record_id,
                                survey_id: w.id,
                                status: w.status.to_string(),
                            }
                            .into(),
                            None => DatabaseError::NotFound {
                                entity: "survey".into(),
                                id: send_record_id.to_string(),
                            }
                            .into(),
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let messages = self.settings.survey_messages().await;
        let question = template::render(&messages.question, &recipient_of(&record));
        self.sender
            .send(&phone::to_outbound(&record.phone), &question)
            .await
            .inspect_err(|e| {
                warn!(survey_id = %survey.id, phone = %record.phone, error = %e, "Survey send failed, left pending");
            })?;

        self.mark_sent(survey).await
    }

    /// Operator one-off survey: blacklist only, then a `manual` send record
    /// and a survey in `sent`.
    pub async fn dispatch_manual_survey(&self, recipient: &Recipient) -> Result<SatisfactionSurvey> {
        let rules = RuleSnapshot::load(self.store.as_ref()).await?;
        let messages = self.settings.survey_messages().await;
        let order = recipient.primary_order().cloned();

        if let Verdict::Rejected(reason) = rules.evaluate_recipient(recipient, SendPath::Manual) {
            let record = SendRecord::new(
                None,
                SendPath::Manual,
                recipient.phone.clone(),
                recipient.name.clone(),
                String::new(),
                SendStatus::Skipped,
                Some(reason.to_string()),
                order,
                self.clock.now(),
            );
            self.store.insert_send_record(&record).await?;
            info!(phone = %recipient.phone, %reason, "Manual survey skipped");
            return Err(SurveyError::Blacklisted {
                phone: recipient.phone.clone(),
            }
            .into());
        }

        let question = template::render(&messages.question, recipient);
        let outcome = self
            .sender
            .send(&phone::to_outbound(&recipient.phone), &question)
            .await;
        let (status, reason) = match &outcome {
            Ok(()) => (SendStatus::Sent, None),
            Err(e) => (SendStatus::Failed, Some(e.to_string())),
        };
        let record = SendRecord::new(
            None,
            SendPath::Manual,
            recipient.phone.clone(),
            recipient.name.clone(),
            question,
            status,
            reason.clone(),
            order,
            self.clock.now(),
        );
        self.store.insert_send_record(&record).await?;
        self.events.publish(DomainEvent::SendRecorded {
            run_id: None,
            record_id: record.id,
            phone: record.phone.clone(),
            status,
            reason,
        });

        outcome?;
        self.open_dispatched(&record).await
    }

    async fn mark_sent(&self, survey: SatisfactionSurvey) -> Result<SatisfactionSurvey> {
        let sent = survey
            .apply(&SurveyEvent::Dispatched, self.clock.now())
            .map_err(|e| invalid(survey.id, e))?;
        if !self.store.update_survey(&sent, survey.status).await? {
            warn!(survey_id = %survey.id, "Survey changed while sending, keeping stored state");
            return self
                .store
                .get_survey(survey.id)
                .await?
                .ok_or_else(|| SurveyError::NotFound { id: survey.id }.into());
        }
        self.publish_transition(sent.id, survey.status, sent.status);
        info!(survey_id = %sent.id, phone = %sent.phone, "Survey dispatched");
        Ok(sent)
    }

    /// Route a customer message to their open survey, if they have one.
    ///
    /// Returns `None` when no survey is waiting on this phone, so the caller
    /// can hand the message to the automated responder instead.
    pub async fn handle_reply(&self, raw_phone: &str, text: &str) -> Result<Option<SurveyReplyOutcome>> {
        let Some(survey) = self.store.find_open_survey_for_phone(raw_phone).await? else {
            return Ok(None);
        };
        let messages = self.settings.survey_messages().await;
        let now = self.clock.now();

        let (event, reply) = if survey.status.awaits_rating() {
            match classify_rating(text) {
                Some(rating) => (Some(SurveyEvent::RatingReceived(rating)), Some(messages.follow_up)),
                None => (None, Some(messages.reminder)),
            }
        } else {
            let thank_you = Some(messages.thank_you).filter(|t| !t.trim().is_empty());
            (Some(SurveyEvent::FeedbackReceived(text.to_string())), thank_you)
        };

        let mut state_changed = false;
        if let Some(event) = event {
            let next = survey.apply(&event, now).map_err(|e| invalid(survey.id, e))?;
            if self.store.update_survey(&next, survey.status).await? {
                self.publish_transition(survey.id, survey.status, next.status);
                info!(
                    survey_id = %survey.id,
                    from = %survey.status,
                    to = %next.status,
                    "Survey reply recorded"
                );
                state_changed = true;
            } else {
                // A sweep closed it between our read and write.
                debug!(survey_id = %survey.id, "Survey reply lost the race, ignoring");
                return Ok(Some(SurveyReplyOutcome {
                    survey_id: survey.id,
                    state_changed: false,
                    reply: None,
                    reply_sent: false,
                }));
            }
        }

        let mut reply_sent = false;
        if let Some(ref text) = reply {
            match self.sender.send(&phone::to_outbound(&survey.phone), text).await {
                Ok(()) => {
                    reply_sent = true;
                    self.events.publish(DomainEvent::ReplySent {
                        phone: survey.phone.clone(),
                        origin: ReplyOrigin::Survey,
                    });
                }
                Err(e) => warn!(survey_id = %survey.id, error = %e, "Survey reply send failed"),
            }
        }

        Ok(Some(SurveyReplyOutcome {
            survey_id: survey.id,
            state_changed,
            reply,
            reply_sent,
        }))
    }

    /// Cancel the `pending` surveys of a cancelled run. Returns how many changed.
    pub async fn cancel_pending_for_run(&self, run_id: Uuid) -> Result<usize> {
        let now = self.clock.now();
        let pending = self.store.list_pending_surveys_for_run(run_id).await?;
        let mut updates = Vec::with_capacity(pending.len());
        for survey in pending {
            let cancelled = survey
                .apply(&SurveyEvent::RunCancelled, now)
                .map_err(|e| invalid(survey.id, e))?;
            updates.push(SurveyUpdate {
                survey: cancelled,
                expected: survey.status,
            });
        }
        let applied = self.store.apply_survey_batch(&updates).await?;
        for id in &applied {
            self.publish_transition(*id, SurveyStatus::Pending, SurveyStatus::Cancelled);
        }
        if !applied.is_empty() {
            info!(%run_id, count = applied.len(), "Cancelled pending surveys of run");
        }
        Ok(applied.len())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::dispatch::model::{RunKind, SendRun};
    use crate::orders::OrderContext;
    use crate::testing::{Harness, RecordingSender};

    fn service(h: &Harness) -> SurveyService {
        SurveyService::new(
            Arc::clone(&h.store),
            h.sender.clone(),
            Arc::clone(&h.settings),
            h.clock.clone(),
            Arc::clone(&h.events),
        )
    }

    async fn delivered_record(h: &Harness, phone: &str, run_id: Option<Uuid>) -> SendRecord {
        let record = SendRecord::new(
            run_id,
            SendPath::Campaign,
            phone,
            "Ana Souza",
            "Seu pedido foi entregue",
            SendStatus::Sent,
            None,
            Some(OrderContext::new("PX-7").with_driver("Carlos")),
            h.clock.now(),
        );
        h.store.insert_send_record(&record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn dispatch_sends_question_and_marks_sent() {
        let h = Harness::new().await;
        let svc = service(&h);
        let record = delivered_record(&h, "11988887777", None).await;

        let survey = svc.dispatch_survey(record.id).await.unwrap();
        assert_eq!(survey.status, SurveyStatus::Sent);
        assert!(survey.sent_at.is_some());

        let texts = h.sender.texts_to("5511988887777");
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("Ana"));
        assert!(texts[0].contains("PX-7"));
    }

    #[tokio::test]
    async fn dispatch_twice_is_already_exists() {
        let h = Harness::new().await;
        let svc = service(&h);
        let record = delivered_record(&h, "11988887777", None).await;
        svc.dispatch_survey(record.id).await.unwrap();

        let err = svc.dispatch_survey(record.id).await.unwrap_err();
        assert!(matches!(err, Error::Survey(SurveyError::AlreadyExists { .. })));
        assert_eq!(h.sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn failed_send_leaves_pending_then_retry_succeeds() {
        let h = Harness::new().await;
        let svc = service(&h);
        let record = delivered_record(&h, "11988887777", None).await;

        h.sender.fail_for("5511988887777");
        assert!(matches!(svc.dispatch_survey(record.id).await, Err(Error::Channel(_))));
        let stored = h.store.get_survey_for_record(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SurveyStatus::Pending);

        let retry = SurveyService::new(
            Arc::clone(&h.store),
            RecordingSender::new(),
            Arc::clone(&h.settings),
            h.clock.clone(),
            Arc::clone(&h.events),
        );
        let survey = retry.dispatch_survey(record.id).await.unwrap();
        assert_eq!(survey.id, stored.id);
        assert_eq!(survey.status, SurveyStatus::Sent);
    }

    #[tokio::test]
    async fn dispatch_refuses_blacklisted_and_unsent() {
        let h = Harness::new().await;
        let svc = service(&h);
        let record = delivered_record(&h, "11988887777", None).await;
        h.store.add_blacklist_entry("11988887777", None).await.unwrap();
        assert!(matches!(
            svc.dispatch_survey(record.id).await,
            Err(Error::Survey(SurveyError::Blacklisted { .. }))
        ));

        let failed = SendRecord::new(
            None,
            SendPath::Campaign,
            "11900000009",
            "X",
            "t",
            SendStatus::Failed,
            Some("boom".into()),
            None,
            Utc::now(),
        );
        h.store.insert_send_record(&failed).await.unwrap();
        assert!(matches!(
            svc.dispatch_survey(failed.id).await,
            Err(Error::Survey(SurveyError::NotDispatchable { .. }))
        ));
        assert!(matches!(
            svc.dispatch_survey(Uuid::new_v4()).await,
            Err(Error::Dispatch(DispatchError::RecordNotFound { .. }))
        ));
        assert!(h.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn manual_survey_bypasses_driver_restriction() {
        let h = Harness::new().await;
        h.store.add_restricted_driver("Carlos").await.unwrap();
        let svc = service(&h);
        let recipient = Recipient::new("11988887777", "Ana")
            .with_order(OrderContext::new("PX-1").with_driver("carlos"));

        let survey = svc.dispatch_manual_survey(&recipient).await.unwrap();
        assert_eq!(survey.status, SurveyStatus::Sent);
        let record = h.store.get_send_record(survey.send_record_id).await.unwrap().unwrap();
        assert_eq!(record.path, SendPath::Manual);
        assert!(record.run_id.is_none());
    }

    #[tokio::test]
    async fn manual_survey_respects_blacklist() {
        let h = Harness::new().await;
        h.store.add_blacklist_entry("11988887777", None).await.unwrap();
        let svc = service(&h);
        let recipient = Recipient::new("11988887777", "Ana");
        assert!(svc.dispatch_manual_survey(&recipient).await.is_err());
        assert!(h.sender.sent().is_empty());
        let records = h.store.list_send_records_for_phone("11988887777", 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, SendStatus::Skipped);
        assert_eq!(records[0].reason.as_deref(), Some("blacklisted"));
    }

    #[tokio::test]
    async fn rating_then_feedback_flow() {
        let h = Harness::new().await;
        let svc = service(&h);
        let record = delivered_record(&h, "11988887777", None).await;
        let survey = svc.dispatch_survey(record.id).await.unwrap();

        let out = svc.handle_reply("5511988887777", "ótimo").await.unwrap().unwrap();
        assert!(!out.state_changed);
        assert_eq!(out.reply, Some(h.settings.survey_messages().await.reminder));

        let out = svc.handle_reply("11988887777", "4\u{FE0F}\u{20E3}").await.unwrap().unwrap();
        assert!(out.state_changed);
        assert!(out.reply_sent);
        let stored = h.store.get_survey(survey.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SurveyStatus::AwaitingFeedback);
        assert_eq!(stored.rating.unwrap().value(), 4);

        let out = svc
            .handle_reply("11988887777", "Motorista muito educado")
            .await
            .unwrap()
            .unwrap();
        assert!(out.state_changed);
        let stored = h.store.get_survey(survey.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SurveyStatus::Responded);
        assert_eq!(stored.feedback.as_deref(), Some("Motorista muito educado"));

        // Closed survey no longer catches replies
        assert!(svc.handle_reply("11988887777", "5").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_thank_you_sends_nothing() {
        let h = Harness::new().await;
        let mut messages = h.settings.survey_messages().await;
        messages.thank_you = String::new();
        h.settings.set_survey_messages(messages).await.unwrap();
        let svc = service(&h);
        let record = delivered_record(&h, "11988887777", None).await;
        svc.dispatch_survey(record.id).await.unwrap();
        svc.handle_reply("11988887777", "5").await.unwrap();

        let before = h.sender.sent().len();
        let out = svc.handle_reply("11988887777", "tudo certo").await.unwrap().unwrap();
        assert!(out.state_changed);
        assert!(out.reply.is_none());
        assert_eq!(h.sender.sent().len(), before);
    }

    #[tokio::test]
    async fn cancel_only_touches_pending() {
        let h = Harness::new().await;
        let svc = service(&h);
        let run = SendRun::new(RunKind::Survey, "t", 2, h.clock.now());
        h.store.insert_run(&run).await.unwrap();

        let a = delivered_record(&h, "11900000001", Some(run.id)).await;
        let b = delivered_record(&h, "11900000002", Some(run.id)).await;
        let pending = SatisfactionSurvey::pending(a.id, a.phone.clone(), h.clock.now());
        h.store.insert_survey(&pending).await.unwrap();
        let sent = svc.open_dispatched(&b).await.unwrap();

        assert_eq!(svc.cancel_pending_for_run(run.id).await.unwrap(), 1);
        let pending = h.store.get_survey(pending.id).await.unwrap().unwrap();
        assert_eq!(pending.status, SurveyStatus::Cancelled);
        assert!(pending.closed_at.is_some());
        let sent = h.store.get_survey(sent.id).await.unwrap().unwrap();
        assert_eq!(sent.status, SurveyStatus::Sent);
    }
}
