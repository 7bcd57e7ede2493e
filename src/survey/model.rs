use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{InvalidTransition, Rating, SurveyEvent, SurveyStatus, transition};

/// One satisfaction survey. At most one exists per send record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SatisfactionSurvey {
    pub id: Uuid,
    pub send_record_id: Uuid,
    pub phone: String,
    pub rating: Option<Rating>,
    pub feedback: Option<String>,
    pub status: SurveyStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    /// When the rating was recorded.
    pub responded_at: Option<DateTime<Utc>>,
    /// When the survey reached a terminal status.
    pub closed_at: Option<DateTime<Utc>>,
}

impl SatisfactionSurvey {
    /// A new survey in `pending`.
    pub fn pending(send_record_id: Uuid, phone: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            send_record_id,
            phone: phone.into(),
            rating: None,
            feedback: None,
            status: SurveyStatus::Pending,
            created_at: now,
            sent_at: None,
            responded_at: None,
            closed_at: None,
        }
    }

    /// A new survey whose question has already been delivered.
    pub fn sent(send_record_id: Uuid, phone: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            status: SurveyStatus::Sent,
            sent_at: Some(now),
            ..Self::pending(send_record_id, phone, now)
        }
    }

    /// Reference time for the expiry window: `sent_at`, else `created_at`.
    pub fn expiry_anchor(&self) -> DateTime<Utc> {
        self.sent_at.unwrap_or(self.created_at)
    }

    /// The survey after `event`, with status and timestamps updated.
    ///
    /// Pure: persisting the result is the caller's compare-and-set.
    pub fn apply(&self, event: &SurveyEvent, now: DateTime<Utc>) -> Result<Self, InvalidTransition> {
        let status = transition(self.status, event)?;
        let mut next = self.clone();
        next.status = status;
        match event {
            SurveyEvent::Dispatched => next.sent_at = Some(now),
            SurveyEvent::RatingReceived(rating) => {
                next.rating = Some(*rating);
                next.responded_at = Some(now);
            }
            SurveyEvent::FeedbackReceived(text) => next.feedback = Some(text.clone()),
            SurveyEvent::TimedOutWithoutRating
            | SurveyEvent::TimedOutWithoutFeedback
            | SurveyEvent::RunCancelled => {}
        }
        if status.is_terminal() {
            next.closed_at = Some(now);
        }
        Ok(next)
    }
}
