//! Survey status and the single guarded transition function.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Satisfaction survey lifecycle.
///
/// ```text
/// pending ─▶ sent ─▶ awaiting_feedback ─▶ responded
///    │         │
///    ├─────────┴─▶ expired     (no rating within the expiry window)
///    └─────────┴─▶ cancelled   (owning run cancelled)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurveyStatus {
    /// Created, question not yet delivered.
    Pending,
    /// Question delivered, waiting for a rating.
    Sent,
    /// Rating stored, waiting for optional feedback.
    AwaitingFeedback,
    Responded,
    Expired,
    Cancelled,
}

impl SurveyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::AwaitingFeedback => "awaiting_feedback",
            Self::Responded => "responded",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Responded | Self::Expired | Self::Cancelled)
    }

    /// Still waiting for a rating.
    pub fn awaits_rating(&self) -> bool {
        matches!(self, Self::Pending | Self::Sent)
    }
}

impl fmt::Display for SurveyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SurveyStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "awaiting_feedback" => Ok(Self::AwaitingFeedback),
            "responded" => Ok(Self::Responded),
            "expired" => Ok(Self::Expired),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown survey status: {s}")),
        }
    }
}

/// A rating in `1..=5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Rating(u8);

impl Rating {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    pub fn new(value: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&value).then_some(Self(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Rating {
    type Error = String;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("rating {value} is outside 1..=5"))
    }
}

impl From<Rating> for u8 {
    fn from(rating: Rating) -> Self {
        rating.0
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Something that happened to a survey.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurveyEvent {
    /// The question reached the customer.
    Dispatched,
    RatingReceived(Rating),
    FeedbackReceived(String),
    /// Expiry sweep: no rating in time.
    TimedOutWithoutRating,
    /// Finalize sweep: no feedback in time.
    TimedOutWithoutFeedback,
    /// The owning run was cancelled.
    RunCancelled,
}

impl SurveyEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dispatched => "dispatched",
            Self::RatingReceived(_) => "rating_received",
            Self::FeedbackReceived(_) => "feedback_received",
            Self::TimedOutWithoutRating => "timed_out_without_rating",
            Self::TimedOutWithoutFeedback => "timed_out_without_feedback",
            Self::RunCancelled => "run_cancelled",
        }
    }
}

/// A rejected transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot apply {event} to a survey in {from}")]
pub struct InvalidTransition {
    pub from: SurveyStatus,
    pub event: &'static str,
}

/// Compute the next status for `event`, or reject it.
///
/// Terminal statuses accept nothing.
pub fn transition(current: SurveyStatus, event: &SurveyEvent) -> Result<SurveyStatus, InvalidTransition> {
    use SurveyStatus::*;

    let next = match (current, event) {
        (Pending, SurveyEvent::Dispatched) => Some(Sent),
        (Pending | Sent, SurveyEvent::RatingReceived(_)) => Some(AwaitingFeedback),
        (Pending | Sent, SurveyEvent::TimedOutWithoutRating) => Some(Expired),
        (Pending | Sent, SurveyEvent::RunCancelled) => Some(Cancelled),
        (AwaitingFeedback, SurveyEvent::FeedbackReceived(_)) => Some(Responded),
        (AwaitingFeedback, SurveyEvent::TimedOutWithoutFeedback) => Some(Responded),
        _ => None,
    };

    next.ok_or(InvalidTransition {
        from: current,
        event: event.name(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rating(v: u8) -> SurveyEvent {
        SurveyEvent::RatingReceived(Rating::new(v).unwrap())
    }

    #[test]
    fn happy_path() {
        let s = transition(SurveyStatus::Pending, &SurveyEvent::Dispatched).unwrap();
        assert_eq!(s, SurveyStatus::Sent);
        let s = transition(s, &rating(4)).unwrap();
        assert_eq!(s, SurveyStatus::AwaitingFeedback);
        let s = transition(s, &SurveyEvent::FeedbackReceived("ok".into())).unwrap();
        assert_eq!(s, SurveyStatus::Responded);
    }

    #[test]
    fn finalize_without_feedback() {
        let s = transition(SurveyStatus::AwaitingFeedback, &SurveyEvent::TimedOutWithoutFeedback);
        assert_eq!(s.unwrap(), SurveyStatus::Responded);
    }

    #[test]
    fn expiry_and_cancel_only_before_rating() {
        for from in [SurveyStatus::Pending, SurveyStatus::Sent] {
            assert_eq!(
                transition(from, &SurveyEvent::TimedOutWithoutRating).unwrap(),
                SurveyStatus::Expired
            );
            assert_eq!(
                transition(from, &SurveyEvent::RunCancelled).unwrap(),
                SurveyStatus::Cancelled
            );
        }
        assert!(transition(SurveyStatus::AwaitingFeedback, &SurveyEvent::TimedOutWithoutRating).is_err());
        assert!(transition(SurveyStatus::AwaitingFeedback, &SurveyEvent::RunCancelled).is_err());
    }

    #[test]
    fn terminal_states_reject_everything() {
        let events = [
            SurveyEvent::Dispatched,
            rating(3),
            SurveyEvent::FeedbackReceived("late".into()),
            SurveyEvent::TimedOutWithoutRating,
            SurveyEvent::TimedOutWithoutFeedback,
            SurveyEvent::RunCancelled,
        ];
        for from in [SurveyStatus::Responded, SurveyStatus::Expired, SurveyStatus::Cancelled] {
            assert!(from.is_terminal());
            for event in &events {
                assert!(transition(from, event).is_err(), "{from} accepted {}", event.name());
            }
        }
    }

    #[test]
    fn expired_cannot_receive_rating() {
        let err = transition(SurveyStatus::Expired, &rating(5)).unwrap_err();
        assert_eq!(err.from, SurveyStatus::Expired);
        assert_eq!(err.event, "rating_received");
    }

    #[test]
    fn sent_cannot_be_redispatched() {
        assert!(transition(SurveyStatus::Sent, &SurveyEvent::Dispatched).is_err());
    }

    #[test]
    fn rating_bounds() {
        assert!(Rating::new(0).is_none());
        assert!(Rating::new(6).is_none());
        assert_eq!(Rating::new(5).unwrap().value(), 5);
        assert!(serde_json::from_str::<Rating>("9").is_err());
    }

    #[test]
    fn status_round_trips_through_str() {
        assert_eq!(
            "awaiting_feedback".parse::<SurveyStatus>().unwrap(),
            SurveyStatus::AwaitingFeedback
        );
    }
}
