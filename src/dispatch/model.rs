//! Send runs and send records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::eligibility::SendPath;
use crate::orders::OrderContext;

/// What a run sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// Delivery notification.
    Campaign,
    /// Satisfaction survey question; each successful send opens a survey.
    Survey,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Campaign => "campaign",
            Self::Survey => "survey",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "campaign" => Ok(Self::Campaign),
            "survey" => Ok(Self::Survey),
            _ => Err(format!("Unknown run kind: {s}")),
        }
    }
}

/// Run lifecycle. Only `Running` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Cancelled,
    Completed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Unknown run status: {s}")),
        }
    }
}

/// A bulk send over a recipient list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRun {
    pub id: Uuid,
    pub kind: RunKind,
    pub status: RunStatus,
    pub template: String,
    pub total_recipients: u32,
    pub started_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SendRun {
    pub fn new(kind: RunKind, template: impl Into<String>, total_recipients: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            status: RunStatus::Running,
            template: template.into(),
            total_recipients,
            started_at: now,
            cancelled_at: None,
            completed_at: None,
        }
    }
}

/// Result of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Sent,
    Skipped,
    Failed,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SendStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown send status: {s}")),
        }
    }
}

/// One attempted (or skipped) message. Immutable apart from `confirmed_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRecord {
    pub id: Uuid,
    /// `None` for manual one-off sends.
    pub run_id: Option<Uuid>,
    pub path: SendPath,
    pub phone: String,
    pub recipient_name: String,
    pub content: String,
    pub status: SendStatus,
    /// Skip or failure reason.
    pub reason: Option<String>,
    pub order_snapshot: Option<OrderContext>,
    pub created_at: DateTime<Utc>,
    /// Set when the customer replies after this send.
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl SendRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: Option<Uuid>,
        path: SendPath,
        phone: impl Into<String>,
        recipient_name: impl Into<String>,
        content: impl Into<String>,
        status: SendStatus,
        reason: Option<String>,
        order_snapshot: Option<OrderContext>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            path,
            phone: phone.into(),
            recipient_name: recipient_name.into(),
            content: content.into(),
            status,
            reason,
            order_snapshot,
            created_at: now,
            confirmed_at: None,
        }
    }
}

/// Per-status counts for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub sent: u32,
    pub skipped: u32,
    pub failed: u32,
}

impl RunSummary {
    pub fn record(&mut self, status: SendStatus) {
        match status {
            SendStatus::Sent => self.sent += 1,
            SendStatus::Skipped => self.skipped += 1,
            SendStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.sent + self.skipped + self.failed
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    /// The run had already left `running`; nothing changed.
    AlreadyFinished(RunStatus),
}
