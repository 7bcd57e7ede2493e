//! `Database` trait — single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversations::model::{Conversation, Message, MessageSender};
use crate::dispatch::model::{RunStatus, RunSummary, SendRecord, SendRun};
use crate::error::DatabaseError;
use crate::survey::model::SatisfactionSurvey;
use crate::survey::state::SurveyStatus;

/// A blacklisted phone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    /// Normalized phone.
    pub phone: String,
    pub reason: Option<String>,
    pub added_at: DateTime<Utc>,
}

/// A survey update applied as part of a batch: the new row plus the status
/// it is expected to still have in the store.
#[derive(Debug, Clone)]
pub struct SurveyUpdate {
    pub survey: SatisfactionSurvey,
    pub expected: SurveyStatus,
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    /// All persisted key/value settings.
    async fn list_settings(&self) -> Result<Vec<(String, String)>, DatabaseError>;

    /// Insert or replace several settings atomically.
    async fn upsert_settings(&self, entries: &[(String, String)]) -> Result<(), DatabaseError>;

    // ── Rule tables ─────────────────────────────────────────────────

    /// Add (or update the reason of) a blacklisted phone. The phone is normalized.
    async fn add_blacklist_entry(&self, phone: &str, reason: Option<&str>) -> Result<(), DatabaseError>;

    async fn remove_blacklist_entry(&self, phone: &str) -> Result<bool, DatabaseError>;

    async fn list_blacklist(&self) -> Result<Vec<BlacklistEntry>, DatabaseError>;

    /// Add a restricted driver name (stored trimmed).
    async fn add_restricted_driver(&self, name: &str) -> Result<(), DatabaseError>;

    async fn remove_restricted_driver(&self, name: &str) -> Result<bool, DatabaseError>;

    async fn list_restricted_drivers(&self) -> Result<Vec<String>, DatabaseError>;

    async fn add_restricted_prefix(&self, prefix: &str) -> Result<(), DatabaseError>;

    async fn remove_restricted_prefix(&self, prefix: &str) -> Result<bool, DatabaseError>;

    async fn list_restricted_prefixes(&self) -> Result<Vec<String>, DatabaseError>;

    // ── Send runs ───────────────────────────────────────────────────

    async fn insert_run(&self, run: &SendRun) -> Result<(), DatabaseError>;

    async fn get_run(&self, id: Uuid) -> Result<Option<SendRun>, DatabaseError>;

    /// Cheap status read used at every recipient boundary.
    async fn get_run_status(&self, id: Uuid) -> Result<Option<RunStatus>, DatabaseError>;

    /// Compare-and-set `running → to`. Returns `false` when the run had
    /// already left `running`.
    async fn transition_run(
        &self,
        id: Uuid,
        to: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Most recent runs first.
    async fn list_runs(&self, limit: usize) -> Result<Vec<SendRun>, DatabaseError>;

    // ── Send records ────────────────────────────────────────────────

    async fn insert_send_record(&self, record: &SendRecord) -> Result<(), DatabaseError>;

    async fn get_send_record(&self, id: Uuid) -> Result<Option<SendRecord>, DatabaseError>;

    /// Records of a run in creation order.
    async fn list_send_records_for_run(&self, run_id: Uuid) -> Result<Vec<SendRecord>, DatabaseError>;

    /// Most recent records for a phone first.
    async fn list_send_records_for_phone(
        &self,
        phone: &str,
        limit: usize,
    ) -> Result<Vec<SendRecord>, DatabaseError>;

    /// Stamp `confirmed_at` on the latest unconfirmed `sent` record for a phone.
    async fn confirm_latest_send_record(
        &self,
        phone: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Uuid>, DatabaseError>;

    async fn count_send_records_by_status(&self, run_id: Uuid) -> Result<RunSummary, DatabaseError>;

    // ── Surveys ─────────────────────────────────────────────────────

    /// Insert a survey. A second survey for the same send record is a
    /// `DatabaseError::Constraint`.
    async fn insert_survey(&self, survey: &SatisfactionSurvey) -> Result<(), DatabaseError>;

    async fn get_survey(&self, id: Uuid) -> Result<Option<SatisfactionSurvey>, DatabaseError>;

    async fn get_survey_for_record(
        &self,
        send_record_id: Uuid,
    ) -> Result<Option<SatisfactionSurvey>, DatabaseError>;

    /// Newest non-terminal survey for a phone.
    async fn find_open_survey_for_phone(
        &self,
        phone: &str,
    ) -> Result<Option<SatisfactionSurvey>, DatabaseError>;

    async fn list_surveys_by_status(
        &self,
        statuses: &[SurveyStatus],
    ) -> Result<Vec<SatisfactionSurvey>, DatabaseError>;

    /// Most recent surveys for a phone first.
    async fn list_surveys_for_phone(
        &self,
        phone: &str,
        limit: usize,
    ) -> Result<Vec<SatisfactionSurvey>, DatabaseError>;

    /// Surveys still `pending` whose send record belongs to `run_id`.
    async fn list_pending_surveys_for_run(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<SatisfactionSurvey>, DatabaseError>;

    /// Write every mutable survey field, but only if the stored status is
    /// still `expected`. Returns whether the row was updated.
    async fn update_survey(
        &self,
        survey: &SatisfactionSurvey,
        expected: SurveyStatus,
    ) -> Result<bool, DatabaseError>;

    /// Apply several compare-and-set survey updates in one transaction.
    /// Returns the ids whose CAS succeeded; any error rolls back all of them.
    async fn apply_survey_batch(&self, updates: &[SurveyUpdate]) -> Result<Vec<Uuid>, DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    /// Fetch the conversation for a phone, creating it if needed. A provided
    /// display name replaces a missing one.
    async fn ensure_conversation(
        &self,
        phone: &str,
        display_name: Option<&str>,
    ) -> Result<Conversation, DatabaseError>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError>;

    async fn get_conversation_by_phone(&self, phone: &str) -> Result<Option<Conversation>, DatabaseError>;

    /// Most recently active conversations first.
    async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>, DatabaseError>;

    async fn set_conversation_automation(&self, id: Uuid, active: bool) -> Result<bool, DatabaseError>;

    /// Append a message and bump the conversation's last-message fields.
    async fn append_message(&self, message: &Message) -> Result<(), DatabaseError>;

    async fn latest_message(&self, conversation_id: Uuid) -> Result<Option<Message>, DatabaseError>;

    /// The last `limit` messages in chronological order.
    async fn list_recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError>;

    /// Whether `sender` wrote anything strictly after `after`.
    async fn has_message_from_after(
        &self,
        conversation_id: Uuid,
        sender: MessageSender,
        after: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;
}
