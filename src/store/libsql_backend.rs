//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! fixed-width RFC 3339 TEXT (microseconds, `Z`), so lexical order is time order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::conversations::model::{Conversation, Message, MessageSender};
use crate::dispatch::model::{RunStatus, RunSummary, SendRecord, SendRun, SendStatus};
use crate::error::DatabaseError;
use crate::orders::OrderContext;
use crate::phone;
use crate::store::migrations;
use crate::store::traits::{BlacklistEntry, Database, SurveyUpdate};
use crate::survey::model::SatisfactionSurvey;
use crate::survey::state::{Rating, SurveyStatus};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run one raw statement; tests use it to break the schema underneath a
    /// running component.
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(sql, ())
            .await
            .map_err(query_err("execute_raw"))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for timestamps.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s:?}: {e}")))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

fn query_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

/// Map a libsql execute error, turning UNIQUE violations into `Constraint`.
fn constraint_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| {
        let msg = e.to_string();
        if msg.contains("UNIQUE constraint failed") {
            DatabaseError::Constraint(format!("{op}: {msg}"))
        } else {
            DatabaseError::Query(format!("{op}: {msg}"))
        }
    }
}

const RUN_COLUMNS: &str =
    "id, kind, status, template, total_recipients, started_at, cancelled_at, completed_at";

const RECORD_COLUMNS: &str = "id, run_id, path, phone, recipient_name, content, status, reason, order_snapshot, created_at, confirmed_at";

const SURVEY_COLUMNS: &str = "id, send_record_id, phone, rating, feedback, status, created_at, sent_at, responded_at, closed_at";

const SURVEY_COLUMNS_S: &str = "s.id, s.send_record_id, s.phone, s.rating, s.feedback, s.status, s.created_at, s.sent_at, s.responded_at, s.closed_at";

const CONVERSATION_COLUMNS: &str =
    "id, phone, display_name, automation_active, last_message_at, last_message_preview";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender, text, created_at";

fn row_to_run(row: &libsql::Row) -> Result<SendRun, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("run row: {e}"));
    let id: String = row.get(0).map_err(get_err)?;
    let kind: String = row.get(1).map_err(get_err)?;
    let status: String = row.get(2).map_err(get_err)?;
    let total: i64 = row.get(4).map_err(get_err)?;
    let started: String = row.get(5).map_err(get_err)?;
    Ok(SendRun {
        id: parse_uuid(&id)?,
        kind: parse_enum(&kind)?,
        status: parse_enum(&status)?,
        template: row.get(3).map_err(get_err)?,
        total_recipients: u32::try_from(total).unwrap_or(0),
        started_at: parse_datetime(&started),
        cancelled_at: parse_optional_datetime(row.get(6).map_err(get_err)?),
        completed_at: parse_optional_datetime(row.get(7).map_err(get_err)?),
    })
}

fn row_to_record(row: &libsql::Row) -> Result<SendRecord, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("send record row: {e}"));
    let id: String = row.get(0).map_err(get_err)?;
    let run_id: Option<String> = row.get(1).map_err(get_err)?;
    let path: String = row.get(2).map_err(get_err)?;
    let status: String = row.get(6).map_err(get_err)?;
    let snapshot: Option<String> = row.get(8).map_err(get_err)?;
    let created: String = row.get(9).map_err(get_err)?;

    let order_snapshot = match snapshot {
        Some(json) => Some(
            serde_json::from_str::<OrderContext>(&json)
                .map_err(|e| DatabaseError::Serialization(format!("order_snapshot: {e}")))?,
        ),
        None => None,
    };

    Ok(SendRecord {
        id: parse_uuid(&id)?,
        run_id: run_id.as_deref().map(parse_uuid).transpose()?,
        path: parse_enum(&path)?,
        phone: row.get(3).map_err(get_err)?,
        recipient_name: row.get(4).map_err(get_err)?,
        content: row.get(5).map_err(get_err)?,
        status: parse_enum(&status)?,
        reason: row.get(7).map_err(get_err)?,
        order_snapshot,
        created_at: parse_datetime(&created),
        confirmed_at: parse_optional_datetime(row.get(10).map_err(get_err)?),
    })
}

fn row_to_survey(row: &libsql::Row) -> Result<SatisfactionSurvey, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("survey row: {e}"));
    let id: String = row.get(0).map_err(get_err)?;
    let record_id: String = row.get(1).map_err(get_err)?;
    let rating: Option<i64> = row.get(3).map_err(get_err)?;
    let status: String = row.get(5).map_err(get_err)?;
    let created: String = row.get(6).map_err(get_err)?;

    let rating = match rating {
        Some(v) => Some(
            u8::try_from(v)
                .ok()
                .and_then(Rating::new)
                .ok_or_else(|| DatabaseError::Serialization(format!("rating out of range: {v}")))?,
        ),
        None => None,
    };

    Ok(SatisfactionSurvey {
        id: parse_uuid(&id)?,
        send_record_id: parse_uuid(&record_id)?,
        phone: row.get(2).map_err(get_err)?,
        rating,
        feedback: row.get(4).map_err(get_err)?,
        status: parse_enum(&status)?,
        created_at: parse_datetime(&created),
        sent_at: parse_optional_datetime(row.get(7).map_err(get_err)?),
        responded_at: parse_optional_datetime(row.get(8).map_err(get_err)?),
        closed_at: parse_optional_datetime(row.get(9).map_err(get_err)?),
    })
}

fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("conversation row: {e}"));
    let id: String = row.get(0).map_err(get_err)?;
    let active: i64 = row.get(3).map_err(get_err)?;
    Ok(Conversation {
        id: parse_uuid(&id)?,
        phone: row.get(1).map_err(get_err)?,
        display_name: row.get(2).map_err(get_err)?,
        automation_active: active != 0,
        last_message_at: parse_optional_datetime(row.get(4).map_err(get_err)?),
        last_message_preview: row.get(5).map_err(get_err)?,
    })
}

fn row_to_message(row: &libsql::Row) -> Result<Message, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("message row: {e}"));
    let id: String = row.get(0).map_err(get_err)?;
    let conversation_id: String = row.get(1).map_err(get_err)?;
    let sender: String = row.get(2).map_err(get_err)?;
    let created: String = row.get(4).map_err(get_err)?;
    Ok(Message {
        id: parse_uuid(&id)?,
        conversation_id: parse_uuid(&conversation_id)?,
        sender: parse_enum(&sender)?,
        text: row.get(3).map_err(get_err)?,
        created_at: parse_datetime(&created),
    })
}

/// Collect every row of a query through `map`.
async fn collect_rows<T>(
    mut rows: libsql::Rows,
    op: &str,
    map: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err(op))? {
        out.push(map(&row)?);
    }
    Ok(out)
}

/// First row of a query through `map`, if any.
async fn first_row<T>(
    mut rows: libsql::Rows,
    op: &str,
    map: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Option<T>, DatabaseError> {
    match rows.next().await.map_err(query_err(op))? {
        Some(row) => Ok(Some(map(&row)?)),
        None => Ok(None),
    }
}

/// Shared CAS update used by `update_survey` and `apply_survey_batch`.
async fn cas_update_survey(
    conn: &Connection,
    survey: &SatisfactionSurvey,
    expected: SurveyStatus,
) -> Result<bool, DatabaseError> {
    let rating = match survey.rating {
        Some(r) => libsql::Value::Integer(i64::from(r.value())),
        None => libsql::Value::Null,
    };
    let count = conn
        .execute(
            "UPDATE surveys SET rating = ?1, feedback = ?2, status = ?3, sent_at = ?4, responded_at = ?5, closed_at = ?6
             WHERE id = ?7 AND status = ?8",
            params![
                rating,
                opt_text(survey.feedback.as_deref()),
                survey.status.as_str(),
                opt_ts(survey.sent_at),
                opt_ts(survey.responded_at),
                opt_ts(survey.closed_at),
                survey.id.to_string(),
                expected.as_str(),
            ],
        )
        .await
        .map_err(query_err("update_survey"))?;
    Ok(count > 0)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn list_settings(&self) -> Result<Vec<(String, String)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT key, value FROM settings ORDER BY key", ())
            .await
            .map_err(query_err("list_settings"))?;

        let mut settings = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_settings"))? {
            let key: String = row.get(0).map_err(query_err("list_settings"))?;
            let value: String = row.get(1).map_err(query_err("list_settings"))?;
            settings.push((key, value));
        }
        Ok(settings)
    }

    async fn upsert_settings(&self, entries: &[(String, String)]) -> Result<(), DatabaseError> {
        let now = ts(Utc::now());
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err("upsert_settings"))?;
        for (key, value) in entries {
            if let Err(e) = tx
                .execute(
                    "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT (key) DO UPDATE SET value = ?2, updated_at = ?3",
                    params![key.as_str(), value.as_str(), now.as_str()],
                )
                .await
            {
                let _ = tx.rollback().await;
                return Err(DatabaseError::Query(format!("upsert_settings: {e}")));
            }
        }
        tx.commit().await.map_err(query_err("upsert_settings"))?;
        debug!(count = entries.len(), "Settings upserted");
        Ok(())
    }

    // ── Rule tables ─────────────────────────────────────────────────

    async fn add_blacklist_entry(&self, raw_phone: &str, reason: Option<&str>) -> Result<(), DatabaseError> {
        let normalized = phone::normalize(raw_phone);
        if normalized.is_empty() {
            return Err(DatabaseError::Constraint(format!(
                "add_blacklist_entry: {raw_phone:?} has no digits"
            )));
        }
        self.conn()
            .execute(
                "INSERT INTO blacklist (phone, reason, added_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (phone) DO UPDATE SET reason = ?2",
                params![normalized.as_str(), opt_text(reason), ts(Utc::now())],
            )
            .await
            .map_err(query_err("add_blacklist_entry"))?;
        info!(phone = %normalized, "Phone blacklisted");
        Ok(())
    }

    async fn remove_blacklist_entry(&self, raw_phone: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM blacklist WHERE phone = ?1",
                params![phone::normalize(raw_phone)],
            )
            .await
            .map_err(query_err("remove_blacklist_entry"))?;
        Ok(count > 0)
    }

    async fn list_blacklist(&self) -> Result<Vec<BlacklistEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT phone, reason, added_at FROM blacklist ORDER BY added_at", ())
            .await
            .map_err(query_err("list_blacklist"))?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_blacklist"))? {
            let added: String = row.get(2).map_err(query_err("list_blacklist"))?;
            entries.push(BlacklistEntry {
                phone: row.get(0).map_err(query_err("list_blacklist"))?,
                reason: row.get(1).map_err(query_err("list_blacklist"))?,
                added_at: parse_datetime(&added),
            });
        }
        Ok(entries)
    }

    async fn add_restricted_driver(&self, name: &str) -> Result<(), DatabaseError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DatabaseError::Constraint(
                "add_restricted_driver: empty name".into(),
            ));
        }
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO restricted_drivers (name, added_at) VALUES (?1, ?2)",
                params![name, ts(Utc::now())],
            )
            .await
            .map_err(query_err("add_restricted_driver"))?;
        Ok(())
    }

    async fn remove_restricted_driver(&self, name: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM restricted_drivers WHERE name = ?1",
                params![name.trim()],
            )
            .await
            .map_err(query_err("remove_restricted_driver"))?;
        Ok(count > 0)
    }

    async fn list_restricted_drivers(&self) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT name FROM restricted_drivers ORDER BY name", ())
            .await
            .map_err(query_err("list_restricted_drivers"))?;
        let mut names = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_restricted_drivers"))? {
            names.push(row.get(0).map_err(query_err("list_restricted_drivers"))?);
        }
        Ok(names)
    }

    async fn add_restricted_prefix(&self, prefix: &str) -> Result<(), DatabaseError> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Err(DatabaseError::Constraint(
                "add_restricted_prefix: empty prefix".into(),
            ));
        }
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO restricted_prefixes (prefix, added_at) VALUES (?1, ?2)",
                params![prefix, ts(Utc::now())],
            )
            .await
            .map_err(query_err("add_restricted_prefix"))?;
        Ok(())
    }

    async fn remove_restricted_prefix(&self, prefix: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM restricted_prefixes WHERE prefix = ?1",
                params![prefix.trim()],
            )
            .await
            .map_err(query_err("remove_restricted_prefix"))?;
        Ok(count > 0)
    }

    async fn list_restricted_prefixes(&self) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT prefix FROM restricted_prefixes ORDER BY prefix", ())
            .await
            .map_err(query_err("list_restricted_prefixes"))?;
        let mut prefixes = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_restricted_prefixes"))? {
            prefixes.push(row.get(0).map_err(query_err("list_restricted_prefixes"))?);
        }
        Ok(prefixes)
    }

    // ── Send runs ───────────────────────────────────────────────────

    async fn insert_run(&self, run: &SendRun) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO send_runs ({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    run.id.to_string(),
                    run.kind.as_str(),
                    run.status.as_str(),
                    run.template.as_str(),
                    i64::from(run.total_recipients),
                    ts(run.started_at),
                    opt_ts(run.cancelled_at),
                    opt_ts(run.completed_at),
                ],
            )
            .await
            .map_err(constraint_err("insert_run"))?;
        debug!(run_id = %run.id, kind = %run.kind, "Send run inserted");
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<SendRun>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM send_runs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_run"))?;
        first_row(rows, "get_run", row_to_run).await
    }

    async fn get_run_status(&self, id: Uuid) -> Result<Option<RunStatus>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status FROM send_runs WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_run_status"))?;
        match rows.next().await.map_err(query_err("get_run_status"))? {
            Some(row) => {
                let status: String = row.get(0).map_err(query_err("get_run_status"))?;
                Ok(Some(parse_enum(&status)?))
            }
            None => Ok(None),
        }
    }

    async fn transition_run(
        &self,
        id: Uuid,
        to: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let column = match to {
            RunStatus::Cancelled => "cancelled_at",
            RunStatus::Completed => "completed_at",
            RunStatus::Running => {
                return Err(DatabaseError::Constraint(
                    "transition_run: runs never re-enter running".into(),
                ));
            }
        };
        let count = self
            .conn()
            .execute(
                &format!(
                    "UPDATE send_runs SET status = ?1, {column} = ?2 WHERE id = ?3 AND status = 'running'"
                ),
                params![to.as_str(), ts(at), id.to_string()],
            )
            .await
            .map_err(query_err("transition_run"))?;
        Ok(count > 0)
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<SendRun>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM send_runs ORDER BY started_at DESC, rowid DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(query_err("list_runs"))?;
        collect_rows(rows, "list_runs", row_to_run).await
    }

    // ── Send records ────────────────────────────────────────────────

    async fn insert_send_record(&self, record: &SendRecord) -> Result<(), DatabaseError> {
        let snapshot = match &record.order_snapshot {
            Some(order) => libsql::Value::Text(
                serde_json::to_string(order)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            ),
            None => libsql::Value::Null,
        };
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO send_records ({RECORD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    record.id.to_string(),
                    opt_text(record.run_id.map(|id| id.to_string()).as_deref()),
                    record.path.as_str(),
                    record.phone.as_str(),
                    record.recipient_name.as_str(),
                    record.content.as_str(),
                    record.status.as_str(),
                    opt_text(record.reason.as_deref()),
                    snapshot,
                    ts(record.created_at),
                    opt_ts(record.confirmed_at),
                ],
            )
            .await
            .map_err(constraint_err("insert_send_record"))?;
        debug!(record_id = %record.id, status = %record.status, "Send record inserted");
        Ok(())
    }

    async fn get_send_record(&self, id: Uuid) -> Result<Option<SendRecord>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM send_records WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_send_record"))?;
        first_row(rows, "get_send_record", row_to_record).await
    }

    async fn list_send_records_for_run(&self, run_id: Uuid) -> Result<Vec<SendRecord>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM send_records WHERE run_id = ?1 ORDER BY created_at ASC, rowid ASC"
                ),
                params![run_id.to_string()],
            )
            .await
            .map_err(query_err("list_send_records_for_run"))?;
        collect_rows(rows, "list_send_records_for_run", row_to_record).await
    }

    async fn list_send_records_for_phone(
        &self,
        raw_phone: &str,
        limit: usize,
    ) -> Result<Vec<SendRecord>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM send_records WHERE phone = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ),
                params![phone::normalize(raw_phone), limit as i64],
            )
            .await
            .map_err(query_err("list_send_records_for_phone"))?;
        collect_rows(rows, "list_send_records_for_phone", row_to_record).await
    }

    async fn confirm_latest_send_record(
        &self,
        raw_phone: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Uuid>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM send_records WHERE phone = ?1 AND status = 'sent' AND confirmed_at IS NULL
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![phone::normalize(raw_phone)],
            )
            .await
            .map_err(query_err("confirm_latest_send_record"))?;
        let Some(row) = rows
            .next()
            .await
            .map_err(query_err("confirm_latest_send_record"))?
        else {
            return Ok(None);
        };
        let id: String = row.get(0).map_err(query_err("confirm_latest_send_record"))?;
        self.conn()
            .execute(
                "UPDATE send_records SET confirmed_at = ?1 WHERE id = ?2 AND confirmed_at IS NULL",
                params![ts(at), id.as_str()],
            )
            .await
            .map_err(query_err("confirm_latest_send_record"))?;
        Ok(Some(parse_uuid(&id)?))
    }

    async fn count_send_records_by_status(&self, run_id: Uuid) -> Result<RunSummary, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status, COUNT(*) FROM send_records WHERE run_id = ?1 GROUP BY status",
                params![run_id.to_string()],
            )
            .await
            .map_err(query_err("count_send_records_by_status"))?;

        let mut summary = RunSummary::default();
        while let Some(row) = rows
            .next()
            .await
            .map_err(query_err("count_send_records_by_status"))?
        {
            let status: String = row.get(0).map_err(query_err("count_send_records_by_status"))?;
            let count: i64 = row.get(1).map_err(query_err("count_send_records_by_status"))?;
            let count = u32::try_from(count).unwrap_or(u32::MAX);
            match parse_enum::<SendStatus>(&status)? {
                SendStatus::Sent => summary.sent = count,
                SendStatus::Skipped => summary.skipped = count,
                SendStatus::Failed => summary.failed = count,
            }
        }
        Ok(summary)
    }

    // ── Surveys ─────────────────────────────────────────────────────

    async fn insert_survey(&self, survey: &SatisfactionSurvey) -> Result<(), DatabaseError> {
        let rating = match survey.rating {
            Some(r) => libsql::Value::Integer(i64::from(r.value())),
            None => libsql::Value::Null,
        };
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO surveys ({SURVEY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    survey.id.to_string(),
                    survey.send_record_id.to_string(),
                    survey.phone.as_str(),
                    rating,
                    opt_text(survey.feedback.as_deref()),
                    survey.status.as_str(),
                    ts(survey.created_at),
                    opt_ts(survey.sent_at),
                    opt_ts(survey.responded_at),
                    opt_ts(survey.closed_at),
                ],
            )
            .await
            .map_err(constraint_err("insert_survey"))?;
        debug!(survey_id = %survey.id, status = %survey.status, "Survey inserted");
        Ok(())
    }

    async fn get_survey(&self, id: Uuid) -> Result<Option<SatisfactionSurvey>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {SURVEY_COLUMNS} FROM surveys WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_survey"))?;
        first_row(rows, "get_survey", row_to_survey).await
    }

    async fn get_survey_for_record(
        &self,
        send_record_id: Uuid,
    ) -> Result<Option<SatisfactionSurvey>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {SURVEY_COLUMNS} FROM surveys WHERE send_record_id = ?1"),
                params![send_record_id.to_string()],
            )
            .await
            .map_err(query_err("get_survey_for_record"))?;
        first_row(rows, "get_survey_for_record", row_to_survey).await
    }

    async fn find_open_survey_for_phone(
        &self,
        raw_phone: &str,
    ) -> Result<Option<SatisfactionSurvey>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SURVEY_COLUMNS} FROM surveys
                     WHERE phone = ?1 AND status IN ('pending', 'sent', 'awaiting_feedback')
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                params![phone::normalize(raw_phone)],
            )
            .await
            .map_err(query_err("find_open_survey_for_phone"))?;
        first_row(rows, "find_open_survey_for_phone", row_to_survey).await
    }

    async fn list_surveys_by_status(
        &self,
        statuses: &[SurveyStatus],
    ) -> Result<Vec<SatisfactionSurvey>, DatabaseError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        // Status strings come from the enum, never from input.
        let list = statuses
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SURVEY_COLUMNS} FROM surveys WHERE status IN ({list}) ORDER BY created_at ASC, rowid ASC"
                ),
                (),
            )
            .await
            .map_err(query_err("list_surveys_by_status"))?;
        collect_rows(rows, "list_surveys_by_status", row_to_survey).await
    }

    async fn list_surveys_for_phone(
        &self,
        raw_phone: &str,
        limit: usize,
    ) -> Result<Vec<SatisfactionSurvey>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SURVEY_COLUMNS} FROM surveys WHERE phone = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ),
                params![phone::normalize(raw_phone), limit as i64],
            )
            .await
            .map_err(query_err("list_surveys_for_phone"))?;
        collect_rows(rows, "list_surveys_for_phone", row_to_survey).await
    }

    async fn list_pending_surveys_for_run(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<SatisfactionSurvey>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SURVEY_COLUMNS_S} FROM surveys s
                     JOIN send_records r ON r.id = s.send_record_id
                     WHERE r.run_id = ?1 AND s.status = 'pending'
                     ORDER BY s.created_at ASC"
                ),
                params![run_id.to_string()],
            )
            .await
            .map_err(query_err("list_pending_surveys_for_run"))?;
        collect_rows(rows, "list_pending_surveys_for_run", row_to_survey).await
    }

    async fn update_survey(
        &self,
        survey: &SatisfactionSurvey,
        expected: SurveyStatus,
    ) -> Result<bool, DatabaseError> {
        cas_update_survey(self.conn(), survey, expected).await
    }

    async fn apply_survey_batch(&self, updates: &[SurveyUpdate]) -> Result<Vec<Uuid>, DatabaseError> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err("apply_survey_batch"))?;

        let mut applied = Vec::with_capacity(updates.len());
        for update in updates {
            match cas_update_survey(&tx, &update.survey, update.expected).await {
                Ok(true) => applied.push(update.survey.id),
                Ok(false) => {
                    debug!(survey_id = %update.survey.id, "Survey changed concurrently, skipped in batch");
                }
                Err(e) => {
                    let _ = tx.rollback().await;
                    return Err(e);
                }
            }
        }

        tx.commit().await.map_err(query_err("apply_survey_batch"))?;
        Ok(applied)
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn ensure_conversation(
        &self,
        raw_phone: &str,
        display_name: Option<&str>,
    ) -> Result<Conversation, DatabaseError> {
        let normalized = phone::normalize(raw_phone);
        let display_name = display_name.map(str::trim).filter(|n| !n.is_empty());
        self.conn()
            .execute(
                "INSERT INTO conversations (id, phone, display_name, automation_active) VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT (phone) DO UPDATE SET display_name = COALESCE(conversations.display_name, excluded.display_name)",
                params![Uuid::new_v4().to_string(), normalized.as_str(), opt_text(display_name)],
            )
            .await
            .map_err(query_err("ensure_conversation"))?;

        self.get_conversation_by_phone(&normalized)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "conversation".into(),
                id: normalized,
            })
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_conversation"))?;
        first_row(rows, "get_conversation", row_to_conversation).await
    }

    async fn get_conversation_by_phone(&self, raw_phone: &str) -> Result<Option<Conversation>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE phone = ?1"),
                params![phone::normalize(raw_phone)],
            )
            .await
            .map_err(query_err("get_conversation_by_phone"))?;
        first_row(rows, "get_conversation_by_phone", row_to_conversation).await
    }

    async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     ORDER BY last_message_at IS NULL, last_message_at DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(query_err("list_conversations"))?;
        collect_rows(rows, "list_conversations", row_to_conversation).await
    }

    async fn set_conversation_automation(&self, id: Uuid, active: bool) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE conversations SET automation_active = ?1 WHERE id = ?2",
                params![i64::from(active), id.to_string()],
            )
            .await
            .map_err(query_err("set_conversation_automation"))?;
        Ok(count > 0)
    }

    async fn append_message(&self, message: &Message) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            &format!("INSERT INTO conversation_messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
            params![
                message.id.to_string(),
                message.conversation_id.to_string(),
                message.sender.as_str(),
                message.text.as_str(),
                ts(message.created_at),
            ],
        )
        .await
        .map_err(query_err("append_message"))?;

        conn.execute(
            "UPDATE conversations SET last_message_at = ?1, last_message_preview = ?2
             WHERE id = ?3 AND (last_message_at IS NULL OR last_message_at <= ?1)",
            params![
                ts(message.created_at),
                message.preview(),
                message.conversation_id.to_string()
            ],
        )
        .await
        .map_err(query_err("append_message"))?;

        debug!(
            conversation_id = %message.conversation_id,
            sender = %message.sender,
            "Message appended"
        );
        Ok(())
    }

    async fn latest_message(&self, conversation_id: Uuid) -> Result<Option<Message>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM conversation_messages WHERE conversation_id = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                params![conversation_id.to_string()],
            )
            .await
            .map_err(query_err("latest_message"))?;
        first_row(rows, "latest_message", row_to_message).await
    }

    async fn list_recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM conversation_messages WHERE conversation_id = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ),
                params![conversation_id.to_string(), limit as i64],
            )
            .await
            .map_err(query_err("list_recent_messages"))?;
        let mut messages = collect_rows(rows, "list_recent_messages", row_to_message).await?;
        messages.reverse();
        Ok(messages)
    }

    async fn has_message_from_after(
        &self,
        conversation_id: Uuid,
        sender: MessageSender,
        after: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM conversation_messages
                 WHERE conversation_id = ?1 AND sender = ?2 AND created_at > ?3",
                params![conversation_id.to_string(), sender.as_str(), ts(after)],
            )
            .await
            .map_err(query_err("has_message_from_after"))?;
        match rows.next().await.map_err(query_err("has_message_from_after"))? {
            Some(row) => Ok(row.get::<i64>(0).unwrap_or(0) > 0),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::model::RunKind;
    use crate::eligibility::SendPath;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_record(run_id: Option<Uuid>, phone: &str, status: SendStatus, at: DateTime<Utc>) -> SendRecord {
        SendRecord::new(
            run_id,
            SendPath::Campaign,
            phone,
            "Ana",
            "Seu pedido sai hoje",
            status,
            None,
            Some(OrderContext::new("PX-1").with_driver("Joao")),
            at,
        )
    }

    // ── Runs ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn run_cas_only_from_running() {
        let db = test_db().await;
        let run = SendRun::new(RunKind::Campaign, "oi {name}", 3, Utc::now());
        db.insert_run(&run).await.unwrap();

        assert!(db.transition_run(run.id, RunStatus::Completed, Utc::now()).await.unwrap());
        // Second transition loses the CAS
        assert!(!db.transition_run(run.id, RunStatus::Cancelled, Utc::now()).await.unwrap());

        let stored = db.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert!(stored.completed_at.is_some());
        assert!(stored.cancelled_at.is_none());
        assert!(db.transition_run(run.id, RunStatus::Running, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn run_status_missing_is_none() {
        let db = test_db().await;
        assert!(db.get_run_status(Uuid::new_v4()).await.unwrap().is_none());
    }

    // ── Records ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn record_round_trip_with_snapshot() {
        let db = test_db().await;
        let run = SendRun::new(RunKind::Survey, "t", 1, Utc::now());
        db.insert_run(&run).await.unwrap();
        let record = make_record(Some(run.id), "11988887777", SendStatus::Sent, Utc::now());
        db.insert_send_record(&record).await.unwrap();

        let fetched = db.get_send_record(record.id).await.unwrap().unwrap();
        assert_eq!(fetched.run_id, Some(run.id));
        assert_eq!(fetched.order_snapshot.unwrap().driver_name.as_deref(), Some("Joao"));

        let summary = db.count_send_records_by_status(run.id).await.unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.total(), 1);
    }

    #[tokio::test]
    async fn confirm_latest_sent_record() {
        let db = test_db().await;
        let t0 = Utc::now();
        let older = make_record(None, "11988887777", SendStatus::Sent, t0);
        let newer = make_record(None, "11988887777", SendStatus::Sent, t0 + chrono::Duration::seconds(1));
        let skipped = make_record(None, "11988887777", SendStatus::Skipped, t0 + chrono::Duration::seconds(2));
        for r in [&older, &newer, &skipped] {
            db.insert_send_record(r).await.unwrap();
        }

        let confirmed = db
            .confirm_latest_send_record("+55 11 98888-7777", Utc::now())
            .await
            .unwrap();
        assert_eq!(confirmed, Some(newer.id));
        assert!(db.get_send_record(newer.id).await.unwrap().unwrap().confirmed_at.is_some());
        assert!(db.get_send_record(older.id).await.unwrap().unwrap().confirmed_at.is_none());
    }

    // ── Surveys ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn second_survey_for_record_is_constraint() {
        let db = test_db().await;
        let record = make_record(None, "11988887777", SendStatus::Sent, Utc::now());
        db.insert_send_record(&record).await.unwrap();
        db.insert_survey(&SatisfactionSurvey::sent(record.id, "11988887777", Utc::now()))
            .await
            .unwrap();
        let err = db
            .insert_survey(&SatisfactionSurvey::pending(record.id, "11988887777", Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn survey_update_is_compare_and_set() {
        let db = test_db().await;
        let record = make_record(None, "11988887777", SendStatus::Sent, Utc::now());
        db.insert_send_record(&record).await.unwrap();
        let survey = SatisfactionSurvey::sent(record.id, "11988887777", Utc::now());
        db.insert_survey(&survey).await.unwrap();

        let mut rated = survey.clone();
        rated.status = SurveyStatus::AwaitingFeedback;
        rated.rating = Rating::new(4);
        rated.responded_at = Some(Utc::now());

        // Wrong expectation loses
        assert!(!db.update_survey(&rated, SurveyStatus::Pending).await.unwrap());
        assert!(db.update_survey(&rated, SurveyStatus::Sent).await.unwrap());

        let stored = db.get_survey(survey.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SurveyStatus::AwaitingFeedback);
        assert_eq!(stored.rating.unwrap().value(), 4);

        let open = db.find_open_survey_for_phone("11988887777").await.unwrap().unwrap();
        assert_eq!(open.id, survey.id);
    }

    #[tokio::test]
    async fn batch_reports_only_applied() {
        let db = test_db().await;
        let mut updates = Vec::new();
        for phone in ["11900000001", "11900000002"] {
            let record = make_record(None, phone, SendStatus::Sent, Utc::now());
            db.insert_send_record(&record).await.unwrap();
            let survey = SatisfactionSurvey::sent(record.id, phone, Utc::now());
            db.insert_survey(&survey).await.unwrap();
            let mut expired = survey.clone();
            expired.status = SurveyStatus::Expired;
            expired.closed_at = Some(Utc::now());
            updates.push(SurveyUpdate {
                survey: expired,
                expected: SurveyStatus::Sent,
            });
        }
        // Second update expects the wrong status
        updates[1].expected = SurveyStatus::Pending;

        let applied = db.apply_survey_batch(&updates).await.unwrap();
        assert_eq!(applied, vec![updates[0].survey.id]);
        let expired = db.list_surveys_by_status(&[SurveyStatus::Expired]).await.unwrap();
        assert_eq!(expired.len(), 1);
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let db = test_db().await;
        let mut updates = Vec::new();
        for phone in ["11900000001", "11900000002", "11900000003"] {
            let record = make_record(None, phone, SendStatus::Sent, Utc::now());
            db.insert_send_record(&record).await.unwrap();
            let survey = SatisfactionSurvey::sent(record.id, phone, Utc::now());
            db.insert_survey(&survey).await.unwrap();
            let mut expired = survey.clone();
            expired.status = SurveyStatus::Expired;
            expired.closed_at = Some(Utc::now());
            updates.push(SurveyUpdate {
                survey: expired,
                expected: SurveyStatus::Sent,
            });
        }

        // The last row in the batch refuses to change.
        let locked = updates[2].survey.id;
        db.conn()
            .execute(
                &format!(
                    "CREATE TRIGGER lock_survey BEFORE UPDATE ON surveys WHEN OLD.id = '{locked}'
                     BEGIN SELECT RAISE(ABORT, 'survey locked'); END"
                ),
                (),
            )
            .await
            .unwrap();

        assert!(db.apply_survey_batch(&updates).await.is_err());
        assert!(db.list_surveys_by_status(&[SurveyStatus::Expired]).await.unwrap().is_empty());
        assert_eq!(db.list_surveys_by_status(&[SurveyStatus::Sent]).await.unwrap().len(), 3);

        // The connection is usable again after the rollback
        db.conn().execute("DROP TRIGGER lock_survey", ()).await.unwrap();
        assert_eq!(db.apply_survey_batch(&updates).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn pending_surveys_for_run() {
        let db = test_db().await;
        let run = SendRun::new(RunKind::Survey, "t", 2, Utc::now());
        db.insert_run(&run).await.unwrap();
        let a = make_record(Some(run.id), "11900000001", SendStatus::Sent, Utc::now());
        let b = make_record(Some(run.id), "11900000002", SendStatus::Sent, Utc::now());
        db.insert_send_record(&a).await.unwrap();
        db.insert_send_record(&b).await.unwrap();
        db.insert_survey(&SatisfactionSurvey::pending(a.id, "11900000001", Utc::now()))
            .await
            .unwrap();
        db.insert_survey(&SatisfactionSurvey::sent(b.id, "11900000002", Utc::now()))
            .await
            .unwrap();

        let pending = db.list_pending_surveys_for_run(run.id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].send_record_id, a.id);
    }

    // ── Rules ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn blacklist_normalizes_phone() {
        let db = test_db().await;
        db.add_blacklist_entry("+55 (11) 98888-7777", Some("asked to stop"))
            .await
            .unwrap();
        let entries = db.list_blacklist().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].phone, "11988887777");
        assert!(db.remove_blacklist_entry("5511988887777").await.unwrap());
        assert!(db.list_blacklist().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn drivers_trimmed_and_unique_ignoring_case() {
        let db = test_db().await;
        db.add_restricted_driver("  Carlos  ").await.unwrap();
        db.add_restricted_driver("CARLOS").await.unwrap();
        assert_eq!(db.list_restricted_drivers().await.unwrap(), vec!["Carlos"]);
        assert!(db.remove_restricted_driver("carlos").await.unwrap());
    }

    // ── Settings ────────────────────────────────────────────────────

    #[tokio::test]
    async fn settings_upsert_replaces() {
        let db = test_db().await;
        db.upsert_settings(&[("a".into(), "1".into()), ("b".into(), "2".into())])
            .await
            .unwrap();
        db.upsert_settings(&[("a".into(), "3".into())]).await.unwrap();
        let rows = db.list_settings().await.unwrap();
        assert_eq!(rows, vec![("a".into(), "3".into()), ("b".into(), "2".into())]);
    }

    // ── Conversations ───────────────────────────────────────────────

    #[tokio::test]
    async fn ensure_conversation_is_idempotent() {
        let db = test_db().await;
        let first = db.ensure_conversation("11988887777", None).await.unwrap();
        let second = db
            .ensure_conversation("+55 11 98888 7777", Some("Ana"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert!(second.automation_active);
        assert_eq!(second.display_name.as_deref(), Some("Ana"));

        // Existing name is kept
        let third = db.ensure_conversation("11988887777", Some("Other")).await.unwrap();
        assert_eq!(third.display_name.as_deref(), Some("Ana"));
    }

    #[tokio::test]
    async fn messages_keep_order_and_guards_see_them() {
        let db = test_db().await;
        let convo = db.ensure_conversation("11988887777", None).await.unwrap();
        let t0 = Utc::now();
        let customer = Message::new(convo.id, MessageSender::Customer, "oi", t0);
        let operator = Message::new(
            convo.id,
            MessageSender::Operator,
            "já vejo",
            t0 + chrono::Duration::seconds(2),
        );
        db.append_message(&customer).await.unwrap();
        db.append_message(&operator).await.unwrap();

        let latest = db.latest_message(convo.id).await.unwrap().unwrap();
        assert_eq!(latest.sender, MessageSender::Operator);

        let recent = db.list_recent_messages(convo.id, 20).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, customer.id);

        assert!(db.has_message_from_after(convo.id, MessageSender::Operator, t0).await.unwrap());
        assert!(!db.has_message_from_after(convo.id, MessageSender::Automation, t0).await.unwrap());

        let convo = db.get_conversation(convo.id).await.unwrap().unwrap();
        assert_eq!(convo.last_message_preview.as_deref(), Some("já vejo"));

        assert!(db.set_conversation_automation(convo.id, false).await.unwrap());
        assert!(!db.get_conversation(convo.id).await.unwrap().unwrap().automation_active);
    }

    #[tokio::test]
    async fn local_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("notify.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.add_restricted_prefix("PX").await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert_eq!(db.list_restricted_prefixes().await.unwrap(), vec!["PX"]);
    }
}
