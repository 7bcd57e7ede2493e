//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "dispatch_and_surveys",
        sql: r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS blacklist (
                phone TEXT PRIMARY KEY,
                reason TEXT,
                added_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS restricted_drivers (
                name TEXT PRIMARY KEY COLLATE NOCASE,
                added_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS restricted_prefixes (
                prefix TEXT PRIMARY KEY COLLATE NOCASE,
                added_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS send_runs (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                template TEXT NOT NULL,
                total_recipients INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                cancelled_at TEXT,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_send_runs_started ON send_runs(started_at);

            CREATE TABLE IF NOT EXISTS send_records (
                id TEXT PRIMARY KEY,
                run_id TEXT REFERENCES send_runs(id),
                path TEXT NOT NULL,
                phone TEXT NOT NULL,
                recipient_name TEXT NOT NULL,
                content TEXT NOT NULL,
                status TEXT NOT NULL,
                reason TEXT,
                order_snapshot TEXT,
                created_at TEXT NOT NULL,
                confirmed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_send_records_run ON send_records(run_id);
            CREATE INDEX IF NOT EXISTS idx_send_records_phone ON send_records(phone);

            CREATE TABLE IF NOT EXISTS surveys (
                id TEXT PRIMARY KEY,
                send_record_id TEXT NOT NULL UNIQUE REFERENCES send_records(id),
                phone TEXT NOT NULL,
                rating INTEGER,
                feedback TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                sent_at TEXT,
                responded_at TEXT,
                closed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_surveys_status ON surveys(status);
            CREATE INDEX IF NOT EXISTS idx_surveys_phone ON surveys(phone);
        "#,
    },
    Migration {
        version: 2,
        name: "conversations",
        sql: r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                phone TEXT NOT NULL UNIQUE,
                display_name TEXT,
                automation_active INTEGER NOT NULL DEFAULT 1,
                last_message_at TEXT,
                last_message_preview TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_last_message
                ON conversations(last_message_at);

            CREATE TABLE IF NOT EXISTS conversation_messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                sender TEXT NOT NULL,
                text TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversation_messages_conversation
                ON conversation_messages(conversation_id, created_at);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
