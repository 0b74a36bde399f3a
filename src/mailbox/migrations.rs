//! Version-tracked schema migrations for the local mailbox mirror.
//!
//! `run_migrations()` checks the current version and applies only the new
//! ones sequentially.

use libsql::Connection;

use crate::error::MailboxError;

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
        name: "threads_and_labels",
        sql: r#"
            CREATE TABLE IF NOT EXISTS threads (
                id TEXT PRIMARY KEY,
                subject TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_threads_active ON threads(active);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL REFERENCES threads(id),
                sender TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                sent_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id);

            CREATE TABLE IF NOT EXISTS thread_labels (
                thread_id TEXT NOT NULL REFERENCES threads(id),
                label TEXT NOT NULL,
                PRIMARY KEY (thread_id, label)
            );
            CREATE INDEX IF NOT EXISTS idx_thread_labels_label ON thread_labels(label);
        "#,
    },
    Migration {
        version: 2,
        name: "drafts_and_outbox",
        sql: r#"
            CREATE TABLE IF NOT EXISTS drafts (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL REFERENCES threads(id),
                body TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_drafts_thread ON drafts(thread_id);

            CREATE TABLE IF NOT EXISTS outbox (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL REFERENCES threads(id),
                message_id TEXT,
                recipient TEXT NOT NULL,
                note TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
        "#,
    },
];

/// Bring the schema up to the latest version.
pub(crate) async fn run_migrations(conn: &Connection) -> Result<(), MailboxError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .await
    .map_err(|e| MailboxError::Migration(format!("Failed to create _migrations: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                MailboxError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, MailboxError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| MailboxError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| MailboxError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            MailboxError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), MailboxError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| MailboxError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
