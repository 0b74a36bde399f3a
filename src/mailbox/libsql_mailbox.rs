//! libSQL-backed local mailbox mirror.
//!
//! Threads are written by an external sync (`upsert_thread`); the triage run
//! reads them and records labels, archive state, drafts and forwards here.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::MailboxError;
use crate::mailbox::migrations;
use crate::mailbox::{Clause, MailMessage, MailQuery, MailThread, Mailbox};

/// A forward recorded in the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub thread_id: String,
    pub message_id: Option<String>,
    pub recipient: String,
    pub note: String,
}

/// libSQL mailbox backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlMailbox {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlMailbox {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, MailboxError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                MailboxError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| MailboxError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let mailbox = Self::from_database(db).await?;
        info!(path = %path.display(), "Mailbox opened");
        Ok(mailbox)
    }

    /// Create an in-memory mailbox (for tests).
    pub async fn new_memory() -> Result<Self, MailboxError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                MailboxError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, MailboxError> {
        let conn = db
            .connect()
            .map_err(|e| MailboxError::Connection(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Insert or replace a thread with its messages and labels.
    pub async fn upsert_thread(&self, thread: &MailThread) -> Result<(), MailboxError> {
        let conn = self.conn();
        let updated_at = thread
            .latest()
            .map(|m| m.sent_at)
            .unwrap_or_else(Utc::now)
            .to_rfc3339();

        conn.execute(
            "INSERT INTO threads (id, subject, active, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET subject = ?2, active = ?3, updated_at = ?4",
            params![
                thread.id.as_str(),
                thread.subject.as_str(),
                thread.active as i64,
                updated_at
            ],
        )
        .await
        .map_err(|e| MailboxError::Query(format!("upsert thread: {e}")))?;

        for message in &thread.messages {
            conn.execute(
                "INSERT OR REPLACE INTO messages (id, thread_id, sender, subject, body, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.id.as_str(),
                    thread.id.as_str(),
                    message.sender.as_str(),
                    message.subject.as_str(),
                    message.body.as_str(),
                    message.sent_at.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| MailboxError::Query(format!("upsert message: {e}")))?;
        }

        conn.execute(
            "DELETE FROM thread_labels WHERE thread_id = ?1",
            params![thread.id.as_str()],
        )
        .await
        .map_err(|e| MailboxError::Query(format!("reset labels: {e}")))?;
        for label in &thread.labels {
            self.insert_label(&thread.id, label).await?;
        }

        debug!(thread = %thread.id, messages = thread.messages.len(), "Thread upserted");
        Ok(())
    }

    /// Forwards recorded for a thread, oldest first.
    pub async fn outbox_for(&self, thread_id: &str) -> Result<Vec<OutboxEntry>, MailboxError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT thread_id, message_id, recipient, note FROM outbox
                 WHERE thread_id = ?1 ORDER BY created_at ASC",
                params![thread_id],
            )
            .await
            .map_err(|e| MailboxError::Query(format!("outbox_for: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            entries.push(OutboxEntry {
                thread_id: row.get(0).map_err(query_err)?,
                message_id: row.get(1).ok(),
                recipient: row.get(2).map_err(query_err)?,
                note: row.get(3).map_err(query_err)?,
            });
        }
        Ok(entries)
    }

    async fn insert_label(&self, thread_id: &str, label: &str) -> Result<(), MailboxError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO thread_labels (thread_id, label) VALUES (?1, ?2)",
                params![thread_id, label],
            )
            .await
            .map_err(|e| MailboxError::Query(format!("insert label: {e}")))?;
        Ok(())
    }

    async fn ensure_thread(&self, thread_id: &str) -> Result<(), MailboxError> {
        let mut rows = self
            .conn()
            .query("SELECT 1 FROM threads WHERE id = ?1", params![thread_id])
            .await
            .map_err(|e| MailboxError::Query(format!("ensure_thread: {e}")))?;
        match rows.next().await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(MailboxError::ThreadNotFound(thread_id.to_string())),
            Err(e) => Err(MailboxError::Query(format!("ensure_thread: {e}"))),
        }
    }

    async fn load_messages(&self, thread_id: &str) -> Result<Vec<MailMessage>, MailboxError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, sender, subject, body, sent_at FROM messages
                 WHERE thread_id = ?1 ORDER BY sent_at ASC",
                params![thread_id],
            )
            .await
            .map_err(|e| MailboxError::Query(format!("load_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let sent_at: String = row.get(4).map_err(query_err)?;
            messages.push(MailMessage {
                id: row.get(0).map_err(query_err)?,
                sender: row.get(1).map_err(query_err)?,
                subject: row.get(2).map_err(query_err)?,
                body: row.get(3).map_err(query_err)?,
                sent_at: parse_datetime(&sent_at),
            });
        }
        Ok(messages)
    }

    async fn load_labels(&self, thread_id: &str) -> Result<Vec<String>, MailboxError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT label FROM thread_labels WHERE thread_id = ?1 ORDER BY label ASC",
                params![thread_id],
            )
            .await
            .map_err(|e| MailboxError::Query(format!("load_labels: {e}")))?;

        let mut labels = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            labels.push(row.get::<String>(0).map_err(query_err)?);
        }
        Ok(labels)
    }
}

/// Translate a query into SQL over `threads` with positional parameters.
/// Label clauses become correlated `EXISTS` subqueries.
fn search_sql(query: &MailQuery) -> (String, Vec<libsql::Value>) {
    let mut conditions = Vec::new();
    let mut values = Vec::new();
    for clause in &query.clauses {
        match clause {
            Clause::Active => conditions.push("t.active = 1".to_string()),
            Clause::HasLabel(label) | Clause::LacksLabel(label) => {
                values.push(libsql::Value::Text(label.clone()));
                let negate = if matches!(clause, Clause::LacksLabel(_)) { "NOT " } else { "" };
                conditions.push(format!(
                    "{negate}EXISTS (SELECT 1 FROM thread_labels l \
                     WHERE l.thread_id = t.id AND l.label = ?{})",
                    values.len()
                ));
            }
        }
    }

    let mut sql = String::from("SELECT t.id FROM threads t");
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(" ORDER BY t.updated_at DESC");
    if let Some(limit) = query.limit {
        values.push(libsql::Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        sql.push_str(&format!(" LIMIT ?{}", values.len()));
    }
    (sql, values)
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn query_err(e: libsql::Error) -> MailboxError {
    MailboxError::Query(e.to_string())
}

/// Parse an RFC 3339 string, falling back to the epoch minimum.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[async_trait]
impl Mailbox for LibSqlMailbox {
    async fn search(&self, query: &MailQuery) -> Result<Vec<MailThread>, MailboxError> {
        let (sql, values) = search_sql(query);
        let mut rows = self
            .conn()
            .query(&sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| MailboxError::Query(format!("search: {e}")))?;
        let mut ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            ids.push(row.get::<String>(0).map_err(query_err)?);
        }

        let mut threads = Vec::with_capacity(ids.len());
        for id in ids {
            threads.push(self.get_thread(&id).await?);
        }
        debug!(query = %query, found = threads.len(), "Mailbox search");
        Ok(threads)
    }

    async fn get_thread(&self, thread_id: &str) -> Result<MailThread, MailboxError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, subject, active FROM threads WHERE id = ?1",
                params![thread_id],
            )
            .await
            .map_err(|e| MailboxError::Query(format!("get_thread: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Err(MailboxError::ThreadNotFound(thread_id.to_string())),
            Err(e) => return Err(MailboxError::Query(format!("get_thread: {e}"))),
        };
        let id: String = row.get(0).map_err(query_err)?;
        let subject: String = row.get(1).map_err(query_err)?;
        let active: i64 = row.get(2).map_err(query_err)?;

        Ok(MailThread {
            messages: self.load_messages(&id).await?,
            labels: self.load_labels(&id).await?,
            id,
            subject,
            active: active != 0,
        })
    }

    async fn apply_label(&self, thread_id: &str, label: &str) -> Result<(), MailboxError> {
        self.ensure_thread(thread_id).await?;
        self.insert_label(thread_id, label).await
    }

    async fn remove_label(&self, thread_id: &str, label: &str) -> Result<(), MailboxError> {
        self.ensure_thread(thread_id).await?;
        self.conn()
            .execute(
                "DELETE FROM thread_labels WHERE thread_id = ?1 AND label = ?2",
                params![thread_id, label],
            )
            .await
            .map_err(|e| MailboxError::Query(format!("remove_label: {e}")))?;
        Ok(())
    }

    async fn archive(&self, thread_id: &str) -> Result<(), MailboxError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE threads SET active = 0 WHERE id = ?1",
                params![thread_id],
            )
            .await
            .map_err(|e| MailboxError::Query(format!("archive: {e}")))?;
        if changed == 0 {
            return Err(MailboxError::ThreadNotFound(thread_id.to_string()));
        }
        Ok(())
    }

    async fn is_active(&self, thread_id: &str) -> Result<bool, MailboxError> {
        let mut rows = self
            .conn()
            .query("SELECT active FROM threads WHERE id = ?1", params![thread_id])
            .await
            .map_err(|e| MailboxError::Query(format!("is_active: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(query_err)? != 0),
            Ok(None) => Err(MailboxError::ThreadNotFound(thread_id.to_string())),
            Err(e) => Err(MailboxError::Query(format!("is_active: {e}"))),
        }
    }

    async fn create_draft(&self, thread_id: &str, body: &str) -> Result<String, MailboxError> {
        self.ensure_thread(thread_id).await?;
        let id = Uuid::new_v4().to_string();
        self.conn()
            .execute(
                "INSERT INTO drafts (id, thread_id, body, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id.as_str(), thread_id, body, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| MailboxError::Query(format!("create_draft: {e}")))?;
        Ok(id)
    }

    async fn has_draft(&self, thread_id: &str) -> Result<bool, MailboxError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM drafts WHERE thread_id = ?1",
                params![thread_id],
            )
            .await
            .map_err(|e| MailboxError::Query(format!("has_draft: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) > 0),
            Ok(None) => Ok(false),
            Err(e) => Err(MailboxError::Query(format!("has_draft: {e}"))),
        }
    }

    async fn forward(
        &self,
        thread_id: &str,
        recipient: &str,
        note: &str,
    ) -> Result<(), MailboxError> {
        let thread = self.get_thread(thread_id).await?;
        let message_id = thread.latest().map(|m| m.id.clone());
        self.conn()
            .execute(
                "INSERT INTO outbox (id, thread_id, message_id, recipient, note, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    thread_id,
                    opt_text_owned(message_id),
                    recipient,
                    note,
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(|e| MailboxError::Query(format!("forward: {e}")))?;
        info!(thread = thread_id, recipient, "Thread forwarded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_mailbox() -> LibSqlMailbox {
        LibSqlMailbox::new_memory().await.unwrap()
    }

    fn make_thread(id: &str, labels: &[&str]) -> MailThread {
        MailThread {
            id: id.into(),
            subject: format!("Subject {id}"),
            messages: vec![MailMessage {
                id: format!("{id}-m1"),
                sender: "alice@example.com".into(),
                subject: format!("Subject {id}"),
                body: "Can you take a look?".into(),
                sent_at: Utc::now(),
            }],
            labels: labels.iter().map(|s| s.to_string()).collect(),
            active: true,
        }
    }

    #[tokio::test]
    async fn upsert_and_get_roundtrip() {
        let mb = test_mailbox().await;
        let thread = make_thread("t1", &["inbox"]);
        mb.upsert_thread(&thread).await.unwrap();

        let loaded = mb.get_thread("t1").await.unwrap();
        assert_eq!(loaded.subject, "Subject t1");
        assert_eq!(loaded.labels, vec!["inbox".to_string()]);
        assert_eq!(loaded.messages.len(), 1);
        assert!(loaded.active);
    }

    #[tokio::test]
    async fn search_filters_by_labels_and_queue() {
        let mb = test_mailbox().await;
        mb.upsert_thread(&make_thread("t1", &["triage/todo"])).await.unwrap();
        mb.upsert_thread(&make_thread("t2", &[])).await.unwrap();
        mb.upsert_thread(&make_thread("t3", &["triage/todo"])).await.unwrap();
        mb.archive("t3").await.unwrap();

        let todo = mb
            .search(&MailQuery::active().with_label("triage/todo"))
            .await
            .unwrap();
        assert_eq!(todo.len(), 1);
        assert_eq!(todo[0].id, "t1");

        let unlabeled = mb
            .search(&MailQuery::active().without_label("triage/todo"))
            .await
            .unwrap();
        assert_eq!(unlabeled.len(), 1);
        assert_eq!(unlabeled[0].id, "t2");
    }

    #[test]
    fn search_sql_binds_labels_and_limit() {
        let query = MailQuery::active()
            .with_label("triage/todo")
            .without_label("triage/todo-forwarded")
            .limit(25);
        let (sql, values) = search_sql(&query);
        assert!(sql.contains("t.active = 1"));
        assert!(sql.contains("AND EXISTS"));
        assert!(sql.contains("l.label = ?1"));
        assert!(sql.contains("NOT EXISTS"));
        assert!(sql.contains("l.label = ?2"));
        assert!(sql.ends_with("LIMIT ?3"));
        assert_eq!(
            values,
            vec![
                libsql::Value::Text("triage/todo".into()),
                libsql::Value::Text("triage/todo-forwarded".into()),
                libsql::Value::Integer(25),
            ]
        );

        let (sql, values) = search_sql(&MailQuery::default());
        assert_eq!(sql, "SELECT t.id FROM threads t ORDER BY t.updated_at DESC");
        assert!(values.is_empty());
    }

    #[tokio::test]
    async fn search_limit_applies_after_label_filter() {
        let mb = test_mailbox().await;
        for i in 0..5 {
            mb.upsert_thread(&make_thread(&format!("done{i}"), &["triage/todo", "triage/todo-forwarded"]))
                .await
                .unwrap();
        }
        mb.upsert_thread(&make_thread("pending", &["triage/todo"])).await.unwrap();

        let found = mb
            .search(
                &MailQuery::active()
                    .with_label("triage/todo")
                    .without_label("triage/todo-forwarded")
                    .limit(2),
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "pending");
    }

    #[tokio::test]
    async fn search_respects_limit() {
        let mb = test_mailbox().await;
        for i in 0..5 {
            mb.upsert_thread(&make_thread(&format!("t{i}"), &[])).await.unwrap();
        }
        let found = mb.search(&MailQuery::active().limit(3)).await.unwrap();
        assert_eq!(found.len(), 3);
    }

    #[tokio::test]
    async fn labels_are_idempotent_and_removable() {
        let mb = test_mailbox().await;
        mb.upsert_thread(&make_thread("t1", &[])).await.unwrap();
        mb.apply_label("t1", "x").await.unwrap();
        mb.apply_label("t1", "x").await.unwrap();
        assert_eq!(mb.get_thread("t1").await.unwrap().labels, vec!["x".to_string()]);

        mb.remove_label("t1", "x").await.unwrap();
        assert!(mb.get_thread("t1").await.unwrap().labels.is_empty());
    }

    #[tokio::test]
    async fn archive_changes_active_state() {
        let mb = test_mailbox().await;
        mb.upsert_thread(&make_thread("t1", &[])).await.unwrap();
        assert!(mb.is_active("t1").await.unwrap());
        mb.archive("t1").await.unwrap();
        assert!(!mb.is_active("t1").await.unwrap());
    }

    #[tokio::test]
    async fn unknown_thread_errors() {
        let mb = test_mailbox().await;
        assert!(matches!(
            mb.apply_label("nope", "x").await,
            Err(MailboxError::ThreadNotFound(_))
        ));
        assert!(matches!(
            mb.archive("nope").await,
            Err(MailboxError::ThreadNotFound(_))
        ));
    }

    #[tokio::test]
    async fn drafts_and_forwards_are_recorded() {
        let mb = test_mailbox().await;
        mb.upsert_thread(&make_thread("t1", &[])).await.unwrap();

        assert!(!mb.has_draft("t1").await.unwrap());
        mb.create_draft("t1", "Thanks, will do.").await.unwrap();
        assert!(mb.has_draft("t1").await.unwrap());

        mb.forward("t1", "tasks@example.com", "From triage").await.unwrap();
        let outbox = mb.outbox_for("t1").await.unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].recipient, "tasks@example.com");
        assert_eq!(outbox[0].message_id.as_deref(), Some("t1-m1"));
    }
}
