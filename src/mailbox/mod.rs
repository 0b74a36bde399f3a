//! Mailbox collaborator: thread storage, labels, archive, drafts, forwards.
//!
//! The triage core never caches mailbox state. Every "already handled?"
//! question is answered by asking the mailbox again.

mod libsql_mailbox;
mod migrations;

pub use libsql_mailbox::LibSqlMailbox;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MailboxError;

/// One message in a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// A mail thread with its current label and queue state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailThread {
    pub id: String,
    pub subject: String,
    /// Oldest first.
    pub messages: Vec<MailMessage>,
    pub labels: Vec<String>,
    /// Still in the primary queue (not archived).
    pub active: bool,
}

impl MailThread {
    /// Most recent message, if any.
    pub fn latest(&self) -> Option<&MailMessage> {
        self.messages.iter().max_by_key(|m| m.sent_at)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// One conjunct of a mailbox query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clause {
    /// Thread is in the primary queue.
    Active,
    HasLabel(String),
    LacksLabel(String),
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clause::Active => write!(f, "active"),
            Clause::HasLabel(l) => write!(f, "has-label({l})"),
            Clause::LacksLabel(l) => write!(f, "NOT has-label({l})"),
        }
    }
}

/// Conjunctive query over queue and label membership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailQuery {
    pub clauses: Vec<Clause>,
    pub limit: Option<usize>,
}

impl MailQuery {
    /// Threads still in the primary queue.
    pub fn active() -> Self {
        Self {
            clauses: vec![Clause::Active],
            limit: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.clauses.push(Clause::HasLabel(label.into()));
        self
    }

    pub fn without_label(mut self, label: impl Into<String>) -> Self {
        self.clauses.push(Clause::LacksLabel(label.into()));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Evaluate the query against a thread.
    pub fn matches(&self, thread: &MailThread) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::Active => thread.active,
            Clause::HasLabel(l) => thread.has_label(l),
            Clause::LacksLabel(l) => !thread.has_label(l),
        })
    }
}

impl fmt::Display for MailQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.clauses.is_empty() {
            return write!(f, "all");
        }
        let parts: Vec<String> = self.clauses.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join(" AND "))
    }
}

/// Mailbox platform operations used by the triage run and its agents.
///
/// Mutating methods: `apply_label`, `remove_label`, `archive`,
/// `create_draft`, `forward`.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Threads matching `query`, newest first.
    async fn search(&self, query: &MailQuery) -> Result<Vec<MailThread>, MailboxError>;

    /// Fetch a thread with all its messages.
    async fn get_thread(&self, thread_id: &str) -> Result<MailThread, MailboxError>;

    /// Add `label` to a thread. Adding an existing label is a no-op.
    async fn apply_label(&self, thread_id: &str, label: &str) -> Result<(), MailboxError>;

    /// Remove `label` from a thread. Removing a missing label is a no-op.
    async fn remove_label(&self, thread_id: &str, label: &str) -> Result<(), MailboxError>;

    /// Move a thread out of the primary queue.
    async fn archive(&self, thread_id: &str) -> Result<(), MailboxError>;

    /// Whether a thread is still in the primary queue.
    async fn is_active(&self, thread_id: &str) -> Result<bool, MailboxError>;

    /// Save a reply draft on a thread. Returns the draft id.
    async fn create_draft(&self, thread_id: &str, body: &str) -> Result<String, MailboxError>;

    /// Whether a thread already has a saved draft.
    async fn has_draft(&self, thread_id: &str) -> Result<bool, MailboxError>;

    /// Forward the latest message of a thread to `recipient`.
    async fn forward(
        &self,
        thread_id: &str,
        recipient: &str,
        note: &str,
    ) -> Result<(), MailboxError>;
}
