//! "Already handled?" markers backed by mailbox state.
//!
//! Nothing here keeps local state. A tracker asks the mailbox whether its
//! marker is present and sets the marker once the side effect has
//! succeeded, so a failed side effect leaves the thread discoverable for
//! the next run.

use std::future::Future;

use async_trait::async_trait;

use crate::error::{AgentError, MailboxError};
use crate::mailbox::{MailQuery, Mailbox};

/// Per-agent idempotency strategy.
#[async_trait]
pub trait IdempotencyTracker: Send + Sync {
    /// Whether the agent has already handled `thread_id`.
    async fn is_done(&self, mailbox: &dyn Mailbox, thread_id: &str) -> Result<bool, MailboxError>;

    /// Record that `thread_id` is handled. Only called after success.
    async fn mark_done(&self, mailbox: &dyn Mailbox, thread_id: &str) -> Result<(), MailboxError>;

    /// Narrow a discovery query to threads not yet marked, where the marker
    /// is expressible as a query clause.
    fn pending(&self, query: MailQuery) -> MailQuery {
        query
    }
}

/// Marker is a dedicated label on the thread.
#[derive(Debug, Clone)]
pub struct TrackingLabel {
    label: String,
}

impl TrackingLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

#[async_trait]
impl IdempotencyTracker for TrackingLabel {
    async fn is_done(&self, mailbox: &dyn Mailbox, thread_id: &str) -> Result<bool, MailboxError> {
        Ok(mailbox.get_thread(thread_id).await?.has_label(&self.label))
    }

    async fn mark_done(&self, mailbox: &dyn Mailbox, thread_id: &str) -> Result<(), MailboxError> {
        mailbox.apply_label(thread_id, &self.label).await
    }

    fn pending(&self, query: MailQuery) -> MailQuery {
        query.without_label(self.label.clone())
    }
}

/// Marker is the thread leaving the primary queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveMarker;

#[async_trait]
impl IdempotencyTracker for ArchiveMarker {
    async fn is_done(&self, mailbox: &dyn Mailbox, thread_id: &str) -> Result<bool, MailboxError> {
        Ok(!mailbox.is_active(thread_id).await?)
    }

    async fn mark_done(&self, mailbox: &dyn Mailbox, thread_id: &str) -> Result<(), MailboxError> {
        mailbox.archive(thread_id).await
    }
}

/// Marker is an artifact the side effect itself produces (a saved draft).
/// `mark_done` has nothing left to do.
#[derive(Debug, Clone, Copy, Default)]
pub struct DraftArtifact;

#[async_trait]
impl IdempotencyTracker for DraftArtifact {
    async fn is_done(&self, mailbox: &dyn Mailbox, thread_id: &str) -> Result<bool, MailboxError> {
        mailbox.has_draft(thread_id).await
    }

    async fn mark_done(&self, _mailbox: &dyn Mailbox, _thread_id: &str) -> Result<(), MailboxError> {
        Ok(())
    }
}

/// What [`run_once`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    AlreadyDone,
    Done,
    /// Dry-run: side effect and marker both skipped.
    Simulated,
}

/// Run `effect` for `thread_id` unless the tracker says it is done, then set
/// the marker. A failing effect leaves the marker unset.
pub async fn run_once<F, Fut>(
    tracker: &dyn IdempotencyTracker,
    mailbox: &dyn Mailbox,
    thread_id: &str,
    dry_run: bool,
    effect: F,
) -> Result<Outcome, AgentError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), AgentError>>,
{
    if tracker.is_done(mailbox, thread_id).await? {
        return Ok(Outcome::AlreadyDone);
    }
    if dry_run {
        return Ok(Outcome::Simulated);
    }
    effect().await?;
    tracker.mark_done(mailbox, thread_id).await?;
    Ok(Outcome::Done)
}
