//! Shared types for the triage pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mailbox::MailThread;

// ── Labels ──────────────────────────────────────────────────────────

/// The fixed set of classification outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageLabel {
    /// Someone expects a personal reply.
    ReplyNeeded,
    /// A document, change or approval awaits review.
    Review,
    /// An actionable task that is not a reply.
    Todo,
    /// Informational only.
    Fyi,
}

impl TriageLabel {
    /// All labels in dispatch order.
    pub const ALL: [TriageLabel; 4] = [
        TriageLabel::ReplyNeeded,
        TriageLabel::Review,
        TriageLabel::Todo,
        TriageLabel::Fyi,
    ];

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReplyNeeded => "reply_needed",
            Self::Review => "review",
            Self::Todo => "todo",
            Self::Fyi => "fyi",
        }
    }

    /// Human description used in the classifier instructions.
    pub fn description(&self) -> &'static str {
        match self {
            Self::ReplyNeeded => "someone is waiting for a personal reply from me",
            Self::Review => "a document, change, or approval request needs my review",
            Self::Todo => "contains a concrete task for me that is not just a reply",
            Self::Fyi => "informational; no action needed",
        }
    }

    /// Parse a model-proposed label: trimmed, case-insensitive, canonical
    /// names only.
    pub fn parse_normalized(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_lowercase();
        Self::ALL.into_iter().find(|l| l.as_str() == normalized)
    }

    /// Name of this label in the mailbox, e.g. `triage/todo`.
    pub fn mailbox_name(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.as_str())
    }
}

impl fmt::Display for TriageLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Items ───────────────────────────────────────────────────────────

/// Per-run snapshot of a thread, sized for the classifier prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiableItem {
    /// Latest message id.
    pub id: String,
    pub thread_id: String,
    pub subject: String,
    pub sender: String,
    pub age_days: u32,
    /// Whitespace-collapsed body, bounded in characters.
    pub body_excerpt: String,
}

impl ClassifiableItem {
    /// Snapshot a thread. Threads without messages are not classifiable.
    pub fn from_thread(thread: &MailThread, excerpt_chars: usize, now: DateTime<Utc>) -> Option<Self> {
        let latest = thread.latest()?;
        let age_days = now
            .signed_duration_since(latest.sent_at)
            .num_days()
            .clamp(0, u32::MAX as i64) as u32;
        let subject = if latest.subject.trim().is_empty() {
            thread.subject.clone()
        } else {
            latest.subject.clone()
        };

        Some(Self {
            id: latest.id.clone(),
            thread_id: thread.id.clone(),
            subject,
            sender: latest.sender.clone(),
            age_days,
            body_excerpt: excerpt(&latest.body, excerpt_chars),
        })
    }
}

/// Collapse whitespace and bound to `max_chars` characters.
pub fn excerpt(body: &str, max_chars: usize) -> String {
    let collapsed = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let cut: String = collapsed.chars().take(max_chars).collect();
        format!("{}…", cut.trim_end())
    }
}

// ── Results ─────────────────────────────────────────────────────────

/// Reason attached to every item of a batch whose classifier call failed.
pub const REASON_FALLBACK_ON_ERROR: &str = "fallback-on-error";
/// Reason for an item the model skipped or labeled outside the known set.
pub const REASON_INVALID_OR_MISSING: &str = "invalid-or-missing";
/// Reason used when the model accepted a label without explaining it.
pub const REASON_DEFAULT: &str = "ok";

/// Where a classification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    Model,
    Fallback,
}

/// Classification outcome for one item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    pub id: String,
    pub thread_id: String,
    pub label: Option<TriageLabel>,
    pub reason: String,
    pub source: ResultSource,
}

impl ClassificationResult {
    pub fn accepted(item: &ClassifiableItem, label: TriageLabel, reason: String) -> Self {
        Self {
            id: item.id.clone(),
            thread_id: item.thread_id.clone(),
            label: Some(label),
            reason,
            source: ResultSource::Model,
        }
    }

    pub fn fallback(item: &ClassifiableItem, reason: &str) -> Self {
        Self {
            id: item.id.clone(),
            thread_id: item.thread_id.clone(),
            label: None,
            reason: reason.to_string(),
            source: ResultSource::Fallback,
        }
    }
}
