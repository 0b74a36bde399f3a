//! Hook traits, contexts and results.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::agent::AgentDeps;
use crate::config::Settings;
use crate::error::AgentError;
use crate::pipeline::types::TriageLabel;

/// Outcome of one hook invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HookStatus {
    Ok,
    /// Nothing to do (already handled, or not applicable).
    Skip,
    /// Transient problem; the next run will pick the item up again.
    Retry,
    Error,
}

impl fmt::Display for HookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Skip => "skip",
            Self::Retry => "retry",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Tagged hook result. Only `status` drives aggregation; `info` is for logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookResult {
    pub status: HookStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

impl HookResult {
    pub fn ok() -> Self {
        Self {
            status: HookStatus::Ok,
            info: None,
        }
    }

    pub fn skip(info: impl Into<String>) -> Self {
        Self {
            status: HookStatus::Skip,
            info: Some(info.into()),
        }
    }

    pub fn retry(info: impl Into<String>) -> Self {
        Self {
            status: HookStatus::Retry,
            info: Some(info.into()),
        }
    }

    pub fn error(info: impl Into<String>) -> Self {
        Self {
            status: HookStatus::Error,
            info: Some(info.into()),
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }
}

/// Per-scan counts returned by a `postLabel` hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanTally {
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl ScanTally {
    /// Fold one per-thread result into the tally. `retry` counts as skipped.
    pub fn record(&mut self, result: &HookResult) {
        match result.status {
            HookStatus::Ok => self.processed += 1,
            HookStatus::Skip | HookStatus::Retry => self.skipped += 1,
            HookStatus::Error => self.errors += 1,
        }
    }
}

/// Half-open time range `(start, end]` covered by the current run. Scheduled
/// `postLabel` hooks fire when their schedule has an occurrence inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl RunWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window of length `span` ending at `end`.
    pub fn ending_at(end: DateTime<Utc>, span: chrono::Duration) -> Self {
        Self {
            start: end - span,
            end,
        }
    }
}

/// Context for one `onLabel` invocation.
pub struct LabelContext<'a> {
    pub label: TriageLabel,
    pub reason: &'a str,
    /// Latest message id of the item.
    pub item_id: &'a str,
    pub thread_id: &'a str,
    pub settings: &'a Settings,
    /// Resolved dry-run flag (global or agent override). Hooks must not
    /// mutate external state when set.
    pub dry_run: bool,
    pub deps: &'a AgentDeps,
}

/// Context for one `postLabel` invocation.
pub struct PostLabelContext<'a> {
    pub label: TriageLabel,
    pub settings: &'a Settings,
    pub dry_run: bool,
    pub window: RunWindow,
    pub deps: &'a AgentDeps,
}

/// Reacts to one freshly labeled item.
///
/// Implementations report their own failures as [`HookStatus::Error`]. An
/// `Err` or panic that still escapes is converted by the dispatcher.
#[async_trait]
pub trait OnLabelHook: Send + Sync {
    async fn on_label(&self, ctx: &LabelContext<'_>) -> Result<HookResult, AgentError>;
}

/// Scans the mailbox once per run for items carrying the agent's label.
///
/// Failures belong in the returned tally's `errors`.
#[async_trait]
pub trait PostLabelHook: Send + Sync {
    async fn post_label(&self, ctx: &PostLabelContext<'_>) -> Result<ScanTally, AgentError>;
}

/// The hooks an agent exposes. At least one must be set.
#[derive(Clone, Default)]
pub struct AgentHooks {
    pub on_label: Option<Arc<dyn OnLabelHook>>,
    pub post_label: Option<Arc<dyn PostLabelHook>>,
}

impl AgentHooks {
    pub fn on_label(hook: Arc<dyn OnLabelHook>) -> Self {
        Self {
            on_label: Some(hook),
            post_label: None,
        }
    }

    pub fn post_label(hook: Arc<dyn PostLabelHook>) -> Self {
        Self {
            on_label: None,
            post_label: Some(hook),
        }
    }

    /// Both hooks from one agent value.
    pub fn both<A>(agent: Arc<A>) -> Self
    where
        A: OnLabelHook + PostLabelHook + 'static,
    {
        Self {
            on_label: Some(agent.clone()),
            post_label: Some(agent),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.on_label.is_none() && self.post_label.is_none()
    }
}

impl fmt::Debug for AgentHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentHooks")
            .field("on_label", &self.on_label.is_some())
            .field("post_label", &self.post_label.is_some())
            .finish()
    }
}
