//! Agents: per-label reactions to classification.
//!
//! Agents register `onLabel` and/or `postLabel` hooks for a label. The
//! dispatcher runs `onLabel` for each item right after its label commits,
//! then every `postLabel` once per run.

pub mod builtin;
mod dispatcher;
mod hook;
pub mod idempotency;
mod registry;

pub use dispatcher::{DispatchReport, Dispatcher, HookCounts, PostLabelOutcome, PostLabelStatus};
pub use hook::{
    AgentHooks, HookResult, HookStatus, LabelContext, OnLabelHook, PostLabelContext,
    PostLabelHook, RunWindow, ScanTally,
};
pub use registry::{
    AgentOptions, AgentRegistration, AgentRegistry, DEFAULT_TIMEOUT_HINT, Registrar, RunWhen,
    settings_key,
};

use std::sync::Arc;

use crate::knowledge::PromptKnowledge;
use crate::llm::{Generator, QuotaRetryPolicy};
use crate::mailbox::Mailbox;
use crate::notify::NotificationSink;
use crate::pipeline::types::TriageLabel;

/// Collaborators shared by every hook in a run.
#[derive(Clone)]
pub struct AgentDeps {
    pub mailbox: Arc<dyn Mailbox>,
    pub generator: Arc<dyn Generator>,
    pub notifier: Arc<dyn NotificationSink>,
    /// Knowledge for reply drafting, loaded once per run.
    pub reply_knowledge: PromptKnowledge,
    pub model: String,
    pub retry: QuotaRetryPolicy,
    /// Mailbox label namespace.
    pub label_prefix: String,
}

impl AgentDeps {
    /// Mailbox name of a triage label.
    pub fn label_name(&self, label: TriageLabel) -> String {
        label.mailbox_name(&self.label_prefix)
    }

    /// Mailbox name of an agent-owned marker label, e.g. `triage/todo-forwarded`.
    pub fn marker_label(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.label_prefix)
    }
}
