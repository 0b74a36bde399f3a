//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::agent::AgentDeps;
use crate::error::{LlmError, MailboxError, NotifyError};
use crate::knowledge::PromptKnowledge;
use crate::llm::{Generator, QuotaRetryPolicy};
use crate::mailbox::{MailMessage, MailQuery, MailThread, Mailbox};
use crate::notify::{Notification, NotificationSink};

// ── Mailbox ─────────────────────────────────────────────────────────

/// Mailbox kept in memory. Records every mutating call and can be told to
/// fail specific operations.
#[derive(Default)]
pub struct MockMailbox {
    threads: Mutex<BTreeMap<String, MailThread>>,
    drafts: Mutex<HashMap<String, Vec<String>>>,
    forwards: Mutex<Vec<(String, String)>>,
    mutations: Mutex<Vec<String>>,
    failing: Mutex<HashSet<&'static str>>,
}

impl MockMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an active thread with one message from `sender@example.com`.
    pub fn add_thread(&self, id: &str, labels: &[&str]) {
        let thread = MailThread {
            id: id.to_string(),
            subject: format!("Subject {id}"),
            messages: vec![MailMessage {
                id: format!("{id}-m1"),
                sender: "sender@example.com".into(),
                subject: format!("Subject {id}"),
                body: format!("Body of {id}"),
                sent_at: Utc::now() - Duration::days(1),
            }],
            labels: labels.iter().map(|s| s.to_string()).collect(),
            active: true,
        };
        self.threads.lock().unwrap().insert(id.to_string(), thread);
    }

    /// Make every call to `op` fail (`apply_label`, `archive`, `forward`, ...).
    pub fn fail_on(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    /// Mutating calls in order, formatted `op:thread[:arg]`.
    pub fn mutations(&self) -> Vec<String> {
        self.mutations.lock().unwrap().clone()
    }

    pub fn labels(&self, thread_id: &str) -> Vec<String> {
        self.threads
            .lock()
            .unwrap()
            .get(thread_id)
            .map(|t| t.labels.clone())
            .unwrap_or_default()
    }

    pub fn drafts(&self, thread_id: &str) -> Vec<String> {
        self.drafts
            .lock()
            .unwrap()
            .get(thread_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn forwards(&self) -> Vec<(String, String)> {
        self.forwards.lock().unwrap().clone()
    }

    fn check(&self, op: &'static str) -> Result<(), MailboxError> {
        if self.failing.lock().unwrap().contains(op) {
            return Err(MailboxError::Query(format!("{op} failed")));
        }
        Ok(())
    }

    fn record(&self, entry: String) {
        self.mutations.lock().unwrap().push(entry);
    }

    fn with_thread<T>(
        &self,
        thread_id: &str,
        f: impl FnOnce(&mut MailThread) -> T,
    ) -> Result<T, MailboxError> {
        let mut threads = self.threads.lock().unwrap();
        let thread = threads
            .get_mut(thread_id)
            .ok_or_else(|| MailboxError::ThreadNotFound(thread_id.to_string()))?;
        Ok(f(thread))
    }
}

#[async_trait]
impl Mailbox for MockMailbox {
    async fn search(&self, query: &MailQuery) -> Result<Vec<MailThread>, MailboxError> {
        self.check("search")?;
        let threads = self.threads.lock().unwrap();
        let matched = threads.values().filter(|t| query.matches(t)).cloned();
        Ok(match query.limit {
            Some(limit) => matched.take(limit).collect(),
            None => matched.collect(),
        })
    }

    async fn get_thread(&self, thread_id: &str) -> Result<MailThread, MailboxError> {
        self.check("get_thread")?;
        self.with_thread(thread_id, |t| t.clone())
    }

    async fn apply_label(&self, thread_id: &str, label: &str) -> Result<(), MailboxError> {
        self.check("apply_label")?;
        self.with_thread(thread_id, |t| {
            if !t.has_label(label) {
                t.labels.push(label.to_string());
            }
        })?;
        self.record(format!("apply_label:{thread_id}:{label}"));
        Ok(())
    }

    async fn remove_label(&self, thread_id: &str, label: &str) -> Result<(), MailboxError> {
        self.check("remove_label")?;
        self.with_thread(thread_id, |t| t.labels.retain(|l| l != label))?;
        self.record(format!("remove_label:{thread_id}:{label}"));
        Ok(())
    }

    async fn archive(&self, thread_id: &str) -> Result<(), MailboxError> {
        self.check("archive")?;
        self.with_thread(thread_id, |t| t.active = false)?;
        self.record(format!("archive:{thread_id}"));
        Ok(())
    }

    async fn is_active(&self, thread_id: &str) -> Result<bool, MailboxError> {
        self.check("is_active")?;
        self.with_thread(thread_id, |t| t.active)
    }

    async fn create_draft(&self, thread_id: &str, body: &str) -> Result<String, MailboxError> {
        self.check("create_draft")?;
        self.with_thread(thread_id, |_| ())?;
        let mut drafts = self.drafts.lock().unwrap();
        let entry = drafts.entry(thread_id.to_string()).or_default();
        entry.push(body.to_string());
        let id = format!("draft-{thread_id}-{}", entry.len());
        drop(drafts);
        self.record(format!("create_draft:{thread_id}"));
        Ok(id)
    }

    async fn has_draft(&self, thread_id: &str) -> Result<bool, MailboxError> {
        self.check("has_draft")?;
        Ok(!self.drafts(thread_id).is_empty())
    }

    async fn forward(
        &self,
        thread_id: &str,
        recipient: &str,
        _note: &str,
    ) -> Result<(), MailboxError> {
        self.check("forward")?;
        self.with_thread(thread_id, |_| ())?;
        self.forwards
            .lock()
            .unwrap()
            .push((thread_id.to_string(), recipient.to_string()));
        self.record(format!("forward:{thread_id}:{recipient}"));
        Ok(())
    }
}

// ── Generator ───────────────────────────────────────────────────────

/// Replies from a queue of scripted results; once drained, repeats `fallback`.
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: String,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: fallback.into(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, response: Result<String, LlmError>) -> Self {
        self.script.lock().unwrap().push_back(response);
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, prompt: &str, _model: &str) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.script.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Ok(self.fallback.clone()),
        }
    }
}

// ── Notifier ────────────────────────────────────────────────────────

/// Records notifications; can be switched to fail every send.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let notifier = Self::default();
        notifier.set_failing(true);
        notifier
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::DeliveryFailed {
                sink: "recording".into(),
                reason: "unreachable".into(),
            });
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

// ── Wiring ──────────────────────────────────────────────────────────

/// Agent dependencies over the given doubles, no retries, `triage/` prefix.
pub fn deps(
    mailbox: Arc<MockMailbox>,
    generator: Arc<ScriptedGenerator>,
    notifier: Arc<RecordingNotifier>,
) -> AgentDeps {
    AgentDeps {
        mailbox,
        generator,
        notifier,
        reply_knowledge: PromptKnowledge::none(),
        model: "test-model".into(),
        retry: QuotaRetryPolicy::new(0),
        label_prefix: "triage/".into(),
    }
}
