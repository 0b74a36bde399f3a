//! Two-phase hook dispatch.
//!
//! Phase A walks the classification results in order: commit the label,
//! then run each enabled `onLabel` agent for it. Phase B runs each enabled
//! `postLabel` agent once. Hook failures, including panics, are recorded
//! and never stop the loop.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::agent::AgentDeps;
use crate::agent::hook::{
    HookResult, HookStatus, LabelContext, PostLabelContext, RunWindow, ScanTally,
};
use crate::agent::registry::{AgentRegistration, AgentRegistry};
use crate::config::Settings;
use crate::error::AgentError;
use crate::pipeline::types::{ClassificationResult, TriageLabel};

/// `onLabel` results by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HookCounts {
    pub ok: usize,
    pub skip: usize,
    pub retry: usize,
    pub error: usize,
}

impl HookCounts {
    pub fn record(&mut self, status: HookStatus) {
        match status {
            HookStatus::Ok => self.ok += 1,
            HookStatus::Skip => self.skip += 1,
            HookStatus::Retry => self.retry += 1,
            HookStatus::Error => self.error += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.ok + self.skip + self.retry + self.error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PostLabelStatus {
    Completed,
    /// Scheduled agent with no occurrence in this run's window.
    NotDue,
    Error,
}

/// One `postLabel` invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostLabelOutcome {
    pub agent: String,
    pub label: TriageLabel,
    pub status: PostLabelStatus,
    pub tally: ScanTally,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate of one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchReport {
    pub labels_applied: usize,
    /// Labels that dry-run would have applied.
    pub labels_simulated: usize,
    pub label_failures: usize,
    /// Results without a label (fallback).
    pub unlabeled: usize,
    pub on_label: HookCounts,
    pub post_label: Vec<PostLabelOutcome>,
}

impl DispatchReport {
    /// Hook-level failures across both phases, including per-thread errors
    /// reported in `postLabel` tallies.
    pub fn hook_errors(&self) -> usize {
        self.on_label.error
            + self
                .post_label
                .iter()
                .map(|o| o.tally.errors + usize::from(o.status == PostLabelStatus::Error))
                .sum::<usize>()
    }
}

/// Runs registered hooks against one run's classification results.
pub struct Dispatcher<'a> {
    registry: &'a AgentRegistry,
    deps: &'a AgentDeps,
    settings: &'a Settings,
    dry_run: bool,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        registry: &'a AgentRegistry,
        deps: &'a AgentDeps,
        settings: &'a Settings,
        dry_run: bool,
    ) -> Self {
        Self {
            registry,
            deps,
            settings,
            dry_run,
        }
    }

    /// Phase A then Phase B.
    pub async fn dispatch(
        &self,
        results: &[ClassificationResult],
        window: RunWindow,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        self.on_label_phase(results, &mut report).await;
        self.post_label_phase(window, &mut report).await;

        info!(
            labels_applied = report.labels_applied,
            labels_simulated = report.labels_simulated,
            label_failures = report.label_failures,
            unlabeled = report.unlabeled,
            hooks_ok = report.on_label.ok,
            hooks_skip = report.on_label.skip,
            hooks_retry = report.on_label.retry,
            hooks_error = report.on_label.error,
            post_label_runs = report.post_label.len(),
            "Dispatch complete"
        );
        report
    }

    /// Commit each label and run its `onLabel` agents.
    pub async fn on_label_phase(
        &self,
        results: &[ClassificationResult],
        report: &mut DispatchReport,
    ) {
        for result in results {
            let Some(label) = result.label else {
                debug!(item = %result.id, reason = %result.reason, "No label, skipping dispatch");
                report.unlabeled += 1;
                continue;
            };

            if !self.commit_label(result, label, report).await {
                continue;
            }

            for registration in self.registry.agents(label) {
                let Some(hook) = registration.hooks.on_label.as_ref() else {
                    continue;
                };
                if !registration.is_enabled(self.settings) {
                    continue;
                }

                let ctx = LabelContext {
                    label,
                    reason: &result.reason,
                    item_id: &result.id,
                    thread_id: &result.thread_id,
                    settings: self.settings,
                    dry_run: registration.dry_run(self.settings, self.dry_run),
                    deps: self.deps,
                };
                let span = info_span!(
                    "hook",
                    phase = "on_label",
                    agent = %registration.name,
                    %label,
                    item = %result.id,
                    thread = %result.thread_id,
                );

                let outcome = invoke(registration, hook.on_label(&ctx))
                    .instrument(span.clone())
                    .await;
                let hook_result = outcome.unwrap_or_else(HookResult::error);

                span.in_scope(|| log_hook_result(&hook_result));
                report.on_label.record(hook_result.status);
            }
        }
    }

    /// Run every enabled `postLabel` agent once.
    pub async fn post_label_phase(&self, window: RunWindow, report: &mut DispatchReport) {
        for registration in self.registry.iter() {
            let Some(hook) = registration.hooks.post_label.as_ref() else {
                continue;
            };
            if !registration.is_enabled(self.settings) {
                continue;
            }

            let mut outcome = PostLabelOutcome {
                agent: registration.name.clone(),
                label: registration.label,
                status: PostLabelStatus::Completed,
                tally: ScanTally::default(),
                error: None,
            };

            if !registration.options.run_when.is_due(&window) {
                info!(agent = %registration.name, "Scheduled agent not due this run");
                outcome.status = PostLabelStatus::NotDue;
                report.post_label.push(outcome);
                continue;
            }

            let ctx = PostLabelContext {
                label: registration.label,
                settings: self.settings,
                dry_run: registration.dry_run(self.settings, self.dry_run),
                window,
                deps: self.deps,
            };
            let span = info_span!(
                "hook",
                phase = "post_label",
                agent = %registration.name,
                label = %registration.label,
            );

            match invoke(registration, hook.post_label(&ctx))
                .instrument(span.clone())
                .await
            {
                Ok(tally) => {
                    span.in_scope(|| {
                        info!(
                            processed = tally.processed,
                            skipped = tally.skipped,
                            errors = tally.errors,
                            "postLabel scan complete"
                        )
                    });
                    outcome.tally = tally;
                }
                Err(e) => {
                    span.in_scope(|| error!(error = %e, "postLabel hook failed"));
                    outcome.status = PostLabelStatus::Error;
                    outcome.error = Some(e);
                }
            }
            report.post_label.push(outcome);
        }
    }

    /// Apply the mailbox label for `result`. Returns whether hooks may run.
    async fn commit_label(
        &self,
        result: &ClassificationResult,
        label: TriageLabel,
        report: &mut DispatchReport,
    ) -> bool {
        let name = self.deps.label_name(label);
        if self.dry_run {
            info!(thread = %result.thread_id, label = %name, "Dry run: would apply label");
            report.labels_simulated += 1;
            return true;
        }

        match self.deps.mailbox.apply_label(&result.thread_id, &name).await {
            Ok(()) => {
                debug!(thread = %result.thread_id, label = %name, "Label applied");
                report.labels_applied += 1;
                true
            }
            Err(e) => {
                error!(thread = %result.thread_id, label = %name, error = %e, "Failed to apply label");
                report.label_failures += 1;
                false
            }
        }
    }
}

/// Await a hook, turning errors and panics into a message and warning when
/// the soft time budget is exceeded.
async fn invoke<T, F>(registration: &AgentRegistration, hook: F) -> Result<T, String>
where
    F: Future<Output = Result<T, AgentError>>,
{
    let started = Instant::now();
    let outcome = AssertUnwindSafe(hook).catch_unwind().await;
    warn_if_slow(started.elapsed(), registration.options.timeout_hint);

    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(format!("hook panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn warn_if_slow(elapsed: Duration, hint: Duration) {
    if elapsed > hint {
        warn!(
            elapsed_ms = elapsed.as_millis() as u64,
            hint_ms = hint.as_millis() as u64,
            "Hook exceeded its time hint"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn log_hook_result(result: &HookResult) {
    let info = result.info.as_deref().unwrap_or("");
    match result.status {
        HookStatus::Ok => debug!(info, "Hook ok"),
        HookStatus::Skip => debug!(info, "Hook skipped"),
        HookStatus::Retry => warn!(info, "Hook asked to retry next run"),
        HookStatus::Error => error!(info, "Hook failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    use crate::agent::hook::{AgentHooks, OnLabelHook, PostLabelHook};
    use crate::agent::registry::{AgentOptions, RunWhen};
    use crate::pipeline::types::{ClassifiableItem, REASON_FALLBACK_ON_ERROR};
    use crate::testing::{self, MockMailbox, RecordingNotifier, ScriptedGenerator};

    #[derive(Clone, Copy)]
    enum Behavior {
        Ok,
        Fail,
        Panic,
    }

    /// Hook double that records `(agent, phase, item, dry_run)`.
    struct RecordingAgent {
        name: &'static str,
        behavior: Behavior,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingAgent {
        fn act(&self, entry: String) -> Result<(), AgentError> {
            self.log.lock().unwrap().push(entry);
            match self.behavior {
                Behavior::Ok => Ok(()),
                Behavior::Fail => Err(AgentError::SideEffect(format!("{} failed", self.name))),
                Behavior::Panic => panic!("{} exploded", self.name),
            }
        }
    }

    #[async_trait]
    impl OnLabelHook for RecordingAgent {
        async fn on_label(&self, ctx: &LabelContext<'_>) -> Result<HookResult, AgentError> {
            self.act(format!("{}:on:{}:{}", self.name, ctx.item_id, ctx.dry_run))?;
            Ok(HookResult::ok())
        }
    }

    #[async_trait]
    impl PostLabelHook for RecordingAgent {
        async fn post_label(&self, ctx: &PostLabelContext<'_>) -> Result<ScanTally, AgentError> {
            self.act(format!("{}:post:{}:{}", self.name, ctx.label, ctx.dry_run))?;
            Ok(ScanTally {
                processed: 1,
                ..Default::default()
            })
        }
    }

    struct Fixture {
        mailbox: Arc<MockMailbox>,
        deps: AgentDeps,
        log: Arc<Mutex<Vec<String>>>,
        registry: AgentRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let mailbox = Arc::new(MockMailbox::new());
            for i in 1..=3 {
                mailbox.add_thread(&format!("t{i}"), &[]);
            }
            let deps = testing::deps(
                mailbox.clone(),
                Arc::new(ScriptedGenerator::new("")),
                Arc::new(RecordingNotifier::new()),
            );
            Self {
                mailbox,
                deps,
                log: Arc::new(Mutex::new(Vec::new())),
                registry: AgentRegistry::new(),
            }
        }

        fn agent(&self, name: &'static str, behavior: Behavior) -> Arc<RecordingAgent> {
            Arc::new(RecordingAgent {
                name,
                behavior,
                log: self.log.clone(),
            })
        }

        fn register(&mut self, label: TriageLabel, name: &'static str, behavior: Behavior) {
            let agent = self.agent(name, behavior);
            self.registry
                .register(label, name, AgentHooks::both(agent), AgentOptions::default())
                .unwrap();
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    fn result(n: usize, label: Option<TriageLabel>) -> ClassificationResult {
        let item = ClassifiableItem {
            id: format!("m{n}"),
            thread_id: format!("t{n}"),
            subject: String::new(),
            sender: String::new(),
            age_days: 0,
            body_excerpt: String::new(),
        };
        match label {
            Some(label) => ClassificationResult::accepted(&item, label, "because".into()),
            None => ClassificationResult::fallback(&item, REASON_FALLBACK_ON_ERROR),
        }
    }

    fn window() -> RunWindow {
        let end = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        RunWindow::ending_at(end, chrono::Duration::hours(1))
    }

    #[tokio::test]
    async fn commits_label_then_runs_agents_in_order() {
        let mut fx = Fixture::new();
        fx.register(TriageLabel::Todo, "first", Behavior::Ok);
        fx.register(TriageLabel::Todo, "second", Behavior::Ok);
        fx.register(TriageLabel::Fyi, "other", Behavior::Ok);

        let settings = Settings::default();
        let dispatcher = Dispatcher::new(&fx.registry, &fx.deps, &settings, false);
        let mut report = DispatchReport::default();
        dispatcher
            .on_label_phase(&[result(1, Some(TriageLabel::Todo))], &mut report)
            .await;

        assert_eq!(fx.mailbox.labels("t1"), vec!["triage/todo"]);
        assert_eq!(fx.log(), ["first:on:m1:false", "second:on:m1:false"]);
        assert_eq!(report.labels_applied, 1);
        assert_eq!(report.on_label.ok, 2);
    }

    #[tokio::test]
    async fn failing_and_panicking_hooks_are_isolated() {
        let mut fx = Fixture::new();
        fx.register(TriageLabel::Todo, "fails", Behavior::Fail);
        fx.register(TriageLabel::Todo, "panics", Behavior::Panic);
        fx.register(TriageLabel::Todo, "works", Behavior::Ok);

        let settings = Settings::default();
        let dispatcher = Dispatcher::new(&fx.registry, &fx.deps, &settings, false);
        let report = dispatcher
            .dispatch(
                &[
                    result(1, Some(TriageLabel::Todo)),
                    result(2, Some(TriageLabel::Todo)),
                ],
                window(),
            )
            .await;

        let log = fx.log();
        assert!(log.contains(&"works:on:m1:false".to_string()));
        assert!(log.contains(&"works:on:m2:false".to_string()));
        assert!(log.contains(&"fails:on:m2:false".to_string()));
        assert_eq!(report.on_label.error, 4);
        assert_eq!(report.on_label.ok, 2);

        // Phase B still runs every agent once despite failures.
        assert_eq!(report.post_label.len(), 3);
        let statuses: Vec<_> = report.post_label.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            [
                PostLabelStatus::Error,
                PostLabelStatus::Error,
                PostLabelStatus::Completed
            ]
        );
        assert!(report.post_label[1].error.as_deref().unwrap().contains("panicked"));
        assert_eq!(report.hook_errors(), 6);
    }

    #[tokio::test]
    async fn unlabeled_results_dispatch_nothing() {
        let mut fx = Fixture::new();
        fx.register(TriageLabel::Todo, "agent", Behavior::Ok);

        let settings = Settings::default();
        let dispatcher = Dispatcher::new(&fx.registry, &fx.deps, &settings, false);
        let mut report = DispatchReport::default();
        dispatcher
            .on_label_phase(&[result(1, None)], &mut report)
            .await;

        assert!(fx.mailbox.mutations().is_empty());
        assert!(fx.log().is_empty());
        assert_eq!(report.unlabeled, 1);
    }

    #[tokio::test]
    async fn dry_run_skips_label_commit_and_flags_hooks() {
        let mut fx = Fixture::new();
        fx.register(TriageLabel::Review, "agent", Behavior::Ok);

        let settings = Settings::default();
        let dispatcher = Dispatcher::new(&fx.registry, &fx.deps, &settings, true);
        let report = dispatcher
            .dispatch(&[result(1, Some(TriageLabel::Review))], window())
            .await;

        assert!(fx.mailbox.mutations().is_empty());
        assert_eq!(report.labels_simulated, 1);
        assert_eq!(report.labels_applied, 0);
        assert_eq!(fx.log(), ["agent:on:m1:true", "agent:post:review:true"]);
    }

    #[tokio::test]
    async fn agent_dry_run_override() {
        let mut fx = Fixture::new();
        fx.register(TriageLabel::Todo, "careful-agent", Behavior::Ok);

        let settings = Settings::from_map([("careful_agent_dry_run", "true")]);
        let dispatcher = Dispatcher::new(&fx.registry, &fx.deps, &settings, false);
        let mut report = DispatchReport::default();
        dispatcher
            .on_label_phase(&[result(1, Some(TriageLabel::Todo))], &mut report)
            .await;

        // Label still commits; only the agent simulates.
        assert_eq!(fx.mailbox.labels("t1"), vec!["triage/todo"]);
        assert_eq!(fx.log(), ["careful-agent:on:m1:true"]);
    }

    #[tokio::test]
    async fn agent_setting_cannot_lift_global_dry_run() {
        let mut fx = Fixture::new();
        fx.register(TriageLabel::Todo, "eager-agent", Behavior::Ok);

        let settings = Settings::from_map([("eager_agent_dry_run", "false")]);
        let dispatcher = Dispatcher::new(&fx.registry, &fx.deps, &settings, true);
        let report = dispatcher
            .dispatch(&[result(1, Some(TriageLabel::Todo))], window())
            .await;

        assert!(fx.mailbox.mutations().is_empty());
        assert_eq!(report.labels_simulated, 1);
        assert_eq!(fx.log(), ["eager-agent:on:m1:true", "eager-agent:post:todo:true"]);
    }

    #[tokio::test]
    async fn disabled_agents_are_skipped() {
        let mut fx = Fixture::new();
        let off = fx.agent("off", Behavior::Ok);
        fx.registry
            .register(
                TriageLabel::Todo,
                "off",
                AgentHooks::both(off),
                AgentOptions::default().enabled(false),
            )
            .unwrap();
        fx.register(TriageLabel::Todo, "muted", Behavior::Ok);

        let settings = Settings::from_map([("muted_enabled", "no")]);
        let dispatcher = Dispatcher::new(&fx.registry, &fx.deps, &settings, false);
        let report = dispatcher
            .dispatch(&[result(1, Some(TriageLabel::Todo))], window())
            .await;

        assert!(fx.log().is_empty());
        assert_eq!(report.on_label.total(), 0);
        assert!(report.post_label.is_empty());
        assert_eq!(fx.registry.len(), 2);
    }

    #[tokio::test]
    async fn label_commit_failure_skips_hooks() {
        let mut fx = Fixture::new();
        fx.register(TriageLabel::Todo, "agent", Behavior::Ok);
        fx.mailbox.fail_on("apply_label");

        let settings = Settings::default();
        let dispatcher = Dispatcher::new(&fx.registry, &fx.deps, &settings, false);
        let mut report = DispatchReport::default();
        dispatcher
            .on_label_phase(
                &[
                    result(1, Some(TriageLabel::Todo)),
                    result(2, Some(TriageLabel::Todo)),
                ],
                &mut report,
            )
            .await;

        assert_eq!(report.label_failures, 2);
        assert!(fx.log().is_empty());
    }

    #[tokio::test]
    async fn scheduled_post_label_respects_window() {
        let mut fx = Fixture::new();
        let digest = fx.agent("digest", Behavior::Ok);
        fx.registry
            .register(
                TriageLabel::Fyi,
                "digest",
                AgentHooks::post_label(digest),
                AgentOptions::default()
                    .run_when(RunWhen::cron("digest", "0 0 17 * * *").unwrap()),
            )
            .unwrap();

        let settings = Settings::default();
        let dispatcher = Dispatcher::new(&fx.registry, &fx.deps, &settings, false);

        let mut report = DispatchReport::default();
        dispatcher.post_label_phase(window(), &mut report).await;
        assert_eq!(report.post_label[0].status, PostLabelStatus::NotDue);
        assert!(fx.log().is_empty());

        let evening = RunWindow::ending_at(
            Utc.with_ymd_and_hms(2026, 3, 2, 17, 30, 0).unwrap(),
            chrono::Duration::hours(1),
        );
        let mut report = DispatchReport::default();
        dispatcher.post_label_phase(evening, &mut report).await;
        assert_eq!(report.post_label[0].status, PostLabelStatus::Completed);
        assert_eq!(report.post_label[0].tally.processed, 1);
        assert_eq!(fx.log(), ["digest:post:fyi:false"]);
    }

    #[test]
    fn panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(boxed.as_ref()), "static str");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }
}
