//! Forwards `todo` threads to a task inbox.

use std::sync::Arc;

use async_trait::async_trait;

use crate::agent::AgentDeps;
use crate::agent::builtin::{caught, caught_scan, outcome_result, scan};
use crate::agent::hook::{
    AgentHooks, HookResult, LabelContext, OnLabelHook, PostLabelContext, PostLabelHook, ScanTally,
};
use crate::agent::idempotency::{TrackingLabel, run_once};
use crate::agent::registry::{AgentOptions, AgentRegistry};
use crate::config::Settings;
use crate::error::{AgentError, ConfigError, RegistryError};
use crate::mailbox::MailQuery;
use crate::pipeline::types::TriageLabel;

pub const NAME: &str = "todo-forwarder";

/// Setting holding the task inbox address.
pub const FORWARD_TO: &str = "todo_forward_to";

/// Marker label suffix, e.g. `triage/todo-forwarded`.
const MARKER: &str = "todo-forwarded";

pub fn register(registry: &mut AgentRegistry, _settings: &Settings) -> Result<(), RegistryError> {
    registry.register(
        TriageLabel::Todo,
        NAME,
        AgentHooks::both(Arc::new(TodoForwarder)),
        AgentOptions::default(),
    )
}

pub struct TodoForwarder;

impl TodoForwarder {
    fn tracker(deps: &AgentDeps) -> TrackingLabel {
        TrackingLabel::new(deps.marker_label(MARKER))
    }

    async fn forward(
        &self,
        deps: &AgentDeps,
        recipient: &str,
        thread_id: &str,
        note: &str,
        dry_run: bool,
    ) -> Result<HookResult, AgentError> {
        let tracker = Self::tracker(deps);
        let outcome = run_once(&tracker, deps.mailbox.as_ref(), thread_id, dry_run, || async {
            deps.mailbox.forward(thread_id, recipient, note).await?;
            tracing::info!(thread = %thread_id, to = %recipient, "Forwarded todo");
            Ok::<(), AgentError>(())
        })
        .await?;
        Ok(outcome_result(outcome, &format!("forward to {recipient}")))
    }
}

/// Resolve and sanity-check the task inbox address.
fn recipient(settings: &Settings) -> Result<&str, ConfigError> {
    let address = settings.require(FORWARD_TO)?;
    if !address.contains('@') {
        return Err(ConfigError::InvalidValue {
            key: FORWARD_TO.into(),
            message: format!("'{address}' is not an email address"),
        });
    }
    Ok(address)
}

#[async_trait]
impl OnLabelHook for TodoForwarder {
    async fn on_label(&self, ctx: &LabelContext<'_>) -> Result<HookResult, AgentError> {
        let result = match recipient(ctx.settings) {
            Ok(to) => {
                let note = format!("Triaged as todo: {}", ctx.reason);
                self.forward(ctx.deps, to, ctx.thread_id, &note, ctx.dry_run)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        Ok(caught(NAME, result))
    }
}

#[async_trait]
impl PostLabelHook for TodoForwarder {
    async fn post_label(&self, ctx: &PostLabelContext<'_>) -> Result<ScanTally, AgentError> {
        let to = match recipient(ctx.settings) {
            Ok(to) => to,
            Err(e) => return Ok(caught_scan(NAME, Err(e.into()))),
        };
        let tracker = Self::tracker(ctx.deps);
        let query = MailQuery::active().with_label(ctx.deps.label_name(ctx.label));
        let result = scan(ctx, query, &tracker, |thread| async move {
            self.forward(ctx.deps, to, &thread.id, "Triaged as todo", ctx.dry_run)
                .await
        })
        .await;
        Ok(caught_scan(NAME, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::agent::{HookStatus, RunWindow};
    use crate::testing::{self, MockMailbox, RecordingNotifier, ScriptedGenerator};

    fn setup() -> (Arc<MockMailbox>, AgentDeps) {
        let mailbox = Arc::new(MockMailbox::new());
        mailbox.add_thread("t1", &["triage/todo"]);
        mailbox.add_thread("t2", &["triage/todo", "triage/todo-forwarded"]);
        mailbox.add_thread("t3", &[]);
        let deps = testing::deps(
            mailbox.clone(),
            Arc::new(ScriptedGenerator::new("")),
            Arc::new(RecordingNotifier::new()),
        );
        (mailbox, deps)
    }

    fn post_ctx<'a>(deps: &'a AgentDeps, settings: &'a Settings) -> PostLabelContext<'a> {
        PostLabelContext {
            label: TriageLabel::Todo,
            settings,
            dry_run: false,
            window: RunWindow::ending_at(Utc::now(), chrono::Duration::hours(1)),
            deps,
        }
    }

    #[tokio::test]
    async fn forwards_and_marks() {
        let (mailbox, deps) = setup();
        let settings = Settings::from_map([(FORWARD_TO, "tasks@example.com")]);
        let ctx = LabelContext {
            label: TriageLabel::Todo,
            reason: "asks for a report",
            item_id: "t1-m1",
            thread_id: "t1",
            settings: &settings,
            dry_run: false,
            deps: &deps,
        };

        let result = TodoForwarder.on_label(&ctx).await.unwrap();
        assert_eq!(result.status, HookStatus::Ok);
        assert_eq!(
            mailbox.forwards(),
            vec![("t1".to_string(), "tasks@example.com".to_string())]
        );
        assert!(mailbox.labels("t1").contains(&"triage/todo-forwarded".to_string()));

        let again = TodoForwarder.on_label(&ctx).await.unwrap();
        assert_eq!(again.status, HookStatus::Skip);
        assert_eq!(mailbox.forwards().len(), 1);
    }

    #[tokio::test]
    async fn missing_recipient_is_reported_not_raised() {
        let (mailbox, deps) = setup();
        let settings = Settings::default();
        assert!(matches!(
            recipient(&settings),
            Err(ConfigError::MissingRequired { .. })
        ));

        let tally = TodoForwarder
            .post_label(&post_ctx(&deps, &settings))
            .await
            .unwrap();
        assert_eq!(tally.errors, 1);

        let ctx = LabelContext {
            label: TriageLabel::Todo,
            reason: "asks for a report",
            item_id: "t1-m1",
            thread_id: "t1",
            settings: &settings,
            dry_run: false,
            deps: &deps,
        };
        let result = TodoForwarder.on_label(&ctx).await.unwrap();
        assert_eq!(result.status, HookStatus::Error);
        assert!(result.info.unwrap().contains("TRIAGE_AGENT_TODO_FORWARD_TO"));
        assert!(mailbox.mutations().is_empty());
    }

    #[test]
    fn malformed_recipient_is_rejected() {
        let settings = Settings::from_map([(FORWARD_TO, "tasks")]);
        assert!(matches!(
            recipient(&settings),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn scan_skips_marked_threads() {
        let (mailbox, deps) = setup();
        let settings = Settings::from_map([(FORWARD_TO, "tasks@example.com")]);
        let tally = TodoForwarder
            .post_label(&post_ctx(&deps, &settings))
            .await
            .unwrap();
        assert_eq!(tally.processed, 1);
        assert_eq!(mailbox.forwards().len(), 1);
        assert_eq!(mailbox.forwards()[0].0, "t1");
    }

    #[tokio::test]
    async fn forward_failure_leaves_thread_unmarked() {
        let (mailbox, deps) = setup();
        mailbox.fail_on("forward");
        let settings = Settings::from_map([(FORWARD_TO, "tasks@example.com")]);
        let tally = TodoForwarder
            .post_label(&post_ctx(&deps, &settings))
            .await
            .unwrap();
        assert_eq!(tally.errors, 1);
        assert!(!mailbox.labels("t1").contains(&"triage/todo-forwarded".to_string()));
    }
}
