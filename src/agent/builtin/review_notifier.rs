//! Notifies a human when something lands in `review`.
//!
//! The `review-notified` tracking label marks delivered notifications. A
//! failed send leaves it unset and the `postLabel` scan picks the thread up
//! on a later run.

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
use crate::error::{AgentError, RegistryError};
use crate::mailbox::MailQuery;
use crate::notify::Notification;
use crate::pipeline::types::TriageLabel;

pub const NAME: &str = "review-notifier";

const MARKER: &str = "review-notified";

/// Reason given for threads picked up by the scan rather than at labeling.
const SCAN_REASON: &str = "still awaiting review";

pub fn register(registry: &mut AgentRegistry, _settings: &Settings) -> Result<(), RegistryError> {
    registry.register(
        TriageLabel::Review,
        NAME,
        AgentHooks::both(Arc::new(ReviewNotifier)),
        AgentOptions::default(),
    )
}

pub struct ReviewNotifier;

impl ReviewNotifier {
    fn tracker(deps: &AgentDeps) -> TrackingLabel {
        TrackingLabel::new(deps.marker_label(MARKER))
    }

    async fn notify(
        &self,
        deps: &AgentDeps,
        thread_id: &str,
        reason: &str,
        dry_run: bool,
    ) -> Result<HookResult, AgentError> {
        let tracker = Self::tracker(deps);
        let outcome = run_once(&tracker, deps.mailbox.as_ref(), thread_id, dry_run, || async {
            let thread = deps.mailbox.get_thread(thread_id).await?;
            let sender = thread
                .latest()
                .map(|m| m.sender.as_str())
                .unwrap_or("unknown sender");
            let notification = Notification::new(
                NAME,
                format!("Review requested: {}", thread.subject),
                format!("From {sender}\nWhy: {reason}"),
            )
            .with_threads(vec![thread.id.clone()]);

            deps.notifier.send(&notification).await?;
            tracing::info!(thread = %thread_id, sink = deps.notifier.name(), "Review notification sent");
            Ok::<(), AgentError>(())
        })
        .await?;

        Ok(outcome_result(outcome, "notify reviewer"))
    }
}

#[async_trait]
impl OnLabelHook for ReviewNotifier {
    async fn on_label(&self, ctx: &LabelContext<'_>) -> Result<HookResult, AgentError> {
        let result = self
            .notify(ctx.deps, ctx.thread_id, ctx.reason, ctx.dry_run)
            .await;
        Ok(caught(NAME, result))
    }
}

#[async_trait]
impl PostLabelHook for ReviewNotifier {
    async fn post_label(&self, ctx: &PostLabelContext<'_>) -> Result<ScanTally, AgentError> {
        let tracker = Self::tracker(ctx.deps);
        let query = MailQuery::active().with_label(ctx.deps.label_name(ctx.label));
        let result = scan(ctx, query, &tracker, |thread| async move {
            self.notify(ctx.deps, &thread.id, SCAN_REASON, ctx.dry_run)
                .await
        })
        .await;
        Ok(caught_scan(NAME, result))
    }
}
