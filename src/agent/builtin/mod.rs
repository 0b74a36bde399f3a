//! Built-in agents, one per triage label.

pub mod fyi_digest;
pub mod reply_drafter;
pub mod review_notifier;
pub mod todo_forwarder;

use std::future::Future;

use tracing::{debug, warn};

use crate::agent::Registrar;
use crate::agent::hook::{HookResult, PostLabelContext, ScanTally};
use crate::agent::idempotency::{IdempotencyTracker, Outcome};
use crate::error::AgentError;
use crate::mailbox::{MailQuery, MailThread};

/// Registrars run at startup, in this order.
pub const REGISTRARS: &[Registrar] = &[
    reply_drafter::register,
    review_notifier::register,
    todo_forwarder::register,
    fyi_digest::register,
];

/// Upper bound on pending threads one `postLabel` scan handles.
const SCAN_LIMIT: usize = 25;

/// Map an idempotent side-effect outcome onto a hook result.
fn outcome_result(outcome: Outcome, action: &str) -> HookResult {
    match outcome {
        Outcome::Done => HookResult::ok().with_info(action),
        Outcome::AlreadyDone => HookResult::skip("already handled"),
        Outcome::Simulated => HookResult::ok().with_info(format!("dry run: would {action}")),
    }
}

/// Hook boundary for `onLabel`: failures become an `error` result.
fn caught(agent: &str, result: Result<HookResult, AgentError>) -> HookResult {
    result.unwrap_or_else(|e| {
        warn!(agent, error = %e, "onLabel failed");
        HookResult::error(e.to_string())
    })
}

/// Hook boundary for `postLabel`: a failed scan counts as one error.
fn caught_scan(agent: &str, result: Result<ScanTally, AgentError>) -> ScanTally {
    result.unwrap_or_else(|e| {
        warn!(agent, error = %e, "postLabel scan failed");
        ScanTally {
            errors: 1,
            ..Default::default()
        }
    })
}

/// Search `query` narrowed to threads `tracker` still considers pending and
/// run `handle` on up to [`SCAN_LIMIT`] of them. Threads the tracker reports
/// done are dropped before the limit applies, so finished threads never
/// crowd out pending ones. Per-thread failures fold into the tally.
async fn scan<F, Fut>(
    ctx: &PostLabelContext<'_>,
    query: MailQuery,
    tracker: &dyn IdempotencyTracker,
    mut handle: F,
) -> Result<ScanTally, AgentError>
where
    F: FnMut(MailThread) -> Fut,
    Fut: Future<Output = Result<HookResult, AgentError>>,
{
    let mailbox = ctx.deps.mailbox.as_ref();
    let query = tracker.pending(query);
    let threads = mailbox.search(&query).await?;
    debug!(%query, found = threads.len(), "Scanning for pending threads");

    let mut tally = ScanTally::default();
    let mut handled = 0;
    for thread in threads {
        if handled >= SCAN_LIMIT {
            break;
        }
        let thread_id = thread.id.clone();
        match tracker.is_done(mailbox, &thread_id).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => {
                warn!(thread = %thread_id, error = %e, "Could not check thread state");
                tally.errors += 1;
                handled += 1;
                continue;
            }
        }

        handled += 1;
        let result = match handle(thread).await {
            Ok(result) => result,
            Err(e) => {
                warn!(thread = %thread_id, error = %e, "Thread failed");
                HookResult::error(e.to_string())
            }
        };
        tally.record(&result);
    }
    Ok(tally)
}
