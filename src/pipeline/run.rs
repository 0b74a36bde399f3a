//! One triage run end to end, and the periodic loop around it.
//!
//! Each run:
//! 1. Searches the mailbox for active threads carrying no triage label
//! 2. Snapshots them into `ClassifiableItem`s
//! 3. Loads knowledge bundles (missing knowledge is never fatal)
//! 4. Classifies in batches
//! 5. Dispatches: label commit + `onLabel`, then `postLabel`

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::agent::{AgentDeps, AgentRegistry, DispatchReport, Dispatcher, RunWindow};
use crate::config::{Settings, TriageConfig};
use crate::error::MailboxError;
use crate::knowledge::{
    KnowledgeMetadata, KnowledgeStore, PromptKnowledge, load_bundle, warn_if_near_capacity,
};
use crate::llm::QuotaRetryPolicy;
use crate::mailbox::MailQuery;
use crate::pipeline::classifier::Classifier;
use crate::pipeline::types::{ClassifiableItem, ResultSource, TriageLabel};

/// Run window used for schedule checks when there is no previous run.
const DEFAULT_WINDOW: Duration = Duration::from_secs(3600);

/// Knowledge sizes seen by one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KnowledgeReport {
    pub global: KnowledgeMetadata,
    pub classifier: KnowledgeMetadata,
    pub replies: KnowledgeMetadata,
}

/// Per-run aggregate, logged at the end of every run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub threads_found: usize,
    pub items: usize,
    /// Results carrying a label.
    pub classified: usize,
    /// Results that fell back to no label.
    pub fallback: usize,
    pub by_label: BTreeMap<TriageLabel, usize>,
    pub knowledge: KnowledgeReport,
    pub dispatch: DispatchReport,
}

/// Owns everything a run needs. Cheap to share behind an `Arc`.
pub struct TriageRunner {
    config: TriageConfig,
    registry: Arc<AgentRegistry>,
    deps: AgentDeps,
    knowledge: Option<Arc<dyn KnowledgeStore>>,
    classifier: Classifier,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

impl TriageRunner {
    pub fn new(
        config: TriageConfig,
        registry: Arc<AgentRegistry>,
        deps: AgentDeps,
        knowledge: Option<Arc<dyn KnowledgeStore>>,
    ) -> Self {
        let classifier = Classifier::new(
            deps.generator.clone(),
            config.model.clone(),
            QuotaRetryPolicy::new(config.max_retries),
        );
        Self {
            config,
            registry,
            deps,
            knowledge,
            classifier,
            last_run: Mutex::new(None),
        }
    }

    /// Query for threads no run has labeled yet.
    pub fn pending_query(&self) -> MailQuery {
        TriageLabel::ALL
            .iter()
            .fold(MailQuery::active(), |q, label| {
                q.without_label(label.mailbox_name(&self.config.label_prefix))
            })
            .limit(self.config.max_threads)
    }

    /// Execute one run. Only a failed mailbox search aborts it.
    pub async fn run_once(&self, settings: &Settings) -> Result<RunReport, MailboxError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let window = self.window_for(started_at).await;
        info!(%run_id, dry_run = self.config.dry_run, "Triage run started");

        let query = self.pending_query();
        let threads = self.deps.mailbox.search(&query).await?;
        let items: Vec<ClassifiableItem> = threads
            .iter()
            .filter_map(|t| ClassifiableItem::from_thread(t, self.config.excerpt_chars, started_at))
            .collect();
        info!(%query, threads = threads.len(), items = items.len(), "Pending threads loaded");

        let store = self.knowledge.as_deref();
        let k = &self.config.knowledge;
        let tokens = self.config.model_context_tokens;
        let global = load_bundle(store, k.global.as_deref(), k.max_docs, tokens).await;
        let classifier_kb = load_bundle(store, k.classifier.as_deref(), k.max_docs, tokens).await;
        let replies_kb = load_bundle(store, k.replies.as_deref(), k.max_docs, tokens).await;
        warn_if_near_capacity("global", &global);
        warn_if_near_capacity("classifier", &classifier_kb);
        warn_if_near_capacity("replies", &replies_kb);

        let knowledge_report = KnowledgeReport {
            global: global.metadata.clone(),
            classifier: classifier_kb.metadata.clone(),
            replies: replies_kb.metadata.clone(),
        };

        let classifier_knowledge = PromptKnowledge {
            global: global.clone(),
            specific: classifier_kb,
        };
        let results = self
            .classifier
            .classify(&items, &classifier_knowledge, self.config.batch_size)
            .await;

        let deps = AgentDeps {
            reply_knowledge: PromptKnowledge {
                global,
                specific: replies_kb,
            },
            ..self.deps.clone()
        };
        let dispatcher = Dispatcher::new(&self.registry, &deps, settings, self.config.dry_run);
        let dispatch = dispatcher.dispatch(&results, window).await;

        let mut by_label = BTreeMap::new();
        for label in results.iter().filter_map(|r| r.label) {
            *by_label.entry(label).or_insert(0) += 1;
        }
        let fallback = results
            .iter()
            .filter(|r| r.source == ResultSource::Fallback)
            .count();

        *self.last_run.lock().await = Some(started_at);

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: self.config.dry_run,
            threads_found: threads.len(),
            items: items.len(),
            classified: results.len() - fallback,
            fallback,
            by_label,
            knowledge: knowledge_report,
            dispatch,
        };
        info!(
            %run_id,
            items = report.items,
            classified = report.classified,
            fallback = report.fallback,
            hook_errors = report.dispatch.hook_errors(),
            "Triage run finished"
        );
        Ok(report)
    }

    /// `(previous run start, now]`, or a default-length window on the first run.
    async fn window_for(&self, now: DateTime<Utc>) -> RunWindow {
        match *self.last_run.lock().await {
            Some(previous) if previous < now => RunWindow::new(previous, now),
            _ => {
                let span = self.config.interval.unwrap_or(DEFAULT_WINDOW);
                let span = chrono::Duration::from_std(span)
                    .unwrap_or_else(|_| chrono::Duration::hours(1));
                RunWindow::ending_at(now, span)
            }
        }
    }
}

/// Spawn the periodic triage loop. Settings are re-read from the
/// environment before every run.
///
/// Returns a `JoinHandle` and shutdown flag.
pub fn spawn_periodic(
    runner: Arc<TriageRunner>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Periodic triage started");
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // First tick fires immediately.
        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Periodic triage shutting down");
                return;
            }

            let settings = Settings::from_env();
            if let Err(e) = runner.run_once(&settings).await {
                error!(error = %e, "Triage run failed");
            }
        }
    });

    (handle, shutdown_flag)
}
