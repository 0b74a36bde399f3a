//! Knowledge bundles and prompt assembly.
//!
//! A bundle is optional context text (organization-wide or feature-specific)
//! merged into a prompt. Missing configuration yields an empty bundle, never
//! an error.

pub mod store;

pub use store::{DirKnowledgeStore, FetchedKnowledge, KnowledgeStore};

use serde::Serialize;
use tracing::{debug, warn};

/// Utilization above which callers should warn about prompt size.
pub const HIGH_UTILIZATION_PERCENT: f64 = 80.0;

/// Rough chars-per-token ratio used for estimates.
const CHARS_PER_TOKEN: usize = 4;

const GLOBAL_HEADER: &str = "# Organization context";
const SPECIFIC_HEADER: &str = "# Task-specific context";

/// Size and provenance of a bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KnowledgeMetadata {
    pub doc_count: usize,
    pub estimated_tokens: usize,
    /// Estimated share of the model's context window, 0–100+.
    pub utilization_percent: f64,
    pub sources: Vec<String>,
}

/// Optional contextual text for a prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KnowledgeBundle {
    pub configured: bool,
    pub text: String,
    pub metadata: KnowledgeMetadata,
}

impl KnowledgeBundle {
    /// The "no knowledge" bundle. Merging it into a prompt is a no-op.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a bundle from fetched text, sizing it against `context_tokens`.
    pub fn from_fetched(fetched: FetchedKnowledge, context_tokens: usize) -> Self {
        let estimated_tokens = estimate_tokens(&fetched.text);
        let utilization_percent = if context_tokens == 0 {
            0.0
        } else {
            estimated_tokens as f64 * 100.0 / context_tokens as f64
        };
        Self {
            configured: !fetched.text.trim().is_empty(),
            text: fetched.text,
            metadata: KnowledgeMetadata {
                doc_count: fetched.doc_count,
                estimated_tokens,
                utilization_percent,
                sources: fetched.sources,
            },
        }
    }

    /// Whether this bundle contributes anything to a prompt.
    pub fn is_active(&self) -> bool {
        self.configured && !self.text.trim().is_empty()
    }

    /// Whether the bundle is large enough that callers should warn.
    pub fn is_near_capacity(&self) -> bool {
        self.metadata.utilization_percent >= HIGH_UTILIZATION_PERCENT
    }
}

/// Global and feature-specific bundles for one family of prompts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptKnowledge {
    pub global: KnowledgeBundle,
    pub specific: KnowledgeBundle,
}

impl PromptKnowledge {
    /// No knowledge at all.
    pub fn none() -> Self {
        Self::default()
    }

    /// [`assemble`] with these bundles.
    pub fn assemble(&self, base: &str, task_data: &str) -> String {
        assemble(base, &self.global, &self.specific, task_data)
    }
}

/// Estimate the token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Assemble a prompt in fixed order: base instructions, global knowledge,
/// specific knowledge, task data.
///
/// Specific knowledge follows global so it can refine it. Task data is
/// always last. Inactive bundles and empty task data emit nothing.
pub fn assemble(
    base: &str,
    global: &KnowledgeBundle,
    specific: &KnowledgeBundle,
    task_data: &str,
) -> String {
    let mut sections: Vec<String> = Vec::with_capacity(4);

    let base = base.trim();
    if !base.is_empty() {
        sections.push(base.to_string());
    }
    if global.is_active() {
        sections.push(format!("{GLOBAL_HEADER}\n\n{}", global.text.trim()));
    }
    if specific.is_active() {
        sections.push(format!("{SPECIFIC_HEADER}\n\n{}", specific.text.trim()));
    }
    let task_data = task_data.trim();
    if !task_data.is_empty() {
        sections.push(task_data.to_string());
    }

    sections.join("\n\n")
}

/// Load a bundle for `reference`, degrading every failure to an empty bundle.
pub async fn load_bundle(
    store: Option<&dyn KnowledgeStore>,
    reference: Option<&str>,
    max_docs: usize,
    context_tokens: usize,
) -> KnowledgeBundle {
    let (Some(store), Some(reference)) = (store, reference) else {
        return KnowledgeBundle::empty();
    };

    match store.fetch(reference, max_docs).await {
        Ok(fetched) => {
            let bundle = KnowledgeBundle::from_fetched(fetched, context_tokens);
            debug!(
                reference,
                docs = bundle.metadata.doc_count,
                tokens = bundle.metadata.estimated_tokens,
                "Loaded knowledge"
            );
            bundle
        }
        Err(e) => {
            warn!(reference, error = %e, "Knowledge unavailable, continuing without it");
            KnowledgeBundle::empty()
        }
    }
}

/// Log a warning for bundles close to the model's capacity.
pub fn warn_if_near_capacity(name: &str, bundle: &KnowledgeBundle) {
    if bundle.is_near_capacity() {
        warn!(
            bundle = name,
            utilization_percent = bundle.metadata.utilization_percent,
            estimated_tokens = bundle.metadata.estimated_tokens,
            "Knowledge bundle is close to the model context limit"
        );
    }
}
