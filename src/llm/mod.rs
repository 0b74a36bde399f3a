//! AI service integration.
//!
//! The triage core only needs one capability from the model provider:
//! turn a prompt into text. Everything provider-specific lives behind the
//! [`Generator`] trait; [`retry`] wraps calls with quota-aware backoff.

mod anthropic;
pub mod retry;

pub use anthropic::AnthropicGenerator;
pub use retry::{QuotaRetryPolicy, RetryPolicy, with_retry};

use async_trait::async_trait;

use crate::error::LlmError;

/// Black-box text generation service.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate a completion for `prompt` using `model`.
    ///
    /// The returned text is unstructured; callers parse it.
    async fn generate(&self, prompt: &str, model: &str) -> Result<String, LlmError>;
}

/// Extract a JSON object or array from model output (handles markdown wrapping).
pub fn extract_json(text: &str) -> String {
    let trimmed = text.trim();

    // Already bare JSON
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return trimmed.to_string();
    }

    // Wrapped in markdown code block
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') || inner.starts_with('[') {
                return inner.to_string();
            }
        }
    }

    // Try to find object bounds, then array bounds
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close))
            && end > start
        {
            return trimmed[start..=end].to_string();
        }
    }

    trimmed.to_string()
}
