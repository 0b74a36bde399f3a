//! Anthropic generation via rig-core.
//!
//! rig owns the HTTP transport. This module only builds a one-shot agent per
//! call and maps rig's stringly errors back onto [`LlmError`] so the retry
//! controller can still tell quota failures from oversized prompts.

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::anthropic;
use secrecy::{ExposeSecret, SecretString};

use crate::error::LlmError;
use crate::llm::Generator;
use crate::llm::retry::{ErrorClass, bounded_delay, classify_error, parse_retry_hint};

const PROVIDER: &str = "anthropic";

/// Output budget per call. Classification responses for a full batch stay
/// well under this.
const MAX_OUTPUT_TOKENS: u64 = 2048;

/// Temperature for triage (deterministic-ish).
const TEMPERATURE: f64 = 0.1;

/// Phrases rig surfaces for rejected credentials.
const AUTH_PHRASES: &[&str] = &["authentication_error", "invalid x-api-key", "401"];

/// [`Generator`] backed by rig's Anthropic provider.
pub struct AnthropicGenerator {
    client: rig::client::Client<anthropic::client::AnthropicExt>,
}

impl AnthropicGenerator {
    pub fn new(api_key: &SecretString) -> Result<Self, LlmError> {
        let client: rig::client::Client<anthropic::client::AnthropicExt> =
            anthropic::Client::new(api_key.expose_secret()).map_err(|e| {
                LlmError::RequestFailed {
                    provider: PROVIDER.to_string(),
                    reason: format!("Failed to create Anthropic client: {e}"),
                }
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Generator for AnthropicGenerator {
    async fn generate(&self, prompt: &str, model: &str) -> Result<String, LlmError> {
        let agent = self
            .client
            .agent(model)
            .temperature(TEMPERATURE)
            .max_tokens(MAX_OUTPUT_TOKENS)
            .build();

        let text = agent
            .prompt(prompt)
            .await
            .map_err(|e| map_provider_error(&e.to_string()))?;

        tracing::debug!(model, chars = text.len(), "Generation complete");
        Ok(text)
    }
}

/// Map a provider failure message onto the error taxonomy.
fn map_provider_error(message: &str) -> LlmError {
    match classify_error(message) {
        ErrorClass::SizeLimit => LlmError::ContextLengthExceeded {
            reason: truncate(message, 300),
        },
        ErrorClass::Quota => LlmError::RateLimited {
            provider: PROVIDER.into(),
            retry_after: parse_retry_hint(message).map(bounded_delay),
        },
        ErrorClass::Other => {
            let lower = message.to_lowercase();
            if AUTH_PHRASES.iter().any(|p| lower.contains(p)) {
                LlmError::AuthFailed {
                    provider: PROVIDER.into(),
                }
            } else {
                LlmError::RequestFailed {
                    provider: PROVIDER.into(),
                    reason: truncate(message, 300),
                }
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn client_constructs_without_network() {
        let key = SecretString::from("test-key");
        assert!(AnthropicGenerator::new(&key).is_ok());
    }

    #[test]
    fn rate_limit_error_maps_to_rate_limited() {
        let msg = r#"ProviderError: {"type":"error","error":{"type":"rate_limit_error","message":"Number of request tokens has exceeded your per-minute rate limit, retry after 3s"}}"#;
        let err = map_provider_error(msg);
        assert!(matches!(
            err,
            LlmError::RateLimited {
                retry_after: Some(d),
                ..
            } if d == Duration::from_secs(3)
        ));
        assert!(err.to_string().contains("retry after 3s"));
    }

    #[test]
    fn overloaded_is_rate_limited() {
        let err = map_provider_error(r#"{"error":{"type":"overloaded_error"}}"#);
        assert!(matches!(err, LlmError::RateLimited { retry_after: None, .. }));
    }

    #[test]
    fn absurd_hint_is_capped() {
        let err = map_provider_error("rate limit, retry in 99999999999999999999999s");
        let LlmError::RateLimited {
            retry_after: Some(d),
            ..
        } = err
        else {
            panic!("expected rate limit, got {err:?}");
        };
        assert!(d <= Duration::from_secs(300));
    }

    #[test]
    fn prompt_too_long_maps_to_context_exceeded() {
        let msg = r#"{"error":{"type":"invalid_request_error","message":"prompt is too long: 210000 tokens > 200000 maximum"}}"#;
        assert!(matches!(
            map_provider_error(msg),
            LlmError::ContextLengthExceeded { .. }
        ));
    }

    #[test]
    fn auth_failure() {
        let msg = r#"{"error":{"type":"authentication_error","message":"invalid x-api-key"}}"#;
        assert!(matches!(map_provider_error(msg), LlmError::AuthFailed { .. }));
    }

    #[test]
    fn other_errors_are_request_failed() {
        assert!(matches!(
            map_provider_error("max_tokens: field required"),
            LlmError::RequestFailed { .. }
        ));
    }
}
