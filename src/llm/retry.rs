//! Quota-aware retry with backoff.
//!
//! Only quota / rate-limit failures are retried. Everything else, including
//! size-limit failures that mention quotas in passing, propagates on the
//! first attempt.

use std::fmt::Display;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::warn;

/// Multiplier applied to every computed delay so the retry lands after the
/// provider's window closes rather than on its edge.
const DELAY_BUFFER: f64 = 1.1;

/// Upper bound on any single backoff. Provider hints above it are capped.
pub const MAX_DELAY_SECS: f64 = 300.0;

/// Phrases that mark a request as too large. Checked before quota phrases.
const SIZE_LIMIT_PHRASES: &[&str] = &[
    "context length",
    "context window",
    "token limit",
    "too many tokens",
    "prompt is too long",
    "input is too long",
    "request too large",
    "payload too large",
    "maximum context",
    "exceeds the maximum",
];

/// Phrases that mark a transient quota / rate-limit failure.
const QUOTA_PHRASES: &[&str] = &[
    "rate limit",
    "rate-limit",
    "rate_limit",
    "ratelimit",
    "quota",
    "resource_exhausted",
    "resource exhausted",
    "resource has been exhausted",
    "too many requests",
    "429",
    "overloaded",
];

static RETRY_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)retry\s+(?:in|after)\s+(\d+(?:\.\d+)?)\s*s").expect("valid retry hint regex")
});

/// Coarse classification of an external-call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Request exceeded a size/token limit. Never retried.
    SizeLimit,
    /// Quota or rate limit. Retried with backoff.
    Quota,
    /// Anything else. Never retried.
    Other,
}

/// Classify a failure from its message.
pub fn classify_error(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    if SIZE_LIMIT_PHRASES.iter().any(|p| lower.contains(p)) {
        ErrorClass::SizeLimit
    } else if QUOTA_PHRASES.iter().any(|p| lower.contains(p)) {
        ErrorClass::Quota
    } else {
        ErrorClass::Other
    }
}

/// Provider-suggested delay in seconds, if the message carries one.
pub fn parse_retry_hint(message: &str) -> Option<f64> {
    RETRY_HINT
        .captures(message)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Delay before the retry following failed attempt `attempt` (0-based),
/// buffer included, capped at [`MAX_DELAY_SECS`].
pub fn compute_delay_secs(message: &str, attempt: u32) -> f64 {
    let base = parse_retry_hint(message).unwrap_or_else(|| 2f64.powi(attempt.min(16) as i32));
    (base * DELAY_BUFFER).min(MAX_DELAY_SECS)
}

/// Convert an untrusted number of seconds into a sleep. Non-finite and
/// negative values become zero; large values are capped.
pub fn bounded_delay(secs: f64) -> Duration {
    if !secs.is_finite() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs.min(MAX_DELAY_SECS)).unwrap_or(Duration::ZERO)
}

/// Decides whether and how long to wait before retrying a failed call.
pub trait RetryPolicy<E> {
    /// Number of retries after the first attempt.
    fn max_retries(&self) -> u32;

    /// Whether `error` is worth another attempt.
    fn is_retryable(&self, error: &E) -> bool;

    /// Delay before the retry that follows failed attempt `attempt` (0-based).
    fn delay_for(&self, error: &E, attempt: u32) -> Duration;
}

/// Default policy: retry quota-class failures, honour provider hints,
/// otherwise back off exponentially.
#[derive(Debug, Clone, Copy)]
pub struct QuotaRetryPolicy {
    pub max_retries: u32,
}

impl QuotaRetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }
}

impl Default for QuotaRetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl<E: Display> RetryPolicy<E> for QuotaRetryPolicy {
    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn is_retryable(&self, error: &E) -> bool {
        classify_error(&error.to_string()) == ErrorClass::Quota
    }

    fn delay_for(&self, error: &E, attempt: u32) -> Duration {
        bounded_delay(compute_delay_secs(&error.to_string(), attempt))
    }
}

/// Run `call`, retrying per `policy`. Returns the last error once retries
/// are exhausted, or the first non-retryable error immediately.
pub async fn with_retry<T, E, F, Fut, P>(mut call: F, policy: &P, operation: &str) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: RetryPolicy<E> + ?Sized,
    E: Display,
{
    let max_retries = policy.max_retries();
    let mut attempt: u32 = 0;

    loop {
        let error = match call().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !policy.is_retryable(&error) {
            return Err(error);
        }

        if attempt >= max_retries {
            warn!(
                operation,
                attempts = attempt + 1,
                error = %error,
                "Retries exhausted"
            );
            return Err(error);
        }

        let delay = policy.delay_for(&error, attempt);
        warn!(
            operation,
            attempt = attempt + 1,
            max_retries,
            delay_secs = delay.as_secs_f64(),
            error = %error,
            "Retryable failure, backing off"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
