//! Error types for mail-triage.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Knowledge error: {0}")]
    Knowledge(#[from] KnowledgeError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Mailbox collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// AI service errors.
///
/// The retry controller classifies these by their rendered message, so the
/// `Display` text of each variant carries the phrasing it looks for.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited{}", retry_hint(.retry_after))]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Context length exceeded: {reason}")]
    ContextLengthExceeded { reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {}s", d.as_secs_f64()),
        None => String::new(),
    }
}

/// Knowledge store errors. Callers degrade these to an empty bundle.
#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Path escapes knowledge root: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Notification sink errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification delivery via {sink} failed: {reason}")]
    DeliveryFailed { sink: String, reason: String },

    #[error("Invalid notification target: {0}")]
    InvalidTarget(String),
}

/// Agent registration errors. These abort startup.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Agent {name} for label {label} registers no hooks")]
    NoHooks { label: String, name: String },

    #[error("Agent {name} is already registered for label {label}")]
    Duplicate { label: String, name: String },

    #[error("Agent {name} has an invalid run schedule: {reason}")]
    InvalidSchedule { name: String, reason: String },
}

/// Errors raised inside agent hooks. The dispatcher turns them into
/// `HookStatus::Error` results.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error("Side effect failed: {0}")]
    SideEffect(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
