//! Notification sinks used by agents to tell a human something happened.

mod smtp;
mod webhook;

pub use smtp::{SmtpConfig, SmtpNotifier};
pub use webhook::WebhookNotifier;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::NotifyError;

/// Payload delivered to a sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    /// Agent that produced the notification.
    pub source: String,
    pub title: String,
    pub body: String,
    /// Threads the notification refers to.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub thread_ids: Vec<String>,
}

impl Notification {
    pub fn new(source: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            title: title.into(),
            body: body.into(),
            thread_ids: Vec::new(),
        }
    }

    pub fn with_threads(mut self, thread_ids: Vec<String>) -> Self {
        self.thread_ids = thread_ids;
        self
    }
}

/// Outbound notification delivery.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Short sink name for logs and errors.
    fn name(&self) -> &str;

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Sink that only logs. Used when no delivery target is configured.
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            source = %notification.source,
            title = %notification.title,
            threads = notification.thread_ids.len(),
            "Notification"
        );
        Ok(())
    }
}
