//! JSON webhook sink.

use async_trait::async_trait;

use crate::error::NotifyError;
use crate::notify::{Notification, NotificationSink};

const SINK: &str = "webhook";

/// POSTs each notification as JSON to a fixed URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let url = url.into();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(NotifyError::InvalidTarget(url));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            url,
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    fn name(&self) -> &str {
        SINK
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| NotifyError::DeliveryFailed {
                sink: SINK.into(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::DeliveryFailed {
                sink: SINK.into(),
                reason: format!("HTTP {status}"),
            });
        }

        tracing::debug!(url = %self.url, title = %notification.title, "Webhook delivered");
        Ok(())
    }
}
