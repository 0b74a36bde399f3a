//! SMTP sink via lettre.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};

use crate::error::{ConfigError, NotifyError};
use crate::notify::{Notification, NotificationSink};

const SINK: &str = "smtp";

/// SMTP delivery settings, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub to_address: String,
}

impl SmtpConfig {
    /// Returns `Ok(None)` if `TRIAGE_SMTP_HOST` is not set (sink disabled).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(host) = std::env::var("TRIAGE_SMTP_HOST") else {
            return Ok(None);
        };

        let port = match std::env::var("TRIAGE_SMTP_PORT") {
            Ok(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
                key: "TRIAGE_SMTP_PORT".into(),
                message: format!("{e}"),
            })?,
            Err(_) => 587,
        };

        let username = std::env::var("TRIAGE_SMTP_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("TRIAGE_SMTP_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("TRIAGE_SMTP_FROM").unwrap_or_else(|_| username.clone());
        let to_address = std::env::var("TRIAGE_SMTP_TO")
            .map_err(|_| ConfigError::MissingEnvVar("TRIAGE_SMTP_TO".into()))?;

        Ok(Some(Self {
            host,
            port,
            username,
            password,
            from_address,
            to_address,
        }))
    }
}

/// Sends each notification as a plain-text email.
pub struct SmtpNotifier {
    config: SmtpConfig,
}

impl SmtpNotifier {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

/// Build the outgoing message for a notification.
fn build_message(
    from: &str,
    to: &str,
    notification: &Notification,
) -> Result<Message, NotifyError> {
    let mut body = notification.body.clone();
    if !notification.thread_ids.is_empty() {
        body.push_str("\n\nThreads: ");
        body.push_str(&notification.thread_ids.join(", "));
    }

    Message::builder()
        .from(
            from.parse()
                .map_err(|e| NotifyError::InvalidTarget(format!("from address {from}: {e}")))?,
        )
        .to(to
            .parse()
            .map_err(|e| NotifyError::InvalidTarget(format!("to address {to}: {e}")))?)
        .subject(format!("[{}] {}", notification.source, notification.title))
        .body(body)
        .map_err(|e| NotifyError::DeliveryFailed {
            sink: SINK.into(),
            reason: format!("Failed to build email: {e}"),
        })
}

fn send_blocking(config: &SmtpConfig, message: &Message) -> Result<(), NotifyError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    let transport = SmtpTransport::relay(&config.host)
        .map_err(|e| NotifyError::DeliveryFailed {
            sink: SINK.into(),
            reason: format!("SMTP relay error: {e}"),
        })?
        .port(config.port)
        .credentials(creds)
        .build();

    transport
        .send(message)
        .map_err(|e| NotifyError::DeliveryFailed {
            sink: SINK.into(),
            reason: format!("SMTP send failed: {e}"),
        })?;
    Ok(())
}

#[async_trait]
impl NotificationSink for SmtpNotifier {
    fn name(&self) -> &str {
        SINK
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let message = build_message(
            &self.config.from_address,
            &self.config.to_address,
            notification,
        )?;
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || send_blocking(&config, &message))
            .await
            .map_err(|e| NotifyError::DeliveryFailed {
                sink: SINK.into(),
                reason: format!("SMTP task failed: {e}"),
            })??;

        tracing::info!(to = %self.config.to_address, title = %notification.title, "Notification emailed");
        Ok(())
    }
}
