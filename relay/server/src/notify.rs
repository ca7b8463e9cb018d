use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use support_core::ports::{Notification, Notifier};
use tracing::info;

/// Writes notifications to the log; the default when no webhook is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, recipients: &[String], notification: &Notification) -> Result<()> {
        info!(
            conversation_id = %notification.conversation_id,
            priority = %notification.priority,
            recipients = ?recipients,
            "{}",
            notification.subject
        );
        Ok(())
    }
}

/// POSTs `{recipients, notification}` as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), url: url.into() }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, recipients: &[String], notification: &Notification) -> Result<()> {
        self.http
            .post(&self.url)
            .json(&json!({ "recipients": recipients, "notification": notification }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("notification webhook {}", self.url))?;
        Ok(())
    }
}
