//! Notification channels for routed alerts

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::error::NotificationError;
use crate::types::{Alert, AlertCategory, Severity};

/// Destination for alerts at or above a minimum severity
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn channel_type(&self) -> &'static str;

    fn min_severity(&self) -> Severity;

    fn accepts(&self, alert: &Alert) -> bool {
        alert.severity >= self.min_severity()
    }

    async fn send(&self, alert: &Alert) -> Result<(), NotificationError>;
}

/// `[[notifications]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    Log(LogChannelConfig),
    Webhook(WebhookChannelConfig),
}

impl ChannelConfig {
    pub fn min_severity(&self) -> Severity {
        match self {
            ChannelConfig::Log(config) => config.min_severity,
            ChannelConfig::Webhook(config) => config.min_severity,
        }
    }

    pub fn build(&self) -> Result<Arc<dyn NotificationChannel>, NotificationError> {
        Ok(match self {
            ChannelConfig::Log(config) => Arc::new(LogChannel::new(config.min_severity)),
            ChannelConfig::Webhook(config) => Arc::new(WebhookChannel::new(config.clone())?),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogChannelConfig {
    #[serde(default)]
    pub min_severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookChannelConfig {
    pub url: String,
    /// Sent as a bearer token when present; never written back out
    #[serde(default, skip_serializing)]
    pub token: Option<SecretString>,
    #[serde(default)]
    pub min_severity: Severity,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

/// Writes alerts to the tracing log
pub struct LogChannel {
    min_severity: Severity,
}

impl LogChannel {
    pub fn new(min_severity: Severity) -> Self {
        Self { min_severity }
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn channel_type(&self) -> &'static str {
        "log"
    }

    fn min_severity(&self) -> Severity {
        self.min_severity
    }

    async fn send(&self, alert: &Alert) -> Result<(), NotificationError> {
        match alert.category {
            AlertCategory::Error => tracing::error!(
                alert_id = %alert.id,
                severity = %alert.severity,
                platform = alert.platform.as_deref(),
                task_id = alert.task_id.as_deref(),
                "{}",
                alert.message
            ),
            AlertCategory::Warning => tracing::warn!(
                alert_id = %alert.id,
                severity = %alert.severity,
                platform = alert.platform.as_deref(),
                task_id = alert.task_id.as_deref(),
                "{}",
                alert.message
            ),
            AlertCategory::Info | AlertCategory::Success => tracing::info!(
                alert_id = %alert.id,
                severity = %alert.severity,
                platform = alert.platform.as_deref(),
                task_id = alert.task_id.as_deref(),
                "{}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// POSTs alerts as JSON to an HTTP endpoint
pub struct WebhookChannel {
    config: WebhookChannelConfig,
    client: Client,
}

impl WebhookChannel {
    pub fn new(config: WebhookChannelConfig) -> Result<Self, NotificationError> {
        reqwest::Url::parse(&config.url).map_err(|e| {
            NotificationError::ChannelUnavailable(format!("invalid webhook url {}: {}", config.url, e))
        })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| NotificationError::ChannelUnavailable(e.to_string()))?;

        Ok(Self { config, client })
    }

    fn build_payload(&self, alert: &Alert) -> serde_json::Value {
        json!({
            "source": "syndicast",
            "id": alert.id,
            "category": alert.category,
            "severity": alert.severity,
            "message": alert.message,
            "detail": alert.detail,
            "platform": alert.platform,
            "task_id": alert.task_id,
            "timestamp": alert.created_at,
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn channel_type(&self) -> &'static str {
        "webhook"
    }

    fn min_severity(&self) -> Severity {
        self.config.min_severity
    }

    async fn send(&self, alert: &Alert) -> Result<(), NotificationError> {
        let mut request = self.client.post(&self.config.url).json(&self.build_payload(alert));
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotificationError::SendFailed(format!("webhook request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::SendFailed(format!(
                "webhook returned {}: {}",
                status, body
            )));
        }

        tracing::debug!(alert_id = %alert.id, "Webhook notification sent");
        Ok(())
    }
}
