//! Operator notification for the abuse prevention engine.
//!
//! Alerting is fire-and-forget: a sink failure is logged and never affects
//! the response decision that triggered it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;

/// Notification audience
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertChannel {
    Security,
    OnCall,
    Compliance,
    Management,
}

impl AlertChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertChannel::Security => "security",
            AlertChannel::OnCall => "on_call",
            AlertChannel::Compliance => "compliance",
            AlertChannel::Management => "management",
        }
    }
}

/// What operators see when an automated action fires
#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload {
    pub action_id: String,
    pub identifier: String,
    pub action: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Delivery backend for alerts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, channel: AlertChannel, payload: &AlertPayload) -> anyhow::Result<()>;
}

/// Sink that writes alerts to the service log
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, channel: AlertChannel, payload: &AlertPayload) -> anyhow::Result<()> {
        log::warn!(
            "[alert:{}] {} against {} ({})",
            channel.as_str(),
            payload.action,
            payload.identifier,
            payload.reason
        );
        Ok(())
    }
}

/// Sink that posts alerts to a webhook endpoint
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    channel: &'static str,
    #[serde(flatten)]
    payload: &'a AlertPayload,
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, channel: AlertChannel, payload: &AlertPayload) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(&WebhookBody {
                channel: channel.as_str(),
                payload,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Fans one alert out to every configured sink on every target channel.
pub struct Notifier {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl Notifier {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }

    pub async fn dispatch(&self, channels: &[AlertChannel], payload: &AlertPayload) {
        let mut sends = Vec::with_capacity(channels.len() * self.sinks.len());
        for channel in channels {
            for sink in &self.sinks {
                sends.push(async move { (*channel, sink.notify(*channel, payload).await) });
            }
        }
        for (channel, result) in join_all(sends).await {
            if let Err(e) = result {
                log::error!(
                    "alert delivery to {} failed for action {}: {}",
                    channel.as_str(),
                    payload.action_id,
                    e
                );
            }
        }
    }
}
