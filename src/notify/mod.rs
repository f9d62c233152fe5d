//! Best-effort fan-out of job outcomes.
//!
//! [`NotificationDispatcher::dispatch`] never blocks the caller: channel
//! resolution and every send run on detached tasks tracked by a
//! [`TaskTracker`], so shutdown (and tests) can wait for them without the
//! worker ever awaiting a send. A failing channel is logged and dropped; it
//! does not affect the others and is never retried.

pub mod discord;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::task::TaskTracker;

use crate::queue::{JobQueue, DEFAULT_NOTIFICATION_CONFIG_KEY};

pub use discord::DiscordClient;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response status: {0}")]
    UnexpectedStatus(u16),
}

/// Normalized outcome of one job, independent of the channel it goes to.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionEvent {
    pub prompt: String,
    pub success: bool,
    pub response: Option<String>,
    pub error: Option<String>,
    pub execution_time: Duration,
    pub timestamp: DateTime<Utc>,
}

impl CompletionEvent {
    pub fn success(prompt: impl Into<String>, response: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            prompt: prompt.into(),
            success: true,
            response: Some(response.into()),
            error: None,
            execution_time: elapsed,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(prompt: impl Into<String>, error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            prompt: prompt.into(),
            success: false,
            response: None,
            error: Some(error.into()),
            execution_time: elapsed,
            timestamp: Utc::now(),
        }
    }

    /// Seconds with two decimals, e.g. `"1.50s"`.
    pub fn execution_time_display(&self) -> String {
        format!("{:.2}s", self.execution_time.as_secs_f64())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub webhook_url: String,
}

/// Per-webhook (or global default) notification settings, stored as JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord: Option<DiscordConfig>,
}

impl NotificationConfig {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn channels(&self, http: &reqwest::Client) -> Vec<Channel> {
        let mut channels = Vec::new();
        if let Some(ref discord) = self.discord {
            if !discord.webhook_url.trim().is_empty() {
                channels.push(Channel::Discord(DiscordClient::new(
                    discord.webhook_url.trim(),
                    http.clone(),
                )));
            }
        }
        channels
    }
}

/// A notification target. New targets are added as variants.
#[derive(Debug, Clone)]
pub enum Channel {
    Discord(DiscordClient),
}

impl Channel {
    pub fn name(&self) -> &'static str {
        match self {
            Channel::Discord(_) => "discord",
        }
    }

    pub async fn send(&self, event: &CompletionEvent) -> Result<(), NotifyError> {
        match self {
            Channel::Discord(client) => client.send(event).await,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    queue: JobQueue,
    http: reqwest::Client,
    tracker: TaskTracker,
}

impl NotificationDispatcher {
    pub fn new(queue: JobQueue) -> Self {
        let http = match reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Failed to build notification HTTP client, using defaults without a timeout"
                );
                reqwest::Client::new()
            }
        };
        Self::with_client(queue, http)
    }

    pub fn with_client(queue: JobQueue, http: reqwest::Client) -> Self {
        Self {
            queue,
            http,
            tracker: TaskTracker::new(),
        }
    }

    /// Tracker owning every spawned notification task.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Fire-and-forget: resolve channels for `webhook_id` and send `event`
    /// to each of them on independent tasks.
    pub fn dispatch(&self, webhook_id: &str, event: CompletionEvent) {
        let this = self.clone();
        let webhook_id = webhook_id.to_string();
        self.tracker.spawn(async move {
            let channels = this.resolve_channels(&webhook_id).await;
            if channels.is_empty() {
                tracing::debug!(webhook_id = %webhook_id, "No notification channels configured");
                return;
            }
            for channel in channels {
                let event = event.clone();
                let webhook_id = webhook_id.clone();
                this.tracker.spawn(async move {
                    if let Err(e) = channel.send(&event).await {
                        tracing::warn!(
                            webhook_id = %webhook_id,
                            channel = channel.name(),
                            error = %e,
                            "Notification failed"
                        );
                    }
                });
            }
        });
    }

    /// Channels from the webhook's own config, or from the global default
    /// when the webhook defines none.
    pub async fn resolve_channels(&self, webhook_id: &str) -> Vec<Channel> {
        match self.queue.get_webhook(webhook_id).await {
            Ok(webhook) => {
                if let Some(raw) = webhook.notification_config.as_deref() {
                    match NotificationConfig::parse(raw) {
                        Ok(config) => {
                            let channels = config.channels(&self.http);
                            if !channels.is_empty() {
                                return channels;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(webhook_id, error = %e, "Invalid webhook notification config");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(webhook_id, error = %e, "Failed to load webhook for notification");
            }
        }

        match self.queue.get_global_setting(DEFAULT_NOTIFICATION_CONFIG_KEY).await {
            Ok(Some(raw)) => match NotificationConfig::parse(&raw) {
                Ok(config) => config.channels(&self.http),
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid global notification config");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load global notification config");
                Vec::new()
            }
        }
    }

    /// Wait up to `grace` for in-flight sends. Returns `true` if everything
    /// finished in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(grace, self.tracker.wait()).await.is_ok()
    }
}
