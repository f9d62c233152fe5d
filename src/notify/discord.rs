use serde::Serialize;

use crate::notify::{CompletionEvent, NotifyError};

pub const COLOR_SUCCESS: u32 = 0x00ff00;
pub const COLOR_ERROR: u32 = 0xff0000;
pub const MAX_FIELD_LEN: usize = 1024;
pub const MAX_DESCRIPTION_LEN: usize = 2048;

const TITLE: &str = "Claude Code Execution Result";

#[derive(Debug, Serialize)]
pub struct WebhookPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Serialize)]
pub struct Embed {
    pub title: String,
    pub description: String,
    pub color: u32,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Field>,
}

#[derive(Debug, Serialize)]
pub struct Field {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// Cut `s` to at most `max_chars` characters, marking the cut with `...`.
pub fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = s.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Posts completion events to a Discord incoming-webhook URL.
#[derive(Debug, Clone)]
pub struct DiscordClient {
    webhook_url: String,
    http: reqwest::Client,
}

impl DiscordClient {
    pub fn new(webhook_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            http,
        }
    }

    pub fn webhook_url(&self) -> &str {
        &self.webhook_url
    }

    pub fn build_payload(event: &CompletionEvent) -> WebhookPayload {
        let (color, description) = if event.success {
            (
                COLOR_SUCCESS,
                truncate(event.response.as_deref().unwrap_or_default(), MAX_DESCRIPTION_LEN),
            )
        } else {
            (
                COLOR_ERROR,
                format!(
                    "Error: {}",
                    truncate(event.error.as_deref().unwrap_or_default(), MAX_DESCRIPTION_LEN)
                ),
            )
        };

        WebhookPayload {
            content: None,
            embeds: vec![Embed {
                title: TITLE.to_string(),
                description,
                color,
                timestamp: event.timestamp.to_rfc3339(),
                fields: vec![
                    Field {
                        name: "Prompt".to_string(),
                        value: truncate(&event.prompt, MAX_FIELD_LEN),
                        inline: false,
                    },
                    Field {
                        name: "Execution Time".to_string(),
                        value: event.execution_time_display(),
                        inline: true,
                    },
                    Field {
                        name: "Status".to_string(),
                        value: event.success.to_string(),
                        inline: true,
                    },
                ],
            }],
        }
    }

    pub async fn send(&self, event: &CompletionEvent) -> Result<(), NotifyError> {
        let payload = Self::build_payload(event);
        let response = self.http.post(&self.webhook_url).json(&payload).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::UnexpectedStatus(status.as_u16()));
        }
        Ok(())
    }
}
