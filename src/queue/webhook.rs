use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PullWorkerError, Result};
use crate::queue::job::{from_millis, to_millis, JobOptions, NewJob, DEFAULT_MAX_RETRIES};
use crate::queue::JobQueue;

/// Global setting holding the notification config used by webhooks that
/// have none of their own.
pub const DEFAULT_NOTIFICATION_CONFIG_KEY: &str = "default_notification_config";

/// Webhook configuration. Owned by the admin surface; the worker only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Template copied onto every job enqueued for this webhook
    pub options: JobOptions,
    /// Raw JSON, see [`NotificationConfig`](crate::notify::NotificationConfig)
    pub notification_config: Option<String>,
}

impl Webhook {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            is_active: true,
            created_at: now,
            updated_at: now,
            options: JobOptions {
                continue_minutes: crate::config::DEFAULT_CONTINUE_MINUTES,
                ..JobOptions::default()
            },
            notification_config: None,
        }
    }

    /// Build a job that snapshots this webhook's options. Later edits to the
    /// webhook do not reach jobs already enqueued.
    pub fn new_job(&self, prompt: impl Into<String>, priority: i64, api_key_id: Option<i64>) -> NewJob {
        NewJob {
            webhook_id: self.id.clone(),
            api_key_id,
            prompt: prompt.into(),
            priority,
            max_retries: DEFAULT_MAX_RETRIES,
            options: self.options.clone(),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WebhookRow {
    id: String,
    name: String,
    description: Option<String>,
    is_active: bool,
    created_at: i64,
    updated_at: i64,
    working_dir: Option<String>,
    max_thinking_tokens: Option<i64>,
    max_turns: Option<i64>,
    custom_system_prompt: Option<String>,
    append_system_prompt: Option<String>,
    allowed_tools: Option<String>,
    disallowed_tools: Option<String>,
    permission_mode: Option<String>,
    permission_prompt_tool_name: Option<String>,
    model: Option<String>,
    fallback_model: Option<String>,
    mcp_servers: Option<String>,
    notification_config: Option<String>,
    enable_continue: bool,
    continue_minutes: i64,
}

impl From<WebhookRow> for Webhook {
    fn from(row: WebhookRow) -> Self {
        Webhook {
            id: row.id,
            name: row.name,
            description: row.description,
            is_active: row.is_active,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
            options: JobOptions {
                working_dir: row.working_dir,
                max_thinking_tokens: row.max_thinking_tokens,
                max_turns: row.max_turns,
                custom_system_prompt: row.custom_system_prompt,
                append_system_prompt: row.append_system_prompt,
                allowed_tools: row.allowed_tools,
                disallowed_tools: row.disallowed_tools,
                permission_mode: row.permission_mode,
                permission_prompt_tool_name: row.permission_prompt_tool_name,
                model: row.model,
                fallback_model: row.fallback_model,
                mcp_servers: row.mcp_servers,
                enable_continue: row.enable_continue,
                continue_minutes: row.continue_minutes,
            },
            notification_config: row.notification_config,
        }
    }
}

impl JobQueue {
    pub async fn get_webhook(&self, webhook_id: &str) -> Result<Webhook> {
        sqlx::query_as::<_, WebhookRow>("SELECT * FROM webhooks WHERE id = ?1")
            .bind(webhook_id)
            .fetch_optional(self.pool())
            .await?
            .map(Webhook::from)
            .ok_or_else(|| PullWorkerError::WebhookNotFound(webhook_id.to_string()))
    }

    /// Insert or replace a webhook definition.
    pub async fn save_webhook(&self, webhook: &Webhook) -> Result<()> {
        let opts = &webhook.options;
        sqlx::query(
            "INSERT INTO webhooks (
                id, name, description, is_active, created_at, updated_at, working_dir,
                max_thinking_tokens, max_turns, custom_system_prompt, append_system_prompt,
                allowed_tools, disallowed_tools, permission_mode, permission_prompt_tool_name,
                model, fallback_model, mcp_servers, notification_config, enable_continue,
                continue_minutes
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                      ?17, ?18, ?19, ?20, ?21)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at,
                working_dir = excluded.working_dir,
                max_thinking_tokens = excluded.max_thinking_tokens,
                max_turns = excluded.max_turns,
                custom_system_prompt = excluded.custom_system_prompt,
                append_system_prompt = excluded.append_system_prompt,
                allowed_tools = excluded.allowed_tools,
                disallowed_tools = excluded.disallowed_tools,
                permission_mode = excluded.permission_mode,
                permission_prompt_tool_name = excluded.permission_prompt_tool_name,
                model = excluded.model,
                fallback_model = excluded.fallback_model,
                mcp_servers = excluded.mcp_servers,
                notification_config = excluded.notification_config,
                enable_continue = excluded.enable_continue,
                continue_minutes = excluded.continue_minutes",
        )
        .bind(&webhook.id)
        .bind(&webhook.name)
        .bind(&webhook.description)
        .bind(webhook.is_active)
        .bind(to_millis(webhook.created_at))
        .bind(to_millis(Utc::now()))
        .bind(&opts.working_dir)
        .bind(opts.max_thinking_tokens)
        .bind(opts.max_turns)
        .bind(&opts.custom_system_prompt)
        .bind(&opts.append_system_prompt)
        .bind(&opts.allowed_tools)
        .bind(&opts.disallowed_tools)
        .bind(&opts.permission_mode)
        .bind(&opts.permission_prompt_tool_name)
        .bind(&opts.model)
        .bind(&opts.fallback_model)
        .bind(&opts.mcp_servers)
        .bind(&webhook.notification_config)
        .bind(opts.enable_continue)
        .bind(opts.continue_minutes)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_global_setting(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT setting_value FROM global_settings WHERE setting_key = ?1")
                .bind(key)
                .fetch_optional(self.pool())
                .await?;
        Ok(value)
    }

    pub async fn set_global_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO global_settings (setting_key, setting_value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(setting_key) DO UPDATE SET
                setting_value = excluded.setting_value,
                updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(to_millis(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
