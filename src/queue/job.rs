use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PullWorkerError;

pub const DEFAULT_MAX_RETRIES: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = PullWorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(PullWorkerError::InvalidStatus(other.to_string())),
        }
    }
}

/// Execution options as stored on a webhook and snapshotted onto each job.
///
/// List-valued fields (`allowed_tools`, `disallowed_tools`) keep the raw
/// comma-separated form they are stored in; the options resolver splits them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub working_dir: Option<String>,
    pub max_thinking_tokens: Option<i64>,
    pub max_turns: Option<i64>,
    pub custom_system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub allowed_tools: Option<String>,
    pub disallowed_tools: Option<String>,
    pub permission_mode: Option<String>,
    pub permission_prompt_tool_name: Option<String>,
    pub model: Option<String>,
    pub fallback_model: Option<String>,
    /// MCP server configuration as a JSON document
    pub mcp_servers: Option<String>,
    pub enable_continue: bool,
    pub continue_minutes: i64,
}

/// A job as handed to [`JobQueue::enqueue`](super::JobQueue::enqueue).
#[derive(Debug, Clone)]
pub struct NewJob {
    pub webhook_id: String,
    pub api_key_id: Option<i64>,
    pub prompt: String,
    pub priority: i64,
    pub max_retries: i64,
    pub options: JobOptions,
}

impl NewJob {
    pub fn new(webhook_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            webhook_id: webhook_id.into(),
            api_key_id: None,
            prompt: prompt.into(),
            priority: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            options: JobOptions::default(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: i64,
    pub webhook_id: String,
    pub api_key_id: Option<i64>,
    pub prompt: String,
    pub status: JobStatus,
    pub priority: i64,
    pub retry_count: i64,
    pub max_retries: i64,
    pub worker_id: Option<String>,
    pub visibility_deadline: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub response: Option<String>,
    pub execution_time_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub options: JobOptions,
}

/// Flat row shape of `job_queue`. Timestamps are Unix milliseconds.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    id: i64,
    webhook_id: String,
    api_key_id: Option<i64>,
    prompt: String,
    job_status: String,
    priority: i64,
    retry_count: i64,
    max_retries: i64,
    worker_id: Option<String>,
    visibility_deadline: Option<i64>,
    error_message: Option<String>,
    response: Option<String>,
    execution_time_ms: Option<i64>,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
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
    enable_continue: bool,
    continue_minutes: i64,
}

impl TryFrom<JobRow> for Job {
    type Error = PullWorkerError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            webhook_id: row.webhook_id,
            api_key_id: row.api_key_id,
            prompt: row.prompt,
            status: row.job_status.parse()?,
            priority: row.priority,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            worker_id: row.worker_id,
            visibility_deadline: row.visibility_deadline.map(from_millis),
            error_message: row.error_message,
            response: row.response,
            execution_time_ms: row.execution_time_ms,
            created_at: from_millis(row.created_at),
            started_at: row.started_at.map(from_millis),
            completed_at: row.completed_at.map(from_millis),
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
        })
    }
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
