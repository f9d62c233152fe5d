use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::queue::{Job, JobOptions, JobQueue};

/// How the external command treats tool permission prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionMode {
    /// Run tools without asking.
    Allow,
    /// The command's own default: ask before using tools.
    #[default]
    Ask,
}

impl PermissionMode {
    /// Map a stored mode string. Unset and unrecognised values fall back to `Ask`.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("allow") => PermissionMode::Allow,
            _ => PermissionMode::Ask,
        }
    }

    /// Value passed to `--permission-mode`.
    pub fn as_flag(&self) -> &'static str {
        match self {
            PermissionMode::Allow => "bypassPermissions",
            PermissionMode::Ask => "default",
        }
    }
}

/// Everything the executor needs to build one command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationSpec {
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub custom_system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub max_thinking_tokens: Option<i64>,
    pub max_turns: Option<i64>,
    pub permission_mode: PermissionMode,
    pub permission_prompt_tool_name: Option<String>,
    pub model: Option<String>,
    pub fallback_model: Option<String>,
    pub mcp_servers: Option<String>,
    pub continue_session: bool,
}

/// Split a comma-separated tool list into trimmed, non-empty names.
pub fn split_tools(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// True when `last` is at most `window_minutes` before `now`.
pub fn within_continue_window(
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window_minutes: i64,
) -> bool {
    match last {
        Some(last) => now - last <= chrono::Duration::minutes(window_minutes),
        None => false,
    }
}

/// Blank values count as unset; anything else is kept verbatim.
fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

/// Pure part of the mapping: stored option fields to an invocation spec.
pub fn build_spec(options: &JobOptions, continue_session: bool) -> InvocationSpec {
    InvocationSpec {
        allowed_tools: split_tools(options.allowed_tools.as_deref()),
        disallowed_tools: split_tools(options.disallowed_tools.as_deref()),
        custom_system_prompt: non_empty(&options.custom_system_prompt),
        append_system_prompt: non_empty(&options.append_system_prompt),
        working_dir: non_empty(&options.working_dir).map(PathBuf::from),
        max_thinking_tokens: options.max_thinking_tokens.filter(|n| *n > 0),
        max_turns: options.max_turns.filter(|n| *n > 0),
        permission_mode: PermissionMode::parse(options.permission_mode.as_deref()),
        permission_prompt_tool_name: non_empty(&options.permission_prompt_tool_name),
        model: non_empty(&options.model),
        fallback_model: non_empty(&options.fallback_model),
        mcp_servers: non_empty(&options.mcp_servers),
        continue_session,
    }
}

/// Resolves a claimed job into an [`InvocationSpec`], consulting execution
/// history for the continuation flag.
#[derive(Debug, Clone)]
pub struct OptionsResolver {
    queue: JobQueue,
    default_continue_minutes: i64,
}

impl OptionsResolver {
    pub fn new(queue: JobQueue, default_continue_minutes: i64) -> Self {
        Self {
            queue,
            default_continue_minutes,
        }
    }

    pub async fn resolve(&self, job: &Job) -> InvocationSpec {
        let continue_session = self.should_continue(job).await;
        build_spec(&job.options, continue_session)
    }

    /// History lookup failures are not errors: they just mean no continuation.
    async fn should_continue(&self, job: &Job) -> bool {
        if !job.options.enable_continue {
            return false;
        }
        let window = if job.options.continue_minutes > 0 {
            job.options.continue_minutes
        } else {
            self.default_continue_minutes
        };

        match self.queue.last_successful_execution(&job.webhook_id).await {
            Ok(last) => within_continue_window(last, Utc::now(), window),
            Err(e) => {
                tracing::debug!(
                    job_id = job.id,
                    webhook_id = %job.webhook_id,
                    error = %e,
                    "Execution history lookup failed, not continuing"
                );
                false
            }
        }
    }
}
