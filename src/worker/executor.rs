use std::process::Stdio;
use std::string::FromUtf8Error;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorConfig;
use crate::worker::options::InvocationSpec;

/// Coarse classification of an execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The deadline fired before the command exited.
    Timeout,
    /// Spawn error, non-zero exit or unreadable output.
    Command,
    /// The caller cancelled (shutdown).
    Cancelled,
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("execution timeout after {0:?}")]
    Timeout(Duration),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("execution error: exit code {code:?}\nstderr: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("execution produced invalid UTF-8 output: {0}")]
    InvalidOutput(#[from] FromUtf8Error),

    #[error("execution cancelled")]
    Cancelled,
}

impl ExecutionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ExecutionError::Timeout(_) => FailureKind::Timeout,
            ExecutionError::Cancelled => FailureKind::Cancelled,
            ExecutionError::Spawn { .. }
            | ExecutionError::NonZeroExit { .. }
            | ExecutionError::InvalidOutput(_) => FailureKind::Command,
        }
    }
}

/// Runs the external command for one job.
///
/// The child is spawned with `kill_on_drop`, so both the deadline and a
/// cancelled token terminate it: the wait future is dropped and the process
/// goes with it.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    config: ExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Command-line arguments for `prompt` under `spec`, in invocation order.
    pub fn build_args(&self, prompt: &str, spec: &InvocationSpec) -> Vec<String> {
        let mut args = self.config.program_args.clone();
        args.push("-p".to_string());

        if !spec.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(spec.allowed_tools.join(","));
        }
        if !spec.disallowed_tools.is_empty() {
            args.push("--disallowedTools".to_string());
            args.push(spec.disallowed_tools.join(","));
        }
        if let Some(ref prompt) = spec.custom_system_prompt {
            args.push("--system-prompt".to_string());
            args.push(prompt.clone());
        }
        if let Some(ref prompt) = spec.append_system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(prompt.clone());
        }
        if let Some(turns) = spec.max_turns {
            args.push("--max-turns".to_string());
            args.push(turns.to_string());
        }

        args.push("--permission-mode".to_string());
        args.push(spec.permission_mode.as_flag().to_string());

        if let Some(ref tool) = spec.permission_prompt_tool_name {
            args.push("--permission-prompt-tool".to_string());
            args.push(tool.clone());
        }
        if let Some(ref model) = spec.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(ref model) = spec.fallback_model {
            args.push("--fallback-model".to_string());
            args.push(model.clone());
        }
        if let Some(ref servers) = spec.mcp_servers {
            args.push("--mcp-config".to_string());
            args.push(servers.clone());
        }
        if spec.continue_session {
            args.push("--continue".to_string());
        }

        // The prompt is always last and separated from flags.
        args.push("--".to_string());
        args.push(prompt.to_string());
        args
    }

    /// Run the command to completion, the deadline, or cancellation,
    /// whichever comes first. Returns captured stdout on success.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        spec: &InvocationSpec,
    ) -> Result<String, ExecutionError> {
        let args = self.build_args(prompt, spec);

        let mut command = Command::new(&self.config.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = spec.working_dir {
            command.current_dir(dir);
        }
        if let Some(tokens) = spec.max_thinking_tokens {
            command.env("MAX_THINKING_TOKENS", tokens.to_string());
        }

        tracing::debug!(
            program = %self.config.program,
            timeout = ?self.config.timeout,
            continue_session = spec.continue_session,
            "Spawning command"
        );

        let child = command.spawn().map_err(|source| ExecutionError::Spawn {
            program: self.config.program.clone(),
            source,
        })?;

        // A child that has already exited wins over a concurrent cancel.
        let output = tokio::select! {
            biased;
            result = tokio::time::timeout(self.config.timeout, child.wait_with_output()) => {
                match result {
                    Err(_) => return Err(ExecutionError::Timeout(self.config.timeout)),
                    Ok(Err(source)) => {
                        return Err(ExecutionError::Spawn {
                            program: self.config.program.clone(),
                            source,
                        })
                    }
                    Ok(Ok(output)) => output,
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!(program = %self.config.program, "Execution cancelled, terminating child");
                return Err(ExecutionError::Cancelled);
            }
        };

        if !output.status.success() {
            return Err(ExecutionError::NonZeroExit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            });
        }

        Ok(String::from_utf8(output.stdout)?)
    }
}
