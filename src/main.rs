use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use pull_worker::config::{
    derived_visibility_window, ExecutorConfig, RetryPolicy, ServerConfig, WorkerConfig,
};
use pull_worker::notify::{DiscordConfig, NotificationConfig};
use pull_worker::queue::{Job, JobOptions, JobQueue, Webhook, DEFAULT_NOTIFICATION_CONFIG_KEY};
use pull_worker::server::Server;
use pull_worker::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "pull-worker")]
#[command(version)]
#[command(about = "Webhook-triggered job queue that runs Claude Code prompts")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server and queue worker
    Serve(ServeArgs),

    /// Job commands
    Job {
        #[command(flatten)]
        db: DbArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Webhook configuration commands
    Webhook {
        #[command(flatten)]
        db: DbArgs,

        #[command(subcommand)]
        command: WebhookCommands,
    },

    /// Notification defaults
    Notify {
        #[command(flatten)]
        db: DbArgs,

        #[command(subcommand)]
        command: NotifyCommands,
    },

    /// Execution statistics for a webhook over the last 30 days
    Stats {
        #[command(flatten)]
        db: DbArgs,

        /// Webhook ID
        webhook: String,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// SQLite database file
    #[arg(long, env = "DATABASE_PATH", default_value = "pull-worker.db")]
    database: PathBuf,

    /// Address to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port for the HTTP server
    #[arg(long, env = "PORT", default_value = "8081")]
    port: u16,

    /// Program to run for each job
    #[arg(long, env = "CLAUDE_PATH", default_value = "claude")]
    program: String,

    /// Execution timeout in seconds
    #[arg(long, env = "EXECUTION_TIMEOUT_SECS", default_value = "3600")]
    timeout_secs: u64,

    /// Claim visibility window in seconds (default: timeout + 600)
    #[arg(long, env = "VISIBILITY_WINDOW_SECS")]
    visibility_secs: Option<u64>,

    /// Poll interval in milliseconds
    #[arg(long, env = "POLL_INTERVAL_MS", default_value = "1000")]
    poll_interval_ms: u64,

    /// Continuation window in minutes for jobs that set none
    #[arg(long, env = "DEFAULT_CONTINUE_MINUTES", default_value = "10")]
    continue_minutes: i64,

    /// Requeue failed jobs until their max_retries is reached
    #[arg(long, env = "RETRY_FAILED")]
    retry_failed: bool,
}

// =============================================================================
// Local Admin Arguments (shared by job, webhook, notify and stats)
// =============================================================================

#[derive(Parser, Debug)]
struct DbArgs {
    /// SQLite database file
    #[arg(long, env = "DATABASE_PATH", default_value = "pull-worker.db")]
    database: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Enqueue a prompt for a webhook
    Submit {
        /// Webhook ID
        #[arg(long)]
        webhook: String,

        /// Lower runs first
        #[arg(long, default_value = "0")]
        priority: i64,

        /// The prompt to run
        prompt: String,
    },
    /// Show a single job
    Status {
        /// The job ID
        job_id: i64,
    },
    /// List recent jobs for a webhook
    List {
        /// Webhook ID
        #[arg(long)]
        webhook: String,

        /// Number of jobs to show
        #[arg(long, default_value = "50")]
        limit: i64,
    },
}

#[derive(clap::Subcommand, Debug)]
enum WebhookCommands {
    /// Create or replace a webhook
    Add(WebhookAddArgs),
    /// Show a webhook
    Show {
        /// Webhook ID
        id: String,
    },
}

#[derive(Parser, Debug)]
struct WebhookAddArgs {
    /// Webhook ID (used in /webhooks/<id>)
    id: String,

    /// Display name
    #[arg(long)]
    name: String,

    #[arg(long)]
    description: Option<String>,

    /// Working directory for the command
    #[arg(long)]
    working_dir: Option<String>,

    /// Comma-separated allowed tools
    #[arg(long)]
    allowed_tools: Option<String>,

    /// Comma-separated disallowed tools
    #[arg(long)]
    disallowed_tools: Option<String>,

    #[arg(long)]
    system_prompt: Option<String>,

    #[arg(long)]
    append_system_prompt: Option<String>,

    #[arg(long)]
    max_turns: Option<i64>,

    #[arg(long)]
    max_thinking_tokens: Option<i64>,

    /// "allow" or "ask"
    #[arg(long)]
    permission_mode: Option<String>,

    #[arg(long)]
    permission_prompt_tool: Option<String>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    fallback_model: Option<String>,

    /// MCP server configuration (JSON)
    #[arg(long)]
    mcp_config: Option<String>,

    /// Continue the previous session when it ran recently
    #[arg(long)]
    enable_continue: bool,

    #[arg(long, default_value = "10")]
    continue_minutes: i64,

    /// Discord webhook URL for completion notifications
    #[arg(long)]
    discord_url: Option<String>,

    /// Create the webhook disabled
    #[arg(long)]
    inactive: bool,
}

#[derive(clap::Subcommand, Debug)]
enum NotifyCommands {
    /// Set the notification config used by webhooks without their own
    SetDefault {
        /// Discord webhook URL
        #[arg(long)]
        discord_url: String,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: i64,
    webhook_id: String,
}

#[derive(Serialize)]
struct StatsOutput {
    webhook_id: String,
    total_executions: i64,
    successful_executions: i64,
    success_rate: f64,
    avg_execution_time_ms: f64,
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let timeout = Duration::from_secs(args.timeout_secs);
    let visibility_window = match args.visibility_secs {
        Some(secs) => Duration::from_secs(secs),
        None => derived_visibility_window(timeout)?,
    };

    let config = ServerConfig {
        database_path: args.database,
        listen_addr,
        executor: ExecutorConfig {
            program: args.program,
            timeout,
            ..ExecutorConfig::default()
        },
        worker: WorkerConfig {
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            visibility_window,
            retry_policy: if args.retry_failed {
                RetryPolicy::UpToMaxRetries
            } else {
                RetryPolicy::Never
            },
            default_continue_minutes: args.continue_minutes,
            ..WorkerConfig::default()
        },
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        database = %config.database_path.display(),
        "Starting pull-worker"
    );

    let shutdown = install_shutdown_handler();
    let server = Server::open(config).await?;
    server.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Local Command Handlers
// =============================================================================

fn print_job(job: &Job) {
    println!("Job ID:       {}", job.id);
    println!("Webhook:      {}", job.webhook_id);
    println!("Status:       {}", job.status);
    println!("Priority:     {}", job.priority);
    println!("Retries:      {}/{}", job.retry_count, job.max_retries);
    println!("Created:      {}", job.created_at.to_rfc3339());
    if let Some(started) = job.started_at {
        println!("Started:      {}", started.to_rfc3339());
    }
    if let Some(completed) = job.completed_at {
        println!("Completed:    {}", completed.to_rfc3339());
    }
    if let Some(ms) = job.execution_time_ms {
        println!("Duration:     {:.2}s", ms as f64 / 1000.0);
    }
    if let Some(ref worker) = job.worker_id {
        println!("Worker:       {}", worker);
    }
    println!("Prompt:");
    for line in job.prompt.lines() {
        println!("  {}", line);
    }
    if let Some(ref response) = job.response {
        println!("Response:");
        for line in response.lines() {
            println!("  {}", line);
        }
    }
    if let Some(ref error) = job.error_message {
        println!("Error:");
        for line in error.lines() {
            println!("  {}", line);
        }
    }
}

async fn handle_job(
    queue: &JobQueue,
    command: JobCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::Submit {
            webhook,
            priority,
            prompt,
        } => {
            let hook = queue.get_webhook(&webhook).await?;
            if !hook.is_active {
                return Err(format!("webhook {} is inactive", webhook).into());
            }
            let job_id = queue.enqueue(&hook.new_job(prompt, priority, None)).await?;
            match output_format {
                OutputFormat::Json => {
                    let output = JobSubmitOutput {
                        job_id,
                        webhook_id: webhook,
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Table => {
                    println!("Job submitted successfully!");
                    println!("Job ID: {}", job_id);
                }
            }
        }
        JobCommands::Status { job_id } => {
            let job = queue.get_job(job_id).await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
                OutputFormat::Table => print_job(&job),
            }
        }
        JobCommands::List { webhook, limit } => {
            let jobs = queue.list_jobs_by_webhook(&webhook, limit.max(1)).await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
                OutputFormat::Table => {
                    if jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!(
                            "{:<8} {:<12} {:<8} {:<26} PROMPT",
                            "JOB ID", "STATUS", "PRIO", "CREATED"
                        );
                        println!("{}", "-".repeat(90));
                        for job in &jobs {
                            let prompt: String = job.prompt.chars().take(40).collect();
                            let prompt = if job.prompt.chars().count() > 40 {
                                format!("{}...", prompt)
                            } else {
                                prompt
                            };
                            println!(
                                "{:<8} {:<12} {:<8} {:<26} {}",
                                job.id,
                                job.status.to_string(),
                                job.priority,
                                job.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                                prompt.replace('\n', " ")
                            );
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_webhook(
    queue: &JobQueue,
    command: WebhookCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        WebhookCommands::Add(args) => {
            let mut webhook = Webhook::new(args.id, args.name);
            webhook.description = args.description;
            webhook.is_active = !args.inactive;
            webhook.options = JobOptions {
                working_dir: args.working_dir,
                max_thinking_tokens: args.max_thinking_tokens,
                max_turns: args.max_turns,
                custom_system_prompt: args.system_prompt,
                append_system_prompt: args.append_system_prompt,
                allowed_tools: args.allowed_tools,
                disallowed_tools: args.disallowed_tools,
                permission_mode: args.permission_mode,
                permission_prompt_tool_name: args.permission_prompt_tool,
                model: args.model,
                fallback_model: args.fallback_model,
                mcp_servers: args.mcp_config,
                enable_continue: args.enable_continue,
                continue_minutes: args.continue_minutes,
            };
            if let Some(url) = args.discord_url {
                let config = NotificationConfig {
                    discord: Some(DiscordConfig { webhook_url: url }),
                };
                webhook.notification_config = Some(serde_json::to_string(&config)?);
            }
            queue.save_webhook(&webhook).await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&webhook)?),
                OutputFormat::Table => println!("Webhook saved: {}", webhook.id),
            }
        }
        WebhookCommands::Show { id } => {
            let webhook = queue.get_webhook(&id).await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&webhook)?),
                OutputFormat::Table => {
                    println!("Webhook ID:   {}", webhook.id);
                    println!("Name:         {}", webhook.name);
                    if let Some(ref description) = webhook.description {
                        println!("Description:  {}", description);
                    }
                    println!("Active:       {}", webhook.is_active);
                    println!("Continue:     {}", webhook.options.enable_continue);
                    if webhook.options.enable_continue {
                        println!("Window:       {} min", webhook.options.continue_minutes);
                    }
                    if let Some(ref dir) = webhook.options.working_dir {
                        println!("Working Dir:  {}", dir);
                    }
                    if let Some(ref model) = webhook.options.model {
                        println!("Model:        {}", model);
                    }
                    println!(
                        "Notify:       {}",
                        if webhook.notification_config.is_some() {
                            "custom"
                        } else {
                            "default"
                        }
                    );
                }
            }
        }
    }
    Ok(())
}

async fn handle_notify(
    queue: &JobQueue,
    command: NotifyCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        NotifyCommands::SetDefault { discord_url } => {
            let config = NotificationConfig {
                discord: Some(DiscordConfig {
                    webhook_url: discord_url,
                }),
            };
            queue
                .set_global_setting(
                    DEFAULT_NOTIFICATION_CONFIG_KEY,
                    &serde_json::to_string(&config)?,
                )
                .await?;
            println!("Default notification config saved.");
        }
    }
    Ok(())
}

async fn handle_stats(
    queue: &JobQueue,
    webhook: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    queue.get_webhook(&webhook).await?;
    let since = chrono::Utc::now() - chrono::Duration::days(30);
    let stats = queue.execution_stats(&webhook, since).await?;

    match output_format {
        OutputFormat::Json => {
            let output = StatsOutput {
                webhook_id: webhook,
                total_executions: stats.total_executions,
                successful_executions: stats.successful_executions,
                success_rate: stats.success_rate(),
                avg_execution_time_ms: stats.avg_execution_time_ms,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Webhook:      {}", webhook);
            println!("Executions:   {}", stats.total_executions);
            println!("Successful:   {}", stats.successful_executions);
            println!("Success Rate: {:.1}%", stats.success_rate());
            println!(
                "Avg Duration: {:.2}s",
                stats.avg_execution_time_ms / 1000.0
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => {
            run_server(serve_args).await?;
        }
        Commands::Job { db, command } => {
            let queue = JobQueue::open(&db.database).await?;
            handle_job(&queue, command, &db.output).await?;
        }
        Commands::Webhook { db, command } => {
            let queue = JobQueue::open(&db.database).await?;
            handle_webhook(&queue, command, &db.output).await?;
        }
        Commands::Notify { db, command } => {
            let queue = JobQueue::open(&db.database).await?;
            handle_notify(&queue, command).await?;
        }
        Commands::Stats { db, webhook } => {
            let queue = JobQueue::open(&db.database).await?;
            handle_stats(&queue, webhook, &db.output).await?;
        }
    }

    Ok(())
}
