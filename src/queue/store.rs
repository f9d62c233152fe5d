use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::{PullWorkerError, Result};
use crate::queue::job::{to_millis, Job, JobRow, JobStatus, NewJob};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) const JOB_COLUMNS: &str = "id, webhook_id, api_key_id, prompt, job_status, priority, \
     retry_count, max_retries, worker_id, visibility_deadline, error_message, response, \
     execution_time_ms, created_at, started_at, completed_at, working_dir, max_thinking_tokens, \
     max_turns, custom_system_prompt, append_system_prompt, allowed_tools, disallowed_tools, \
     permission_mode, permission_prompt_tool_name, model, fallback_model, mcp_servers, \
     enable_continue, continue_minutes";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS webhooks (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        working_dir TEXT,
        max_thinking_tokens INTEGER,
        max_turns INTEGER,
        custom_system_prompt TEXT,
        append_system_prompt TEXT,
        allowed_tools TEXT,
        disallowed_tools TEXT,
        permission_mode TEXT,
        permission_prompt_tool_name TEXT,
        model TEXT,
        fallback_model TEXT,
        mcp_servers TEXT,
        notification_config TEXT,
        enable_continue INTEGER NOT NULL DEFAULT 0,
        continue_minutes INTEGER NOT NULL DEFAULT 10
    )",
    "CREATE TABLE IF NOT EXISTS global_settings (
        setting_key TEXT PRIMARY KEY,
        setting_value TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS job_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        webhook_id TEXT NOT NULL,
        api_key_id INTEGER,
        prompt TEXT NOT NULL,
        job_status TEXT NOT NULL DEFAULT 'pending'
            CHECK (job_status IN ('pending', 'processing', 'completed', 'failed')),
        priority INTEGER NOT NULL DEFAULT 0,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        worker_id TEXT,
        visibility_deadline INTEGER,
        error_message TEXT,
        response TEXT,
        execution_time_ms INTEGER,
        created_at INTEGER NOT NULL,
        started_at INTEGER,
        completed_at INTEGER,
        working_dir TEXT,
        max_thinking_tokens INTEGER,
        max_turns INTEGER,
        custom_system_prompt TEXT,
        append_system_prompt TEXT,
        allowed_tools TEXT,
        disallowed_tools TEXT,
        permission_mode TEXT,
        permission_prompt_tool_name TEXT,
        model TEXT,
        fallback_model TEXT,
        mcp_servers TEXT,
        enable_continue INTEGER NOT NULL DEFAULT 0,
        continue_minutes INTEGER NOT NULL DEFAULT 10
    )",
    "CREATE INDEX IF NOT EXISTS idx_job_queue_claim
        ON job_queue(job_status, priority, created_at, id)",
    "CREATE INDEX IF NOT EXISTS idx_job_queue_webhook ON job_queue(webhook_id, created_at)",
    "CREATE TABLE IF NOT EXISTS execution_histories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER,
        webhook_id TEXT NOT NULL,
        api_key_id INTEGER,
        prompt TEXT NOT NULL,
        response TEXT,
        error TEXT,
        success INTEGER NOT NULL,
        execution_time_ms INTEGER,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_execution_histories_webhook
        ON execution_histories(webhook_id, created_at)",
];

/// Durable job queue backed by SQLite.
///
/// The table is the only coordination point between workers: every state
/// transition is a single conditional `UPDATE`, so two callers racing on the
/// same row can never both win.
#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: SqlitePool,
}

impl JobQueue {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::new(pool).await
    }

    /// Transient database, discarded when the queue is dropped.
    ///
    /// Each SQLite memory connection is its own database, so the pool is
    /// pinned to a single connection.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::new(pool).await
    }

    /// Wrap an existing pool and make sure the schema is present.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let queue = Self { pool };
        queue.init_schema().await?;
        Ok(queue)
    }

    /// Underlying pool, for tests that need to poke rows directly.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Insert a pending job carrying a full options snapshot. Never waits on
    /// worker availability.
    pub async fn enqueue(&self, job: &NewJob) -> Result<i64> {
        let opts = &job.options;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO job_queue (
                webhook_id, api_key_id, prompt, job_status, priority, retry_count, max_retries,
                created_at, working_dir, max_thinking_tokens, max_turns, custom_system_prompt,
                append_system_prompt, allowed_tools, disallowed_tools, permission_mode,
                permission_prompt_tool_name, model, fallback_model, mcp_servers,
                enable_continue, continue_minutes
            ) VALUES (?1, ?2, ?3, 'pending', ?4, 0, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                      ?15, ?16, ?17, ?18, ?19, ?20)
            RETURNING id",
        )
        .bind(&job.webhook_id)
        .bind(job.api_key_id)
        .bind(&job.prompt)
        .bind(job.priority)
        .bind(job.max_retries)
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
        .bind(opts.enable_continue)
        .bind(opts.continue_minutes)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(job_id = id, webhook_id = %job.webhook_id, priority = job.priority, "Job enqueued");
        Ok(id)
    }

    /// Atomically claim the next eligible job for `worker_id`.
    ///
    /// Eligible means pending, or processing with an expired visibility
    /// deadline. Order is priority ascending, then creation time, then id.
    /// Returns `Ok(None)` when nothing is available.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        visibility_window: Duration,
    ) -> Result<Option<Job>> {
        let now = Utc::now();
        let window = chrono::Duration::from_std(visibility_window).map_err(|e| {
            PullWorkerError::InvalidConfig(format!("visibility window out of range: {e}"))
        })?;
        let deadline = now + window;

        let sql = format!(
            "UPDATE job_queue
             SET job_status = 'processing',
                 worker_id = ?1,
                 visibility_deadline = ?2,
                 started_at = ?3
             WHERE id = (
                 SELECT id FROM job_queue
                 WHERE job_status = 'pending'
                    OR (job_status = 'processing' AND visibility_deadline < ?3)
                 ORDER BY priority ASC, created_at ASC, id ASC
                 LIMIT 1
             )
             RETURNING {JOB_COLUMNS}"
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(worker_id)
            .bind(to_millis(deadline))
            .bind(to_millis(now))
            .fetch_optional(&self.pool)
            .await?;

        row.map(Job::try_from).transpose()
    }

    /// processing → completed. Fails with `JobNotProcessing` when the row has
    /// already left the processing state.
    pub async fn complete(&self, job_id: i64, response: &str, execution_time_ms: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE job_queue
             SET job_status = 'completed',
                 response = ?1,
                 execution_time_ms = ?2,
                 completed_at = ?3,
                 visibility_deadline = NULL
             WHERE id = ?4 AND job_status = 'processing'",
        )
        .bind(response)
        .bind(execution_time_ms)
        .bind(to_millis(Utc::now()))
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        self.expect_transition(job_id, result.rows_affected()).await
    }

    /// processing → failed, recording the error.
    pub async fn fail(&self, job_id: i64, error_message: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE job_queue
             SET job_status = 'failed',
                 error_message = ?1,
                 completed_at = ?2,
                 visibility_deadline = NULL
             WHERE id = ?3 AND job_status = 'processing'",
        )
        .bind(error_message)
        .bind(to_millis(Utc::now()))
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        self.expect_transition(job_id, result.rows_affected()).await
    }

    /// processing → pending with `retry_count + 1`, only while retries remain.
    ///
    /// Returns `false` when the job has exhausted its retries (or is no longer
    /// processing); the caller should then `fail` it.
    pub async fn requeue(&self, job_id: i64, error_message: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE job_queue
             SET job_status = 'pending',
                 retry_count = retry_count + 1,
                 error_message = ?1,
                 worker_id = NULL,
                 visibility_deadline = NULL,
                 started_at = NULL
             WHERE id = ?2 AND job_status = 'processing' AND retry_count < max_retries",
        )
        .bind(error_message)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Give a claim back without consuming a retry. Only the owning worker
    /// can release.
    pub async fn release(&self, job_id: i64, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE job_queue
             SET job_status = 'pending',
                 worker_id = NULL,
                 visibility_deadline = NULL,
                 started_at = NULL
             WHERE id = ?1 AND job_status = 'processing' AND worker_id = ?2",
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Reset every processing job whose visibility deadline has passed back
    /// to pending. Returns the number of rows reset.
    pub async fn reset_stale(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE job_queue
             SET job_status = 'pending',
                 worker_id = NULL,
                 visibility_deadline = NULL,
                 started_at = NULL
             WHERE job_status = 'processing'
               AND visibility_deadline IS NOT NULL
               AND visibility_deadline < ?1",
        )
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn get_job(&self, job_id: i64) -> Result<Job> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE id = ?1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(PullWorkerError::JobNotFound(job_id))?;
        Job::try_from(row)
    }

    /// Most recent jobs for a webhook, newest first.
    pub async fn list_jobs_by_webhook(&self, webhook_id: &str, limit: i64) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM job_queue
             WHERE webhook_id = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2"
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(webhook_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    /// Number of jobs currently in `status`.
    pub async fn count_by_status(&self, status: JobStatus) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_queue WHERE job_status = ?1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Overwrite a claim's visibility deadline. Only useful to simulate an
    /// elapsed claim in tests and tooling.
    pub async fn set_visibility_deadline(&self, job_id: i64, deadline: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE job_queue SET visibility_deadline = ?1 WHERE id = ?2")
            .bind(to_millis(deadline))
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PullWorkerError::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn expect_transition(&self, job_id: i64, rows_affected: u64) -> Result<()> {
        if rows_affected > 0 {
            return Ok(());
        }
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM job_queue WHERE id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Err(PullWorkerError::JobNotProcessing(job_id)),
            None => Err(PullWorkerError::JobNotFound(job_id)),
        }
    }
}
