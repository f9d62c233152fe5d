use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::queue::job::{from_millis, to_millis};
use crate::queue::JobQueue;

/// One finished execution. Rows are appended once and never updated.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub job_id: Option<i64>,
    pub webhook_id: String,
    pub api_key_id: Option<i64>,
    pub prompt: String,
    pub response: Option<String>,
    pub error: Option<String>,
    pub success: bool,
    pub execution_time_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewExecution {
    pub job_id: Option<i64>,
    pub webhook_id: String,
    pub api_key_id: Option<i64>,
    pub prompt: String,
    pub response: Option<String>,
    pub error: Option<String>,
    pub success: bool,
    pub execution_time_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExecutionStats {
    pub total_executions: i64,
    pub successful_executions: i64,
    pub avg_execution_time_ms: f64,
}

impl ExecutionStats {
    /// Percentage in `0.0..=100.0`; zero when nothing ran.
    pub fn success_rate(&self) -> f64 {
        if self.total_executions == 0 {
            return 0.0;
        }
        self.successful_executions as f64 / self.total_executions as f64 * 100.0
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ExecutionRow {
    id: i64,
    job_id: Option<i64>,
    webhook_id: String,
    api_key_id: Option<i64>,
    prompt: String,
    response: Option<String>,
    error: Option<String>,
    success: bool,
    execution_time_ms: Option<i64>,
    created_at: i64,
}

impl From<ExecutionRow> for ExecutionRecord {
    fn from(row: ExecutionRow) -> Self {
        ExecutionRecord {
            id: row.id,
            job_id: row.job_id,
            webhook_id: row.webhook_id,
            api_key_id: row.api_key_id,
            prompt: row.prompt,
            response: row.response,
            error: row.error,
            success: row.success,
            execution_time_ms: row.execution_time_ms,
            created_at: from_millis(row.created_at),
        }
    }
}

impl JobQueue {
    pub async fn record_execution(&self, execution: &NewExecution) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO execution_histories (
                job_id, webhook_id, api_key_id, prompt, response, error, success,
                execution_time_ms, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            RETURNING id",
        )
        .bind(execution.job_id)
        .bind(&execution.webhook_id)
        .bind(execution.api_key_id)
        .bind(&execution.prompt)
        .bind(&execution.response)
        .bind(&execution.error)
        .bind(execution.success)
        .bind(execution.execution_time_ms)
        .bind(to_millis(execution.created_at))
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    /// Timestamp of the newest successful execution for a webhook.
    pub async fn last_successful_execution(&self, webhook_id: &str) -> Result<Option<DateTime<Utc>>> {
        let created_at: Option<i64> = sqlx::query_scalar(
            "SELECT created_at FROM execution_histories
             WHERE webhook_id = ?1 AND success = 1
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
        )
        .bind(webhook_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(created_at.map(from_millis))
    }

    /// Page of execution records, newest first.
    pub async fn list_executions(
        &self,
        webhook_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            "SELECT id, job_id, webhook_id, api_key_id, prompt, response, error, success,
                    execution_time_ms, created_at
             FROM execution_histories
             WHERE webhook_id = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2 OFFSET ?3",
        )
        .bind(webhook_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(ExecutionRecord::from).collect())
    }

    pub async fn count_executions(&self, webhook_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM execution_histories WHERE webhook_id = ?1")
                .bind(webhook_id)
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }

    /// Count, successes and mean duration of executions since `since`.
    pub async fn execution_stats(&self, webhook_id: &str, since: DateTime<Utc>) -> Result<ExecutionStats> {
        let (total, successful, avg): (i64, Option<i64>, Option<f64>) = sqlx::query_as(
            "SELECT COUNT(*),
                    SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END),
                    AVG(execution_time_ms)
             FROM execution_histories
             WHERE webhook_id = ?1 AND created_at >= ?2",
        )
        .bind(webhook_id)
        .bind(to_millis(since))
        .fetch_one(self.pool())
        .await?;

        Ok(ExecutionStats {
            total_executions: total,
            successful_executions: successful.unwrap_or(0),
            avg_execution_time_ms: avg.unwrap_or(0.0),
        })
    }
}
