//! HTTP surface: webhook ingress plus read-only job and execution queries.
//!
//! Nothing here can change a job's status; the only write is `enqueue`.

use std::net::SocketAddr;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::PullWorkerError;
use crate::queue::{ExecutionRecord, Job, JobQueue};

pub const EXECUTIONS_PER_PAGE: i64 = 20;
pub const DEFAULT_JOB_LIST_LIMIT: i64 = 50;
pub const MAX_JOB_LIST_LIMIT: i64 = 500;
pub const STATS_WINDOW_DAYS: i64 = 30;

#[derive(Clone)]
pub struct DashboardState {
    pub queue: JobQueue,
}

#[derive(Deserialize)]
struct TriggerRequest {
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    priority: i64,
}

#[derive(Serialize)]
struct TriggerResponse {
    status: &'static str,
    message: &'static str,
    job_id: i64,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Deserialize)]
struct JobListQuery {
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct PageQuery {
    page: Option<i64>,
}

#[derive(Serialize)]
struct ExecutionPage {
    executions: Vec<ExecutionRecord>,
    total: i64,
    page: i64,
    per_page: i64,
}

#[derive(Serialize)]
struct StatsResponse {
    webhook_id: String,
    since: DateTime<Utc>,
    total_executions: i64,
    successful_executions: i64,
    success_rate: f64,
    avg_execution_time_ms: f64,
}

/// Error mapped onto an HTTP status with a JSON body.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<PullWorkerError> for ApiError {
    fn from(err: PullWorkerError) -> Self {
        let status = match err {
            PullWorkerError::JobNotFound(_) | PullWorkerError::WebhookNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            _ => {
                tracing::error!(error = %err, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/webhooks/:id", post(trigger_handler))
        .route("/api/jobs/:id", get(get_job_handler))
        .route("/api/webhooks/:id/jobs", get(list_jobs_handler))
        .route("/api/webhooks/:id/executions", get(list_executions_handler))
        .route("/api/webhooks/:id/stats", get(stats_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve until `shutdown` is cancelled, then stop accepting and let
/// in-flight requests finish.
pub async fn run_dashboard(
    addr: SocketAddr,
    state: DashboardState,
    shutdown: CancellationToken,
) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting HTTP server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("HTTP server stopped");
    Ok(())
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

async fn trigger_handler(
    State(state): State<DashboardState>,
    Path(webhook_id): Path<String>,
    Json(payload): Json<TriggerRequest>,
) -> Result<Json<TriggerResponse>, ApiError> {
    let webhook = state.queue.get_webhook(&webhook_id).await?;
    if !webhook.is_active {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("Webhook not found: {webhook_id}"),
        ));
    }

    if payload.prompt.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "prompt is required"));
    }

    let job_id = state
        .queue
        .enqueue(&webhook.new_job(payload.prompt, payload.priority, None))
        .await?;

    tracing::info!(webhook_id = %webhook_id, job_id, "Webhook execution enqueued");

    Ok(Json(TriggerResponse {
        status: "accepted",
        message: "Webhook execution enqueued",
        job_id,
    }))
}

async fn get_job_handler(
    State(state): State<DashboardState>,
    Path(job_id): Path<i64>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.queue.get_job(job_id).await?))
}

async fn list_jobs_handler(
    State(state): State<DashboardState>,
    Path(webhook_id): Path<String>,
    Query(query): Query<JobListQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    state.queue.get_webhook(&webhook_id).await?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_JOB_LIST_LIMIT)
        .clamp(1, MAX_JOB_LIST_LIMIT);
    Ok(Json(
        state.queue.list_jobs_by_webhook(&webhook_id, limit).await?,
    ))
}

async fn list_executions_handler(
    State(state): State<DashboardState>,
    Path(webhook_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<ExecutionPage>, ApiError> {
    state.queue.get_webhook(&webhook_id).await?;
    let page = query.page.unwrap_or(1).max(1);
    let offset = (page - 1).saturating_mul(EXECUTIONS_PER_PAGE);

    let executions = state
        .queue
        .list_executions(&webhook_id, EXECUTIONS_PER_PAGE, offset)
        .await?;
    let total = state.queue.count_executions(&webhook_id).await?;

    Ok(Json(ExecutionPage {
        executions,
        total,
        page,
        per_page: EXECUTIONS_PER_PAGE,
    }))
}

async fn stats_handler(
    State(state): State<DashboardState>,
    Path(webhook_id): Path<String>,
) -> Result<Json<StatsResponse>, ApiError> {
    state.queue.get_webhook(&webhook_id).await?;
    let since = Utc::now() - chrono::Duration::days(STATS_WINDOW_DAYS);
    let stats = state.queue.execution_stats(&webhook_id, since).await?;

    Ok(Json(StatsResponse {
        webhook_id,
        since,
        total_executions: stats.total_executions,
        successful_executions: stats.successful_executions,
        success_rate: stats.success_rate(),
        avg_execution_time_ms: stats.avg_execution_time_ms,
    }))
}
