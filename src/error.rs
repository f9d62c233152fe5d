use thiserror::Error;

#[derive(Error, Debug)]
pub enum PullWorkerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("Job {0} is not in processing state")]
    JobNotProcessing(i64),

    #[error("Webhook not found: {0}")]
    WebhookNotFound(String),

    #[error("Invalid job status: {0}")]
    InvalidStatus(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PullWorkerError>;
