//! Durable job storage.
//!
//! Everything that touches the database lives here:
//! - [`store`]: the job table and its claim/complete/fail/reset transitions
//! - [`webhook`]: webhook templates and global settings (read-only to the worker)
//! - [`history`]: append-only execution records and statistics
//!
//! All methods hang off [`JobQueue`], which wraps a single connection pool.

pub mod history;
pub mod job;
pub mod store;
pub mod webhook;

pub use history::{ExecutionRecord, ExecutionStats, NewExecution};
pub use job::{Job, JobOptions, JobStatus, NewJob};
pub use store::JobQueue;
pub use webhook::{Webhook, DEFAULT_NOTIFICATION_CONFIG_KEY};
