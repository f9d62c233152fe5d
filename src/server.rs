use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::notify::NotificationDispatcher;
use crate::queue::JobQueue;
use crate::worker::{CommandExecutor, QueueWorker};

/// Runs the HTTP surface and one queue worker over a shared store.
pub struct Server {
    config: ServerConfig,
    queue: JobQueue,
}

impl Server {
    /// Validate `config` and open the database it points at.
    pub async fn open(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let queue = JobQueue::open(&config.database_path).await?;
        Ok(Self { config, queue })
    }

    /// Use an already-open store.
    pub fn with_queue(config: ServerConfig, queue: JobQueue) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, queue })
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Shutdown order: the HTTP server stops accepting, the worker stops
    /// between ticks (killing and releasing an in-flight job), then pending
    /// notifications get `notification_grace` to finish.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let dispatcher = NotificationDispatcher::new(self.queue.clone());
        let worker = Arc::new(QueueWorker::new(
            self.queue.clone(),
            CommandExecutor::new(self.config.executor.clone()),
            dispatcher.clone(),
            self.config.worker.clone(),
            &shutdown,
        ));

        tracing::info!(
            worker_id = %worker.id(),
            database = %self.config.database_path.display(),
            program = %self.config.executor.program,
            timeout = ?self.config.executor.timeout,
            retry_policy = ?self.config.worker.retry_policy,
            "Starting pull worker"
        );

        let worker_task = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run().await })
        };

        let state = DashboardState {
            queue: self.queue.clone(),
        };
        let http_result = run_dashboard(self.config.listen_addr, state, shutdown.clone()).await;
        if let Err(ref e) = http_result {
            tracing::error!(error = %e, "HTTP server failed, stopping worker");
            worker.stop();
        }

        if let Err(e) = worker_task.await {
            tracing::error!(error = %e, "Worker task panicked");
        }

        if !dispatcher.drain(self.config.worker.notification_grace).await {
            tracing::warn!(
                grace = ?self.config.worker.notification_grace,
                "Notifications still in flight at shutdown"
            );
        }

        tracing::info!("Pull worker stopped");
        http_result
    }
}
