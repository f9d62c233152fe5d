use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{RetryPolicy, WorkerConfig};
use crate::notify::{CompletionEvent, NotificationDispatcher};
use crate::queue::{Job, JobQueue, NewExecution};
use crate::worker::executor::{CommandExecutor, ExecutionError, FailureKind};
use crate::worker::options::OptionsResolver;

/// Per-worker phase. Job-level terminal states live in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Claiming,
    Executing,
    Recording,
}

/// What a single poll tick ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No job was available.
    Empty,
    /// The claim query itself failed; nothing changed.
    ClaimFailed,
    Completed(i64),
    Failed(i64),
    /// Failed but put back to pending under the retry policy.
    Requeued(i64),
    /// Cancelled mid-execution; the claim was handed back.
    Released(i64),
    /// A store write failed after execution; the job stays claimed until
    /// its visibility deadline passes.
    Abandoned(i64),
}

/// Single-flight poll loop over a [`JobQueue`].
///
/// Each worker has a unique id used to own claims. At most one job runs at a
/// time; several workers may share one store safely.
pub struct QueueWorker {
    id: String,
    queue: JobQueue,
    executor: CommandExecutor,
    resolver: OptionsResolver,
    dispatcher: NotificationDispatcher,
    config: WorkerConfig,
    stop: CancellationToken,
    state: watch::Sender<WorkerState>,
}

impl QueueWorker {
    /// `shutdown` is the process-wide token; the worker derives its own stop
    /// token from it so it can also be stopped on its own.
    pub fn new(
        queue: JobQueue,
        executor: CommandExecutor,
        dispatcher: NotificationDispatcher,
        config: WorkerConfig,
        shutdown: &CancellationToken,
    ) -> Self {
        let resolver = OptionsResolver::new(queue.clone(), config.default_continue_minutes);
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            id: Uuid::new_v4().to_string(),
            queue,
            executor,
            resolver,
            dispatcher,
            config,
            stop: shutdown.child_token(),
            state,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Stop polling and cancel the in-flight execution, if any.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Reset stale claims, then poll until stopped.
    pub async fn run(&self) {
        match self.queue.reset_stale().await {
            Ok(0) => {}
            Ok(count) => {
                tracing::info!(worker_id = %self.id, count, "Reset stale jobs to pending");
            }
            Err(e) => {
                tracing::error!(worker_id = %self.id, error = %e, "Failed to reset stale jobs");
            }
        }

        tracing::info!(
            worker_id = %self.id,
            poll_interval = ?self.config.poll_interval,
            visibility_window = ?self.config.visibility_window,
            "Queue worker started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.tick().await;
        }

        self.state.send_replace(WorkerState::Idle);
        tracing::info!(worker_id = %self.id, "Queue worker stopped");
    }

    /// One poll: claim, execute, record. Never returns an error; every
    /// failure ends up on the job row or in the log.
    pub async fn tick(&self) -> TickOutcome {
        self.state.send_replace(WorkerState::Claiming);
        let job = match self
            .queue
            .claim_next(&self.id, self.config.visibility_window)
            .await
        {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.state.send_replace(WorkerState::Idle);
                return TickOutcome::Empty;
            }
            Err(e) => {
                tracing::error!(worker_id = %self.id, error = %e, "Failed to claim job");
                self.state.send_replace(WorkerState::Idle);
                return TickOutcome::ClaimFailed;
            }
        };

        tracing::info!(
            worker_id = %self.id,
            job_id = job.id,
            webhook_id = %job.webhook_id,
            priority = job.priority,
            retry_count = job.retry_count,
            "Claimed job"
        );

        self.state.send_replace(WorkerState::Executing);
        let spec = self.resolver.resolve(&job).await;
        let started = Instant::now();
        let result = self.executor.execute(&self.stop, &job.prompt, &spec).await;
        let elapsed = started.elapsed();

        self.state.send_replace(WorkerState::Recording);
        let outcome = match result {
            Ok(response) => self.record_success(&job, response, elapsed).await,
            Err(e) if e.kind() == FailureKind::Cancelled => self.release(&job).await,
            Err(e) => self.record_failure(&job, e, elapsed).await,
        };
        self.state.send_replace(WorkerState::Idle);
        outcome
    }

    async fn record_success(&self, job: &Job, response: String, elapsed: Duration) -> TickOutcome {
        let elapsed_ms = duration_ms(elapsed);
        if let Err(e) = self.queue.complete(job.id, &response, elapsed_ms).await {
            tracing::error!(
                worker_id = %self.id,
                job_id = job.id,
                error = %e,
                "Failed to mark job completed, abandoning"
            );
            return TickOutcome::Abandoned(job.id);
        }

        tracing::info!(worker_id = %self.id, job_id = job.id, elapsed_ms, "Job completed");

        self.append_history(job, Some(response.clone()), None, true, elapsed_ms)
            .await;
        self.dispatcher.dispatch(
            &job.webhook_id,
            CompletionEvent::success(job.prompt.clone(), response, elapsed),
        );
        TickOutcome::Completed(job.id)
    }

    async fn record_failure(&self, job: &Job, error: ExecutionError, elapsed: Duration) -> TickOutcome {
        let message = error.to_string();
        let elapsed_ms = duration_ms(elapsed);

        if self.config.retry_policy == RetryPolicy::UpToMaxRetries {
            match self.queue.requeue(job.id, &message).await {
                Ok(true) => {
                    tracing::warn!(
                        worker_id = %self.id,
                        job_id = job.id,
                        retry_count = job.retry_count + 1,
                        max_retries = job.max_retries,
                        error = %message,
                        "Job failed, requeued for retry"
                    );
                    return TickOutcome::Requeued(job.id);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        worker_id = %self.id,
                        job_id = job.id,
                        error = %e,
                        "Failed to requeue job, abandoning"
                    );
                    return TickOutcome::Abandoned(job.id);
                }
            }
        }

        if let Err(e) = self.queue.fail(job.id, &message).await {
            tracing::error!(
                worker_id = %self.id,
                job_id = job.id,
                error = %e,
                "Failed to mark job failed, abandoning"
            );
            return TickOutcome::Abandoned(job.id);
        }

        tracing::warn!(
            worker_id = %self.id,
            job_id = job.id,
            kind = ?error.kind(),
            elapsed_ms,
            error = %message,
            "Job failed"
        );

        self.append_history(job, None, Some(message.clone()), false, elapsed_ms)
            .await;
        self.dispatcher.dispatch(
            &job.webhook_id,
            CompletionEvent::failure(job.prompt.clone(), message, elapsed),
        );
        TickOutcome::Failed(job.id)
    }

    async fn release(&self, job: &Job) -> TickOutcome {
        match self.queue.release(job.id, &self.id).await {
            Ok(true) => {
                tracing::info!(worker_id = %self.id, job_id = job.id, "Execution cancelled, job released");
                TickOutcome::Released(job.id)
            }
            Ok(false) => {
                tracing::warn!(
                    worker_id = %self.id,
                    job_id = job.id,
                    "Execution cancelled but claim was no longer held"
                );
                TickOutcome::Abandoned(job.id)
            }
            Err(e) => {
                tracing::error!(worker_id = %self.id, job_id = job.id, error = %e, "Failed to release job");
                TickOutcome::Abandoned(job.id)
            }
        }
    }

    /// History failures are logged only; the job row is already terminal.
    async fn append_history(
        &self,
        job: &Job,
        response: Option<String>,
        error: Option<String>,
        success: bool,
        elapsed_ms: i64,
    ) {
        let record = NewExecution {
            job_id: Some(job.id),
            webhook_id: job.webhook_id.clone(),
            api_key_id: job.api_key_id,
            prompt: job.prompt.clone(),
            response,
            error,
            success,
            execution_time_ms: Some(elapsed_ms),
            created_at: Utc::now(),
        };
        if let Err(e) = self.queue.record_execution(&record).await {
            tracing::error!(
                worker_id = %self.id,
                job_id = job.id,
                error = %e,
                "Failed to record execution history"
            );
        }
    }
}

fn duration_ms(elapsed: Duration) -> i64 {
    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
}
