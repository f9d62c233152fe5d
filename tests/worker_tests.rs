
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use chrono::Utc;
use pull_worker::config::{ExecutorConfig, RetryPolicy, WorkerConfig};
use pull_worker::notify::NotificationDispatcher;
use pull_worker::queue::{
    JobQueue, JobStatus, NewExecution, Webhook, DEFAULT_NOTIFICATION_CONFIG_KEY,
};
use pull_worker::worker::{CommandExecutor, QueueWorker, TickOutcome, WorkerState};
use test_harness::{
    create_webhook, discord_config, echo_command, fake_command, read_args, read_pid,
    sleeper_command, temp_queue, wait_for, wait_for_exit, CaptureServer,
};
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(10);

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(50),
        visibility_window: Duration::from_secs(60),
        ..WorkerConfig::default()
    }
}

fn build_worker(
    queue: &JobQueue,
    executor: ExecutorConfig,
    config: WorkerConfig,
    shutdown: &CancellationToken,
) -> (QueueWorker, NotificationDispatcher) {
    let dispatcher = NotificationDispatcher::new(queue.clone());
    let worker = QueueWorker::new(
        queue.clone(),
        CommandExecutor::new(executor),
        dispatcher.clone(),
        config,
        shutdown,
    );
    (worker, dispatcher)
}

async fn flush_notifications(dispatcher: &NotificationDispatcher) {
    assert!(
        dispatcher.drain(Duration::from_secs(5)).await,
        "notifications did not finish"
    );
}

#[tokio::test]
async fn test_tick_completes_job_and_records_history() {
    let (queue, dir) = temp_queue().await;
    let webhook = create_webhook(&queue, "hook").await;
    let args_file = dir.path().join("args.txt");
    let (worker, dispatcher) = build_worker(
        &queue,
        echo_command(dir.path(), &args_file, TIMEOUT),
        worker_config(),
        &CancellationToken::new(),
    );

    let id = queue.enqueue(&webhook.new_job("hello", 0, None)).await.unwrap();

    assert_eq!(worker.tick().await, TickOutcome::Completed(id));
    assert_eq!(worker.state(), WorkerState::Idle);

    let job = queue.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.response.as_deref(), Some("echo: hello"));
    assert_eq!(job.worker_id.as_deref(), Some(worker.id()));
    assert!(job.execution_time_ms.is_some());

    let history = queue.list_executions("hook", 10, 0).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].success);
    assert_eq!(history[0].job_id, Some(id));
    assert_eq!(history[0].response.as_deref(), Some("echo: hello"));

    assert_eq!(worker.tick().await, TickOutcome::Empty);
    flush_notifications(&dispatcher).await;
}

#[tokio::test]
async fn test_tick_timeout_marks_job_failed() {
    let (queue, dir) = temp_queue().await;
    let webhook = create_webhook(&queue, "hook").await;
    let timeout = Duration::from_millis(300);
    let pid_file = dir.path().join("pid");
    let (worker, _dispatcher) = build_worker(
        &queue,
        sleeper_command(dir.path(), &pid_file, timeout),
        worker_config(),
        &CancellationToken::new(),
    );

    let id = queue.enqueue(&webhook.new_job("slow", 0, None)).await.unwrap();

    assert_eq!(worker.tick().await, TickOutcome::Failed(id));

    let job = queue.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let message = job.error_message.unwrap();
    assert!(message.contains("timeout"), "{message}");
    assert!(message.contains("300ms"), "{message}");
    assert_eq!(job.retry_count, 0);

    let history = queue.list_executions("hook", 10, 0).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);

    assert!(wait_for_exit(read_pid(&pid_file)).await);
}

#[tokio::test]
async fn test_tick_command_failure_records_stderr() {
    let (queue, dir) = temp_queue().await;
    let webhook = create_webhook(&queue, "hook").await;
    let (worker, _dispatcher) = build_worker(
        &queue,
        fake_command(dir.path(), "fail.sh", "echo 'bad flag' >&2\nexit 2", TIMEOUT),
        worker_config(),
        &CancellationToken::new(),
    );

    let id = queue.enqueue(&webhook.new_job("p", 0, None)).await.unwrap();
    assert_eq!(worker.tick().await, TickOutcome::Failed(id));

    let job = queue.get_job(id).await.unwrap();
    assert!(job.error_message.unwrap().contains("bad flag"));
}

#[tokio::test]
async fn test_retry_policy_requeues_until_exhausted() {
    let (queue, dir) = temp_queue().await;
    let webhook = create_webhook(&queue, "hook").await;
    let config = WorkerConfig {
        retry_policy: RetryPolicy::UpToMaxRetries,
        ..worker_config()
    };
    let (worker, _dispatcher) = build_worker(
        &queue,
        fake_command(dir.path(), "fail.sh", "exit 1", TIMEOUT),
        config,
        &CancellationToken::new(),
    );

    let mut new_job = webhook.new_job("flaky", 0, None);
    new_job.max_retries = 2;
    let id = queue.enqueue(&new_job).await.unwrap();

    assert_eq!(worker.tick().await, TickOutcome::Requeued(id));
    assert_eq!(worker.tick().await, TickOutcome::Requeued(id));
    assert_eq!(worker.tick().await, TickOutcome::Failed(id));

    let job = queue.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 2);

    // Only the terminal outcome reaches history.
    assert_eq!(queue.count_executions("hook").await.unwrap(), 1);
}

#[tokio::test]
async fn test_continue_flag_follows_recent_success() {
    let (queue, dir) = temp_queue().await;
    let mut webhook = Webhook::new("hook", "Hook");
    webhook.options.enable_continue = true;
    webhook.options.continue_minutes = 10;
    queue.save_webhook(&webhook).await.unwrap();

    let args_file = dir.path().join("args.txt");
    let (worker, _dispatcher) = build_worker(
        &queue,
        echo_command(dir.path(), &args_file, TIMEOUT),
        worker_config(),
        &CancellationToken::new(),
    );

    // No history yet: fresh session.
    queue.enqueue(&webhook.new_job("first", 0, None)).await.unwrap();
    worker.tick().await;
    assert!(!read_args(&args_file).contains(&"--continue".to_string()));

    // The first job just succeeded, so the next one continues.
    queue.enqueue(&webhook.new_job("second", 0, None)).await.unwrap();
    worker.tick().await;
    assert!(read_args(&args_file).contains(&"--continue".to_string()));
}

#[tokio::test]
async fn test_continue_flag_off_outside_window() {
    let (queue, dir) = temp_queue().await;
    let mut webhook = Webhook::new("hook", "Hook");
    webhook.options.enable_continue = true;
    webhook.options.continue_minutes = 5;
    queue.save_webhook(&webhook).await.unwrap();

    queue
        .record_execution(&NewExecution {
            job_id: None,
            webhook_id: "hook".to_string(),
            api_key_id: None,
            prompt: "old".to_string(),
            response: Some("ok".to_string()),
            error: None,
            success: true,
            execution_time_ms: Some(10),
            created_at: Utc::now() - chrono::Duration::minutes(6),
        })
        .await
        .unwrap();

    let args_file = dir.path().join("args.txt");
    let (worker, _dispatcher) = build_worker(
        &queue,
        echo_command(dir.path(), &args_file, TIMEOUT),
        worker_config(),
        &CancellationToken::new(),
    );

    queue.enqueue(&webhook.new_job("p", 0, None)).await.unwrap();
    worker.tick().await;
    assert!(!read_args(&args_file).contains(&"--continue".to_string()));
}

#[tokio::test]
async fn test_notification_sent_on_completion() {
    let (queue, dir) = temp_queue().await;
    let capture = CaptureServer::start(StatusCode::NO_CONTENT).await;

    let mut webhook = Webhook::new("hook", "Hook");
    webhook.notification_config = Some(discord_config(&capture.url));
    queue.save_webhook(&webhook).await.unwrap();

    let args_file = dir.path().join("args.txt");
    let (worker, dispatcher) = build_worker(
        &queue,
        echo_command(dir.path(), &args_file, TIMEOUT),
        worker_config(),
        &CancellationToken::new(),
    );

    queue.enqueue(&webhook.new_job("ping", 0, None)).await.unwrap();
    worker.tick().await;
    flush_notifications(&dispatcher).await;

    let received = capture.received();
    assert_eq!(received.len(), 1);
    let embed = &received[0]["embeds"][0];
    assert_eq!(embed["title"], "Claude Code Execution Result");
    assert_eq!(embed["description"], "echo: ping");
    assert_eq!(embed["color"], 0x00ff00);
    assert_eq!(embed["fields"][0]["value"], "ping");
    assert_eq!(embed["fields"][2]["value"], "true");
}

#[tokio::test]
async fn test_notification_falls_back_to_global_config() {
    let (queue, dir) = temp_queue().await;
    let capture = CaptureServer::start(StatusCode::NO_CONTENT).await;
    let webhook = create_webhook(&queue, "hook").await;
    queue
        .set_global_setting(DEFAULT_NOTIFICATION_CONFIG_KEY, &discord_config(&capture.url))
        .await
        .unwrap();

    let (worker, dispatcher) = build_worker(
        &queue,
        fake_command(dir.path(), "fail.sh", "echo nope >&2\nexit 1", TIMEOUT),
        worker_config(),
        &CancellationToken::new(),
    );

    queue.enqueue(&webhook.new_job("p", 0, None)).await.unwrap();
    worker.tick().await;
    flush_notifications(&dispatcher).await;

    let received = capture.received();
    assert_eq!(received.len(), 1);
    let embed = &received[0]["embeds"][0];
    assert_eq!(embed["color"], 0xff0000);
    assert!(embed["description"]
        .as_str()
        .unwrap()
        .starts_with("Error: "));
}

#[tokio::test]
async fn test_notification_failure_does_not_affect_job() {
    let (queue, dir) = temp_queue().await;
    let capture = CaptureServer::start(StatusCode::INTERNAL_SERVER_ERROR).await;
    let mut webhook = Webhook::new("hook", "Hook");
    webhook.notification_config = Some(discord_config(&capture.url));
    queue.save_webhook(&webhook).await.unwrap();

    let args_file = dir.path().join("args.txt");
    let (worker, dispatcher) = build_worker(
        &queue,
        echo_command(dir.path(), &args_file, TIMEOUT),
        worker_config(),
        &CancellationToken::new(),
    );

    let id = queue.enqueue(&webhook.new_job("p", 0, None)).await.unwrap();
    assert_eq!(worker.tick().await, TickOutcome::Completed(id));
    flush_notifications(&dispatcher).await;

    assert_eq!(capture.received().len(), 1);
    assert_eq!(
        queue.get_job(id).await.unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn test_run_resets_stale_and_processes() {
    let (queue, dir) = temp_queue().await;
    let webhook = create_webhook(&queue, "hook").await;

    // A claim left behind by a crashed worker.
    let id = queue.enqueue(&webhook.new_job("orphan", 0, None)).await.unwrap();
    queue
        .claim_next("crashed-worker", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    queue
        .set_visibility_deadline(id, Utc::now() - chrono::Duration::seconds(1))
        .await
        .unwrap();

    let args_file = dir.path().join("args.txt");
    let shutdown = CancellationToken::new();
    let (worker, _dispatcher) = build_worker(
        &queue,
        echo_command(dir.path(), &args_file, TIMEOUT),
        worker_config(),
        &shutdown,
    );
    let worker = Arc::new(worker);
    let handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    let done = wait_for(Duration::from_secs(5), || {
        let queue = queue.clone();
        async move { queue.get_job(id).await.unwrap().status == JobStatus::Completed }
    })
    .await;
    assert!(done, "orphaned job was not picked up");
    assert_eq!(
        queue.get_job(id).await.unwrap().worker_id.as_deref(),
        Some(worker.id())
    );

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_shutdown_releases_in_flight_job() {
    let (queue, dir) = temp_queue().await;
    let webhook = create_webhook(&queue, "hook").await;
    let pid_file = dir.path().join("pid");
    let shutdown = CancellationToken::new();
    let (worker, _dispatcher) = build_worker(
        &queue,
        sleeper_command(dir.path(), &pid_file, TIMEOUT),
        worker_config(),
        &shutdown,
    );
    let mut state = worker.subscribe_state();
    let handle = tokio::spawn(async move { worker.run().await });

    let id = queue.enqueue(&webhook.new_job("long", 0, None)).await.unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == WorkerState::Executing),
    )
    .await
    .unwrap()
    .unwrap();
    let pid_path = pid_file.as_path();
    let started = wait_for(Duration::from_secs(5), || async move {
        std::fs::read_to_string(pid_path).is_ok_and(|s| s.ends_with('\n'))
    })
    .await;
    assert!(started);
    let pid = read_pid(&pid_file);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop promptly")
        .unwrap();
    assert!(wait_for_exit(pid).await, "process {pid} survived shutdown");

    let job = queue.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.worker_id.is_none());
    assert_eq!(queue.count_executions("hook").await.unwrap(), 0);
}

#[tokio::test]
async fn test_stop_ends_idle_loop() {
    let (queue, dir) = temp_queue().await;
    let (worker, _dispatcher) = build_worker(
        &queue,
        fake_command(dir.path(), "noop.sh", "true", TIMEOUT),
        worker_config(),
        &CancellationToken::new(),
    );
    let worker = Arc::new(worker);
    let handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    tokio::time::sleep(Duration::from_millis(150)).await;
    worker.stop();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(worker.state(), WorkerState::Idle);
}

#[tokio::test]
async fn test_completion_write_failure_abandons_job() {
    let (queue, dir) = temp_queue().await;
    let webhook = create_webhook(&queue, "hook").await;
    let (worker, _dispatcher) = build_worker(
        &queue,
        fake_command(dir.path(), "slowish.sh", "sleep 1\necho done", TIMEOUT),
        worker_config(),
        &CancellationToken::new(),
    );
    let worker = Arc::new(worker);
    let mut state = worker.subscribe_state();

    let id = queue.enqueue(&webhook.new_job("p", 0, None)).await.unwrap();
    let tick = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.tick().await })
    };

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == WorkerState::Executing),
    )
    .await
    .unwrap()
    .unwrap();

    // Someone else moves the row on while the command is still running.
    sqlx::query("UPDATE job_queue SET job_status = 'failed' WHERE id = ?1")
        .bind(id)
        .execute(queue.pool())
        .await
        .unwrap();

    assert_eq!(tick.await.unwrap(), TickOutcome::Abandoned(id));
    assert_eq!(queue.count_executions("hook").await.unwrap(), 0);
    assert_eq!(queue.get_job(id).await.unwrap().status, JobStatus::Failed);
}
