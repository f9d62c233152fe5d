
use std::time::Duration;

use axum::http::StatusCode;
use pull_worker::notify::{
    Channel, CompletionEvent, DiscordClient, NotificationDispatcher, NotifyError,
};
use pull_worker::queue::{Webhook, DEFAULT_NOTIFICATION_CONFIG_KEY};
use test_harness::{create_webhook, discord_config, temp_queue, CaptureServer};

#[tokio::test]
async fn test_discord_client_posts_embed() {
    let capture = CaptureServer::start(StatusCode::NO_CONTENT).await;
    let client = DiscordClient::new(capture.url.clone(), reqwest::Client::new());

    let event = CompletionEvent::success("what time is it", "noon", Duration::from_millis(2500));
    client.send(&event).await.unwrap();

    let received = capture.received();
    assert_eq!(received.len(), 1);
    let embed = &received[0]["embeds"][0];
    assert_eq!(embed["description"], "noon");
    assert_eq!(embed["fields"][0]["name"], "Prompt");
    assert_eq!(embed["fields"][0]["value"], "what time is it");
    assert_eq!(embed["fields"][1]["name"], "Execution Time");
    assert_eq!(embed["fields"][1]["value"], "2.50s");
    assert_eq!(embed["fields"][2]["name"], "Status");
}

#[tokio::test]
async fn test_discord_client_truncates_long_text() {
    let capture = CaptureServer::start(StatusCode::NO_CONTENT).await;
    let channel = Channel::Discord(DiscordClient::new(
        capture.url.clone(),
        reqwest::Client::new(),
    ));

    let event = CompletionEvent::success("q".repeat(5000), "a".repeat(10_000), Duration::ZERO);
    channel.send(&event).await.unwrap();

    let embed = &capture.received()[0]["embeds"][0];
    let description = embed["description"].as_str().unwrap();
    let prompt = embed["fields"][0]["value"].as_str().unwrap();
    assert_eq!(description.chars().count(), 2048);
    assert!(description.ends_with("..."));
    assert_eq!(prompt.chars().count(), 1024);
}

#[tokio::test]
async fn test_discord_client_reports_error_status() {
    let capture = CaptureServer::start(StatusCode::BAD_REQUEST).await;
    let client = DiscordClient::new(capture.url.clone(), reqwest::Client::new());

    let event = CompletionEvent::failure("p", "boom", Duration::from_secs(1));
    let err = client.send(&event).await.unwrap_err();
    assert!(matches!(err, NotifyError::UnexpectedStatus(400)));
}

#[tokio::test]
async fn test_discord_client_unreachable_endpoint() {
    // Bind then drop to get a port nothing listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = DiscordClient::new(format!("http://{addr}/hook"), reqwest::Client::new());
    let event = CompletionEvent::success("p", "r", Duration::ZERO);
    assert!(matches!(
        client.send(&event).await,
        Err(NotifyError::Http(_))
    ));
}

#[tokio::test]
async fn test_webhook_config_wins_over_global() {
    let (queue, _dir) = temp_queue().await;
    let own = CaptureServer::start(StatusCode::NO_CONTENT).await;
    let global = CaptureServer::start(StatusCode::NO_CONTENT).await;

    let mut webhook = Webhook::new("hook", "Hook");
    webhook.notification_config = Some(discord_config(&own.url));
    queue.save_webhook(&webhook).await.unwrap();
    queue
        .set_global_setting(DEFAULT_NOTIFICATION_CONFIG_KEY, &discord_config(&global.url))
        .await
        .unwrap();

    let dispatcher = NotificationDispatcher::new(queue.clone());
    dispatcher.dispatch("hook", CompletionEvent::success("p", "r", Duration::ZERO));
    assert!(dispatcher.drain(Duration::from_secs(5)).await);

    assert_eq!(own.received().len(), 1);
    assert!(global.received().is_empty());
}

#[tokio::test]
async fn test_no_config_means_no_channels() {
    let (queue, _dir) = temp_queue().await;
    create_webhook(&queue, "quiet").await;

    let dispatcher = NotificationDispatcher::new(queue.clone());
    assert!(dispatcher.resolve_channels("quiet").await.is_empty());

    dispatcher.dispatch("quiet", CompletionEvent::success("p", "r", Duration::ZERO));
    assert!(dispatcher.drain(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_invalid_webhook_config_falls_back_to_global() {
    let (queue, _dir) = temp_queue().await;
    let global = CaptureServer::start(StatusCode::NO_CONTENT).await;

    let mut webhook = Webhook::new("hook", "Hook");
    webhook.notification_config = Some("{not json".to_string());
    queue.save_webhook(&webhook).await.unwrap();
    queue
        .set_global_setting(DEFAULT_NOTIFICATION_CONFIG_KEY, &discord_config(&global.url))
        .await
        .unwrap();

    let dispatcher = NotificationDispatcher::new(queue.clone());
    let channels = dispatcher.resolve_channels("hook").await;
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].name(), "discord");
}

#[tokio::test]
async fn test_dispatch_does_not_block_caller() {
    let (queue, _dir) = temp_queue().await;
    let mut webhook = Webhook::new("hook", "Hook");
    // Non-routable address: the send hangs until the client gives up.
    webhook.notification_config = Some(discord_config("http://10.255.255.1:9/hook"));
    queue.save_webhook(&webhook).await.unwrap();

    let dispatcher = NotificationDispatcher::with_client(
        queue.clone(),
        reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap(),
    );

    let start = std::time::Instant::now();
    for _ in 0..10 {
        dispatcher.dispatch("hook", CompletionEvent::success("p", "r", Duration::ZERO));
    }
    assert!(start.elapsed() < Duration::from_millis(100));

    // Failures are swallowed; the tracker still drains once the client times out.
    assert!(dispatcher.drain(Duration::from_secs(5)).await);
}
