// ABOUTME: End-to-end session scenarios across lifecycle, command routing and the file watcher
// Drives the same components the WebSocket handler uses, against the in-memory driver

use pretty_assertions::assert_eq;
use sandbox_hub::config::AppConfig;
use sandbox_hub::docker::{EnvironmentDriver, MockDriver};
use sandbox_hub::services::Services;
use sandbox_hub::terminal::{RouteOutcome, ServerEvent};
use sandbox_hub::watcher::TickOutcome;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use uuid::Uuid;

fn services() -> (Arc<MockDriver>, Arc<Services>) {
    let mut config = AppConfig::default();
    config.watcher.start_delay_ms = 0;
    config.terminal.hint_delay_ms = 0;
    // Long enough that background polling never races the explicit ticks below
    config.watcher.interval_ms = 60_000;

    let driver = Arc::new(MockDriver::new());
    let services = Arc::new(Services::new(config, driver.clone()));
    (driver, services)
}

/// Concatenated terminal text received so far
fn drain_text(rx: &mut UnboundedReceiver<ServerEvent>) -> String {
    let mut text = String::new();
    while let Ok(event) = rx.try_recv() {
        if let Some(chunk) = event.text() {
            text.push_str(chunk);
        }
    }
    text
}

fn drain_events(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn open_session(services: &Services, workspace_id: &str) -> (Uuid, UnboundedReceiver<ServerEvent>) {
    let session_id = Uuid::new_v4();
    let (tx, rx) = mpsc::unbounded_channel();
    services
        .lifecycle
        .attach(session_id, workspace_id, tx)
        .await
        .unwrap();
    (session_id, rx)
}

#[tokio::test]
async fn test_open_session_greets_and_prompts() {
    let (_driver, services) = services();
    let (_session, mut rx) = open_session(&services, "demo").await;

    let text = drain_text(&mut rx);
    assert!(text.starts_with("🐳 Initializing secure sandbox environment..."));
    assert!(text.contains("📁 Working directory: /workspace"));
    assert!(text.ends_with("$ "));
}

#[tokio::test]
async fn test_sessions_share_one_environment() {
    // BEHAVIOR: many sessions on one workspace id see exactly one environment
    let (driver, services) = services();

    let mut sessions = Vec::new();
    for _ in 0..5 {
        sessions.push(open_session(&services, "shared").await);
    }

    assert_eq!(driver.created_count(), 1);
    assert_eq!(services.sessions.count_for("shared").await, 5);
}

#[tokio::test]
async fn test_cd_outside_root_is_denied_and_directory_kept() {
    let (_driver, services) = services();
    let (session, mut rx) = open_session(&services, "demo").await;
    drain_text(&mut rx);

    let outcome = services.router.handle_input(session, "cd /etc").await;
    assert_eq!(outcome, RouteOutcome::DirectoryDenied);
    assert_eq!(
        drain_text(&mut rx),
        "\r\n❌ Access denied: Can only navigate within /workspace\r\n$ "
    );
    assert_eq!(services.sessions.current_dir(&session).await.unwrap(), "/workspace");
}

#[tokio::test]
async fn test_commands_run_in_the_session_directory() {
    // BEHAVIOR: every command reasserts the session's directory, whatever ran before
    let (driver, services) = services();
    let (session, mut rx) = open_session(&services, "demo").await;

    let outcome = services.router.handle_input(session, "cd src").await;
    assert_eq!(outcome, RouteOutcome::DirectoryChanged("/workspace/src".to_string()));
    drain_text(&mut rx);

    let outcome = services.router.handle_input(session, "pwd").await;
    assert_eq!(outcome, RouteOutcome::Executed);
    assert_eq!(drain_text(&mut rx), "\r\n/workspace/src\n$ ");

    let last = driver.executed_commands().pop().unwrap();
    assert_eq!(last, "cd '/workspace/src' && pwd");
}

#[tokio::test]
async fn test_directories_are_per_session() {
    let (_driver, services) = services();
    let (first, _rx1) = open_session(&services, "demo").await;
    let (second, _rx2) = open_session(&services, "demo").await;

    services.router.handle_input(first, "cd src").await;

    assert_eq!(services.sessions.current_dir(&first).await.unwrap(), "/workspace/src");
    assert_eq!(services.sessions.current_dir(&second).await.unwrap(), "/workspace");
}

#[tokio::test]
async fn test_destroyed_environment_reports_error_then_prompts() {
    let (driver, services) = services();
    let (session, mut rx) = open_session(&services, "demo").await;
    drain_text(&mut rx);

    let workspace = services.registry.get("demo").await.unwrap();
    driver.destroy_environment(&workspace.handle).await.unwrap();

    let outcome = services.router.handle_input(session, "ls").await;
    assert_eq!(outcome, RouteOutcome::Failed);

    let text = drain_text(&mut rx);
    assert!(text.contains("❌ Error: Environment sandbox-demo not found"));
    assert!(text.ends_with("$ "));
}

#[tokio::test]
async fn test_file_change_reaches_every_session_once() {
    // BEHAVIOR: a change made by one session is announced to all sessions on the workspace
    let (_driver, services) = services();
    let (writer, mut rx1) = open_session(&services, "demo").await;
    let (_reader, mut rx2) = open_session(&services, "demo").await;

    // Establish the baseline for the empty workspace
    assert_eq!(
        services.watcher.tick("demo").await,
        TickOutcome::Changed { delivered: 2 }
    );
    assert_eq!(services.watcher.tick("demo").await, TickOutcome::Unchanged);
    drain_events(&mut rx1);
    drain_events(&mut rx2);

    services.router.handle_input(writer, "touch notes.txt").await;
    assert_eq!(
        services.watcher.tick("demo").await,
        TickOutcome::Changed { delivered: 2 }
    );
    assert_eq!(services.watcher.tick("demo").await, TickOutcome::Unchanged);

    for rx in [&mut rx1, &mut rx2] {
        let changes: Vec<_> = drain_events(rx)
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::FilesChanged(msg) => Some(msg.files),
                _ => None,
            })
            .collect();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].len(), 1);
        assert_eq!(changes[0][0].path, "notes.txt");
        assert_eq!(changes[0][0].modified % 1000, 0);
    }
}

#[tokio::test]
async fn test_mutating_command_sends_hint() {
    let (_driver, services) = services();
    let (session, mut rx) = open_session(&services, "demo").await;
    drain_events(&mut rx);

    services.router.handle_input(session, "echo hi > a.txt").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let hinted = drain_events(&mut rx)
        .iter()
        .any(|event| matches!(event, ServerEvent::FilesChangedHint));
    assert!(hinted);
}

#[tokio::test]
async fn test_watcher_stops_when_last_session_leaves() {
    let (_driver, services) = services();
    let (first, _rx1) = open_session(&services, "demo").await;
    let (second, _rx2) = open_session(&services, "demo").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(services.watcher.is_watching("demo").await);

    services.lifecycle.detach(first).await;
    assert!(services.watcher.is_watching("demo").await);

    services.lifecycle.detach(second).await;
    assert!(!services.watcher.is_watching("demo").await);

    // The environment itself outlives its sessions
    assert!(services.registry.get("demo").await.is_some());
}

#[tokio::test]
async fn test_failed_provision_leaves_session_unattached() {
    let (driver, services) = services();
    driver.set_fail_create(true);

    let session_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = services.lifecycle.attach(session_id, "demo", tx).await;
    assert!(result.is_err());
    assert!(drain_text(&mut rx).contains("❌ Error creating sandbox"));
    assert!(!services.sessions.contains(&session_id).await);

    // A later open retries the creation
    driver.set_fail_create(false);
    let (_session, _rx) = open_session(&services, "demo").await;
    assert_eq!(driver.created_count(), 1);
}

#[tokio::test]
async fn test_shutdown_tears_down_all_environments() {
    let (driver, services) = services();
    let (_a, _rx_a) = open_session(&services, "one").await;
    let (_b, _rx_b) = open_session(&services, "two").await;
    assert_eq!(driver.live_count(), 2);

    services.lifecycle.shutdown(Duration::from_secs(5)).await;

    assert_eq!(driver.live_count(), 0);
    assert!(services.registry.ids().await.is_empty());
    assert!(services.watcher.watched().await.is_empty());
}

#[tokio::test]
async fn test_stale_environments_reaped_at_startup() {
    let driver = Arc::new(MockDriver::new().with_orphans(3));
    let services = Services::new(AppConfig::default(), driver);

    assert_eq!(services.lifecycle.reap_stale_environments().await, 3);
    assert_eq!(services.lifecycle.reap_stale_environments().await, 0);
}
