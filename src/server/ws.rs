// ABOUTME: WebSocket session channel carrying terminal I/O and file-change notifications
// One socket is one session: a writer task drains the outbound queue while the read loop routes client events

use super::AppState;
use crate::terminal::protocol::{ClientEvent, ServerEvent, PROMPT};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let session_id = Uuid::new_v4();
    info!(session = %session_id, "Client connected");

    let (sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<ServerEvent>();
    let writer = tokio::spawn(run_writer(sender, rx));

    let mut shutdown = state.shutdown.clone();
    if *shutdown.borrow_and_update() {
        drop(tx);
        let _ = writer.await;
        return;
    }
    // Replaced on attach; until then the sender is held here so it never fires
    let (mut _unattached, mut detached) = oneshot::channel::<()>();

    loop {
        tokio::select! {
            Ok(()) = shutdown.changed() => {
                debug!(session = %session_id, "Closing socket for shutdown");
                break;
            }

            _ = &mut detached => {
                info!(session = %session_id, "Session ended by the service");
                break;
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(signal) = handle_client_text(&state, session_id, &tx, &text).await {
                            detached = signal;
                        } else if !state.services.sessions.contains(&session_id).await {
                            // Not attached (or a re-attach failed): nothing can end this session for us
                            (_unattached, detached) = oneshot::channel();
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary, ping and pong frames carry no session protocol
                    }
                    Some(Err(e)) => {
                        debug!(session = %session_id, "WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    state.services.lifecycle.detach(session_id).await;
    info!(session = %session_id, "Client disconnected");

    // The writer finishes once every sender is gone
    drop(tx);
    let _ = writer.await;
}

async fn run_writer(mut sender: SplitSink<WebSocket, Message>, mut rx: mpsc::UnboundedReceiver<ServerEvent>) {
    while let Some(event) = rx.recv().await {
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize server event: {}", e);
                continue;
            }
        };
        if sender.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
    let _ = sender.send(Message::Close(None)).await;
}

/// Returns the detach signal of a freshly attached session
async fn handle_client_text(
    state: &AppState,
    session_id: Uuid,
    tx: &mpsc::UnboundedSender<ServerEvent>,
    text: &str,
) -> Option<oneshot::Receiver<()>> {
    let services = &state.services;

    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(session = %session_id, "Unparseable client frame: {}", e);
            let _ = tx.send(ServerEvent::output(format!("\r\n❌ Invalid message: {e}\r\n")));
            return None;
        }
    };

    match event {
        ClientEvent::OpenSession(msg) => {
            let workspace_id = services.workspace_or_default(msg.workspace_id.as_deref());
            match services.lifecycle.attach(session_id, workspace_id, tx.clone()).await {
                Ok(attached) => Some(attached.detached),
                Err(e) => {
                    warn!(session = %session_id, "Failed to open session: {}", e);
                    None
                }
            }
        }

        ClientEvent::TerminalInput(msg) => {
            if !services.sessions.contains(&session_id).await {
                let _ = tx.send(ServerEvent::output(format!("\r\n❌ Sandbox not available\r\n{PROMPT}")));
                return None;
            }
            // Run off the read loop so the socket stays responsive; the router rejects overlap
            let router = services.router.clone();
            tokio::spawn(async move {
                router.handle_input(session_id, &msg.line).await;
            });
            None
        }

        ClientEvent::StartWatching => {
            if !services.lifecycle.start_watching(session_id).await {
                debug!(session = %session_id, "start-watching before open-session ignored");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::docker::MockDriver;
    use crate::services::Services;
    use std::sync::Arc;
    use tokio::sync::watch;

    fn state() -> (AppState, watch::Sender<bool>) {
        let mut config = AppConfig::default();
        config.watcher.start_delay_ms = 60_000;
        let services = Arc::new(Services::new(config, Arc::new(MockDriver::new())));
        let (tx, rx) = watch::channel(false);
        (AppState::new(services, rx), tx)
    }

    fn texts(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> String {
        let mut out = String::new();
        while let Ok(event) = rx.try_recv() {
            out.push_str(event.text().unwrap_or_default());
        }
        out
    }

    #[tokio::test]
    async fn test_invalid_frame_reports_error() {
        let (state, _shutdown) = state();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let signal = handle_client_text(&state, Uuid::new_v4(), &tx, "{not json").await;
        assert!(signal.is_none());
        assert!(texts(&mut rx).contains("❌ Invalid message"));
    }

    #[tokio::test]
    async fn test_input_before_open_session() {
        let (state, _shutdown) = state();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let frame = r#"{"type":"terminal-input","data":{"line":"ls"}}"#;
        handle_client_text(&state, Uuid::new_v4(), &tx, frame).await;
        assert_eq!(texts(&mut rx), "\r\n❌ Sandbox not available\r\n$ ");
    }

    #[tokio::test]
    async fn test_open_session_attaches_to_default_workspace() {
        let (state, _shutdown) = state();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session_id = Uuid::new_v4();

        let frame = r#"{"type":"open-session","data":{}}"#;
        let signal = handle_client_text(&state, session_id, &tx, frame).await;
        assert!(signal.is_some());

        let sessions = &state.services.sessions;
        assert_eq!(
            sessions.workspace_of(&session_id).await.as_deref(),
            Some("shared-workspace")
        );
    }

    #[tokio::test]
    async fn test_detach_fires_signal() {
        let (state, _shutdown) = state();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session_id = Uuid::new_v4();

        let frame = r#"{"type":"open-session","data":{"workspace_id":"w1"}}"#;
        let signal = handle_client_text(&state, session_id, &tx, frame).await.unwrap();

        state.services.lifecycle.detach(session_id).await;
        assert!(signal.await.is_err());
    }
}
