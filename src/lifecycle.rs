// ABOUTME: Session lifecycle coordination between workspaces, the session table and the file watcher
// Handles attach/detach ordering, delayed watcher start, idle session reaping and shutdown teardown

use crate::config::AppConfig;
use crate::session::{EventSender, SessionEntry, SessionTable};
use crate::terminal::protocol::{ServerEvent, PROMPT};
use crate::watcher::FileWatcher;
use crate::workspace::{Workspace, WorkspaceError, WorkspaceRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

/// A successfully attached session
#[derive(Debug)]
pub struct Attached {
    pub workspace: Arc<Workspace>,
    /// Resolves once the session has been removed from the table, by whoever removed it
    pub detached: oneshot::Receiver<()>,
}

pub struct LifecycleManager {
    registry: Arc<WorkspaceRegistry>,
    sessions: Arc<SessionTable>,
    watcher: Arc<FileWatcher>,
    watch_start_delay: Duration,
    idle_ttl: Duration,
    pending_watch: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<WorkspaceRegistry>,
        sessions: Arc<SessionTable>,
        watcher: Arc<FileWatcher>,
        config: &AppConfig,
    ) -> Self {
        Self {
            registry,
            sessions,
            watcher,
            watch_start_delay: config.watcher.start_delay(),
            idle_ttl: config.lifecycle.session_idle_ttl(),
            pending_watch: Mutex::new(HashMap::new()),
        }
    }

    /// Bind `session_id` to `workspace_id`, provisioning the environment if needed.
    ///
    /// Progress and failures are reported on `outbound`. On failure the session stays
    /// unregistered.
    pub async fn attach(
        &self,
        session_id: Uuid,
        workspace_id: &str,
        outbound: EventSender,
    ) -> Result<Attached, LifecycleError> {
        if self.sessions.contains(&session_id).await {
            debug!(session = %session_id, "Session re-attaching, detaching first");
            self.detach(session_id).await;
        }

        let _ = outbound.send(ServerEvent::output("🐳 Initializing secure sandbox environment...\r\n"));

        let workspace = match self.registry.get_or_create(workspace_id).await {
            Ok(workspace) => workspace,
            Err(e) => {
                error!(session = %session_id, workspace = workspace_id, "Error creating sandbox: {}", e);
                let _ = outbound.send(ServerEvent::output(format!(
                    "❌ Error creating sandbox: {e}\r\n{PROMPT}"
                )));
                return Err(e.into());
            }
        };

        let root = workspace.root().to_string();
        let (signal, detached) = oneshot::channel();
        self.sessions
            .register(
                SessionEntry::new(session_id, workspace_id, root.as_str(), outbound.clone())
                    .with_detach_signal(signal),
            )
            .await;

        for line in [
            "✅ Sandbox ready! You're in an isolated environment.\r\n".to_string(),
            format!("📁 Working directory: {root}\r\n"),
            "🛡️ Safe to run any commands - they won't affect the host system.\r\n\r\n".to_string(),
            PROMPT.to_string(),
        ] {
            let _ = outbound.send(ServerEvent::output(line));
        }

        info!(session = %session_id, workspace = workspace_id, "Session attached");
        self.schedule_watch(session_id, workspace_id).await;

        Ok(Attached { workspace, detached })
    }

    /// Give the environment a grace period before the first snapshot
    async fn schedule_watch(&self, session_id: Uuid, workspace_id: &str) {
        let sessions = self.sessions.clone();
        let watcher = self.watcher.clone();
        let workspace_id = workspace_id.to_string();
        let delay = self.watch_start_delay;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sessions.contains(&session_id).await {
                watcher.start(&workspace_id).await;
            }
        });

        if let Some(previous) = self.pending_watch.lock().await.insert(session_id, handle) {
            previous.abort();
        }
    }

    /// Remove the session. The environment keeps running; its watcher stops once
    /// no session is left on the workspace.
    pub async fn detach(&self, session_id: Uuid) -> bool {
        if let Some(pending) = self.pending_watch.lock().await.remove(&session_id) {
            pending.abort();
        }

        let Some(entry) = self.sessions.remove(&session_id).await else {
            return false;
        };

        let remaining = self.sessions.count_for(&entry.workspace_id).await;
        if remaining == 0 {
            self.watcher.stop(&entry.workspace_id).await;
        }

        info!(
            session = %session_id,
            workspace = %entry.workspace_id,
            remaining,
            "Session detached"
        );
        true
    }

    /// Explicit client request to (re)start watching the session's workspace
    pub async fn start_watching(&self, session_id: Uuid) -> bool {
        let Some(workspace_id) = self.sessions.workspace_of(&session_id).await else {
            return false;
        };
        self.sessions.touch(&session_id).await;
        self.watcher.restart(&workspace_id).await;
        true
    }

    /// Detach sessions idle for longer than `ttl`, telling them first
    pub async fn reap_idle(&self, ttl: Duration) -> Vec<Uuid> {
        let Ok(ttl_chrono) = chrono::Duration::from_std(ttl) else {
            return Vec::new();
        };
        let idle = self.sessions.idle_since(chrono::Utc::now() - ttl_chrono).await;

        for session_id in &idle {
            self.sessions
                .send(
                    session_id,
                    ServerEvent::output(format!(
                        "\r\n⏱️ Session closed after {} minutes of inactivity\r\n",
                        ttl.as_secs() / 60
                    )),
                )
                .await;
            self.detach(*session_id).await;
        }

        if !idle.is_empty() {
            info!("Reaped {} idle session(s)", idle.len());
        }
        idle
    }

    pub fn spawn_idle_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                manager.reap_idle(manager.idle_ttl).await;
            }
        })
    }

    /// Remove environments orphaned by a previous run. Call before serving.
    pub async fn reap_stale_environments(&self) -> usize {
        match self.registry.driver().reap_orphans().await {
            Ok(0) => 0,
            Ok(count) => {
                info!("Removed {} stale environment(s) from a previous run", count);
                count
            }
            Err(e) => {
                warn!("Failed to reap stale environments: {}", e);
                0
            }
        }
    }

    /// Stop all watchers, then tear down every environment within `timeout`
    pub async fn shutdown(&self, timeout: Duration) {
        info!("Shutting down session lifecycle");

        for (_, pending) in self.pending_watch.lock().await.drain() {
            pending.abort();
        }
        self.watcher.stop_all().await;

        let destroyed = self.registry.destroy_all(timeout).await;
        info!("Destroyed {} environment(s)", destroyed);
    }
}
