// ABOUTME: Periodic per-workspace file-state watcher
// Polls a snapshot source, diffs against the last baseline and notifies every attached session

pub mod snapshot;
pub mod source;

pub use snapshot::{listing_command, parse_snapshot, FileEntry, FileKind};
pub use source::{ExecFileStateSource, FileStateSource};

use crate::session::SessionTable;
use crate::terminal::protocol::ServerEvent;
use crate::workspace::WorkspaceRegistry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Result of a single comparison against the baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Workspace has no live environment yet
    NotReady,
    /// Snapshot failed; the next tick retries
    Failed,
    Unchanged,
    /// Baseline replaced and `delivered` sessions notified
    Changed { delivered: usize },
}

struct WatcherInner {
    registry: Arc<WorkspaceRegistry>,
    sessions: Arc<SessionTable>,
    source: Arc<dyn FileStateSource>,
    baselines: std::sync::Mutex<HashMap<String, String>>,
}

impl WatcherInner {
    fn baselines(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.baselines
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// `active` belongs to a polling task; once cleared, the result is discarded
    async fn tick(&self, workspace_id: &str, active: Option<&AtomicBool>) -> TickOutcome {
        let Some(workspace) = self.registry.get(workspace_id).await else {
            debug!(workspace = workspace_id, "Watcher tick skipped, workspace not ready");
            return TickOutcome::NotReady;
        };

        let raw = match self.source.snapshot(&workspace).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(workspace = workspace_id, "File snapshot failed: {}", e);
                return TickOutcome::Failed;
            }
        };

        {
            let mut baselines = self.baselines();
            if active.is_some_and(|a| !a.load(Ordering::SeqCst)) {
                return TickOutcome::Unchanged;
            }
            if baselines.get(workspace_id) == Some(&raw) {
                return TickOutcome::Unchanged;
            }
            baselines.insert(workspace_id.to_string(), raw.clone());
        }

        let files = parse_snapshot(&raw, workspace.root());
        info!(workspace = workspace_id, files = files.len(), "File changes detected");

        let delivered = self
            .sessions
            .broadcast(workspace_id, &ServerEvent::files_changed(files))
            .await;
        TickOutcome::Changed { delivered }
    }
}

#[derive(Debug)]
struct WatchTask {
    started_at: chrono::DateTime<chrono::Utc>,
    active: Arc<AtomicBool>,
    /// Dropping this ends the polling loop after any tick in progress
    _stop: oneshot::Sender<()>,
    task_handle: JoinHandle<()>,
}

pub struct FileWatcher {
    inner: Arc<WatcherInner>,
    interval: Duration,
    tasks: Mutex<HashMap<String, WatchTask>>,
}

impl FileWatcher {
    pub fn new(
        registry: Arc<WorkspaceRegistry>,
        sessions: Arc<SessionTable>,
        source: Arc<dyn FileStateSource>,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                registry,
                sessions,
                source,
                baselines: std::sync::Mutex::new(HashMap::new()),
            }),
            interval,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start polling `workspace_id`. Does nothing if it is already being watched.
    pub async fn start(&self, workspace_id: &str) -> bool {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(workspace_id) {
            debug!(workspace = workspace_id, "Watcher already running");
            return false;
        }

        info!(
            workspace = workspace_id,
            "Starting file watcher (every {}ms)",
            self.interval.as_millis()
        );

        let inner = self.inner.clone();
        let id = workspace_id.to_string();
        let period = self.interval;
        let active = Arc::new(AtomicBool::new(true));
        let task_active = active.clone();
        let (stop, mut stopped) = oneshot::channel::<()>();

        let task_handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = &mut stopped => break,
                }
                // A tick that has started runs to completion
                inner.tick(&id, Some(&task_active)).await;
            }
            debug!(workspace = %id, "File watcher loop ended");
        });

        tasks.insert(
            workspace_id.to_string(),
            WatchTask {
                started_at: chrono::Utc::now(),
                active,
                _stop: stop,
                task_handle,
            },
        );
        true
    }

    /// Stop then start, giving the workspace a fresh baseline
    pub async fn restart(&self, workspace_id: &str) {
        self.stop(workspace_id).await;
        self.start(workspace_id).await;
    }

    /// Run one comparison immediately, outside the polling schedule
    pub async fn tick(&self, workspace_id: &str) -> TickOutcome {
        self.inner.tick(workspace_id, None).await
    }

    /// Stop polling and forget the baseline. Returns false if it was not being watched.
    pub async fn stop(&self, workspace_id: &str) -> bool {
        let task = self.tasks.lock().await.remove(workspace_id);
        let mut baselines = self.inner.baselines();

        match task {
            Some(task) => {
                info!(
                    workspace = workspace_id,
                    "Stopping file watcher (running since {})",
                    task.started_at.format("%H:%M:%S")
                );
                // Cleared under the baseline lock so an in-flight tick cannot store after us
                task.active.store(false, Ordering::SeqCst);
                baselines.remove(workspace_id);
                true
            }
            None => {
                baselines.remove(workspace_id);
                false
            }
        }
    }

    pub async fn stop_all(&self) {
        let tasks: Vec<(String, WatchTask)> = self.tasks.lock().await.drain().collect();
        if !tasks.is_empty() {
            info!("Stopping {} file watcher(s)", tasks.len());
        }

        let mut baselines = self.inner.baselines();
        for (_, task) in &tasks {
            task.active.store(false, Ordering::SeqCst);
        }
        baselines.clear();
    }

    pub async fn is_watching(&self, workspace_id: &str) -> bool {
        self.tasks.lock().await.contains_key(workspace_id)
    }

    pub async fn watched(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        for (_, task) in self.tasks.get_mut().drain() {
            task.task_handle.abort();
        }
    }
}
