// ABOUTME: Session table mapping connection ids to workspace, working directory and outbound channel
// Sessions only reference their workspace by id; tearing one down never touches the environment

use crate::terminal::protocol::ServerEvent;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

#[derive(Debug)]
pub struct SessionEntry {
    pub id: Uuid,
    pub workspace_id: String,
    pub current_dir: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    outbound: EventSender,
    in_flight: Arc<Mutex<()>>,
    /// Dropped together with the entry, which wakes whoever holds the receiving end
    detach_signal: Option<oneshot::Sender<()>>,
}

impl SessionEntry {
    pub fn new(id: Uuid, workspace_id: impl Into<String>, root: impl Into<String>, outbound: EventSender) -> Self {
        let now = Utc::now();
        Self {
            id,
            workspace_id: workspace_id.into(),
            current_dir: root.into(),
            created_at: now,
            last_activity: now,
            outbound,
            in_flight: Arc::new(Mutex::new(())),
            detach_signal: None,
        }
    }

    pub fn with_detach_signal(mut self, signal: oneshot::Sender<()>) -> Self {
        self.detach_signal = Some(signal);
        self
    }

    /// Queue an event for the client. Returns false once the connection is gone.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.outbound.send(event).is_ok()
    }
}

#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<Uuid, SessionEntry>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. An existing entry with the same id is replaced.
    pub async fn register(&self, entry: SessionEntry) {
        self.sessions.write().await.insert(entry.id, entry);
    }

    pub async fn remove(&self, session_id: &Uuid) -> Option<SessionEntry> {
        self.sessions.write().await.remove(session_id)
    }

    pub async fn contains(&self, session_id: &Uuid) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn workspace_of(&self, session_id: &Uuid) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.workspace_id.clone())
    }

    pub async fn current_dir(&self, session_id: &Uuid) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.current_dir.clone())
    }

    /// Update the working directory. Returns false if the session is gone.
    pub async fn set_current_dir(&self, session_id: &Uuid, dir: impl Into<String>) -> bool {
        match self.sessions.write().await.get_mut(session_id) {
            Some(session) => {
                session.current_dir = dir.into();
                true
            }
            None => false,
        }
    }

    pub async fn touch(&self, session_id: &Uuid) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.last_activity = Utc::now();
        }
    }

    pub async fn send(&self, session_id: &Uuid, event: ServerEvent) -> bool {
        self.sessions
            .read()
            .await
            .get(session_id)
            .is_some_and(|s| s.send(event))
    }

    /// Claim the session's in-flight slot; dropping the guard releases it.
    pub async fn try_begin_command(&self, session_id: &Uuid) -> Result<OwnedMutexGuard<()>, CommandSlot> {
        let in_flight = self
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.in_flight.clone())
            .ok_or(CommandSlot::UnknownSession)?;

        in_flight.try_lock_owned().map_err(|_| CommandSlot::Busy)
    }

    pub async fn count_for(&self, workspace_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.workspace_id == workspace_id)
            .count()
    }

    /// Send `event` to every session attached to `workspace_id`. Returns how many accepted it.
    pub async fn broadcast(&self, workspace_id: &str, event: &ServerEvent) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.workspace_id == workspace_id)
            .filter(|s| s.send(event.clone()))
            .count()
    }

    /// Sessions whose last activity is older than `cutoff`
    pub async fn idle_since(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.last_activity < cutoff)
            .map(|s| s.id)
            .collect()
    }
}

/// Why a command could not start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSlot {
    UnknownSession,
    Busy,
}
