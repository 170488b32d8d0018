// ABOUTME: Registry mapping workspace ids to live environments
// Guarantees exactly one environment per id, even when many sessions open the same workspace at once

use super::{validate_id, Workspace, WorkspaceError};
use crate::docker::EnvironmentDriver;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

pub struct WorkspaceRegistry {
    driver: Arc<dyn EnvironmentDriver>,
    live: RwLock<HashMap<String, Arc<Workspace>>>,
    /// Per-id creation locks. An entry lives while any caller holds or waits on it.
    creating: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WorkspaceRegistry {
    pub fn new(driver: Arc<dyn EnvironmentDriver>) -> Self {
        Self {
            driver,
            live: RwLock::new(HashMap::new()),
            creating: Mutex::new(HashMap::new()),
        }
    }

    pub fn driver(&self) -> &Arc<dyn EnvironmentDriver> {
        &self.driver
    }

    /// Return the live workspace for `workspace_id`, creating its environment on first use.
    ///
    /// Concurrent callers for the same id wait on one creation. A failed creation publishes
    /// nothing, so the next caller tries again.
    pub async fn get_or_create(&self, workspace_id: &str) -> Result<Arc<Workspace>, WorkspaceError> {
        validate_id(workspace_id)?;

        if let Some(workspace) = self.get(workspace_id).await {
            return Ok(workspace);
        }

        let creation_lock = {
            let mut creating = self.creating.lock().await;
            creating.entry(workspace_id.to_string()).or_default().clone()
        };
        let _guard = creation_lock.lock().await;

        // Whoever held the lock before us may have finished the job
        if let Some(workspace) = self.get(workspace_id).await {
            debug!(workspace = workspace_id, "Workspace created by a concurrent caller");
            self.release_creation_lock(workspace_id, &creation_lock).await;
            return Ok(workspace);
        }

        info!(workspace = workspace_id, "Creating workspace environment");
        let result = self.driver.create_environment(workspace_id).await;

        let outcome = match result {
            Ok(handle) => {
                let workspace = Arc::new(Workspace {
                    id: workspace_id.to_string(),
                    handle,
                    limits: self.driver.limits().clone(),
                    created_at: chrono::Utc::now(),
                });
                self.live
                    .write()
                    .await
                    .insert(workspace_id.to_string(), workspace.clone());
                info!(
                    workspace = workspace_id,
                    container = %workspace.handle.container_name,
                    "Workspace ready"
                );
                Ok(workspace)
            }
            Err(e) => {
                error!(workspace = workspace_id, "Failed to create workspace: {}", e);
                Err(WorkspaceError::from(e))
            }
        };

        self.release_creation_lock(workspace_id, &creation_lock).await;
        outcome
    }

    /// Drop the per-id lock entry unless another caller still holds or waits on it.
    /// Clones are only taken under the map lock, so the count cannot grow while we hold it.
    async fn release_creation_lock(&self, workspace_id: &str, creation_lock: &Arc<Mutex<()>>) {
        let mut creating = self.creating.lock().await;
        // One reference in the map, one held by the caller
        if Arc::strong_count(creation_lock) <= 2 {
            creating.remove(workspace_id);
        }
    }

    pub async fn get(&self, workspace_id: &str) -> Option<Arc<Workspace>> {
        self.live.read().await.get(workspace_id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.live.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Live workspaces, oldest first
    pub async fn list(&self) -> Vec<Arc<Workspace>> {
        let mut workspaces: Vec<Arc<Workspace>> = self.live.read().await.values().cloned().collect();
        workspaces.sort_by_key(|w| w.created_at);
        workspaces
    }

    /// Remove the workspace and tear down its environment. Returns false if it was not live.
    pub async fn destroy(&self, workspace_id: &str) -> bool {
        let Some(workspace) = self.live.write().await.remove(workspace_id) else {
            return false;
        };

        match self.driver.destroy_environment(&workspace.handle).await {
            Ok(()) => info!(workspace = workspace_id, "Workspace destroyed"),
            Err(e) => warn!(workspace = workspace_id, "Failed to destroy workspace: {}", e),
        }
        true
    }

    /// Tear down every live workspace concurrently, waiting at most `timeout`.
    /// Returns the number of environments removed before the deadline.
    pub async fn destroy_all(&self, timeout: Duration) -> usize {
        let workspaces: Vec<Arc<Workspace>> = self.live.write().await.drain().map(|(_, w)| w).collect();
        if workspaces.is_empty() {
            return 0;
        }

        info!("Destroying {} workspace(s)", workspaces.len());

        let teardown = join_all(workspaces.iter().map(|workspace| async move {
            match self.driver.destroy_environment(&workspace.handle).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(workspace = %workspace.id, "Failed to destroy workspace: {}", e);
                    false
                }
            }
        }));

        match tokio::time::timeout(timeout, teardown).await {
            Ok(results) => results.into_iter().filter(|ok| *ok).count(),
            Err(_) => {
                warn!(
                    "Workspace teardown did not finish within {}s, giving up",
                    timeout.as_secs()
                );
                0
            }
        }
    }
}
