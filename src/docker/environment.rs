// ABOUTME: Environment driver abstraction shared by the Docker backend and the in-memory mock
// Defines handles, resource limits and the async driver trait the rest of the service depends on

use super::EnvironmentError;
use crate::config::SandboxConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Prefix for container names; the workspace id is appended.
pub const CONTAINER_NAME_PREFIX: &str = "sandbox-";

/// Label marking containers owned by this service
pub const MANAGED_LABEL: &str = "sandbox-hub-managed";

/// Label carrying the workspace id of a managed container
pub const WORKSPACE_LABEL: &str = "sandbox-hub-workspace";

/// Reference to a live isolated environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentHandle {
    pub workspace_id: String,
    pub container_name: String,
    pub container_id: String,
}

impl EnvironmentHandle {
    pub fn container_name_for(workspace_id: &str) -> String {
        format!("{CONTAINER_NAME_PREFIX}{workspace_id}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentLimits {
    pub memory_bytes: i64,
    pub cpu_shares: i64,
    pub network_mode: String,
    pub working_dir: String,
}

impl EnvironmentLimits {
    pub fn network_disabled(&self) -> bool {
        self.network_mode == "none"
    }
}

impl Default for EnvironmentLimits {
    fn default() -> Self {
        Self::from(&SandboxConfig::default())
    }
}

impl From<&SandboxConfig> for EnvironmentLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            memory_bytes: config.memory_bytes,
            cpu_shares: config.cpu_shares,
            network_mode: config.network_mode.clone(),
            working_dir: config.working_dir.clone(),
        }
    }
}

/// Creates, drives and destroys isolated environments.
///
/// `execute` is synchronous from the caller's point of view: implementations
/// drive their output stream to completion and return the aggregated text.
#[async_trait]
pub trait EnvironmentDriver: Send + Sync {
    /// Provision a fresh environment for the workspace.
    async fn create_environment(
        &self,
        workspace_id: &str,
    ) -> Result<EnvironmentHandle, EnvironmentError>;

    /// Run `command` through a shell and return combined stdout/stderr.
    async fn execute(
        &self,
        handle: &EnvironmentHandle,
        command: &str,
    ) -> Result<String, EnvironmentError>;

    /// Write `content` to `path`, relative to the root working directory.
    async fn write_file(
        &self,
        handle: &EnvironmentHandle,
        path: &str,
        content: &[u8],
    ) -> Result<(), EnvironmentError>;

    /// Read `path`, relative to the root working directory.
    async fn read_file(
        &self,
        handle: &EnvironmentHandle,
        path: &str,
    ) -> Result<Vec<u8>, EnvironmentError>;

    /// Stop and remove the environment. Already-gone environments are not an error.
    async fn destroy_environment(&self, handle: &EnvironmentHandle)
        -> Result<(), EnvironmentError>;

    /// Remove environments left behind by an earlier process. Returns how many were removed.
    /// Only safe before this process has created environments of its own.
    async fn reap_orphans(&self) -> Result<usize, EnvironmentError> {
        Ok(0)
    }

    /// Limits applied to every environment this driver creates
    fn limits(&self) -> &EnvironmentLimits;
}
