// ABOUTME: Capability for taking a raw file-state snapshot of a workspace
// The exec-backed source lists files inside the environment; tests substitute a mock

use super::snapshot::listing_command;
use crate::docker::{EnvironmentDriver, EnvironmentError};
use crate::workspace::Workspace;
use async_trait::async_trait;
use std::sync::Arc;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FileStateSource: Send + Sync {
    /// Raw listing of every regular file under the workspace root
    async fn snapshot(&self, workspace: &Workspace) -> Result<String, EnvironmentError>;
}

pub struct ExecFileStateSource {
    driver: Arc<dyn EnvironmentDriver>,
}

impl ExecFileStateSource {
    pub fn new(driver: Arc<dyn EnvironmentDriver>) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl FileStateSource for ExecFileStateSource {
    async fn snapshot(&self, workspace: &Workspace) -> Result<String, EnvironmentError> {
        let output = self
            .driver
            .execute(&workspace.handle, &listing_command(workspace.root()))
            .await?;
        Ok(output.trim().to_string())
    }
}
