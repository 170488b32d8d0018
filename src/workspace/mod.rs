// ABOUTME: Workspaces are long-lived isolated environments shared by any number of sessions
// Holds the workspace model, id validation and the registry that owns live environments

pub mod registry;

use crate::docker::{EnvironmentError, EnvironmentHandle, EnvironmentLimits};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

pub use registry::WorkspaceRegistry;

lazy_static! {
    static ref WORKSPACE_ID_PATTERN: Regex =
        Regex::new(r"^[A-Za-z0-9_.-]{1,64}$").expect("workspace id pattern is valid");
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Invalid workspace id: {0:?}")]
    InvalidId(String),

    #[error(transparent)]
    Environment(#[from] EnvironmentError),
}

#[derive(Debug, Clone, Serialize)]
pub struct Workspace {
    pub id: String,
    pub handle: EnvironmentHandle,
    pub limits: EnvironmentLimits,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    /// Root working directory every session of this workspace is confined to
    pub fn root(&self) -> &str {
        &self.limits.working_dir
    }
}

pub fn validate_id(workspace_id: &str) -> Result<(), WorkspaceError> {
    // "." and ".." match the character class but make poor container names
    if WORKSPACE_ID_PATTERN.is_match(workspace_id) && workspace_id != "." && workspace_id != ".." {
        Ok(())
    } else {
        Err(WorkspaceError::InvalidId(workspace_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_id() {
        assert!(validate_id("shared-workspace").is_ok());
        assert!(validate_id("team_1.v2").is_ok());

        assert!(validate_id("").is_err());
        assert!(validate_id("..").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("has space").is_err());
        assert!(validate_id(&"x".repeat(65)).is_err());
    }
}
