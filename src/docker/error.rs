// ABOUTME: Error types for isolated environment operations
// Classifies provisioning, execution, lookup and timeout failures surfaced by environment drivers

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("Failed to provision environment: {0}")]
    Provision(String),

    #[error("Command execution failed: {message}")]
    Execution {
        message: String,
        /// Output received before the failure
        partial_output: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: String,
        after: Duration,
        /// Output received before the deadline
        partial_output: String,
    },

    #[error("Docker connection error: {0}")]
    Connection(#[from] bollard::errors::Error),
}

impl EnvironmentError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            partial_output: String::new(),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
            partial_output: String::new(),
        }
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Output that was already collected when the command failed, if any
    pub fn partial_output(&self) -> Option<&str> {
        match self {
            Self::Execution { partial_output, .. } | Self::Timeout { partial_output, .. }
                if !partial_output.is_empty() =>
            {
                Some(partial_output)
            }
            _ => None,
        }
    }
}
