// ABOUTME: Confinement policy for session working directories
// A directory is allowed only if it is the workspace root or lies beneath it, compared by path component

use std::path::{Component, Path};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Access denied: Can only navigate within {root}")]
pub struct AccessPolicyError {
    pub root: String,
    pub requested: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryPolicy {
    root: String,
}

impl DirectoryPolicy {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    /// `/workspace2` is not inside `/workspace`; `..` components are never accepted.
    pub fn contains(&self, path: &str) -> bool {
        let path = Path::new(path);
        path.is_absolute()
            && !path.components().any(|c| c == Component::ParentDir)
            && path.starts_with(&self.root)
    }

    pub fn check(&self, path: &str) -> Result<(), AccessPolicyError> {
        if self.contains(path) {
            Ok(())
        } else {
            Err(AccessPolicyError {
                root: self.root.clone(),
                requested: path.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_and_descendants_allowed() {
        let policy = DirectoryPolicy::new("/workspace");
        assert!(policy.contains("/workspace"));
        assert!(policy.contains("/workspace/"));
        assert!(policy.contains("/workspace/src/deep"));
    }

    #[test]
    fn test_outside_root_denied() {
        let policy = DirectoryPolicy::new("/workspace");
        assert!(!policy.contains("/etc"));
        assert!(!policy.contains("/"));
        assert!(!policy.contains("/workspace2"));
        assert!(!policy.contains("/workspace/../etc"));
        assert!(!policy.contains("workspace/src"));
    }

    #[test]
    fn test_error_message() {
        let err = DirectoryPolicy::new("/workspace").check("/etc").unwrap_err();
        assert_eq!(err.to_string(), "Access denied: Can only navigate within /workspace");
        assert_eq!(err.requested, "/etc");
    }
}
