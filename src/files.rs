// ABOUTME: Request/response file operations on a workspace
// Save, load and list files in the workspace root on behalf of the HTTP surface

use crate::docker::EnvironmentError;
use crate::watcher::FileKind;
use crate::workspace::{WorkspaceError, WorkspaceRegistry};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum FileError {
    #[error("Invalid file name: {0:?}")]
    InvalidName(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Environment(#[from] EnvironmentError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedFile {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
}

/// File names are relative to the workspace root and may not climb out of it
pub fn validate_file_name(name: &str) -> Result<(), FileError> {
    let path = Path::new(name);
    let valid = !name.trim().is_empty()
        && !name.contains('\0')
        && !name.ends_with('/')
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));

    if valid {
        Ok(())
    } else {
        Err(FileError::InvalidName(name.to_string()))
    }
}

pub struct FileService {
    registry: Arc<WorkspaceRegistry>,
}

impl FileService {
    pub fn new(registry: Arc<WorkspaceRegistry>) -> Self {
        Self { registry }
    }

    pub async fn save(&self, workspace_id: &str, file_name: &str, content: &str) -> Result<(), FileError> {
        validate_file_name(file_name)?;
        let workspace = self.registry.get_or_create(workspace_id).await?;

        self.registry
            .driver()
            .write_file(&workspace.handle, file_name, content.as_bytes())
            .await?;

        info!(workspace = workspace_id, "Saved {} ({} bytes)", file_name, content.len());
        Ok(())
    }

    pub async fn load(&self, workspace_id: &str, file_name: &str) -> Result<String, FileError> {
        validate_file_name(file_name)?;
        let workspace = self.registry.get_or_create(workspace_id).await?;

        match self
            .registry
            .driver()
            .read_file(&workspace.handle, file_name)
            .await
        {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.is_not_found() => Err(FileError::NotFound(file_name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Regular files directly under the workspace root. Never fails: an unreachable
    /// workspace lists as empty.
    pub async fn list(&self, workspace_id: &str) -> Vec<ListedFile> {
        let workspace = match self.registry.get_or_create(workspace_id).await {
            Ok(workspace) => workspace,
            Err(e) => {
                warn!(workspace = workspace_id, "Workspace unavailable, returning empty file list: {}", e);
                return Vec::new();
            }
        };

        let command = format!("ls -la {}", workspace.root());
        match self.registry.driver().execute(&workspace.handle, &command).await {
            Ok(output) => parse_ls_listing(&output),
            Err(e) => {
                debug!(workspace = workspace_id, "Listing failed: {}", e);
                Vec::new()
            }
        }
    }
}

fn parse_ls_listing(output: &str) -> Vec<ListedFile> {
    output
        .trim()
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with("total") && !line.starts_with('d'))
        .filter_map(|line| line.split_whitespace().last())
        .filter(|name| *name != "." && *name != "..")
        .map(|name| ListedFile {
            name: name.to_string(),
            path: name.to_string(),
            kind: FileKind::File,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::MockDriver;
    use pretty_assertions::assert_eq;

    fn service() -> (Arc<MockDriver>, FileService) {
        let driver = Arc::new(MockDriver::new());
        let registry = Arc::new(WorkspaceRegistry::new(driver.clone()));
        (driver, FileService::new(registry))
    }

    #[test]
    fn test_validate_file_name() {
        assert!(validate_file_name("a.py").is_ok());
        assert!(validate_file_name("src/lib.rs").is_ok());
        assert!(validate_file_name("./notes.md").is_ok());

        assert!(validate_file_name("").is_err());
        assert!(validate_file_name("   ").is_err());
        assert!(validate_file_name("/etc/passwd").is_err());
        assert!(validate_file_name("../escape").is_err());
        assert!(validate_file_name("src/../../escape").is_err());
        assert!(validate_file_name("dir/").is_err());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let (_driver, files) = service();
        files.save("w", "a.py", "print(1)").await.unwrap();
        assert_eq!(files.load("w", "a.py").await.unwrap(), "print(1)");
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let (_driver, files) = service();
        assert!(matches!(
            files.load("w", "missing.py").await,
            Err(FileError::NotFound(name)) if name == "missing.py"
        ));
    }

    #[tokio::test]
    async fn test_invalid_name_never_reaches_driver() {
        let (driver, files) = service();
        assert!(matches!(
            files.save("w", "../x", "").await,
            Err(FileError::InvalidName(_))
        ));
        assert_eq!(driver.created_count(), 0);
    }

    #[tokio::test]
    async fn test_list_skips_directories() {
        let (_driver, files) = service();
        files.save("w", "a.py", "1").await.unwrap();
        files.save("w", "src/lib.rs", "2").await.unwrap();

        assert_eq!(
            files.list("w").await,
            vec![ListedFile {
                name: "a.py".to_string(),
                path: "a.py".to_string(),
                kind: FileKind::File
            }]
        );
    }

    #[tokio::test]
    async fn test_list_is_fail_soft() {
        let (driver, files) = service();
        driver.set_fail_create(true);
        assert!(files.list("w").await.is_empty());
    }

    #[test]
    fn test_parse_ls_listing() {
        let output = "total 12\n\
                      drwxr-xr-x 2 root root 4096 Jan  1 00:00 .\n\
                      drwxr-xr-x 1 root root 4096 Jan  1 00:00 ..\n\
                      -rw-r--r-- 1 root root   10 Jan  1 00:00 main.py\n\
                      drwxr-xr-x 2 root root 4096 Jan  1 00:00 src\n";
        let names: Vec<String> = parse_ls_listing(output).into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["main.py"]);
    }
}
