// ABOUTME: Parsing of raw file-state listings into file entries
// A listing is one "<path>|<mtime seconds>" line per regular file, as produced by find + stat

use serde::{Deserialize, Serialize};

/// Command run inside the environment to produce a listing of everything under `root`
pub fn listing_command(root: &str) -> String {
    format!(r#"find {root} -type f -exec stat -c "%n|%Y" {{}} \;"#)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    #[default]
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String, // relative to the workspace root
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub modified: i64, // milliseconds since the epoch
}

impl FileEntry {
    pub fn new(name: impl Into<String>, path: impl Into<String>, modified: i64) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind: FileKind::File,
            modified,
        }
    }
}

/// Parse a raw listing. Blank or malformed lines and dot-files are skipped.
pub fn parse_snapshot(raw: &str, root: &str) -> Vec<FileEntry> {
    let root_prefix = format!("{}/", root.trim_end_matches('/'));

    raw.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }

            // Paths may themselves contain '|', the timestamp never does
            let (full_path, seconds) = line.rsplit_once('|')?;
            let seconds: i64 = seconds.trim().parse().ok()?;

            let name = full_path.rsplit('/').next().unwrap_or(full_path);
            if name.is_empty() || name.starts_with('.') {
                return None;
            }

            let path = full_path
                .strip_prefix(&root_prefix)
                .unwrap_or_else(|| full_path.trim_start_matches('/'));

            Some(FileEntry::new(name, path, seconds.saturating_mul(1000)))
        })
        .collect()
}
