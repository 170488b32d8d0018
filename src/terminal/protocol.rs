// ABOUTME: WebSocket protocol definitions for the session channel between browser and service
// Events are JSON objects of the form {"type": "<kebab-case>", "data": {...}}

use crate::watcher::FileEntry;
use serde::{Deserialize, Serialize};

/// Prompt marker emitted after every handled input
pub const PROMPT: &str = "$ ";

// ============================================
// Client → Service
// ============================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    OpenSession(OpenSessionMessage),
    TerminalInput(TerminalInputMessage),
    StartWatching,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSessionMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInputMessage {
    pub line: String,
}

// ============================================
// Service → Client
// ============================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    TerminalOutput(TerminalOutputMessage),
    FilesChanged(FilesChangedMessage),
    FilesChangedHint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalOutputMessage {
    pub text: String, // Raw shell output, CRLF line endings left as-is
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesChangedMessage {
    pub files: Vec<FileEntry>,
}

impl ServerEvent {
    pub fn output(text: impl Into<String>) -> Self {
        Self::TerminalOutput(TerminalOutputMessage { text: text.into() })
    }

    pub fn files_changed(files: Vec<FileEntry>) -> Self {
        Self::FilesChanged(FilesChangedMessage { files })
    }

    /// Text carried by a terminal-output event
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::TerminalOutput(msg) => Some(&msg.text),
            _ => None,
        }
    }
}
