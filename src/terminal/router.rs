// ABOUTME: Routes a line of terminal input to the session's workspace environment
// Intercepts cd to track and confine the working directory, runs everything else in the current directory

use super::policy::DirectoryPolicy;
use super::protocol::{ServerEvent, PROMPT};
use crate::config::TerminalConfig;
use crate::docker::EnvironmentError;
use crate::session::{CommandSlot, SessionTable};
use crate::workspace::{Workspace, WorkspaceRegistry};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// What happened to a line of input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Empty,
    Busy,
    Unavailable,
    DirectoryChanged(String),
    DirectoryDenied,
    /// `cd` itself failed inside the environment; its output was shown as-is
    DirectoryUnchanged,
    Executed,
    Failed,
}

pub struct CommandRouter {
    registry: Arc<WorkspaceRegistry>,
    sessions: Arc<SessionTable>,
    mutating: HashSet<String>,
    hint_delay: Duration,
}

impl CommandRouter {
    pub fn new(registry: Arc<WorkspaceRegistry>, sessions: Arc<SessionTable>, config: &TerminalConfig) -> Self {
        Self {
            registry,
            sessions,
            mutating: config.mutating_commands.iter().cloned().collect(),
            hint_delay: config.hint_delay(),
        }
    }

    pub async fn handle_input(&self, session_id: Uuid, line: &str) -> RouteOutcome {
        let command = line.trim();

        if command.is_empty() {
            self.emit(session_id, format!("\r\n{PROMPT}")).await;
            return RouteOutcome::Empty;
        }

        let _in_flight = match self.sessions.try_begin_command(&session_id).await {
            Ok(guard) => guard,
            Err(CommandSlot::Busy) => {
                self.emit(session_id, format!("\r\n❌ A command is already running\r\n{PROMPT}"))
                    .await;
                return RouteOutcome::Busy;
            }
            Err(CommandSlot::UnknownSession) => {
                debug!(session = %session_id, "Input for unknown session dropped");
                return RouteOutcome::Unavailable;
            }
        };

        self.sessions.touch(&session_id).await;
        self.emit(session_id, "\r\n").await;

        let workspace = match self.sessions.workspace_of(&session_id).await {
            Some(id) => self.registry.get(&id).await,
            None => None,
        };
        let (Some(workspace), Some(current_dir)) =
            (workspace, self.sessions.current_dir(&session_id).await)
        else {
            self.emit(session_id, format!("❌ Sandbox not available\r\n{PROMPT}")).await;
            return RouteOutcome::Unavailable;
        };

        let outcome = match cd_target(command) {
            Some(target) => {
                self.change_directory(session_id, &workspace, &current_dir, target)
                    .await
            }
            None => self.execute(session_id, &workspace, &current_dir, command).await,
        };

        self.emit(session_id, PROMPT).await;
        outcome
    }

    /// Relative targets resolve against the session's `current_dir`, not the container's cwd.
    async fn change_directory(
        &self,
        session_id: Uuid,
        workspace: &Workspace,
        current_dir: &str,
        target: &str,
    ) -> RouteOutcome {
        let policy = DirectoryPolicy::new(workspace.root());
        let target = if target.is_empty() { workspace.root() } else { target };
        let command = format!("cd {} && cd {} && pwd", shell_quote(current_dir), target);

        let output = match self
            .registry
            .driver()
            .execute(&workspace.handle, &command)
            .await
        {
            Ok(output) => output,
            Err(e) => {
                self.report_error(session_id, workspace, &e).await;
                return RouteOutcome::Failed;
            }
        };

        let new_path = output.trim().lines().last().unwrap_or_default().trim();
        if !new_path.starts_with('/') {
            self.emit(session_id, output).await;
            return RouteOutcome::DirectoryUnchanged;
        }

        match policy.check(new_path) {
            Ok(()) => {
                self.sessions.set_current_dir(&session_id, new_path).await;
                debug!(session = %session_id, "Directory changed to {}", new_path);
                self.emit(session_id, format!("📁 {new_path}\r\n")).await;
                RouteOutcome::DirectoryChanged(new_path.to_string())
            }
            Err(e) => {
                debug!(session = %session_id, "Denied cd to {}", e.requested);
                self.emit(session_id, format!("❌ {e}\r\n")).await;
                RouteOutcome::DirectoryDenied
            }
        }
    }

    async fn execute(
        &self,
        session_id: Uuid,
        workspace: &Workspace,
        current_dir: &str,
        command: &str,
    ) -> RouteOutcome {
        let full_command = format!("cd {} && {}", shell_quote(current_dir), command);
        let result = self
            .registry
            .driver()
            .execute(&workspace.handle, &full_command)
            .await;

        if self.is_mutating(command) {
            self.schedule_hint(&workspace.id);
        }

        match result {
            Ok(output) => {
                self.emit(session_id, output).await;
                RouteOutcome::Executed
            }
            Err(e) => {
                self.report_error(session_id, workspace, &e).await;
                RouteOutcome::Failed
            }
        }
    }

    async fn report_error(&self, session_id: Uuid, workspace: &Workspace, error: &EnvironmentError) {
        if error.is_timeout() {
            warn!(session = %session_id, workspace = %workspace.id, "Command timed out: {}", error);
        } else {
            warn!(session = %session_id, workspace = %workspace.id, "Command failed: {}", error);
        }

        if let Some(partial) = error.partial_output() {
            self.emit(session_id, partial).await;
        }
        let message = match error {
            EnvironmentError::Execution { message, .. } => message.clone(),
            other => other.to_string(),
        };
        self.emit(session_id, format!("❌ Error: {message}\r\n")).await;
    }

    /// Whether the input may have changed the file tree
    pub fn is_mutating(&self, command: &str) -> bool {
        if command.contains('>') {
            return true;
        }

        command
            .split(['&', ';', '|'])
            .filter_map(|segment| segment.split_whitespace().next())
            .map(|program| program.rsplit('/').next().unwrap_or(program))
            .any(|program| self.mutating.contains(program))
    }

    fn schedule_hint(&self, workspace_id: &str) {
        let sessions = self.sessions.clone();
        let workspace_id = workspace_id.to_string();
        let delay = self.hint_delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let delivered = sessions.broadcast(&workspace_id, &ServerEvent::FilesChangedHint).await;
            debug!(workspace = %workspace_id, delivered, "Sent files-changed hint");
        });
    }

    async fn emit(&self, session_id: Uuid, text: impl Into<String>) {
        self.sessions.send(&session_id, ServerEvent::output(text)).await;
    }
}

/// `Some(target)` when the input is a cd; the target is empty for a bare `cd`
fn cd_target(command: &str) -> Option<&str> {
    if command == "cd" {
        return Some("");
    }
    command
        .strip_prefix("cd")
        .filter(|rest| rest.starts_with(char::is_whitespace))
        .map(str::trim)
}

/// Single-quote for bash, escaping embedded single quotes
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
