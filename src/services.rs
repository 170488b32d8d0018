// ABOUTME: Wiring of the long-lived service components created once at startup
// Every component receives its collaborators from here; nothing lives in globals

use crate::config::AppConfig;
use crate::docker::EnvironmentDriver;
use crate::files::FileService;
use crate::lifecycle::LifecycleManager;
use crate::session::SessionTable;
use crate::terminal::CommandRouter;
use crate::watcher::{ExecFileStateSource, FileStateSource, FileWatcher};
use crate::workspace::WorkspaceRegistry;
use std::sync::Arc;

pub struct Services {
    pub config: AppConfig,
    pub registry: Arc<WorkspaceRegistry>,
    pub sessions: Arc<SessionTable>,
    pub watcher: Arc<FileWatcher>,
    pub router: Arc<CommandRouter>,
    pub files: Arc<FileService>,
    pub lifecycle: Arc<LifecycleManager>,
}

impl Services {
    pub fn new(config: AppConfig, driver: Arc<dyn EnvironmentDriver>) -> Self {
        let source: Arc<dyn FileStateSource> = Arc::new(ExecFileStateSource::new(driver.clone()));
        Self::with_source(config, driver, source)
    }

    pub fn with_source(
        config: AppConfig,
        driver: Arc<dyn EnvironmentDriver>,
        source: Arc<dyn FileStateSource>,
    ) -> Self {
        let registry = Arc::new(WorkspaceRegistry::new(driver));
        let sessions = Arc::new(SessionTable::new());
        let watcher = Arc::new(FileWatcher::new(
            registry.clone(),
            sessions.clone(),
            source,
            config.watcher.interval(),
        ));
        let router = Arc::new(CommandRouter::new(
            registry.clone(),
            sessions.clone(),
            &config.terminal,
        ));
        let files = Arc::new(FileService::new(registry.clone()));
        let lifecycle = Arc::new(LifecycleManager::new(
            registry.clone(),
            sessions.clone(),
            watcher.clone(),
            &config,
        ));

        Self {
            config,
            registry,
            sessions,
            watcher,
            router,
            files,
            lifecycle,
        }
    }

    /// Workspace used when a request does not name one
    pub fn workspace_or_default<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        requested
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(&self.config.sandbox.default_workspace)
    }
}
