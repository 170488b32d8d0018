// ABOUTME: Application configuration loaded from TOML with defaults for every field
// Covers server binding, Docker connection, sandbox limits, terminal, watcher and lifecycle tuning

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable pointing at an alternative config file.
pub const CONFIG_ENV_VAR: &str = "SANDBOX_HUB_CONFIG";

/// Directory under the user's home holding config and logs.
pub const APP_DIR_NAME: &str = ".sandbox-hub";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub docker: DockerConfig,
    pub sandbox: SandboxConfig,
    pub terminal: TerminalConfig,
    pub watcher: WatcherConfig,
    pub lifecycle: LifecycleConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origins allowed by CORS. Empty means permissive.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Overrides socket auto-detection (e.g. `unix:///var/run/docker.sock`)
    pub host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub image: String,
    /// Dockerfile used when the image is missing. The embedded one is used when unset.
    pub dockerfile: Option<PathBuf>,
    pub memory_bytes: i64,
    /// Relative CPU weight, not a core count
    pub cpu_shares: i64,
    pub network_mode: String,
    pub working_dir: String,
    pub provision_timeout_secs: u64,
    pub exec_timeout_secs: u64,
    pub default_workspace: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "code-sandbox:latest".to_string(),
            dockerfile: None,
            memory_bytes: 512 * 1024 * 1024,
            cpu_shares: 512,
            network_mode: "none".to_string(),
            working_dir: "/workspace".to_string(),
            provision_timeout_secs: 120,
            exec_timeout_secs: 30,
            default_workspace: "shared-workspace".to_string(),
        }
    }
}

impl SandboxConfig {
    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Program names whose execution should trigger a file refresh hint
    pub mutating_commands: Vec<String>,
    pub hint_delay_ms: u64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        let mutating_commands = [
            "touch", "echo", "cat", "mkdir", "rm", "rmdir", "mv", "cp", "nano", "vim", "vi",
            "sed", "tee", "git", "unzip", "tar", "python", "python3", "node", "npm", "pip",
            "chmod", "ln",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();

        Self {
            mutating_commands,
            hint_delay_ms: 500,
        }
    }
}

impl TerminalConfig {
    pub fn hint_delay(&self) -> Duration {
        Duration::from_millis(self.hint_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub interval_ms: u64,
    /// Grace delay between a session attaching and its workspace watcher starting
    pub start_delay_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            start_delay_ms: 3000,
        }
    }
}

impl WatcherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub session_idle_ttl_secs: u64,
    pub reaper_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            session_idle_ttl_secs: 30 * 60,
            reaper_interval_secs: 60,
            shutdown_timeout_secs: 15,
        }
    }
}

impl LifecycleConfig {
    pub fn session_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.session_idle_ttl_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log file directory. Defaults to `~/.sandbox-hub/logs`.
    pub dir: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn resolve_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| app_dir().join("logs"))
    }
}

/// `~/.sandbox-hub`, or a relative directory when no home is available
pub fn app_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(APP_DIR_NAME))
}

impl AppConfig {
    /// Resolve the config file (explicit path, env var, then home dir) and load it.
    /// Missing default files yield the built-in defaults; a missing explicit path is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Self::load_from_file(Path::new(&path));
        }

        let default_path = app_dir().join("config.toml");
        if default_path.exists() {
            return Self::load_from_file(&default_path);
        }

        Ok(Self::default())
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.sandbox.working_dir.starts_with('/') {
            anyhow::bail!(
                "sandbox.working_dir must be absolute, got '{}'",
                self.sandbox.working_dir
            );
        }
        if self.watcher.interval_ms == 0 {
            anyhow::bail!("watcher.interval_ms must be greater than zero");
        }
        if self.lifecycle.reaper_interval_secs == 0 {
            anyhow::bail!("lifecycle.reaper_interval_secs must be greater than zero");
        }
        Ok(())
    }
}
