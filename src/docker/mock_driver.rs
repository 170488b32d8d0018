// ABOUTME: In-memory environment driver for unit and integration tests
// Emulates the handful of shell commands the service issues against a per-environment file map

use super::environment::{EnvironmentDriver, EnvironmentHandle, EnvironmentLimits};
use super::EnvironmentError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// First logical mtime handed out; each write advances it by one second
const MOCK_EPOCH_SECS: i64 = 1_700_000_000;

/// Scripted command handler. Returning `None` falls through to the built-in emulation.
pub type Responder = Arc<dyn Fn(&str) -> Option<Result<String, EnvironmentError>> + Send + Sync>;

#[derive(Debug, Clone)]
struct MockFile {
    content: Vec<u8>,
    modified_secs: i64,
}

#[derive(Debug, Default)]
struct MockEnvironment {
    files: BTreeMap<String, MockFile>,
}

#[derive(Debug, Default)]
struct MockState {
    environments: HashMap<String, MockEnvironment>,
    executed: Vec<String>,
    clock: i64,
}

impl MockState {
    fn tick(&mut self) -> i64 {
        self.clock += 1;
        MOCK_EPOCH_SECS + self.clock
    }
}

pub struct MockDriver {
    limits: EnvironmentLimits,
    state: Mutex<MockState>,
    responder: Option<Responder>,
    create_delay: Duration,
    fail_create: AtomicBool,
    pending_failures: AtomicUsize,
    created: AtomicUsize,
    next_id: AtomicUsize,
    orphans: AtomicUsize,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            limits: EnvironmentLimits::default(),
            state: Mutex::new(MockState::default()),
            responder: None,
            create_delay: Duration::ZERO,
            fail_create: AtomicBool::new(false),
            pending_failures: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
            orphans: AtomicUsize::new(0),
        }
    }

    pub fn with_limits(mut self, limits: EnvironmentLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&str) -> Option<Result<String, EnvironmentError>> + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Make every creation sleep first, widening race windows in tests
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Pretend `count` environments from an earlier run are still around
    pub fn with_orphans(self, count: usize) -> Self {
        self.orphans.store(count, Ordering::SeqCst);
        self
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Fail only the next `count` creations
    pub fn fail_next_creates(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Number of environments successfully created so far
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn live_count(&self) -> usize {
        self.state().environments.len()
    }

    pub fn executed_commands(&self) -> Vec<String> {
        self.state().executed.clone()
    }

    /// Place a file directly, bypassing `write_file`
    pub fn seed_file(&self, handle: &EnvironmentHandle, path: &str, content: &[u8]) {
        let mut state = self.state();
        let modified_secs = state.tick();
        if let Some(env) = state.environments.get_mut(&handle.container_id) {
            env.files.insert(
                path.trim_start_matches('/').to_string(),
                MockFile {
                    content: content.to_vec(),
                    modified_secs,
                },
            );
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn root(&self) -> &str {
        &self.limits.working_dir
    }

    fn emulate(&self, state: &mut MockState, container_id: &str, command: &str) -> String {
        let root = self.root().to_string();

        if command.starts_with("find ") && command.contains("-type f") {
            let Some(env) = state.environments.get(container_id) else {
                return String::new();
            };
            return env
                .files
                .iter()
                .map(|(path, file)| format!("{root}/{path}|{}\n", file.modified_secs))
                .collect();
        }

        if command.starts_with("ls -la") {
            let Some(env) = state.environments.get(container_id) else {
                return String::new();
            };
            return ls_listing(&env.files);
        }

        let Some((current_dir, rest)) = split_reasserted_dir(command) else {
            return format!("bash: {command}: unsupported by mock driver\n");
        };

        if let Some(target) = rest.strip_prefix("cd ").and_then(|r| r.strip_suffix(" && pwd")) {
            return format!("{}\n", resolve(current_dir, target.trim()).display());
        }

        let mut words = rest.split_whitespace();
        match words.next() {
            Some("pwd") => format!("{current_dir}\n"),
            Some("echo") => {
                let args: Vec<&str> = words.collect();
                match args.iter().position(|w| *w == ">" || *w == ">>") {
                    Some(idx) => {
                        if let Some(target) = args.get(idx + 1) {
                            let text = format!("{}\n", args[..idx].join(" "));
                            let relative = relative_to_root(&root, &resolve(current_dir, target));
                            let modified_secs = state.tick();
                            if let Some(env) = state.environments.get_mut(container_id) {
                                env.files.insert(
                                    relative,
                                    MockFile {
                                        content: text.into_bytes(),
                                        modified_secs,
                                    },
                                );
                            }
                        }
                        String::new()
                    }
                    None => format!("{}\n", args.join(" ")),
                }
            }
            Some("touch") => {
                for target in words {
                    let relative = relative_to_root(&root, &resolve(current_dir, target));
                    let modified_secs = state.tick();
                    if let Some(env) = state.environments.get_mut(container_id) {
                        env.files
                            .entry(relative)
                            .and_modify(|f| f.modified_secs = modified_secs)
                            .or_insert(MockFile {
                                content: Vec::new(),
                                modified_secs,
                            });
                    }
                }
                String::new()
            }
            Some(program) => format!("bash: {program}: command not found\n"),
            None => String::new(),
        }
    }
}

/// Split `cd '<dir>' && <rest>` into its parts
fn split_reasserted_dir(command: &str) -> Option<(&str, &str)> {
    let after = command.strip_prefix("cd '")?;
    let (dir, rest) = after.split_once("' && ")?;
    Some((dir, rest))
}

fn resolve(current_dir: &str, target: &str) -> PathBuf {
    let joined = if target.starts_with('/') {
        PathBuf::from(target)
    } else {
        Path::new(current_dir).join(target)
    };

    let mut normalized = PathBuf::from("/");
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    normalized
}

fn relative_to_root(root: &str, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .trim_start_matches('/')
        .to_string()
}

fn ls_listing(files: &BTreeMap<String, MockFile>) -> String {
    let mut output = format!("total {}\n", files.len());
    output.push_str("drwxr-xr-x 2 root root 4096 Jan  1 00:00 .\n");
    output.push_str("drwxr-xr-x 1 root root 4096 Jan  1 00:00 ..\n");

    let mut dirs_seen = Vec::new();
    for (path, file) in files {
        match path.split_once('/') {
            Some((dir, _)) => {
                if !dirs_seen.contains(&dir) {
                    dirs_seen.push(dir);
                    output.push_str(&format!("drwxr-xr-x 2 root root 4096 Jan  1 00:00 {dir}\n"));
                }
            }
            None => output.push_str(&format!(
                "-rw-r--r-- 1 root root {} Jan  1 00:00 {path}\n",
                file.content.len()
            )),
        }
    }
    output
}

#[async_trait]
impl EnvironmentDriver for MockDriver {
    async fn create_environment(&self, workspace_id: &str) -> Result<EnvironmentHandle, EnvironmentError> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        let scheduled_failure = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scheduled_failure || self.fail_create.load(Ordering::SeqCst) {
            return Err(EnvironmentError::Provision("mock creation failure".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = EnvironmentHandle {
            workspace_id: workspace_id.to_string(),
            container_name: EnvironmentHandle::container_name_for(workspace_id),
            container_id: format!("mock-{id:04}"),
        };

        self.state()
            .environments
            .insert(handle.container_id.clone(), MockEnvironment::default());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn execute(&self, handle: &EnvironmentHandle, command: &str) -> Result<String, EnvironmentError> {
        let live = {
            let mut state = self.state();
            state.executed.push(command.to_string());
            state.environments.contains_key(&handle.container_id)
        };
        if !live {
            return Err(EnvironmentError::execution(format!(
                "Environment {} not found",
                handle.container_name
            )));
        }

        if let Some(responder) = &self.responder {
            if let Some(result) = responder(command) {
                return result;
            }
        }

        let mut state = self.state();
        Ok(self.emulate(&mut state, &handle.container_id, command))
    }

    async fn write_file(&self, handle: &EnvironmentHandle, path: &str, content: &[u8]) -> Result<(), EnvironmentError> {
        let mut state = self.state();
        let modified_secs = state.tick();
        let env = state
            .environments
            .get_mut(&handle.container_id)
            .ok_or_else(|| EnvironmentError::NotFound(handle.container_name.clone()))?;

        env.files.insert(
            path.trim_start_matches('/').to_string(),
            MockFile {
                content: content.to_vec(),
                modified_secs,
            },
        );
        Ok(())
    }

    async fn read_file(&self, handle: &EnvironmentHandle, path: &str) -> Result<Vec<u8>, EnvironmentError> {
        let state = self.state();
        let env = state
            .environments
            .get(&handle.container_id)
            .ok_or_else(|| EnvironmentError::NotFound(handle.container_name.clone()))?;

        env.files
            .get(path.trim_start_matches('/'))
            .map(|f| f.content.clone())
            .ok_or_else(|| EnvironmentError::NotFound(path.to_string()))
    }

    async fn destroy_environment(&self, handle: &EnvironmentHandle) -> Result<(), EnvironmentError> {
        self.state().environments.remove(&handle.container_id);
        Ok(())
    }

    async fn reap_orphans(&self) -> Result<usize, EnvironmentError> {
        Ok(self.orphans.swap(0, Ordering::SeqCst))
    }

    fn limits(&self) -> &EnvironmentLimits {
        &self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_write_then_read() {
        let driver = MockDriver::new();
        let handle = driver.create_environment("w").await.unwrap();

        driver.write_file(&handle, "a.py", b"print(1)").await.unwrap();
        assert_eq!(driver.read_file(&handle, "a.py").await.unwrap(), b"print(1)");
    }

    #[tokio::test]
    async fn test_cd_resolution() {
        let driver = MockDriver::new();
        let handle = driver.create_environment("w").await.unwrap();

        let out = driver
            .execute(&handle, "cd '/workspace/src' && cd .. && pwd")
            .await
            .unwrap();
        assert_eq!(out, "/workspace\n");

        let out = driver
            .execute(&handle, "cd '/workspace' && cd /etc && pwd")
            .await
            .unwrap();
        assert_eq!(out, "/etc\n");
    }

    #[tokio::test]
    async fn test_find_listing_reflects_writes() {
        let driver = MockDriver::new();
        let handle = driver.create_environment("w").await.unwrap();
        driver.write_file(&handle, "a.py", b"x").await.unwrap();
        driver.execute(&handle, "cd '/workspace' && touch b.py").await.unwrap();

        let listing = driver
            .execute(&handle, r#"find /workspace -type f -exec stat -c "%n|%Y" {} \;"#)
            .await
            .unwrap();
        assert_eq!(
            listing,
            "/workspace/a.py|1700000001\n/workspace/b.py|1700000002\n"
        );
    }

    #[tokio::test]
    async fn test_destroyed_environment_rejects_exec() {
        let driver = MockDriver::new();
        let handle = driver.create_environment("w").await.unwrap();
        driver.destroy_environment(&handle).await.unwrap();
        // idempotent
        driver.destroy_environment(&handle).await.unwrap();

        let err = driver.execute(&handle, "ls").await.unwrap_err();
        assert!(matches!(err, EnvironmentError::Execution { .. }));
        assert_eq!(driver.live_count(), 0);
    }

    #[tokio::test]
    async fn test_responder_overrides_builtin() {
        let driver = MockDriver::new().with_responder(|cmd| {
            cmd.contains("boom")
                .then(|| Err(EnvironmentError::execution("boom")))
        });
        let handle = driver.create_environment("w").await.unwrap();

        assert!(driver.execute(&handle, "cd '/workspace' && boom").await.is_err());
        assert_eq!(
            driver.execute(&handle, "cd '/workspace' && echo hi").await.unwrap(),
            "hi\n"
        );
    }
}
