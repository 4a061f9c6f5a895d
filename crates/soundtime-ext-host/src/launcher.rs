//! Starting sandbox processes.
//!
//! The controller only needs a byte stream pair, an exit notification and a
//! way to kill; [`SandboxLauncher`] hides whether that is an OS process or
//! something else.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;

use crate::config::HostConfig;
use crate::error::HostError;

/// Variables inherited from the host environment; everything else is
/// cleared before the sandbox starts.
const INHERITED_ENV: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "TMPDIR",
    "RUST_LOG",
    "RUST_BACKTRACE",
    "EXTENSION_MEMORY_LIMIT_MB",
    "EXTENSION_FUEL_LIMIT",
    "EXTENSION_WASM_MAX_SIZE_MB",
    "EXTENSION_WASI_ENABLED",
];

// ─── Launch parameters ──────────────────────────────────────────────────

/// What the sandbox is told at spawn. Changing these needs a respawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchParams {
    pub search_paths: Vec<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub app_root: PathBuf,
}

impl LaunchParams {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            search_paths: vec![config.extension_dir.clone()],
            log_dir: config.log_dir.clone(),
            app_root: config.app_root.clone(),
        }
    }

    /// The parameters as child-process environment variables.
    pub fn env(&self) -> Vec<(String, String)> {
        let search_paths = self
            .search_paths
            .iter()
            .map(|p| p.to_string_lossy())
            .collect::<Vec<_>>()
            .join(":");
        let mut env = vec![
            ("SOUNDTIME_EXT_SEARCH_PATHS".to_string(), search_paths),
            (
                "SOUNDTIME_APP_ROOT".to_string(),
                self.app_root.to_string_lossy().into_owned(),
            ),
        ];
        if let Some(dir) = &self.log_dir {
            env.push((
                "SOUNDTIME_EXT_LOG_DIR".to_string(),
                dir.to_string_lossy().into_owned(),
            ));
        }
        env
    }
}

// ─── Handle ─────────────────────────────────────────────────────────────

/// How a sandbox went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited on its own, with its exit code when there is one.
    Exited(Option<i32>),
    /// Terminated through [`SandboxHandle::kill`].
    Killed,
    /// Waiting on the process failed.
    Failed(String),
}

impl ProcessExit {
    pub fn is_clean(&self) -> bool {
        matches!(self, ProcessExit::Exited(Some(0)))
    }
}

/// A started sandbox.
pub struct SandboxHandle {
    /// The sandbox's output (its stdout).
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// The sandbox's input (its stdin).
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Resolves once when the sandbox is gone.
    pub exit: oneshot::Receiver<ProcessExit>,
    /// Send to force termination.
    pub kill: oneshot::Sender<()>,
    pub pid: Option<u32>,
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait SandboxLauncher: Send + Sync + 'static {
    async fn launch(&self, params: &LaunchParams) -> Result<SandboxHandle, HostError>;
}

// ─── OS process launcher ────────────────────────────────────────────────

/// Runs the `soundtime-ext-sandbox` binary as a child process speaking the
/// protocol on its stdin/stdout. Its stderr is forwarded to `tracing`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
        }
    }
}

fn inherited_env() -> impl Iterator<Item = (String, String)> {
    INHERITED_ENV
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
}

#[async_trait]
impl SandboxLauncher for ProcessLauncher {
    async fn launch(&self, params: &LaunchParams) -> Result<SandboxHandle, HostError> {
        let mut child = Command::new(&self.program)
            .env_clear()
            .envs(inherited_env())
            .envs(params.env())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HostError::Spawn(format!("{}: {e}", self.program.display())))?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HostError::Spawn("sandbox stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HostError::Spawn("sandbox stdout not captured".into()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(target: "soundtime_ext_sandbox", "{line}");
                }
            });
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => ProcessExit::Exited(status.code()),
                    Err(e) => ProcessExit::Failed(e.to_string()),
                },
                Ok(()) = &mut kill_rx => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(pid = ?pid, "failed to kill sandbox: {e}");
                    }
                    ProcessExit::Killed
                }
            };
            tracing::debug!(pid = ?pid, ?outcome, "sandbox process ended");
            let _ = exit_tx.send(outcome);
        });

        tracing::info!(pid = ?pid, program = %self.program.display(), "sandbox process started");

        Ok(SandboxHandle {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            exit: exit_rx,
            kill: kill_tx,
            pid,
        })
    }
}
