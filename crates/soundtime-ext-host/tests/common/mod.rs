//! In-process sandboxes for exercising the host controller.
//!
//! [`InMemoryLauncher`] runs the real sandbox dispatcher on a tokio task
//! behind a relay task; killing or crashing a "process" aborts both, which
//! the host sees as end of stream, exactly like a dead child process.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use soundtime_ext_core::Request;
use soundtime_ext_host::{
    Collaborator, Collaborators, ExtensionHost, HostConfig, HostError, LaunchParams, ProcessExit,
    SandboxHandle, SandboxLauncher, SandboxState,
};
use soundtime_ext_sandbox::{
    Capability, ExtensionInstance, IsolatedExecutionContext, LogLevelControl, RuntimeConfig,
    SandboxError,
};
use tokio::sync::oneshot;

// ─── Scripted extensions ────────────────────────────────────────────────

pub type CallLog = Arc<Mutex<Vec<(String, String)>>>;

/// Entry files are JSON objects mapping hook names to their result.
/// `"__echo"` returns the input; `{"__fail": msg}` fails the hook.
#[derive(Default)]
pub struct ScriptedContext {
    pub calls: CallLog,
}

impl IsolatedExecutionContext for ScriptedContext {
    fn load(
        &self,
        entry: &Path,
        _root: &Path,
        capability: Arc<Capability>,
    ) -> Result<Box<dyn ExtensionInstance>, SandboxError> {
        let script: HashMap<String, Value> = serde_json::from_slice(&std::fs::read(entry)?)?;
        Ok(Box::new(ScriptedInstance {
            package_name: capability.package_name().to_string(),
            script,
            calls: Arc::clone(&self.calls),
        }))
    }
}

struct ScriptedInstance {
    package_name: String,
    script: HashMap<String, Value>,
    calls: CallLog,
}

impl ExtensionInstance for ScriptedInstance {
    fn has_hook(&self, hook: &str) -> bool {
        self.script.contains_key(hook)
    }

    fn call_hook(&mut self, hook: &str, input: &Value) -> Result<Value, SandboxError> {
        self.calls
            .lock()
            .unwrap()
            .push((self.package_name.clone(), hook.to_string()));
        match self.script.get(hook) {
            Some(Value::String(s)) if s == "__echo" => Ok(input.clone()),
            Some(v) if v.get("__fail").is_some() => Err(SandboxError::Hook {
                package_name: self.package_name.clone(),
                hook: hook.to_string(),
                message: v["__fail"].as_str().unwrap_or("failed").to_string(),
            }),
            Some(v) => Ok(v.clone()),
            None => Ok(Value::Null),
        }
    }
}

// ─── Launcher ───────────────────────────────────────────────────────────

pub struct InMemoryLauncher {
    launches: AtomicUsize,
    crash_triggers: Mutex<Vec<oneshot::Sender<()>>>,
    pub calls: CallLog,
    /// Sandboxes that accept requests but never answer.
    mute: bool,
    fail_next: AtomicBool,
    launch_delay: Mutex<Duration>,
}

impl InMemoryLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            launches: AtomicUsize::new(0),
            crash_triggers: Mutex::new(Vec::new()),
            calls: CallLog::default(),
            mute: false,
            fail_next: AtomicBool::new(false),
            launch_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn mute() -> Arc<Self> {
        Arc::new(Self {
            launches: AtomicUsize::new(0),
            crash_triggers: Mutex::new(Vec::new()),
            calls: CallLog::default(),
            mute: true,
            fail_next: AtomicBool::new(false),
            launch_delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Make the next launch fail with a spawn error.
    pub fn fail_next_launch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Stall every following launch, widening the window for racing callers.
    pub fn slow_launches(&self, delay: Duration) {
        *self.launch_delay.lock().unwrap() = delay;
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Make the most recently launched sandbox die with a non-zero status.
    pub fn crash_current(&self) {
        if let Some(trigger) = self.crash_triggers.lock().unwrap().pop() {
            let _ = trigger.send(());
        }
    }

    pub fn hook_calls(&self, hook: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, h)| h == hook)
            .map(|(p, _)| p.clone())
            .collect()
    }
}

#[async_trait]
impl SandboxLauncher for InMemoryLauncher {
    async fn launch(&self, params: &LaunchParams) -> Result<SandboxHandle, HostError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.launch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(HostError::Spawn("launch refused".into()));
        }

        let (host_side, relay_outer) = tokio::io::duplex(256 * 1024);
        let (sandbox_side, relay_inner) = tokio::io::duplex(256 * 1024);
        let (sr, sw) = tokio::io::split(sandbox_side);

        let mut sandbox = if self.mute {
            tokio::spawn(async move {
                let _held = (sr, sw);
                std::future::pending::<()>().await
            })
        } else {
            let config = RuntimeConfig {
                search_paths: params.search_paths.clone(),
                app_root: params.app_root.clone(),
                ..RuntimeConfig::default()
            };
            let context = ScriptedContext {
                calls: Arc::clone(&self.calls),
            };
            tokio::spawn(soundtime_ext_sandbox::serve(
                sr,
                sw,
                config,
                Arc::new(context),
                LogLevelControl::default(),
            ))
        };
        let relay = tokio::spawn(async move {
            let (mut outer, mut inner) = (relay_outer, relay_inner);
            let _ = tokio::io::copy_bidirectional(&mut outer, &mut inner).await;
        });

        let (crash_tx, crash_rx) = oneshot::channel();
        self.crash_triggers.lock().unwrap().push(crash_tx);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                result = &mut sandbox => match result {
                    Ok(()) => ProcessExit::Exited(Some(0)),
                    Err(e) => ProcessExit::Failed(e.to_string()),
                },
                Ok(()) = kill_rx => ProcessExit::Killed,
                Ok(()) = crash_rx => ProcessExit::Exited(Some(101)),
            };
            sandbox.abort();
            relay.abort();
            let _ = exit_tx.send(outcome);
        });

        let (reader, writer) = tokio::io::split(host_side);
        Ok(SandboxHandle {
            reader: Box::new(reader),
            writer: Box::new(writer),
            exit: exit_rx,
            kill: kill_tx,
            pid: None,
        })
    }
}

// ─── Collaborators ──────────────────────────────────────────────────────

/// Records every request and answers `true` (or the scripted value for its
/// message type).
#[derive(Default)]
pub struct Recorder {
    pub seen: Mutex<Vec<Request>>,
    pub answers: Mutex<HashMap<String, Value>>,
}

impl Recorder {
    pub fn answering(message_type: &str, answer: Value) -> Arc<Self> {
        let recorder = Self::default();
        recorder
            .answers
            .lock()
            .unwrap()
            .insert(message_type.to_string(), answer);
        Arc::new(recorder)
    }

    pub fn seen(&self) -> Vec<Request> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Collaborator for Recorder {
    async fn handle(&self, request: Request) -> Result<Value, String> {
        let key = serde_json::to_value(request.message_type)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        self.seen.lock().unwrap().push(request);
        Ok(self
            .answers
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or(Value::Bool(true)))
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────────

pub fn manifest(package_name: &str, version: &str) -> String {
    format!(
        "soundtime_extension = true\n\
         package_name = \"{package_name}\"\n\
         display_name = \"{package_name} display\"\n\
         version = \"{version}\"\n\
         entry = \"script.json\"\n"
    )
}

/// Build an installable archive in `dir` for a scripted extension.
pub fn package(dir: &Path, package_name: &str, version: &str, script: Value) -> PathBuf {
    let path = dir.join(format!("{package_name}-{version}.zip"));
    let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    writer.start_file("extension.toml", options).unwrap();
    writer
        .write_all(manifest(package_name, version).as_bytes())
        .unwrap();
    writer.start_file("script.json", options).unwrap();
    writer
        .write_all(&serde_json::to_vec(&script).unwrap())
        .unwrap();
    writer.finish().unwrap();
    path
}

/// Write an already-installed scripted extension under the install root.
pub fn install_directly(root: &Path, package_name: &str, version: &str, script: Value) {
    let path = root.join(package_name);
    std::fs::create_dir_all(&path).unwrap();
    std::fs::write(path.join("extension.toml"), manifest(package_name, version)).unwrap();
    std::fs::write(path.join("script.json"), serde_json::to_vec(&script).unwrap()).unwrap();
}

pub fn config(install_root: &Path) -> HostConfig {
    HostConfig {
        extension_dir: install_root.to_path_buf(),
        app_root: PathBuf::from("/opt/soundtime"),
        request_timeout: Duration::from_secs(10),
        stop_grace: Duration::from_secs(2),
        ..HostConfig::default()
    }
}

pub fn host(
    install_root: &Path,
    launcher: Arc<InMemoryLauncher>,
    collaborators: Collaborators,
) -> ExtensionHost {
    ExtensionHost::new(config(install_root), launcher, collaborators)
}

/// Poll until `ready` holds.
pub async fn wait_for(what: &str, ready: impl Fn() -> bool) {
    if tokio::time::timeout(Duration::from_secs(5), async {
        while !ready() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("timed out waiting for {what}");
    }
}

/// Poll until the host has a live sandbox from its `spawns`-th launch.
pub async fn wait_alive(host: &ExtensionHost, spawns: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !(host.state() == SandboxState::Alive && host.spawn_count() >= spawns) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sandbox did not come back");
}
