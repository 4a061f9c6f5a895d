//! Scripted extensions for driving the runtime without WASM.
//!
//! An extension's entry file is a JSON object mapping hook names to the
//! value the hook returns. Two sentinels are understood: `"__echo"` returns
//! the hook input, and `{"__fail": "msg"}` makes the hook fail.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use soundtime_ext_core::{Endpoint, EndpointConfig, Inbound, MessageType, Request};
use soundtime_ext_sandbox::{
    Capability, ExtensionInstance, IsolatedExecutionContext, LogLevelControl, RuntimeConfig,
    SandboxError,
};
use tokio::sync::mpsc;

pub type CallLog = Arc<Mutex<Vec<(String, String)>>>;

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
        if let Some(reason) = script.get("__load_error").and_then(Value::as_str) {
            return Err(SandboxError::Load {
                package_name: capability.package_name().to_string(),
                message: reason.to_string(),
            });
        }
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

/// Write `<root>/<dir>/extension.toml` and its scripted entry.
pub fn write_extension(root: &Path, dir: &str, package_name: &str, version: &str, script: Value) -> PathBuf {
    let path = root.join(dir);
    std::fs::create_dir_all(&path).unwrap();
    std::fs::write(
        path.join("extension.toml"),
        format!(
            "soundtime_extension = true\n\
             package_name = \"{package_name}\"\n\
             display_name = \"{package_name} display\"\n\
             version = \"{version}\"\n\
             entry = \"script.json\"\n"
        ),
    )
    .unwrap();
    std::fs::write(path.join("script.json"), serde_json::to_vec(&script).unwrap()).unwrap();
    path
}

/// A running sandbox with a host-side endpoint connected to it.
pub struct Harness {
    pub host: Endpoint,
    pub calls: CallLog,
    /// Sandbox→host requests, as seen by the fake host.
    pub seen: mpsc::UnboundedReceiver<Request>,
    pub sandbox: tokio::task::JoinHandle<()>,
}

pub async fn start(search_path: &Path) -> Harness {
    let (host_io, sandbox_io) = tokio::io::duplex(256 * 1024);
    let (sr, sw) = tokio::io::split(sandbox_io);
    let context = ScriptedContext::default();
    let calls = Arc::clone(&context.calls);
    let config = RuntimeConfig {
        search_paths: vec![search_path.to_path_buf()],
        app_root: PathBuf::from("/opt/soundtime"),
        ..RuntimeConfig::default()
    };
    let sandbox = tokio::spawn(soundtime_ext_sandbox::serve(
        sr,
        sw,
        config,
        Arc::new(context),
        LogLevelControl::default(),
    ));

    let (hr, hw) = tokio::io::split(host_io);
    let (host, mut inbound) = Endpoint::spawn(hr, hw, EndpointConfig::labeled("host"));
    let (seen_tx, seen) = mpsc::unbounded_channel();
    let replier = host.clone();
    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            let Inbound::Request(request) = message else {
                continue;
            };
            if !request.message_type.is_fire_and_forget() {
                let data = match request.message_type {
                    MessageType::GetSongs => json!([{"_id": "lib-1"}]),
                    _ => Value::Bool(true),
                };
                let _ = replier.reply(request.channel.clone(), Ok(data));
            }
            let _ = seen_tx.send(request);
        }
    });

    Harness {
        host,
        calls,
        seen,
        sandbox,
    }
}

impl Harness {
    pub fn hook_calls(&self, hook: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, h)| h == hook)
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub async fn call(&self, message_type: MessageType, data: Value) -> Value {
        self.host.request(message_type, data).await.unwrap()
    }
}
