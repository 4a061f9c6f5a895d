//! Isolation seam between the runtime and extension code.
//!
//! The runtime never executes extension code directly. It asks an
//! [`IsolatedExecutionContext`] to load an entry module together with the
//! extension's [`Capability`], and gets back an [`ExtensionInstance`] whose
//! hooks it can invoke by name. The WASM implementation lives in
//! [`crate::wasm`].

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::capability::{Capability, HostRequest};
use crate::error::SandboxError;

/// Lifecycle hook run when an extension is started.
pub const HOOK_STARTED: &str = "on_started";
/// Lifecycle hook run when an extension is stopped.
pub const HOOK_STOPPED: &str = "on_stopped";
/// Invoked for `perform-account-login`.
pub const HOOK_ACCOUNT_LOGIN: &str = "handle_account_login";
/// Invoked when one of the extension's context-menu entries is clicked.
pub const HOOK_CONTEXT_MENU: &str = "handle_context_menu";
/// Receives the outcome of each host call the extension requested.
pub const HOOK_HOST_REPLY: &str = "handle_host_reply";
/// Optional export returning the extension's preference schema.
pub const EXPORT_PREFERENCES: &str = "preferences";

/// A loaded extension, callable by hook name.
pub trait ExtensionInstance: Send {
    /// Whether the extension exports `hook`.
    fn has_hook(&self, hook: &str) -> bool;

    /// Run `hook` with a JSON input and return its raw JSON output
    /// (`Value::Null` when the hook produced nothing).
    fn call_hook(&mut self, hook: &str, input: &Value) -> Result<Value, SandboxError>;
}

/// A sandboxing primitive able to load extension entry modules.
pub trait IsolatedExecutionContext: Send + Sync {
    /// Load `entry` (which must live under `root`, the extension's install
    /// directory) with `capability` as its only window onto the host.
    ///
    /// Failure means "failed to load": the caller skips the extension.
    fn load(
        &self,
        entry: &Path,
        root: &Path,
        capability: Arc<Capability>,
    ) -> Result<Box<dyn ExtensionInstance>, SandboxError>;
}

// ─── Hook output ────────────────────────────────────────────────────────

/// What a hook hands back: its response plus any host calls it wants made.
///
/// A hook may return a bare value, or an object of the form
/// `{"response": ..., "host_requests": [{"function": ..., "args": ...}]}`.
#[derive(Debug, Default, PartialEq)]
pub struct HookOutput {
    pub response: Value,
    pub host_requests: Vec<HostRequest>,
}

#[derive(Deserialize)]
struct EnvelopedOutput {
    #[serde(default)]
    response: Value,
    #[serde(default)]
    host_requests: Vec<HostRequest>,
}

impl HookOutput {
    pub fn from_value(raw: Value) -> Result<Self, SandboxError> {
        let enveloped = raw
            .as_object()
            .is_some_and(|map| map.contains_key("response") || map.contains_key("host_requests"));
        if !enveloped {
            return Ok(Self {
                response: raw,
                host_requests: Vec::new(),
            });
        }
        let parsed: EnvelopedOutput = serde_json::from_value(raw)?;
        Ok(Self {
            response: parsed.response,
            host_requests: parsed.host_requests,
        })
    }
}
