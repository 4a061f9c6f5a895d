//! WASM execution context using Extism (wasmtime).
//!
//! Each extension runs in its own Extism plugin with a memory cap and a
//! per-call fuel budget. Modules are validated before instantiation: size,
//! magic bytes and an import allow-list.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use crate::capability::Capability;
use crate::config::WasmLimits;
use crate::context::{ExtensionInstance, IsolatedExecutionContext};
use crate::error::SandboxError;
use crate::sanitize::sanitize_env;

/// WASM magic bytes.
const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// Import namespaces an extension module may reference.
const ALLOWED_IMPORT_NAMESPACES: &[&str] = &[
    "env",                    // Extism host functions
    "extism:host/env",        // Extism host functions (component model)
    "wasi_snapshot_preview1", // WASI preview 1 (when enabled)
    "wasi_unstable",          // Legacy WASI
];

/// Guest path the extension directory is mounted at when WASI is on.
const GUEST_EXTENSION_DIR: &str = "/extension";

// ─── Validation ─────────────────────────────────────────────────────────

/// Check magic bytes and the import allow-list.
pub fn validate_module(wasm_bytes: &[u8]) -> Result<(), SandboxError> {
    if wasm_bytes.len() < 4 || &wasm_bytes[..4] != WASM_MAGIC {
        return Err(SandboxError::WasmValidation(
            "invalid WASM binary: magic bytes mismatch".into(),
        ));
    }
    validate_imports(wasm_bytes)
}

fn validate_imports(wasm_bytes: &[u8]) -> Result<(), SandboxError> {
    use wasmparser::{Parser, Payload};

    for payload in Parser::new(0).parse_all(wasm_bytes) {
        let payload = payload
            .map_err(|e| SandboxError::WasmValidation(format!("failed to parse WASM: {e}")))?;

        if let Payload::ImportSection(reader) = payload {
            for import in reader {
                let import = import.map_err(|e| {
                    SandboxError::WasmValidation(format!("failed to read import: {e}"))
                })?;
                if !ALLOWED_IMPORT_NAMESPACES.contains(&import.module) {
                    return Err(SandboxError::WasmValidation(format!(
                        "unauthorized import namespace: '{}' (function: '{}')",
                        import.module, import.name
                    )));
                }
            }
        }
    }
    Ok(())
}

// ─── Context ────────────────────────────────────────────────────────────

/// Loads `.wasm` entry modules into Extism plugins.
#[derive(Debug, Clone, Default)]
pub struct WasmContext {
    limits: WasmLimits,
}

impl WasmContext {
    pub fn new(limits: WasmLimits) -> Self {
        Self { limits }
    }

    fn read_module(&self, entry: &Path, root: &Path, package_name: &str) -> Result<Vec<u8>, SandboxError> {
        if entry.extension().and_then(|e| e.to_str()) != Some("wasm") {
            return Err(SandboxError::load(
                package_name,
                format!("entry {} is not a .wasm module", entry.display()),
            ));
        }
        if !entry.starts_with(root) {
            return Err(SandboxError::load(
                package_name,
                "entry lies outside the extension directory",
            ));
        }

        let size = std::fs::metadata(entry)?.len();
        if size > self.limits.max_module_size {
            return Err(SandboxError::WasmValidation(format!(
                "WASM binary too large: {size} bytes (max: {} bytes)",
                self.limits.max_module_size
            )));
        }

        let bytes = std::fs::read(entry)?;
        validate_module(&bytes)?;
        Ok(bytes)
    }
}

impl IsolatedExecutionContext for WasmContext {
    fn load(
        &self,
        entry: &Path,
        root: &Path,
        capability: Arc<Capability>,
    ) -> Result<Box<dyn ExtensionInstance>, SandboxError> {
        let package_name = capability.package_name().to_string();
        let wasm_bytes = self.read_module(entry, root, &package_name)?;

        let mut manifest = extism::Manifest::new([extism::Wasm::data(wasm_bytes)])
            .with_memory_max((self.limits.memory_limit / 65536) as u32);
        for (key, value) in capability.config_entries() {
            manifest = manifest.with_config_key(key, value);
        }

        if self.limits.wasi_enabled {
            tracing::warn!(
                package_name = %package_name,
                "WASI enabled for extension; it can read its install directory"
            );
            let env = sanitize_env(std::env::vars());
            let env_json = serde_json::to_string(&env.into_iter().collect::<std::collections::BTreeMap<_, _>>())?;
            manifest = manifest
                .with_config_key("env", env_json)
                .with_allowed_path(root.to_string_lossy().into_owned(), GUEST_EXTENSION_DIR);
        }

        let plugin = extism::PluginBuilder::new(manifest)
            .with_wasi(self.limits.wasi_enabled)
            .with_fuel_limit(self.limits.fuel_limit)
            .build()
            .map_err(|e| SandboxError::load(&package_name, e))?;

        tracing::debug!(package_name = %package_name, entry = %entry.display(), "WASM module instantiated");

        Ok(Box::new(WasmInstance {
            plugin,
            package_name,
        }))
    }
}

// ─── Instance ───────────────────────────────────────────────────────────

/// A loaded WASM extension. Hooks are exported functions taking and
/// returning JSON bytes.
pub struct WasmInstance {
    plugin: extism::Plugin,
    package_name: String,
}

impl std::fmt::Debug for WasmInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmInstance")
            .field("package_name", &self.package_name)
            .finish_non_exhaustive()
    }
}

impl ExtensionInstance for WasmInstance {
    fn has_hook(&self, hook: &str) -> bool {
        self.plugin.function_exists(hook)
    }

    fn call_hook(&mut self, hook: &str, input: &Value) -> Result<Value, SandboxError> {
        let input_bytes = serde_json::to_vec(input)?;

        // Fuel is reset at the start of every call by the builder's limit.
        let output = self
            .plugin
            .call::<&[u8], Vec<u8>>(hook, &input_bytes)
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("fuel") {
                    SandboxError::FuelExhausted(self.package_name.clone())
                } else if msg.contains("memory") {
                    SandboxError::MemoryExceeded(self.package_name.clone())
                } else {
                    SandboxError::Hook {
                        package_name: self.package_name.clone(),
                        hook: hook.to_string(),
                        message: msg,
                    }
                }
            })?;

        if output.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&output)?)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
