//! SoundTime extension sandbox runtime.
//!
//! Runs inside the isolated sandbox process. Discovers installed extensions,
//! loads each into its own WASM execution context with a frozen
//! per-extension [`Capability`], and answers the host's requests over the
//! framed protocol from [`soundtime_ext_core`].

pub mod accounts;
pub mod capability;
pub mod config;
pub mod context;
pub mod context_menu;
pub mod discovery;
pub mod error;
pub mod log_sink;
pub mod registry;
pub mod runtime;
pub mod sanitize;
pub mod wasm;

pub use capability::{Capability, HostReply, HostRequest, SharedStores};
pub use config::{RuntimeConfig, WasmLimits};
pub use context::{ExtensionInstance, HookOutput, IsolatedExecutionContext};
pub use error::SandboxError;
pub use log_sink::{LogFile, LogLevelControl, LogSink};
pub use registry::{ExtensionRegistry, LoadedExtension, RegistryFilter};
pub use runtime::{serve, SandboxRuntime};
pub use wasm::WasmContext;
