//! Sandbox runtime error types.

use soundtime_ext_core::{ManifestError, ProtocolError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("failed to load extension {package_name}: {message}")]
    Load {
        package_name: String,
        message: String,
    },

    #[error("hook {hook} of {package_name} failed: {message}")]
    Hook {
        package_name: String,
        hook: String,
        message: String,
    },

    #[error("extension not found: {0}")]
    NotFound(String),

    #[error("extension already registered: {0}")]
    AlreadyRegistered(String),

    #[error("WASM validation error: {0}")]
    WasmValidation(String),

    #[error("execution timeout: extension {0} exceeded fuel limit")]
    FuelExhausted(String),

    #[error("memory limit exceeded: extension {0}")]
    MemoryExceeded(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SandboxError {
    pub(crate) fn load(package_name: &str, message: impl std::fmt::Display) -> Self {
        SandboxError::Load {
            package_name: package_name.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn invalid(message: impl std::fmt::Display) -> Self {
        SandboxError::InvalidRequest(message.to_string())
    }
}
