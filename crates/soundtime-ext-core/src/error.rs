//! Protocol and manifest error types.

use std::time::Duration;

use thiserror::Error;

use crate::message::MessageType;

/// Failures of the request/reply layer.
///
/// Cloneable so that a single peer-death can be fanned out to every
/// outstanding call.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("peer unavailable: sandbox process is not running")]
    PeerUnavailable,

    #[error("request {message_type:?} timed out after {after:?}")]
    Timeout {
        message_type: MessageType,
        after: Duration,
    },

    #[error("remote error: {0}")]
    Remote(String),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("frame too large: {size} bytes (max: {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    #[error("io error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

/// Failures while parsing or validating an `extension.toml`.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("invalid manifest: {0}")]
    Validation(String),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("semver error: {0}")]
    Semver(#[from] semver::Error),
}
