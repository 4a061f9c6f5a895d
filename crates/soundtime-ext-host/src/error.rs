//! Host controller and installer error types.

use serde::Serialize;
use soundtime_ext_core::{ManifestError, ProtocolError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("failed to spawn sandbox: {0}")]
    Spawn(String),

    #[error("extension host is closed")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HostError {
    /// Whether the sandbox was unreachable (dead, respawning or closed).
    pub fn is_peer_unavailable(&self) -> bool {
        matches!(
            self,
            HostError::Closed | HostError::Protocol(ProtocolError::PeerUnavailable)
        )
    }
}

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("invalid extension package: {0}")]
    Validation(String),

    #[error(
        "{package_name} {installed} is already installed (candidate version {candidate} is not newer)"
    )]
    Duplicate {
        package_name: String,
        installed: String,
        candidate: String,
    },

    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl From<ManifestError> for InstallError {
    fn from(err: ManifestError) -> Self {
        InstallError::Validation(err.to_string())
    }
}

/// Outcome of an install or uninstall, returned as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_name: Option<String>,
}

impl InstallResult {
    pub fn ok(package_name: &str, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            package_name: Some(package_name.to_string()),
        }
    }

    pub fn failed(err: &InstallError) -> Self {
        let package_name = match err {
            InstallError::Duplicate { package_name, .. } => Some(package_name.clone()),
            _ => None,
        };
        Self {
            success: false,
            message: err.to_string(),
            package_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_message() {
        let err = InstallError::Duplicate {
            package_name: "demo-ext".into(),
            installed: "2.0.0".into(),
            candidate: "1.0.0".into(),
        };
        let result = InstallResult::failed(&err);
        assert!(!result.success);
        assert_eq!(result.package_name.as_deref(), Some("demo-ext"));
        assert!(result.message.contains("already installed"));
    }

    #[test]
    fn test_manifest_error_is_validation() {
        let err: InstallError = ManifestError::Validation("entry is required".into()).into();
        assert!(matches!(err, InstallError::Validation(_)));
        assert!(err.to_string().contains("entry is required"));
    }

    #[test]
    fn test_peer_unavailable() {
        assert!(HostError::Closed.is_peer_unavailable());
        assert!(HostError::from(ProtocolError::PeerUnavailable).is_peer_unavailable());
        assert!(!HostError::Spawn("x".into()).is_peer_unavailable());
    }

    #[test]
    fn test_install_result_shape() {
        let value = serde_json::to_value(InstallResult::ok("demo-ext", "installed")).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["packageName"], "demo-ext");
    }
}
