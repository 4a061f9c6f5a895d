//! Host controller configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the sandbox binary.
pub const ENV_SANDBOX_BIN: &str = "SOUNDTIME_EXT_SANDBOX_BIN";
/// Environment variable naming the extension install root.
pub const ENV_EXTENSION_DIR: &str = "SOUNDTIME_EXT_DIR";
pub const ENV_LOG_DIR: &str = "SOUNDTIME_EXT_LOG_DIR";
pub const ENV_APP_ROOT: &str = "SOUNDTIME_APP_ROOT";

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Path of the `soundtime-ext-sandbox` executable.
    pub sandbox_bin: PathBuf,
    /// Install root; one subdirectory per package. Also the sandbox's
    /// discovery search path.
    pub extension_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub app_root: PathBuf,
    /// Timeout applied to every must-reply request (default: 30 s).
    pub request_timeout: Duration,
    /// How long `stop-process` may take before the sandbox is killed
    /// (default: 5 s).
    pub stop_grace: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            sandbox_bin: PathBuf::from("soundtime-ext-sandbox"),
            extension_dir: PathBuf::from("extensions"),
            log_dir: None,
            app_root: PathBuf::from("."),
            request_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl HostConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sandbox_bin: std::env::var(ENV_SANDBOX_BIN)
                .map(PathBuf::from)
                .unwrap_or(defaults.sandbox_bin),
            extension_dir: std::env::var(ENV_EXTENSION_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.extension_dir),
            log_dir: std::env::var(ENV_LOG_DIR)
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            app_root: std::env::var(ENV_APP_ROOT)
                .map(PathBuf::from)
                .unwrap_or(defaults.app_root),
            request_timeout: std::env::var("SOUNDTIME_EXT_REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            stop_grace: std::env::var("SOUNDTIME_EXT_STOP_GRACE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.stop_grace),
        }
    }
}
