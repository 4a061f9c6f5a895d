//! Sandbox runtime configuration.
//!
//! The host passes the launch parameters as environment variables when it
//! spawns the sandbox; changing them requires a respawn.

use std::path::PathBuf;

/// Environment variable carrying the `:`-separated discovery paths.
pub const ENV_SEARCH_PATHS: &str = "SOUNDTIME_EXT_SEARCH_PATHS";
/// Environment variable carrying the log directory.
pub const ENV_LOG_DIR: &str = "SOUNDTIME_EXT_LOG_DIR";
/// Environment variable carrying the application install root.
pub const ENV_APP_ROOT: &str = "SOUNDTIME_APP_ROOT";

// ─── WASM limits ────────────────────────────────────────────────────────

/// Per-extension execution limits.
#[derive(Debug, Clone)]
pub struct WasmLimits {
    /// Maximum memory in bytes (default: 32 MB).
    pub memory_limit: usize,
    /// Maximum fuel (instructions) per call (default: 1_000_000).
    pub fuel_limit: u64,
    /// Maximum size of an entry module (default: 50 MB).
    pub max_module_size: u64,
    /// Whether to enable WASI (default: false).
    /// When false, extensions cannot access env vars, filesystem, or stdio.
    pub wasi_enabled: bool,
}

impl Default for WasmLimits {
    fn default() -> Self {
        Self {
            memory_limit: 32 * 1024 * 1024,
            fuel_limit: 1_000_000,
            max_module_size: 50 * 1024 * 1024,
            wasi_enabled: false,
        }
    }
}

impl WasmLimits {
    pub fn from_env() -> Self {
        Self {
            memory_limit: std::env::var("EXTENSION_MEMORY_LIMIT_MB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(32)
                * 1024
                * 1024,
            fuel_limit: std::env::var("EXTENSION_FUEL_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000_000),
            max_module_size: std::env::var("EXTENSION_WASM_MAX_SIZE_MB")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(50)
                * 1024
                * 1024,
            wasi_enabled: std::env::var("EXTENSION_WASI_ENABLED")
                .unwrap_or_default()
                .eq_ignore_ascii_case("true"),
        }
    }
}

// ─── Runtime config ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Directories scanned for extension packages.
    pub search_paths: Vec<PathBuf>,
    /// Where `extensions.log` is written. `None` disables the file sink.
    pub log_dir: Option<PathBuf>,
    /// Install root of the host application, exposed to extensions.
    pub app_root: PathBuf,
    pub limits: WasmLimits,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let search_paths = std::env::var(ENV_SEARCH_PATHS)
            .map(|v| split_paths(&v))
            .unwrap_or_default();

        Self {
            search_paths,
            log_dir: std::env::var(ENV_LOG_DIR)
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            app_root: std::env::var(ENV_APP_ROOT)
                .map(PathBuf::from)
                .unwrap_or_default(),
            limits: WasmLimits::from_env(),
        }
    }
}

fn split_paths(value: &str) -> Vec<PathBuf> {
    value
        .split(':')
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_default() {
        let limits = WasmLimits::default();
        assert_eq!(limits.memory_limit, 32 * 1024 * 1024);
        assert_eq!(limits.fuel_limit, 1_000_000);
        assert!(!limits.wasi_enabled);
    }

    #[test]
    fn test_split_paths() {
        assert_eq!(
            split_paths("/a/ext::/b/ext:"),
            vec![PathBuf::from("/a/ext"), PathBuf::from("/b/ext")]
        );
        assert!(split_paths("").is_empty());
    }

    #[test]
    fn test_config_from_env() {
        std::env::set_var(ENV_SEARCH_PATHS, "/opt/ext:/home/u/ext");
        std::env::set_var(ENV_LOG_DIR, "/var/log/soundtime");
        std::env::set_var(ENV_APP_ROOT, "/opt/soundtime");
        std::env::set_var("EXTENSION_MEMORY_LIMIT_MB", "64");
        std::env::set_var("EXTENSION_WASI_ENABLED", "TRUE");

        let config = RuntimeConfig::from_env();
        assert_eq!(config.search_paths.len(), 2);
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/soundtime")));
        assert_eq!(config.app_root, PathBuf::from("/opt/soundtime"));
        assert_eq!(config.limits.memory_limit, 64 * 1024 * 1024);
        assert!(config.limits.wasi_enabled);

        std::env::remove_var(ENV_SEARCH_PATHS);
        std::env::remove_var(ENV_LOG_DIR);
        std::env::remove_var(ENV_APP_ROOT);
        std::env::remove_var("EXTENSION_MEMORY_LIMIT_MB");
        std::env::remove_var("EXTENSION_WASI_ENABLED");
    }
}
