//! Per-extension labeled log output.
//!
//! Every extension logs through its own [`LogSink`]. Lines are mirrored to
//! `tracing` and appended to `<log_dir>/extensions.log` as
//! `<rfc3339> <LEVEL> [<packageName>] <message>`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::level_filters::LevelFilter;
use tracing::Level;

use crate::error::SandboxError;
use crate::sanitize::sanitize_log_message;

/// File name of the shared extension log inside the log directory.
pub const LOG_FILE_NAME: &str = "extensions.log";

type ReloadFn = dyn Fn(LevelFilter) -> Result<(), String> + Send + Sync;

// ─── Level control ──────────────────────────────────────────────────────

/// Runtime log level shared by every sink and, when installed, the
/// process-wide `tracing` filter.
#[derive(Clone)]
pub struct LogLevelControl {
    threshold: Arc<RwLock<LevelFilter>>,
    reload: Option<Arc<ReloadFn>>,
}

impl std::fmt::Debug for LogLevelControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogLevelControl")
            .field("threshold", &self.current())
            .field("reload", &self.reload.is_some())
            .finish()
    }
}

impl Default for LogLevelControl {
    fn default() -> Self {
        Self::new(LevelFilter::INFO)
    }
}

impl LogLevelControl {
    pub fn new(initial: LevelFilter) -> Self {
        Self {
            threshold: Arc::new(RwLock::new(initial)),
            reload: None,
        }
    }

    /// Also apply level changes to the subscriber's filter.
    pub fn with_reload<F>(mut self, reload: F) -> Self
    where
        F: Fn(LevelFilter) -> Result<(), String> + Send + Sync + 'static,
    {
        self.reload = Some(Arc::new(reload));
        self
    }

    pub fn current(&self) -> LevelFilter {
        *self.threshold.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Parse and apply a level name (`"debug"`, `"warn"`, `"off"`, ...).
    pub fn set(&self, level: &str) -> Result<LevelFilter, SandboxError> {
        let filter = LevelFilter::from_str(level.trim())
            .map_err(|_| SandboxError::invalid(format!("unknown log level '{level}'")))?;

        if let Some(reload) = &self.reload {
            reload(filter).map_err(SandboxError::invalid)?;
        }
        *self.threshold.write().unwrap_or_else(PoisonError::into_inner) = filter;

        tracing::info!(level = %filter, "log level changed");
        Ok(filter)
    }

    pub fn enabled(&self, level: Level) -> bool {
        level <= self.current()
    }
}

// ─── Log file ───────────────────────────────────────────────────────────

/// Append handle to `extensions.log`, shared by all sinks.
#[derive(Clone, Default)]
pub struct LogFile {
    file: Option<Arc<Mutex<File>>>,
}

impl LogFile {
    /// Open (creating if needed) the log file inside `log_dir`.
    pub fn open(log_dir: &Path) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(log_dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(LOG_FILE_NAME))?;
        Ok(Self {
            file: Some(Arc::new(Mutex::new(file))),
        })
    }

    /// A sink target that only mirrors to `tracing`.
    pub fn disabled() -> Self {
        Self::default()
    }

    fn append(&self, line: &str) {
        let Some(file) = &self.file else { return };
        let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = file.write_all(line.as_bytes()) {
            tracing::warn!("failed to write extension log: {e}");
        }
    }
}

// ─── Sink ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct LogSink {
    package_name: String,
    file: LogFile,
    levels: LogLevelControl,
}

impl LogSink {
    pub fn new(package_name: &str, file: LogFile, levels: LogLevelControl) -> Self {
        Self {
            package_name: package_name.to_string(),
            file,
            levels,
        }
    }

    pub fn log(&self, level: Level, message: &str) {
        if !self.levels.enabled(level) {
            return;
        }
        let msg = sanitize_log_message(message);

        match level {
            Level::ERROR => tracing::error!(package_name = %self.package_name, "{msg}"),
            Level::WARN => tracing::warn!(package_name = %self.package_name, "{msg}"),
            Level::INFO => tracing::info!(package_name = %self.package_name, "{msg}"),
            Level::DEBUG => tracing::debug!(package_name = %self.package_name, "{msg}"),
            Level::TRACE => tracing::trace!(package_name = %self.package_name, "{msg}"),
        }

        let line = format!(
            "{} {} [{}] {}\n",
            chrono::Utc::now().to_rfc3339(),
            level,
            self.package_name,
            msg
        );
        self.file.append(&line);
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_log(dir: &Path) -> String {
        std::fs::read_to_string(dir.join(LOG_FILE_NAME)).unwrap_or_default()
    }

    #[test]
    fn test_lines_are_labeled() {
        let dir = tempfile::tempdir().unwrap();
        let file = LogFile::open(dir.path()).unwrap();
        let levels = LogLevelControl::default();

        LogSink::new("demo-ext", file.clone(), levels.clone()).log(Level::INFO, "hello");
        LogSink::new("other-ext", file, levels).log(Level::ERROR, "boom\x07");

        let content = read_log(dir.path());
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" INFO [demo-ext] hello"), "{}", lines[0]);
        assert!(lines[1].ends_with(" ERROR [other-ext] boom"), "{}", lines[1]);
        // rfc3339 timestamp first
        let stamp = lines[0].split(' ').next().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }

    #[test]
    fn test_level_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let levels = LogLevelControl::new(LevelFilter::WARN);
        let sink = LogSink::new("demo-ext", LogFile::open(dir.path()).unwrap(), levels.clone());

        sink.log(Level::INFO, "dropped");
        sink.log(Level::WARN, "kept");
        levels.set("debug").unwrap();
        sink.log(Level::DEBUG, "now kept");

        let content = read_log(dir.path());
        assert!(!content.contains("dropped"));
        assert!(content.contains("kept"));
        assert!(content.contains("now kept"));
    }

    #[test]
    fn test_set_unknown_level() {
        let levels = LogLevelControl::default();
        assert!(levels.set("loud").is_err());
        assert_eq!(levels.current(), LevelFilter::INFO);
    }

    #[test]
    fn test_reload_hook_called() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let levels = LogLevelControl::default().with_reload(move |filter| {
            seen_clone.lock().unwrap().push(filter);
            Ok(())
        });
        levels.set("trace").unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![LevelFilter::TRACE]);

        let failing = LogLevelControl::default().with_reload(|_| Err("reload failed".into()));
        assert!(failing.set("debug").is_err());
        assert_eq!(failing.current(), LevelFilter::INFO);
    }

    #[test]
    fn test_disabled_file_only_mirrors() {
        let sink = LogSink::new("demo-ext", LogFile::disabled(), LogLevelControl::default());
        sink.log(Level::INFO, "no file");
        assert_eq!(sink.package_name(), "demo-ext");
    }
}
