//! Logging setup with optional rotated log files.
//!
//! Each run writes to `sync.log` inside the configured directory. On startup the previous
//! `sync.log` is archived as `block-sync.YYYY-MM-DD.HHMMSS.log` and the oldest archives
//! beyond `max_files` are removed.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{LoggingError, LoggingResult};

const ARCHIVE_PREFIX: &str = "block-sync.";
const ACTIVE_LOG_NAME: &str = "sync.log";
const ARCHIVE_TIME_FORMAT: &str = "%Y-%m-%d.%H%M%S";

/// Keeps the non-blocking file writer alive. Buffered entries are flushed when dropped.
#[derive(Debug)]
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

/// Configuration for logging output.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level filter. `None` reads `RUST_LOG` and falls back to INFO.
    pub level: Option<LevelFilter>,
    /// Write to stderr.
    pub console: bool,
    pub file: Option<LogFileConfig>,
}

impl LoggingConfig {
    pub fn console(level: LevelFilter) -> Self {
        Self {
            level: Some(level),
            console: true,
            file: None,
        }
    }

    pub fn with_file(mut self, file: LogFileConfig) -> Self {
        self.file = Some(file);
        self
    }
}

/// Configuration for log file output.
#[derive(Debug, Clone)]
pub struct LogFileConfig {
    pub log_dir: PathBuf,
    /// Number of archived run logs to keep.
    pub max_files: usize,
}

impl LogFileConfig {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            max_files: 20,
        }
    }
}

/// Initialize console-only logging with the given level.
pub fn init_console_logging(level: LevelFilter) -> LoggingResult<LoggingGuard> {
    init_logging(LoggingConfig::console(level))
}

/// Install the global tracing subscriber.
///
/// With neither console nor file output the call is a no-op and tracing macros stay silent.
/// Fails if the log directory cannot be prepared or a global subscriber is already set.
///
/// ```no_run
/// use block_sync::logging::{init_logging, LogFileConfig, LoggingConfig};
/// use block_sync::LevelFilter;
///
/// let _guard = init_logging(
///     LoggingConfig::console(LevelFilter::DEBUG)
///         .with_file(LogFileConfig::new("/var/lib/node/logs")),
/// )
/// .unwrap();
/// ```
pub fn init_logging(config: LoggingConfig) -> LoggingResult<LoggingGuard> {
    if !config.console && config.file.is_none() {
        return Ok(LoggingGuard {
            _worker_guard: None,
        });
    }

    let env_filter = match config.level {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(LevelFilter::INFO.to_string())),
    };

    let (file_layer, guard) = match config.file {
        Some(ref file_config) => {
            let (writer, guard) = open_run_log(file_config)?;
            let layer = fmt::layer().with_target(true).with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let console_layer = config.console.then(|| fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| LoggingError::SubscriberInit(e.to_string()))?;

    Ok(LoggingGuard {
        _worker_guard: guard,
    })
}

/// Archive the previous run log, prune old archives and open a fresh run log.
fn open_run_log(config: &LogFileConfig) -> LoggingResult<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(&config.log_dir)?;
    archive_run_log(&config.log_dir)?;
    prune_archives(&config.log_dir, config.max_files)?;

    let file = File::create(config.log_dir.join(ACTIVE_LOG_NAME))?;
    Ok(tracing_appender::non_blocking(file))
}

fn archive_run_log(log_dir: &Path) -> LoggingResult<()> {
    let run_log = log_dir.join(ACTIVE_LOG_NAME);
    if !run_log.exists() {
        return Ok(());
    }

    let stamp =
        modified_at(&run_log).unwrap_or_else(Local::now).format(ARCHIVE_TIME_FORMAT).to_string();
    let target = std::iter::once(format!("{}{}.log", ARCHIVE_PREFIX, stamp))
        .chain((1..=999).map(|i| format!("{}{}-{}.log", ARCHIVE_PREFIX, stamp, i)))
        .map(|name| log_dir.join(name))
        .find(|path| !path.exists())
        .ok_or_else(|| {
            LoggingError::RotationFailed("too many log files with same timestamp".to_string())
        })?;

    fs::rename(&run_log, &target).map_err(|e| LoggingError::RotationFailed(e.to_string()))
}

fn modified_at(path: &Path) -> Option<DateTime<Local>> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::from(modified))
}

fn is_archive(name: &str) -> bool {
    name.starts_with(ARCHIVE_PREFIX) && name.ends_with(".log")
}

/// Delete the oldest archives so at most `max_files` remain. The active log is never touched.
fn prune_archives(log_dir: &Path, max_files: usize) -> LoggingResult<()> {
    let mut archives: Vec<_> = fs::read_dir(log_dir)
        .map_err(|e| LoggingError::RotationFailed(format!("failed to read log dir: {}", e)))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_str().map(is_archive).unwrap_or(false))
        .collect();

    if archives.len() <= max_files {
        return Ok(());
    }

    archives.sort_by_key(|entry| entry.metadata().and_then(|m| m.modified()).ok());

    let excess = archives.len() - max_files;
    for entry in archives.into_iter().take(excess) {
        if let Err(e) = fs::remove_file(entry.path()) {
            tracing::warn!("Failed to remove old log file {:?}: {}", entry.path(), e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    fn archives(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| is_archive(name))
            .collect()
    }

    fn write_archives(dir: &Path, count: usize) {
        for i in 1..=count {
            let mut file =
                File::create(dir.join(format!("block-sync.2025-03-{:02}.080000.log", i))).unwrap();
            writeln!(file, "run {}", i).unwrap();
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_archive_without_run_log_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        archive_run_log(temp_dir.path()).unwrap();
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_archive_keeps_content() {
        let temp_dir = TempDir::new().unwrap();
        let mut file = File::create(temp_dir.path().join(ACTIVE_LOG_NAME)).unwrap();
        writeln!(file, "INFO requesting block peer=4").unwrap();
        drop(file);

        archive_run_log(temp_dir.path()).unwrap();

        assert!(!temp_dir.path().join(ACTIVE_LOG_NAME).exists());
        let names = archives(temp_dir.path());
        assert_eq!(names.len(), 1);
        let content = fs::read_to_string(temp_dir.path().join(&names[0])).unwrap();
        assert!(content.contains("requesting block peer=4"));
    }

    #[test]
    fn test_prune_keeps_newest() {
        let temp_dir = TempDir::new().unwrap();
        write_archives(temp_dir.path(), 6);
        File::create(temp_dir.path().join(ACTIVE_LOG_NAME)).unwrap();
        File::create(temp_dir.path().join("notes.txt")).unwrap();

        prune_archives(temp_dir.path(), 2).unwrap();

        let mut names = archives(temp_dir.path());
        names.sort();
        assert_eq!(
            names,
            vec!["block-sync.2025-03-05.080000.log", "block-sync.2025-03-06.080000.log"]
        );
        assert!(temp_dir.path().join(ACTIVE_LOG_NAME).exists());
        assert!(temp_dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_prune_under_limit() {
        let temp_dir = TempDir::new().unwrap();
        write_archives(temp_dir.path(), 3);
        prune_archives(temp_dir.path(), 10).unwrap();
        assert_eq!(archives(temp_dir.path()).len(), 3);
    }

    #[test]
    fn test_open_run_log_creates_nested_dir() {
        let temp_dir = TempDir::new().unwrap();
        let log_dir = temp_dir.path().join("node").join("logs");

        let result = open_run_log(&LogFileConfig {
            log_dir: log_dir.clone(),
            max_files: 5,
        });

        assert!(result.is_ok());
        assert!(log_dir.join(ACTIVE_LOG_NAME).exists());
    }

    #[test]
    fn test_init_logging_without_outputs() {
        let result = init_logging(LoggingConfig {
            level: Some(LevelFilter::DEBUG),
            console: false,
            file: None,
        });
        assert!(result.is_ok());
    }
}
