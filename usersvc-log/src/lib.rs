//! Structured logging for usersvc
//!
//! Installs a global `tracing` subscriber writing JSON (or text) records
//! through a non-blocking writer. Servers log to hourly-rotated files under
//! `<log_root>/<app>/<server>/`. With a `lifetime` set, old files are pruned
//! at startup and then on every rotation period while the guard lives.
//!
//! # Examples
//!
//! ```no_run
//! use usersvc_log::*;
//!
//! let _guard = LogConfig::for_server("/var/log", "tars", "user")
//!     .level(LogLevel::Debug)
//!     .init()
//!     .expect("logging");
//!
//! info!("Application started");
//! ```
//!
//! The returned [`LogGuard`] flushes buffered records when dropped; keep it
//! alive for the lifetime of the process.

pub mod error;

pub use error::LogError;
pub use tracing::{debug, error, info, trace, warn};

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Shortest pause between two retention sweeps.
const MIN_PRUNE_INTERVAL: Duration = Duration::from_secs(1);

/// Log level for filtering messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    /// Convert to string for EnvFilter
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(LogError::Filter(format!("unknown log level: {}", other))),
        }
    }
}

/// Output format for log records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line (default)
    Json,
    Plain,
    Pretty,
    Compact,
}

/// Where log records go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// `path/filename`, rotated per [`Rotation`]
    File,
}

/// File rotation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    Never,
    Minutely,
    Hourly,
    Daily,
}

impl Rotation {
    /// Time between two rotations; `None` for [`Rotation::Never`].
    pub fn period(self) -> Option<Duration> {
        match self {
            Rotation::Never => None,
            Rotation::Minutely => Some(Duration::from_secs(60)),
            Rotation::Hourly => Some(Duration::from_secs(3600)),
            Rotation::Daily => Some(Duration::from_secs(24 * 3600)),
        }
    }

    fn to_tracing_rotation(self) -> tracing_appender::rolling::Rotation {
        match self {
            Rotation::Minutely => tracing_appender::rolling::Rotation::MINUTELY,
            Rotation::Hourly => tracing_appender::rolling::Rotation::HOURLY,
            Rotation::Daily => tracing_appender::rolling::Rotation::DAILY,
            Rotation::Never => tracing_appender::rolling::Rotation::NEVER,
        }
    }
}

/// Logging configuration
///
/// Deserializes from the `[log]` section of the service config; every field
/// is optional. The service derives `path` from `server.log_path`, so the
/// section does not set it.
///
/// ```toml
/// [log]
/// level = "debug"
/// format = "compact"
/// lifetime = "7days"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Directory holding the log files. Replaced by
    /// [`under`](Self::under) when the service places its logs.
    pub path: PathBuf,
    /// File name, and prefix of rotated files
    pub filename: String,
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Include source file and line in each record
    pub report_caller: bool,
    pub rotation: Rotation,
    /// Files older than this are removed at init and once per rotation
    /// period afterwards
    #[serde(with = "humantime_serde")]
    pub lifetime: Option<Duration>,
    /// Explicit filter directives, e.g. `usersvc=debug,reqwest=warn`.
    /// Overrides both `RUST_LOG` and `level`.
    pub env_filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logs"),
            filename: "app.log".to_string(),
            level: LogLevel::Info,
            format: LogFormat::Json,
            output: LogOutput::File,
            report_caller: true,
            rotation: Rotation::Hourly,
            lifetime: None,
            env_filter: None,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with `path` set to `<log_root>/<app>/<server>/`.
    pub fn for_server(log_root: impl AsRef<Path>, app: &str, server: &str) -> Self {
        Self::default().under(log_root, app, server)
    }

    /// Move this config's directory to `<log_root>/<app>/<server>/`.
    pub fn under(mut self, log_root: impl AsRef<Path>, app: &str, server: &str) -> Self {
        self.path = log_root.as_ref().join(app).join(server);
        self
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn report_caller(mut self, enable: bool) -> Self {
        self.report_caller = enable;
        self
    }

    pub fn rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Initialize the global subscriber.
    ///
    /// Returns a guard that must be kept alive for the duration of the
    /// program; dropping it flushes remaining records. Fails if a global
    /// subscriber is already installed.
    ///
    /// For file output with a `lifetime`, called inside a tokio runtime, the
    /// guard also owns a task repeating [`prune_expired`](Self::prune_expired)
    /// every [`prune_interval`](Self::prune_interval).
    pub fn init(self) -> Result<LogGuard, LogError> {
        let filter = self.build_filter()?;

        let (writer, worker) = match self.output {
            LogOutput::Stdout => tracing_appender::non_blocking(io::stdout()),
            LogOutput::Stderr => tracing_appender::non_blocking(io::stderr()),
            LogOutput::File => {
                fs::create_dir_all(&self.path).map_err(|e| LogError::io(&self.path, e))?;
                self.prune_expired()?;

                let appender = RollingFileAppender::builder()
                    .rotation(self.rotation.to_tracing_rotation())
                    .filename_prefix(self.filename.as_str())
                    .build(&self.path)?;
                tracing_appender::non_blocking(appender)
            }
        };

        self.subscriber(writer, filter)
            .try_init()
            .map_err(|e| LogError::AlreadyInitialized(e.to_string()))?;

        let is_file = self.output == LogOutput::File;
        let pruner = if is_file { self.spawn_pruner() } else { None };

        Ok(LogGuard {
            _worker: worker,
            directory: is_file.then_some(self.path),
            pruner,
        })
    }

    /// Time between retention sweeps: the rotation period capped by the
    /// lifetime, and never under one second. `None` without a lifetime.
    pub fn prune_interval(&self) -> Option<Duration> {
        let lifetime = self.lifetime?;
        let interval = match self.rotation.period() {
            Some(period) => period.min(lifetime),
            None => lifetime,
        };
        Some(interval.max(MIN_PRUNE_INTERVAL))
    }

    /// Start a task on the current tokio runtime that prunes expired files
    /// every [`prune_interval`](Self::prune_interval).
    ///
    /// Returns `None` without a lifetime or outside a runtime. The first sweep
    /// runs one interval after the call.
    pub fn spawn_pruner(&self) -> Option<JoinHandle<()>> {
        let interval = self.prune_interval()?;
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let config = self.clone();

        Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match config.prune_expired() {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "Pruned expired log files"),
                    Err(e) => tracing::warn!("Log retention sweep failed: {}", e),
                }
            }
        }))
    }

    fn build_filter(&self) -> Result<EnvFilter, LogError> {
        match &self.env_filter {
            Some(directives) => {
                EnvFilter::try_new(directives).map_err(|e| LogError::Filter(e.to_string()))
            }
            // RUST_LOG wins over the configured level
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))),
        }
    }

    /// Build (without installing) the subscriber this config describes.
    fn subscriber<W>(&self, writer: W, filter: EnvFilter) -> Box<dyn Subscriber + Send + Sync>
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let caller = self.report_caller;
        let ansi = self.output != LogOutput::File && self.format == LogFormat::Pretty;
        let registry = tracing_subscriber::registry().with(filter);

        match self.format {
            LogFormat::Json => Box::new(
                registry.with(
                    fmt::layer()
                        .json()
                        .with_writer(writer)
                        .with_current_span(true)
                        .with_span_list(false)
                        .with_target(true)
                        .with_file(caller)
                        .with_line_number(caller),
                ),
            ),
            LogFormat::Plain => Box::new(
                registry.with(
                    fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_file(caller)
                        .with_line_number(caller),
                ),
            ),
            LogFormat::Pretty => Box::new(
                registry.with(
                    fmt::layer()
                        .pretty()
                        .with_writer(writer)
                        .with_ansi(ansi)
                        .with_file(caller)
                        .with_line_number(caller),
                ),
            ),
            LogFormat::Compact => Box::new(
                registry.with(
                    fmt::layer()
                        .compact()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_file(caller)
                        .with_line_number(caller),
                ),
            ),
        }
    }

    /// Remove files in `path` named `filename*` that were last modified
    /// more than `lifetime` ago. Returns how many were removed.
    ///
    /// A missing directory or an unset lifetime removes nothing.
    pub fn prune_expired(&self) -> Result<usize, LogError> {
        let Some(lifetime) = self.lifetime else {
            return Ok(0);
        };

        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(LogError::io(&self.path, e)),
        };

        let now = SystemTime::now();
        let mut removed = 0;

        for entry in entries {
            let entry = entry.map_err(|e| LogError::io(&self.path, e))?;
            if !entry.file_name().to_string_lossy().starts_with(&self.filename) {
                continue;
            }

            let metadata = entry.metadata().map_err(|e| LogError::io(entry.path(), e))?;
            if !metadata.is_file() {
                continue;
            }

            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if age.is_some_and(|age| age > lifetime) {
                fs::remove_file(entry.path()).map_err(|e| LogError::io(entry.path(), e))?;
                removed += 1;
            }
        }

        Ok(removed)
    }
}

/// Keeps the background log writer alive.
#[must_use = "dropping the guard stops the log writer"]
pub struct LogGuard {
    _worker: WorkerGuard,
    directory: Option<PathBuf>,
    pruner: Option<JoinHandle<()>>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(pruner) = self.pruner.take() {
            pruner.abort();
        }
    }
}

impl LogGuard {
    /// Directory being written to, for file output.
    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    /// Whether a periodic retention task is running.
    pub fn is_pruning(&self) -> bool {
        self.pruner.as_ref().is_some_and(|pruner| !pruner.is_finished())
    }
}

impl std::fmt::Debug for LogGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogGuard")
            .field("directory", &self.directory)
            .field("pruning", &self.pruner.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// In-memory writer for rendering records without a global subscriber.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn render(config: &LogConfig) -> String {
        let captured = Captured::default();
        let subscriber = config.subscriber(captured.clone(), EnvFilter::new("info"));
        tracing::subscriber::with_default(subscriber, || tracing::info!("user service ready"));
        String::from_utf8(captured.0.lock().unwrap().clone()).unwrap()
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Trace.to_tracing_level(), Level::TRACE);
        assert_eq!(LogLevel::Debug.to_tracing_level(), Level::DEBUG);
        assert_eq!(LogLevel::Info.to_tracing_level(), Level::INFO);
        assert_eq!(LogLevel::Warn.to_tracing_level(), Level::WARN);
        assert_eq!(LogLevel::Error.to_tracing_level(), Level::ERROR);
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.filename, "app.log");
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.output, LogOutput::File);
        assert_eq!(config.rotation, Rotation::Hourly);
        assert!(config.report_caller);
        assert!(config.lifetime.is_none());
    }

    #[test]
    fn test_for_server_layout() {
        let config = LogConfig::for_server("/var/log", "tars", "user");
        assert_eq!(config.path, PathBuf::from("/var/log/tars/user"));
    }

    #[test]
    fn test_deserialize_partial_section() {
        let config: LogConfig = toml::from_str(
            r#"
            path = "/tmp/usersvc"
            level = "debug"
            output = "stdout"
            lifetime = "7days"
            "#,
        )
        .unwrap();

        assert_eq!(config.path, PathBuf::from("/tmp/usersvc"));
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.output, LogOutput::Stdout);
        assert_eq!(config.lifetime, Some(Duration::from_secs(7 * 24 * 3600)));
        assert_eq!(config.filename, "app.log");
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let config = LogConfig::new().with_env_filter("usersvc=[");
        assert!(matches!(config.build_filter(), Err(LogError::Filter(_))));
    }

    #[test]
    fn test_prune_expired() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.log.2024-01-01-00"), b"old").unwrap();
        fs::write(dir.path().join("other.txt"), b"keep").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let config = LogConfig::new()
            .path(dir.path())
            .lifetime(Duration::from_millis(10));

        assert_eq!(config.prune_expired().unwrap(), 1);
        assert!(!dir.path().join("app.log.2024-01-01-00").exists());
        assert!(dir.path().join("other.txt").exists());
    }

    #[test]
    fn test_prune_without_lifetime_keeps_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.log"), b"x").unwrap();

        let config = LogConfig::new().path(dir.path());
        assert_eq!(config.prune_expired().unwrap(), 0);
        assert!(dir.path().join("app.log").exists());
    }

    #[test]
    fn test_prune_missing_directory() {
        let config = LogConfig::new()
            .path("/nonexistent/usersvc/logs")
            .lifetime(Duration::from_secs(1));
        assert_eq!(config.prune_expired().unwrap(), 0);
    }

    #[test]
    fn test_compact_honors_report_caller() {
        let with_caller = render(&LogConfig::new().format(LogFormat::Compact));
        assert!(with_caller.contains("user service ready"));
        assert!(with_caller.contains("lib.rs:"));

        let without = render(&LogConfig::new().format(LogFormat::Compact).report_caller(false));
        assert!(without.contains("user service ready"));
        assert!(!without.contains("lib.rs:"));
    }

    #[test]
    fn test_prune_interval() {
        assert_eq!(LogConfig::new().prune_interval(), None);

        let hourly = LogConfig::new().lifetime(Duration::from_secs(7 * 24 * 3600));
        assert_eq!(hourly.prune_interval(), Some(Duration::from_secs(3600)));

        let short = LogConfig::new().lifetime(Duration::from_secs(120));
        assert_eq!(short.prune_interval(), Some(Duration::from_secs(120)));

        let tiny = LogConfig::new().rotation(Rotation::Never).lifetime(Duration::from_millis(5));
        assert_eq!(tiny.prune_interval(), Some(MIN_PRUNE_INTERVAL));
    }

    #[test]
    fn test_no_pruner_outside_runtime() {
        let config = LogConfig::new().lifetime(Duration::from_secs(60));
        assert!(config.spawn_pruner().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pruner_sweeps_periodically() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig::new()
            .path(dir.path())
            .rotation(Rotation::Never)
            .lifetime(Duration::from_millis(20));
        let pruner = config.spawn_pruner().unwrap();

        // a file rotated out while the process runs
        let rotated = dir.path().join("app.log.2024-01-01-00");
        fs::write(&rotated, b"old").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rotated.exists());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!rotated.exists());

        // and again on the next period
        fs::write(&rotated, b"old").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        tokio::time::sleep(MIN_PRUNE_INTERVAL).await;
        assert!(!rotated.exists());

        pruner.abort();
    }
}
