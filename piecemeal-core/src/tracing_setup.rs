//! Tracing setup for Piecemeal
//!
//! Console output at the level the operator picked, plus a full trace of the
//! last run on disk. Scheduling decisions are logged at debug, so the file is
//! where a stalled stream gets diagnosed.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Name of the per-run trace file inside the logs directory.
pub const LOG_FILE_NAME: &str = "piecemeal-last-run.log";

/// Errors raised while installing the global subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    #[error("Cannot prepare log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("A global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Path of the trace file for a logs directory, `./logs` by default.
pub fn log_file_path(logs_dir: Option<&Path>) -> PathBuf {
    logs_dir.unwrap_or_else(|| Path::new("logs")).join(LOG_FILE_NAME)
}

/// Installs console and file logging for the process.
///
/// The console honours `RUST_LOG` when set and falls back to
/// `console_level`. The file always records everything at trace level and
/// is truncated at startup.
///
/// # Errors
///
/// - `TracingSetupError::LogFile` - If the logs directory or file cannot be created
/// - `TracingSetupError::AlreadyInitialized` - If called twice in one process
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<PathBuf, TracingSetupError> {
    let log_path = log_file_path(logs_dir);
    let log_file = open_log_file(&log_path)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| TracingSetupError::AlreadyInitialized)?;

    tracing::info!(
        "Tracing initialized: console={}, trace_file={}",
        console_level,
        log_path.display()
    );
    Ok(log_path)
}

fn open_log_file(path: &Path) -> Result<File, TracingSetupError> {
    let to_error = |source| TracingSetupError::LogFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        create_dir_all(parent).map_err(to_error)?;
    }
    File::create(path).map_err(to_error)
}

/// Log level choices exposed on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    /// Only error messages
    Error,
    /// Warning and error messages
    Warn,
    /// Reader and torrent lifecycle
    Info,
    /// Every applied scheduling cycle
    Debug,
    /// All messages including detailed tracing
    Trace,
}

impl CliLogLevel {
    /// Converts CLI log level to tracing Level enum.
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}
