//! Tracing configuration and log routing.
//!
//! Pipeline runs log to stderr through a compact formatter (stdout carries the summary report)
//! and, unless disabled, to a file. The file target is resolved in this order: an explicit
//! `--log-file` path, `CASEDRAFT_LOG_FILE`, then `logs/casedraft.log`. The file layer uses a
//! non-blocking writer so long provider calls on worker tasks never contend with log output.
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_LOG_FILE: &str = "casedraft.log";

/// Where file logs should be written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LogFile {
    /// Use `CASEDRAFT_LOG_FILE` when set, otherwise `logs/casedraft.log`.
    #[default]
    Default,
    /// Append to this exact path.
    Path(PathBuf),
    /// Only log to stderr.
    Disabled,
}

/// Knobs supplied by the CLI when tracing is installed.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Number of `-v` flags; raises the default level when `RUST_LOG` is unset.
    pub verbosity: u8,
    /// File routing.
    pub file: LogFile,
}

impl LogOptions {
    fn default_directive(&self) -> &'static str {
        match self.verbosity {
            0 => "info",
            1 => "casedraft=debug,info",
            _ => "casedraft=trace,debug",
        }
    }
}

/// Configure tracing subscribers for stderr and file logging.
///
/// - `RUST_LOG` wins over the verbosity-derived default filter.
/// - Keeps the non-blocking writer guard alive for the process lifetime.
pub fn init_tracing(options: &LogOptions) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.default_directive()));
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if let Some(writer) = configure_file_writer(&options.file) {
        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(false)
            .compact();

        registry.with(file_layer).init();
    } else {
        registry.init();
    }
}

/// Build a non-blocking writer for file logging.
///
/// Returns `None` when file logging is disabled or the target cannot be opened.
fn configure_file_writer(target: &LogFile) -> Option<NonBlocking> {
    let path = match target {
        LogFile::Disabled => return None,
        LogFile::Path(path) => path.clone(),
        LogFile::Default => std::env::var_os("CASEDRAFT_LOG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| Path::new(DEFAULT_LOG_DIR).join(DEFAULT_LOG_FILE)),
    };

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        if let Err(err) = std::fs::create_dir_all(parent) {
            eprintln!("Failed to create log directory {}: {err}", parent.display());
            return None;
        }
    }

    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
    {
        Ok(file) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let _ = LOG_GUARD.set(guard);
            Some(non_blocking)
        }
        Err(err) => {
            eprintln!("Failed to open log file {}: {err}", path.display());
            None
        }
    }
}
