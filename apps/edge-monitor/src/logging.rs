//! Subscriber setup for the monitor binary.
//!
//! Verbose levels only apply to the edge crates; everything else stays at
//! `info` so webrtc and reqwest internals don't drown the device traffic.
//! `EDGE_LOG_FILTER` replaces the computed directives entirely.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::EnvFilter;

pub const LOG_FILTER_ENV: &str = "EDGE_LOG_FILTER";

/// Crates whose spans follow the requested level past `info`.
const EDGE_TARGETS: &[&str] = &[
    "edge_monitor",
    "edge_link",
    "edge_cloud",
    "edge_session",
    "edge_signal",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

/// Directive set for the monitor at one verbosity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorFilter {
    level: LogLevel,
}

impl MonitorFilter {
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }

    /// `warn` and quieter apply globally; `debug` and `trace` raise only
    /// the edge crates.
    pub fn directives(&self) -> String {
        if self.level <= LogLevel::Info {
            return self.level.directive().to_string();
        }
        let mut directives = String::from("info");
        for target in EDGE_TARGETS {
            directives.push(',');
            directives.push_str(target);
            directives.push('=');
            directives.push_str(self.level.directive());
        }
        directives
    }

    fn into_env_filter(self) -> EnvFilter {
        match std::env::var(LOG_FILTER_ENV) {
            Ok(custom) => EnvFilter::new(custom),
            Err(_) => EnvFilter::new(self.directives()),
        }
    }
}

enum LogTarget<'a> {
    Stderr,
    File(&'a Path),
}

impl<'a> LogTarget<'a> {
    fn from_config(config: &'a LogConfig) -> Self {
        match config.file.as_deref() {
            Some(path) => LogTarget::File(path),
            None => LogTarget::Stderr,
        }
    }

    fn colored(&self) -> bool {
        matches!(self, LogTarget::Stderr)
    }

    fn writer(&self) -> Result<(NonBlocking, WorkerGuard), InitError> {
        match self {
            LogTarget::Stderr => Ok(tracing_appender::non_blocking(std::io::stderr())),
            LogTarget::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.to_path_buf(),
                        source,
                    })?;
                Ok(tracing_appender::non_blocking(file))
            }
        }
    }
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber once; later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let target = LogTarget::from_config(config);
    let (writer, guard) = target.writer()?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(MonitorFilter::new(config.level).into_env_filter())
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_names(config.level == LogLevel::Trace)
        .with_ansi(target.colored())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;
    let _ = GUARD.set(guard);
    Ok(())
}
