//! Logging infrastructure
//!
//! Structured events through `tracing`. Every bridge-level event carries an
//! `event` field so logs can be filtered by what happened rather than where.
//! Subscriber setup is optional for embedders that install their own.

use crate::foreign::RawRef;
use crate::handle::IdentityKey;
use once_cell::sync::OnceCell;
use std::path::Path;
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

pub use tracing::{debug, error, info, trace, warn, Level};

static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, multi-line
    Pretty,
    /// Single line per event
    Compact,
    Json,
}

/// Log output destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// Daily rolling file
    File { directory: String, prefix: String },
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level
    pub level: Level,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Emit span open/close events
    pub span_events: bool,
    /// Extra filter directives, e.g. "jbridge::ledger=trace"
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            output: LogOutput::Stderr,
            span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `JBRIDGE_LOG_LEVEL`, `JBRIDGE_LOG_FORMAT`, `JBRIDGE_LOG_FILE`
    /// and `JBRIDGE_LOG_SPANS` over the defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(level) = std::env::var("JBRIDGE_LOG_LEVEL") {
            config.level = parse_level(&level).unwrap_or(Level::INFO);
        }

        if let Ok(format) = std::env::var("JBRIDGE_LOG_FORMAT") {
            config.format = match format.to_lowercase().as_str() {
                "pretty" => LogFormat::Pretty,
                "json" => LogFormat::Json,
                _ => LogFormat::Compact,
            };
        }

        // JBRIDGE_LOG_FILE: <directory>/<prefix>
        if let Ok(path) = std::env::var("JBRIDGE_LOG_FILE") {
            let path = Path::new(&path);
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or_else(|| ".".to_string(), |p| p.to_string_lossy().into_owned());
            let prefix = path
                .file_name()
                .map_or_else(|| "jbridge.log".to_string(), |p| p.to_string_lossy().into_owned());
            config.output = LogOutput::File { directory, prefix };
        }

        config.span_events = std::env::var("JBRIDGE_LOG_SPANS").is_ok();
        config
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

fn parse_level(level: &str) -> Option<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Install the global subscriber
///
/// Only the first call installs anything; later calls return `None`. Keep the
/// returned guard alive so buffered lines are flushed.
pub fn init_logging(config: LogConfig) -> Option<WorkerGuard> {
    let mut guard = None;
    LOGGER_INITIALIZED.get_or_init(|| {
        let (writer, worker) = match &config.output {
            LogOutput::Stdout => tracing_appender::non_blocking(std::io::stdout()),
            LogOutput::Stderr => tracing_appender::non_blocking(std::io::stderr()),
            LogOutput::File { directory, prefix } => {
                tracing_appender::non_blocking(rolling::daily(directory, prefix))
            }
        };

        let base = fmt::layer()
            .with_writer(writer)
            .with_span_events(span_events_config(config.span_events))
            .with_thread_names(true);
        let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
            LogFormat::Pretty => base.pretty().boxed(),
            LogFormat::Compact => base.compact().boxed(),
            LogFormat::Json => base.json().boxed(),
        };

        // Another subscriber may already be installed by the embedder
        if tracing_subscriber::registry()
            .with(layer.with_filter(build_filter(&config)))
            .try_init()
            .is_ok()
        {
            guard = Some(worker);
        }
    });
    guard
}

/// Install logging configured from the environment
pub fn init() -> Option<WorkerGuard> {
    init_logging(LogConfig::from_env())
}

pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

fn build_filter(config: &LogConfig) -> EnvFilter {
    let base = EnvFilter::from_default_env().add_directive(config.level.into());

    match &config.filter {
        Some(directives) => directives.split(',').fold(base, |filter, directive| {
            match directive.parse() {
                Ok(directive) => filter.add_directive(directive),
                Err(_) => {
                    warn!("invalid filter directive: {}", directive);
                    filter
                }
            }
        }),
        None => base,
    }
}

fn span_events_config(enabled: bool) -> FmtSpan {
    if enabled {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

// ============================================================================
// Bridge events
// ============================================================================

pub fn log_vm_launch(description: &str, options: &[String]) {
    info!(
        event = "vm_launch",
        vm = description,
        options = ?options,
        "foreign VM started"
    );
}

pub fn log_thread_attach(name: Option<&str>, daemon: bool, status: i32) {
    debug!(
        event = "thread_attach",
        thread = name.unwrap_or("<unnamed>"),
        daemon,
        status,
        "thread attached"
    );
}

pub fn log_thread_detach(status: i32) {
    debug!(event = "thread_detach", status, "thread detached");
}

#[inline]
pub fn log_ref_acquire(key: IdentityKey, handle: RawRef, count: usize) {
    trace!(
        event = "ref_acquire",
        key = %key,
        handle = %handle,
        count,
        "counted ref acquired"
    );
}

#[inline]
pub fn log_ref_release(key: IdentityKey, handle: RawRef, remaining: usize) {
    trace!(
        event = "ref_release",
        key = %key,
        handle = %handle,
        remaining,
        "counted ref released"
    );
}

pub fn log_ledger_consistency(key: IdentityKey, handle: RawRef) {
    error!(
        event = "ledger_consistency",
        key = %key,
        handle = %handle,
        "deleting non-existent ref"
    );
}

pub fn log_foreign_exception(class_name: Option<&str>, message: Option<&str>) {
    debug!(
        event = "foreign_exception",
        class = class_name.unwrap_or("<unknown>"),
        message = message.unwrap_or(""),
        "foreign exception raised to caller"
    );
}

pub fn log_host_error_round_trip(name: &str, tag: u64) {
    debug!(
        event = "host_error_round_trip",
        error = name,
        tag,
        "host error restored from foreign runtime"
    );
}

pub fn log_exception_describe(handlers: usize) {
    debug!(
        event = "exception_describe",
        handlers,
        "pending exception described by the foreign runtime"
    );
}
