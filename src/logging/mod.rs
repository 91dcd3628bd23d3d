//! Logging infrastructure - structured tracing for the marshaling engine
//!
//! Design: `tracing` events tagged with an `event` field so log pipelines can
//! filter on them:
//! - Configurable level and extra filter directives
//! - Pretty, compact or JSON output
//! - Console or daily-rolling file output through a non-blocking writer
//! - Idempotent initialization

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Global logging state; holds the writer guard for the life of the process
static LOGGER: OnceCell<Option<WorkerGuard>> = OnceCell::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line output
    #[default]
    Pretty,
    /// Single-line output
    Compact,
    /// Structured JSON lines
    Json,
}

/// Log output destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// Daily-rotated file `<directory>/<prefix>.<date>`
    File { directory: String, prefix: String },
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum level for this crate
    pub level: Level,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Emit span open/close events
    pub span_events: bool,
    /// Extra filter directives, e.g. "ffidyn::interop=trace"
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
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

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // FFIDYN_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level) = std::env::var("FFIDYN_LOG_LEVEL") {
            config.level = parse_level(&level).unwrap_or(Level::INFO);
        }

        // FFIDYN_LOG_FILE: path to log file, rotated daily
        if let Ok(path) = std::env::var("FFIDYN_LOG_FILE") {
            config.output = file_output(&path);
        }

        if std::env::var("FFIDYN_LOG_JSON").is_ok() {
            config.format = LogFormat::Json;
        }

        config.span_events = std::env::var("FFIDYN_LOG_SPANS").is_ok();

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

/// Parse a level name, case-insensitive
pub fn parse_level(name: &str) -> Option<Level> {
    match name.to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Split a log file path into the rolling appender's directory and prefix
pub fn file_output(path: &str) -> LogOutput {
    let path = std::path::Path::new(path);
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string());
    let prefix = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ffidyn.log".to_string());
    LogOutput::File { directory, prefix }
}

/// Initialize logging from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration
///
/// Only the first call installs a subscriber; later calls are no-ops, as is
/// the first call when another global subscriber already exists.
pub fn init_with_config(config: LogConfig) {
    LOGGER.get_or_init(|| {
        let (writer, guard) = match &config.output {
            LogOutput::Stdout => tracing_appender::non_blocking(std::io::stdout()),
            LogOutput::Stderr => tracing_appender::non_blocking(std::io::stderr()),
            LogOutput::File { directory, prefix } => {
                tracing_appender::non_blocking(tracing_appender::rolling::daily(directory, prefix))
            }
        };

        let installed = tracing_subscriber::registry()
            .with(build_layer(&config, writer))
            .try_init()
            .is_ok();

        installed.then_some(guard)
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER.get().is_some()
}

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

fn build_layer(config: &LogConfig, writer: NonBlocking) -> BoxedLayer {
    let filter = build_filter(config);
    let spans = span_events_config(config.span_events);
    match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .pretty()
            .with_span_events(spans)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .with_writer(writer)
            .compact()
            .with_span_events(spans)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .with_writer(writer)
            .json()
            .with_span_events(spans)
            .with_filter(filter)
            .boxed(),
    }
}

fn build_filter(config: &LogConfig) -> EnvFilter {
    let base = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("ffidyn={}", config.level.as_str().to_lowercase()))
    });

    match &config.filter {
        Some(directives) => directives
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .fold(base, |filter, directive| match directive.parse() {
                Ok(d) => filter.add_directive(d),
                Err(_) => {
                    tracing::warn!(directive, "ignoring invalid filter directive");
                    filter
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
// Engine-specific events
// ============================================================================

#[inline]
pub fn log_type_defined(name: &str, size: usize, align: usize, elements: usize) {
    tracing::debug!(event = "type_defined", name, size, align, elements, "type defined");
}

#[inline]
pub fn log_signature_hit(key: &str, refs: usize) {
    tracing::trace!(event = "signature_hit", key, refs, "signature cache hit");
}

#[inline]
pub fn log_signature_miss(key: &str) {
    tracing::debug!(event = "signature_miss", key, "preparing call descriptor");
}

pub fn log_signature_replaced(key: &str) {
    tracing::debug!(
        event = "signature_replaced",
        key,
        "type redefined, preparing a fresh call descriptor"
    );
}

#[inline]
pub fn log_signature_released(key: &str) {
    tracing::debug!(event = "signature_released", key, "call descriptor freed");
}

pub fn log_binding(kind: &'static str, name: &str, signature: &str, replaced: bool) {
    tracing::debug!(
        event = "binding_installed",
        kind,
        name,
        signature,
        replaced,
        "binding installed"
    );
}

pub fn log_unbound(kind: &'static str, name: &str) {
    tracing::debug!(event = "binding_released", kind, name, "binding released");
}

#[inline]
pub fn log_callout_enter(signature: &str, address: usize) {
    tracing::trace!(event = "callout_enter", signature, address, "native call");
}

#[inline]
pub fn log_callout_return(signature: &str, fresh_frame: bool) {
    tracing::trace!(event = "callout_return", signature, fresh_frame, "native call returned");
}

#[inline]
pub fn log_dispatch(callback: &str, argc: usize) {
    tracing::trace!(event = "callback_dispatch", callback, argc, "inbound dispatch");
}

/// Dispatch failure swallowed at the native boundary
pub fn log_background_error(callback: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(
        event = "background_error",
        callback,
        error = %error,
        "inbound call failed, returning zero"
    );
}

pub fn log_session_gone(callback: &str, error: &dyn std::fmt::Display) {
    tracing::error!(
        event = "session_gone",
        callback,
        error = %error,
        "callback fired after its session ended, returning zero"
    );
}

pub fn log_library_loaded(path: &str, flags: &str) {
    tracing::debug!(event = "library_loaded", path, flags, "library loaded");
}
