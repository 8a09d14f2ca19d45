// Logging System for Hearth
//
// Process-wide logging is built on the `tracing` ecosystem. The daemon core
// logs through the `tracing` macros with structured fields (`pool`, `worker`,
// `component`, `endpoint`, `request_id`); this module installs the
// subscriber that renders them, and provides the `hearth:tracing-logger`
// component so configured components can log through the same pipeline.
//
// # Usage Examples
//
// ```rust
// use hearth::logging::{self, LogConfig};
// use hearth_api::MemoryConfig;
//
// let config = MemoryConfig::new()
//     .with("daemon/log/level", "debug")
//     .with("daemon/log/json", "yes");
// logging::init(LogConfig::from_config(&config).unwrap());
// ```
//
// ## File Logging
//
// ```rust
// use hearth::logging;
//
// let config = logging::LogConfig::default();
// logging::init_with_file(config, "/var/log/hearth/daemon.log").unwrap();
// ```

use std::io;
use std::str::FromStr;
use std::sync::Once;

use hearth_api::{Component, Config, ConfigError, LogLevel, Logger};
use tracing::{Level, Subscriber};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::component::ComponentContext;

/// Configuration for the Hearth logging system
///
/// # Examples
///
/// ```rust
/// use hearth::logging::LogConfig;
/// use tracing::Level;
///
/// let custom_config = LogConfig {
///     level: Level::DEBUG,
///     json_format: true,
///     show_file_line: false,
///     show_thread_info: true,
///     show_time: true,
///     target_filters: Some("hearth=debug,hearth::server=trace".to_string()),
/// };
/// ```
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: Level,
    /// Whether to use JSON format for logs
    pub json_format: bool,
    /// Whether to include file and line information
    pub show_file_line: bool,
    /// Whether to include thread name/id
    pub show_thread_info: bool,
    /// Whether to include timestamps
    pub show_time: bool,
    /// Target filter expressions (format: "target=level,target2=level2,...")
    pub target_filters: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            show_file_line: true,
            show_thread_info: true,
            show_time: true,
            target_filters: None,
        }
    }
}

impl LogConfig {
    /// Read `daemon/log/level`, `daemon/log/json` and `daemon/log/filters`,
    /// falling back to the defaults for anything absent.
    pub fn from_config(config: &dyn Config) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let level = match config.value("daemon/log/level") {
            Some(value) => Level::from_str(value.trim()).map_err(|_| ConfigError::Invalid {
                path: "daemon/log/level".to_string(),
                value,
                expected: "log level",
            })?,
            None => defaults.level,
        };
        Ok(Self {
            level,
            json_format: config.as_bool_or("daemon/log/json", defaults.json_format)?,
            target_filters: config.value("daemon/log/filters"),
            ..defaults
        })
    }

    /// DEBUG for hearth, TRACE for the worker pools, file/line shown.
    pub fn development() -> Self {
        Self {
            level: Level::DEBUG,
            target_filters: Some("hearth=debug,hearth::pool=trace".to_string()),
            ..Self::default()
        }
    }

    /// JSON output for log aggregators, no file/line information.
    pub fn production() -> Self {
        Self {
            json_format: true,
            show_file_line: false,
            ..Self::default()
        }
    }
}

// Initialization guard to ensure we only initialize once
static INIT: Once = Once::new();

fn env_filter(config: &LogConfig) -> EnvFilter {
    let mut env_filter = EnvFilter::from_default_env().add_directive(config.level.into());
    if let Some(filters) = &config.target_filters {
        for filter in filters.split(',') {
            if let Ok(directive) = filter.trim().parse() {
                env_filter = env_filter.add_directive(directive);
            }
        }
    }
    env_filter
}

/// Initialize the logging system with the given configuration
///
/// Sets up the global tracing subscriber. Safe to call multiple times; only
/// the first call takes effect.
pub fn init(config: LogConfig) {
    INIT.call_once(|| {
        let registry = tracing_subscriber::registry().with(env_filter(&config));

        let subscriber: Box<dyn Subscriber + Send + Sync> = if config.json_format {
            Box::new(registry.with(fmt::layer().json().flatten_event(true)))
        } else {
            let fmt_layer = fmt::layer()
                .with_ansi(atty::is(atty::Stream::Stdout))
                .with_file(config.show_file_line)
                .with_line_number(config.show_file_line)
                .with_thread_names(config.show_thread_info)
                .with_thread_ids(config.show_thread_info);
            if config.show_time {
                Box::new(registry.with(fmt_layer))
            } else {
                Box::new(registry.with(fmt_layer.without_time()))
            }
        };

        set_global_subscriber(subscriber);
    });
}

// Helper function to set the global subscriber
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error setting global tracing subscriber: {}", err);
    }
}

/// Open `path` for appending, creating it if needed.
pub fn file_writer(path: &str) -> io::Result<Box<dyn io::Write + Send + Sync + 'static>> {
    use std::fs::OpenOptions;

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Box::new(file))
}

/// Initialize logging with both console and file output
///
/// Console output respects the terminal's color support; file output is
/// always plain and always carries file/line and thread information.
///
/// # Errors
/// Returns the I/O error when the log file cannot be opened.
pub fn init_with_file(config: LogConfig, log_file: &str) -> Result<(), io::Error> {
    drop(file_writer(log_file)?);

    INIT.call_once(|| {
        let console_layer = fmt::layer()
            .with_ansi(atty::is(atty::Stream::Stdout))
            .with_file(config.show_file_line)
            .with_line_number(config.show_file_line)
            .with_thread_names(config.show_thread_info)
            .with_thread_ids(config.show_thread_info);

        let log_file_path = log_file.to_string();
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(move || match file_writer(&log_file_path) {
                Ok(writer) => writer,
                Err(_) => Box::new(std::io::stderr()),
            })
            .with_file(true)
            .with_line_number(true)
            .with_thread_names(true)
            .with_thread_ids(true);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter(&config))
            .with(console_layer)
            .with(file_layer);

        set_global_subscriber(subscriber);
    });

    Ok(())
}

/// Initialize logging with [`LogConfig::development`].
pub fn init_development() {
    init(LogConfig::development());
}

/// Initialize logging with [`LogConfig::production`].
pub fn init_production() {
    init(LogConfig::production());
}

/// Initialize logging for testing
///
/// Only warnings and errors, no thread information, no timestamps.
pub fn init_test() {
    let config = LogConfig {
        level: Level::WARN,
        json_format: false,
        show_file_line: true,
        show_thread_info: false,
        show_time: false,
        target_filters: None,
    };
    init(config);
}

/// Create a span covering the handling of one request.
#[macro_export]
macro_rules! request_span {
    ($request_id:expr, $endpoint:expr) => {
        tracing::debug_span!("request", request_id = %$request_id, endpoint = %$endpoint)
    };
}

// --- Tracing Logger Component ---

/// `hearth:tracing-logger`: the [`Logger`] capability backed by `tracing`.
///
/// Configuration (under the component's path):
/// - `level`: minimum level forwarded, default `info`
#[derive(Debug)]
pub struct TracingLogger {
    name: String,
    min_level: LogLevel,
}

impl TracingLogger {
    pub fn new(name: impl Into<String>, min_level: LogLevel) -> Self {
        Self {
            name: name.into(),
            min_level,
        }
    }

    pub fn from_context(context: &ComponentContext<'_>) -> anyhow::Result<Self> {
        let min_level = match context.value("level") {
            Some(value) => value
                .parse::<LogLevel>()
                .map_err(|e| anyhow::anyhow!("{}: {}", context.key("level"), e))?,
            None => LogLevel::Info,
        };
        Ok(Self::new(context.name(), min_level))
    }

    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }
}

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        if level < self.min_level {
            return;
        }
        match level {
            LogLevel::Debug => tracing::debug!(logger = %self.name, "{}", message),
            LogLevel::Info => tracing::info!(logger = %self.name, "{}", message),
            LogLevel::Warning => tracing::warn!(logger = %self.name, "{}", message),
            LogLevel::Error => tracing::error!(logger = %self.name, "{}", message),
        }
    }
}

impl Component for TracingLogger {
    fn as_logger(&self) -> Option<&dyn Logger> {
        Some(self)
    }
}
