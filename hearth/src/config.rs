use std::path::PathBuf;
use std::time::Duration;

use hearth_api::{Config, ConfigError};

pub const DEFAULT_POOL_NAME: &str = "main";
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_millis(1000);

// --- Pool Configuration ---

/// Sizing of one request worker pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub threads: usize,

    /// Maximum number of queued, not yet running tasks.
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl PoolConfig {
    /// Read `pools/<name>/threads` and `pools/<name>/queue`, defaulting each.
    pub fn from_config(config: &dyn Config, name: &str) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let threads_path = format!("pools/{}/threads", name);
        let threads = config.as_int_or(&threads_path, defaults.threads as i64)?;
        if threads < 1 {
            return Err(ConfigError::Invalid {
                path: threads_path,
                value: threads.to_string(),
                expected: "positive thread count",
            });
        }
        let queue_path = format!("pools/{}/queue", name);
        let queue_capacity = config.as_int_or(&queue_path, defaults.queue_capacity as i64)?;
        if queue_capacity < 0 {
            return Err(ConfigError::Invalid {
                path: queue_path,
                value: queue_capacity.to_string(),
                expected: "queue capacity",
            });
        }
        Ok(Self {
            threads: threads as usize,
            queue_capacity: queue_capacity as usize,
        })
    }

    /// All configured pools, or a single default `main` pool when none are.
    pub fn all_from_config(config: &dyn Config) -> Result<Vec<(String, Self)>, ConfigError> {
        let names = config.subkeys("pools");
        if names.is_empty() {
            return Ok(vec![(DEFAULT_POOL_NAME.to_string(), Self::default())]);
        }
        names
            .into_iter()
            .map(|name| Self::from_config(config, &name).map(|pool| (name, pool)))
            .collect()
    }
}

// --- Server Configuration ---

/// Process-wide settings read from the `daemon/` subtree.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Component used as the process logger.
    pub logger: Option<String>,

    /// Component collecting response times.
    pub statistics: Option<String>,

    /// Whether handler latency is recorded into `statistics`.
    pub log_times: bool,

    /// Period between status publications by the monitor thread.
    pub monitor_interval: Duration,

    /// TCP port on which the monitor answers status queries.
    pub monitor_port: Option<u16>,

    /// File receiving the process id while the server runs.
    pub pid_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            logger: None,
            statistics: None,
            log_times: false,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            monitor_port: None,
            pid_file: None,
        }
    }
}

impl ServerConfig {
    pub fn from_config(config: &dyn Config) -> Result<Self, ConfigError> {
        let interval = config.as_int_or(
            "daemon/monitor/interval-ms",
            DEFAULT_MONITOR_INTERVAL.as_millis() as i64,
        )?;
        if interval <= 0 {
            return Err(ConfigError::Invalid {
                path: "daemon/monitor/interval-ms".to_string(),
                value: interval.to_string(),
                expected: "positive interval",
            });
        }

        let monitor_port = match config.value("daemon/monitor/port") {
            Some(value) => Some(value.trim().parse::<u16>().map_err(|_| ConfigError::Invalid {
                path: "daemon/monitor/port".to_string(),
                value,
                expected: "port number",
            })?),
            None => None,
        };

        Ok(Self {
            logger: config.value("daemon/logger"),
            statistics: config.value("daemon/statistics"),
            log_times: config.as_bool_or("daemon/log-times", false)?,
            monitor_interval: Duration::from_millis(interval as u64),
            monitor_port,
            pid_file: config.value("daemon/pidfile").map(PathBuf::from),
        })
    }
}
