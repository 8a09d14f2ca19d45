//! # Components and Capabilities
//!
//! A [`Component`] is owned by the daemon's component graph. The graph never
//! needs to know the concrete type: everything it does with a component goes
//! through the lifecycle hooks and the capability accessors defined here.
//!
//! A single type may implement several capabilities at once (a syslog
//! logger that also answers requests, for example). It advertises each one
//! by overriding the matching `as_*` accessor.

use std::fmt;
use std::str::FromStr;

use downcast_rs::{impl_downcast, DowncastSync};

use crate::request::{HandlerContext, Request};

/// A named, configured unit of behavior hosted by the daemon.
///
/// Components are shared between worker threads, so they must be
/// `Send + Sync`; interior state needs its own synchronization.
pub trait Component: DowncastSync {
    /// Called once after every declared component has been constructed.
    ///
    /// Siblings are guaranteed to exist at this point, which makes it the
    /// place for work that depends on them.
    fn on_load(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once during teardown, dependents before their dependencies.
    fn on_unload(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Returns the logging capability, if this component provides one.
    fn as_logger(&self) -> Option<&dyn Logger> {
        None
    }

    /// Returns the request handling capability, if this component provides one.
    fn as_handler(&self) -> Option<&dyn RequestHandler> {
        None
    }
}
impl_downcast!(sync Component);

/// Severity of a log message, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Upper-case name as it appears in log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Logging capability.
pub trait Logger: Send + Sync {
    /// Record an already formatted message.
    fn log(&self, level: LogLevel, message: &str);

    fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    fn warning(&self, message: &str) {
        self.log(LogLevel::Warning, message);
    }

    fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}

/// Request handling capability.
///
/// Handlers configured for the same url run in order against the same
/// request and share one [`HandlerContext`].
pub trait RequestHandler: Send + Sync {
    fn handle_request(
        &self,
        request: &mut dyn Request,
        context: &mut HandlerContext,
    ) -> anyhow::Result<()>;
}
