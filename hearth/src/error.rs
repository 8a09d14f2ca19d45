use std::io;

use thiserror::Error;

pub use hearth_api::ConfigError;

/// Errors related to worker pool operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Thread pool '{pool}' is not started")]
    NotStarted { pool: String },
    #[error("Thread pool '{pool}' queue has already reached its maximum size of {capacity} elements")]
    QueueFull { pool: String, capacity: usize },
    #[error("Failed to spawn worker thread for pool '{pool}': {reason}")]
    Spawn { pool: String, reason: String },
}

impl PoolError {
    /// Whether the caller can back off and retry (admission-path errors).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotStarted { .. } | Self::QueueFull { .. })
    }
}

/// Errors related to plugin modules and factory lookup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    #[error("Failed to load module '{name}' from {path}: {reason}")]
    ModuleLoad {
        name: String,
        path: String,
        reason: String,
    },
    #[error("Unknown component type: {0}")]
    UnknownComponentType(String),
}

/// Errors related to the component graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComponentError {
    #[error("Component is not declared: {0}")]
    NotDeclared(String),
    #[error("Component declared twice: {0}")]
    Duplicate(String),
    #[error("Unknown component type '{component_type}' for component {name}")]
    UnknownComponentType { name: String, component_type: String },
    #[error("Cyclic component dependency: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),
    #[error("Failed to construct component {name}: {reason}")]
    ConstructionFailed { name: String, reason: String },
    #[error("Component {name} is not of type {expected}")]
    TypeMismatch { name: String, expected: &'static str },
    #[error("Component {name} does not provide the {capability} capability")]
    MissingCapability {
        name: String,
        capability: &'static str,
    },
    #[error("Component {name} failed on load: {reason}")]
    LoadFailed { name: String, reason: String },
    #[error("{} component(s) failed to unload: {}", .0.len(), format_failures(.0))]
    UnloadFailed(Vec<(String, String)>),
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(name, reason)| format!("{}: {}", name, reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors related to server orchestration.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind endpoint {endpoint} at {address}: {source}")]
    EndpointBind {
        endpoint: String,
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("Endpoint {endpoint} has no address (set socket or port)")]
    MissingAddress { endpoint: String },
    #[error("Endpoint {endpoint} refers to unknown pool {pool}")]
    UnknownPool { endpoint: String, pool: String },
    #[error("Server is in state {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Failed to spawn {thread} thread: {source}")]
    Spawn {
        thread: String,
        #[source]
        source: io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Top-level error returned by daemon setup and lifecycle operations.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Loader(#[from] LoaderError),
    #[error(transparent)]
    Component(#[from] ComponentError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Server(#[from] ServerError),
}

pub type Result<T, E = DaemonError> = std::result::Result<T, E>;

/// Readable text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
