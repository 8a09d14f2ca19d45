// Hearth Daemon Core
//
// Building blocks of a long-running request-serving daemon: bounded worker
// pools, a dependency-resolving component graph fed by plugin modules, and
// a server that ties pools, components and listening endpoints into one
// start / stop / join lifecycle.

pub mod builtin;
pub mod component;
pub mod config;
pub mod error;
pub mod globals;
pub mod handler;
pub mod logging;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod stats;

// Re-export commonly used types
pub use component::{ComponentContext, ComponentGraph, FactoryRegistrar, Loader};
pub use error::{
    ComponentError, DaemonError, LoaderError, PoolError, Result, ServerError,
};
pub use globals::{GlobalContext, RequestPool};
pub use handler::{HandlerDescriptor, HandlerSet, RequestTask};
pub use pool::{TaskHandler, ThreadPoolInfo, WorkerPool};
pub use protocol::Protocol;
pub use server::{Connection, Server, ServerStatus, StatusReport, StatusSink};

pub use hearth_api;
