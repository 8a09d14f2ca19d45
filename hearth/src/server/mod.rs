//! # Server Orchestration
//!
//! Ties the request pools, the component graph and the listening endpoints
//! into one start / stop / join lifecycle.
//!
//! ## State Machine
//! `NotInited → Loading → Running`, never backwards. A stopped server stays
//! in its last state with `stopping` set in its status report.
//!
//! ## Start Order
//! 1. Bind every configured endpoint
//! 2. Start the request pools
//! 3. Write the pid file, start the monitor thread
//! 4. `Loading`: construct every component and run `on_load`
//! 5. `Running`: spawn one accept loop per endpoint
//!
//! A failure at any step stops and joins whatever was already started,
//! closes the endpoints and returns the error.
//!
//! ## Shutdown
//! `stop` sets the stopper flag and signals the [`StopPipe`], which every
//! accept loop and the monitor poll next to their own descriptor. It then
//! stops the request pools and unloads the components. `join` waits for all
//! of those threads.

mod endpoint;
mod monitor;
mod stopper;

pub use endpoint::{Connection, Endpoint, EndpointAddress, EndpointConfig, EndpointStatus};
pub use monitor::{ChannelSink, PoolStatus, StatusReport, StatusSink, TracingSink};
pub use stopper::{ActiveThreadCounter, ActiveThreadGuard, ServerStopper, StopPipe, WaitResult};

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{DaemonError, ServerError};
use crate::globals::GlobalContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerStatus {
    NotInited,
    Loading,
    Running,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotInited => "not-inited",
            Self::Loading => "loading",
            Self::Running => "running",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State reachable from the server's own threads.
pub(crate) struct ServerShared {
    globals: Arc<GlobalContext>,
    status: Mutex<ServerStatus>,
    stopper: ServerStopper,
    stop_pipe: StopPipe,
    active: Arc<ActiveThreadCounter>,
    endpoints: RwLock<Vec<Arc<Endpoint>>>,
    sink: RwLock<Arc<dyn StatusSink>>,
}

impl ServerShared {
    fn status_report(&self) -> StatusReport {
        StatusReport {
            status: *self.status.lock(),
            stopping: self.stopper.is_stopping(),
            active_threads: self.active.get(),
            pools: self
                .globals
                .pools()
                .map(|(name, pool)| PoolStatus {
                    name: name.to_string(),
                    info: pool.info(),
                })
                .collect(),
            endpoints: self
                .endpoints
                .read()
                .iter()
                .map(|endpoint| endpoint.status())
                .collect(),
        }
    }

    fn status_sink(&self) -> Arc<dyn StatusSink> {
        Arc::clone(&self.sink.read())
    }

    fn set_status(&self, status: ServerStatus) {
        *self.status.lock() = status;
        info!(status = %status, "Server status changed");
    }
}

#[derive(Default)]
struct ServerThreads {
    monitor: Option<JoinHandle<()>>,
    accept: Vec<JoinHandle<()>>,
}

/// Request-serving daemon built on a [`GlobalContext`].
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use hearth::{GlobalContext, Server};
/// # fn protocol() -> Arc<dyn hearth::Protocol> { unimplemented!() }
/// # fn run(config: Arc<dyn hearth_api::Config>) -> hearth::Result<()> {
/// let globals = GlobalContext::from_config(config, protocol())?;
/// let server = Server::new(globals)?;
/// server.start()?;
/// // ... until a shutdown signal arrives
/// server.stop()?;
/// server.join();
/// # Ok(())
/// # }
/// ```
pub struct Server {
    shared: Arc<ServerShared>,
    start_requested: AtomicBool,
    threads: Mutex<ServerThreads>,
    monitor_address: Mutex<Option<SocketAddr>>,
    pid_file: Mutex<Option<PathBuf>>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("status", &self.status())
            .field("stopping", &self.shared.stopper.is_stopping())
            .finish()
    }
}

impl Server {
    pub fn new(globals: Arc<GlobalContext>) -> Result<Self, ServerError> {
        Ok(Self {
            shared: Arc::new(ServerShared {
                globals,
                status: Mutex::new(ServerStatus::NotInited),
                stopper: ServerStopper::default(),
                stop_pipe: StopPipe::new()?,
                active: Arc::new(ActiveThreadCounter::default()),
                endpoints: RwLock::new(Vec::new()),
                sink: RwLock::new(Arc::new(TracingSink)),
            }),
            start_requested: AtomicBool::new(false),
            threads: Mutex::new(ServerThreads::default()),
            monitor_address: Mutex::new(None),
            pid_file: Mutex::new(None),
        })
    }

    /// Replace the sink receiving the monitor's periodic reports.
    pub fn with_status_sink(self, sink: Arc<dyn StatusSink>) -> Self {
        self.set_status_sink(sink);
        self
    }

    pub fn set_status_sink(&self, sink: Arc<dyn StatusSink>) {
        *self.shared.sink.write() = sink;
    }

    pub fn globals(&self) -> &Arc<GlobalContext> {
        &self.shared.globals
    }

    pub fn status(&self) -> ServerStatus {
        *self.shared.status.lock()
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopper.is_stopping()
    }

    pub fn status_report(&self) -> StatusReport {
        self.shared.status_report()
    }

    /// Bound endpoint addresses, in configuration order.
    pub fn endpoint_addresses(&self) -> Vec<(String, EndpointAddress)> {
        self.shared
            .endpoints
            .read()
            .iter()
            .map(|endpoint| (endpoint.name().to_string(), endpoint.address().clone()))
            .collect()
    }

    pub fn endpoint_address(&self, name: &str) -> Option<EndpointAddress> {
        self.shared
            .endpoints
            .read()
            .iter()
            .find(|endpoint| endpoint.name() == name)
            .map(|endpoint| endpoint.address().clone())
    }

    /// Address of the monitor's status port, once started.
    pub fn monitor_address(&self) -> Option<SocketAddr> {
        *self.monitor_address.lock()
    }

    /// Bring the server up. See the module documentation for the order.
    ///
    /// # Errors
    /// * `ServerError::InvalidState` - already started, or stopped before start
    /// * `ServerError::EndpointBind` / `UnknownPool` - endpoint setup failed
    /// * any component error raised while loading; the server never reaches
    ///   `Running` and everything started so far is torn down
    pub fn start(&self) -> Result<(), DaemonError> {
        if self.shared.stopper.is_stopping() {
            return Err(ServerError::InvalidState {
                expected: ServerStatus::NotInited.as_str(),
                actual: "stopped",
            }
            .into());
        }
        if self.start_requested.swap(true, Ordering::SeqCst) {
            return Err(ServerError::InvalidState {
                expected: ServerStatus::NotInited.as_str(),
                actual: self.status().as_str(),
            }
            .into());
        }

        let endpoints = self.bind_endpoints()?;
        *self.shared.endpoints.write() = endpoints;

        if let Err(e) = self.start_services() {
            error!(error = %e, "Server failed to start");
            self.abort_start();
            return Err(e);
        }
        Ok(())
    }

    fn bind_endpoints(&self) -> Result<Vec<Arc<Endpoint>>, DaemonError> {
        let globals = &self.shared.globals;
        let mut endpoints = Vec::new();
        for config in EndpointConfig::all_from_config(globals.config())? {
            let pool = globals
                .pool(&config.pool)
                .ok_or_else(|| ServerError::UnknownPool {
                    endpoint: config.name.clone(),
                    pool: config.pool.clone(),
                })?;
            endpoints.push(Arc::new(Endpoint::bind(&config, pool)?));
        }
        Ok(endpoints)
    }

    fn start_services(&self) -> Result<(), DaemonError> {
        let globals = &self.shared.globals;
        globals.start_pools()?;
        self.write_pid_file()?;
        self.start_monitor()?;

        self.shared.set_status(ServerStatus::Loading);
        globals.load_components()?;
        self.shared.set_status(ServerStatus::Running);

        self.start_accept_loops()?;
        Ok(())
    }

    fn write_pid_file(&self) -> Result<(), ServerError> {
        if let Some(path) = &self.shared.globals.server_config().pid_file {
            std::fs::write(path, format!("{}\n", std::process::id()))?;
            *self.pid_file.lock() = Some(path.clone());
        }
        Ok(())
    }

    fn start_monitor(&self) -> Result<(), ServerError> {
        let listener = match self.shared.globals.server_config().monitor_port {
            Some(port) => {
                let address = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
                let bind_error = |source| ServerError::EndpointBind {
                    endpoint: "monitor".to_string(),
                    address: address.to_string(),
                    source,
                };
                let listener = TcpListener::bind(address).map_err(bind_error)?;
                listener.set_nonblocking(true).map_err(bind_error)?;
                *self.monitor_address.lock() = Some(listener.local_addr()?);
                Some(listener)
            }
            None => None,
        };

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("hearth-monitor".to_string())
            .spawn(move || {
                let _active = shared.active.enter();
                monitor::run_monitor(&shared, listener);
            })
            .map_err(|source| ServerError::Spawn {
                thread: "monitor".to_string(),
                source,
            })?;
        self.threads.lock().monitor = Some(handle);
        Ok(())
    }

    fn start_accept_loops(&self) -> Result<(), ServerError> {
        let endpoints = self.shared.endpoints.read().clone();
        for endpoint in endpoints {
            let shared = Arc::clone(&self.shared);
            let thread_name = format!("hearth-accept-{}", endpoint.name());
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    let _active = shared.active.enter();
                    endpoint.accept_loop(&shared.stop_pipe);
                })
                .map_err(|source| ServerError::Spawn {
                    thread: thread_name,
                    source,
                })?;
            self.threads.lock().accept.push(handle);
        }
        Ok(())
    }

    fn abort_start(&self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Errors while tearing down a failed start");
        }
        self.join();
        self.shared.endpoints.write().clear();
    }

    /// Request shutdown. Does not wait; see [`join`](Self::join).
    ///
    /// Only the first call does anything. Errors are the collected
    /// `on_unload` failures; shutdown itself always completes.
    pub fn stop(&self) -> Result<(), DaemonError> {
        if !self.shared.stopper.request_stop() {
            return Ok(());
        }
        info!("Server stopping");
        if let Err(e) = self.shared.stop_pipe.signal() {
            error!(error = %e, "Failed to signal the stop pipe");
        }
        let globals = &self.shared.globals;
        globals.stop_pools();
        globals.unload_components()?;
        Ok(())
    }

    /// Wait for the monitor, the accept loops and the pool workers to exit,
    /// then remove the pid file.
    pub fn join(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads.accept.into_iter().chain(threads.monitor) {
            let name = handle.thread().name().unwrap_or("server").to_string();
            if handle.join().is_err() {
                warn!(thread = %name, "Server thread terminated by panic");
            }
        }
        self.shared.globals.join_pools();

        if let Some(path) = self.pid_file.lock().take() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove pid file");
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Errors while stopping server on drop");
        }
        self.join();
    }
}
