//! # Global Context
//!
//! The one object every part of a running daemon is handed explicitly: the
//! configuration, the component graph, the handler chains and the named
//! request pools.
//!
//! ## Ownership
//! - The component graph owns every component instance
//! - The designated logger and the statistics component are held weakly, so
//!   they never outlive the graph
//! - Request pools are shared with the server, which starts and stops them
//! - Pool workers reach the context through a weak reference held by the
//!   [`RequestDispatcher`]

use std::sync::{Arc, Weak};
use std::time::Duration;

use hearth_api::{Component, Config, LogLevel};
use parking_lot::RwLock;
use tracing::{debug, error, info, trace, warn};

use crate::component::{ComponentGraph, Loader};
use crate::config::{PoolConfig, ServerConfig};
use crate::error::{ComponentError, DaemonError, PoolError};
use crate::handler::{HandlerSet, RequestDispatcher, RequestTask};
use crate::pool::{TaskHandler, WorkerPool};
use crate::protocol::Protocol;
use crate::stats::ResponseTimeStats;

/// Worker pool draining accepted connections.
pub type RequestPool = WorkerPool<RequestTask>;

pub struct GlobalContext {
    config: Arc<dyn Config>,
    server_config: ServerConfig,
    handlers: HandlerSet,
    pools: Vec<(String, Arc<RequestPool>)>,
    logger: RwLock<Option<Weak<dyn Component>>>,
    statistics: RwLock<Option<Weak<ResponseTimeStats>>>,
    components: ComponentGraph,
}

impl std::fmt::Debug for GlobalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalContext")
            .field("components", &self.components)
            .field("handlers", &self.handlers)
            .field(
                "pools",
                &self.pools.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl GlobalContext {
    /// Build the context with a loader holding the built-in factories plus
    /// every module listed under `modules/`.
    pub fn from_config(
        config: Arc<dyn Config>,
        protocol: Arc<dyn Protocol>,
    ) -> Result<Arc<Self>, DaemonError> {
        let mut loader = Loader::new();
        loader.init(config.as_ref())?;
        Self::new(config, Arc::new(loader), protocol)
    }

    /// Declare the configured components and create the request pools.
    ///
    /// Nothing is constructed or started yet; see
    /// [`load_components`](Self::load_components) and
    /// [`start_pools`](Self::start_pools).
    pub fn new(
        config: Arc<dyn Config>,
        loader: Arc<Loader>,
        protocol: Arc<dyn Protocol>,
    ) -> Result<Arc<Self>, DaemonError> {
        let server_config = ServerConfig::from_config(config.as_ref())?;
        let handlers = HandlerSet::from_config(config.as_ref())?;
        let pool_configs = PoolConfig::all_from_config(config.as_ref())?;

        let components = ComponentGraph::new(loader, Arc::clone(&config));
        components.declare_from_config()?;

        let globals = Arc::new_cyclic(|weak: &Weak<GlobalContext>| {
            let dispatcher: Arc<dyn TaskHandler<RequestTask>> =
                Arc::new(RequestDispatcher::new(weak.clone(), protocol));
            let pools = pool_configs
                .into_iter()
                .map(|(name, pool)| {
                    let request_pool = RequestPool::with_shared_handler(
                        name.clone(),
                        pool.threads,
                        pool.queue_capacity,
                        Arc::clone(&dispatcher),
                    );
                    (name, Arc::new(request_pool))
                })
                .collect();
            Self {
                config,
                server_config,
                handlers,
                pools,
                logger: RwLock::new(None),
                statistics: RwLock::new(None),
                components,
            }
        });
        globals.components.attach_globals(Arc::downgrade(&globals));

        debug!(
            components = globals.components.len(),
            handlers = globals.handlers.len(),
            pools = globals.pools.len(),
            "Global context created"
        );
        Ok(globals)
    }

    pub fn config(&self) -> &dyn Config {
        self.config.as_ref()
    }

    pub fn config_arc(&self) -> Arc<dyn Config> {
        Arc::clone(&self.config)
    }

    pub fn server_config(&self) -> &ServerConfig {
        &self.server_config
    }

    pub fn components(&self) -> &ComponentGraph {
        &self.components
    }

    pub fn handlers(&self) -> &HandlerSet {
        &self.handlers
    }

    /// Construct and load every component, then wire up the designated
    /// logger and statistics components and check that every handler chain
    /// refers to components able to handle requests.
    pub fn load_components(&self) -> Result<(), ComponentError> {
        self.components.send_on_load_to_all()?;

        if let Some(name) = &self.server_config.logger {
            let component = self.components.find(name)?;
            if component.as_logger().is_none() {
                return Err(ComponentError::MissingCapability {
                    name: name.clone(),
                    capability: "logger",
                });
            }
            *self.logger.write() = Some(Arc::downgrade(&component));
            info!(component = %name, "Designated logger attached");
        }

        if let Some(name) = &self.server_config.statistics {
            let statistics = self.components.find_as::<ResponseTimeStats>(name)?;
            *self.statistics.write() = Some(Arc::downgrade(&statistics));
        }

        for descriptor in self.handlers.iter() {
            for name in &descriptor.components {
                if self.components.find(name)?.as_handler().is_none() {
                    return Err(ComponentError::MissingCapability {
                        name: name.clone(),
                        capability: "request handler",
                    });
                }
            }
        }
        Ok(())
    }

    pub fn unload_components(&self) -> Result<(), ComponentError> {
        self.components.send_on_unload_to_all()
    }

    /// Start every request pool that is not running yet.
    pub fn start_pools(&self) -> Result<(), PoolError> {
        for (name, pool) in &self.pools {
            let pool_name = name.clone();
            pool.start(move || trace!(pool = %pool_name, "Request worker ready"))?;
        }
        Ok(())
    }

    pub fn stop_pools(&self) {
        for (_, pool) in &self.pools {
            pool.stop();
        }
    }

    pub fn join_pools(&self) {
        for (_, pool) in &self.pools {
            pool.join();
        }
    }

    pub fn pool(&self, name: &str) -> Option<Arc<RequestPool>> {
        self.pools
            .iter()
            .find(|(pool_name, _)| pool_name == name)
            .map(|(_, pool)| Arc::clone(pool))
    }

    /// Request pools in configuration order.
    pub fn pools(&self) -> impl Iterator<Item = (&str, &Arc<RequestPool>)> {
        self.pools.iter().map(|(name, pool)| (name.as_str(), pool))
    }

    /// The designated logging component, while the graph still holds it.
    pub fn logger(&self) -> Option<Arc<dyn Component>> {
        self.logger.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn statistics(&self) -> Option<Arc<ResponseTimeStats>> {
        self.statistics.read().as_ref().and_then(Weak::upgrade)
    }

    /// Log through the designated logger, or `tracing` when there is none.
    pub fn log(&self, level: LogLevel, message: &str) {
        if let Some(component) = self.logger() {
            if let Some(logger) = component.as_logger() {
                logger.log(level, message);
                return;
            }
        }
        match level {
            LogLevel::Debug => debug!("{}", message),
            LogLevel::Info => info!("{}", message),
            LogLevel::Warning => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
    }

    /// Record handler latency when `daemon/log-times` is enabled.
    pub fn record_response_time(&self, handler: &str, status: u16, elapsed: Duration) {
        if !self.server_config.log_times {
            return;
        }
        if let Some(statistics) = self.statistics() {
            statistics.add(handler, status, elapsed);
        }
    }
}
