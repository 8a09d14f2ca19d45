//! Factories compiled into the daemon, registered as module `hearth`.

use crate::component::FactoryRegistrar;
use crate::logging::TracingLogger;
use crate::stats::ResponseTimeStats;

/// `hearth:tracing-logger` and `hearth:response-time`.
pub fn register_factories(registrar: &mut FactoryRegistrar<'_>) {
    registrar.add("tracing-logger", |ctx| Ok(Box::new(TracingLogger::from_context(ctx)?)));
    registrar.add("response-time", |ctx| Ok(Box::new(ResponseTimeStats::from_context(ctx)?)));
}
