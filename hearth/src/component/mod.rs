//! # Component Module
//!
//! Assembles the daemon's components at startup.
//!
//! ## Key Concepts
//! - [`Loader`]: factory table filled by modules, keyed `"<module>:<factory>"`
//! - [`ComponentGraph`]: declared components, built on demand in dependency
//!   order, with cycle detection
//! - [`ComponentContext`]: handed to a factory so the new component can read
//!   its configuration and resolve the components it depends on
//!
//! ## Lifecycle
//! 1. Declare every component (usually from `components/<name>/type`)
//! 2. `send_on_load_to_all`: construct everything, then run `on_load` in
//!    load order
//! 3. Serve
//! 4. `send_on_unload_to_all`: run `on_unload` in reverse load order
//! 5. Drop the graph: instances are released in reverse load order

mod context;
mod graph;
mod loader;

pub use context::ComponentContext;
pub use graph::ComponentGraph;
pub use loader::{
    ComponentFactory, FactoryRegistrar, Loader, ModuleEntry, BUILTIN_MODULE, MODULE_ENTRY_SYMBOL,
};
