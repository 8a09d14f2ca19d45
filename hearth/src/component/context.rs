use std::sync::{Arc, Weak};

use hearth_api::{Component, Config};

use super::graph::ComponentGraph;
use crate::error::ComponentError;
use crate::globals::GlobalContext;

/// What a factory sees while constructing one component.
///
/// Borrowed for the duration of the factory call only. Components that need
/// a sibling look it up here and keep the returned `Arc`.
pub struct ComponentContext<'a> {
    name: &'a str,
    config_path: &'a str,
    graph: &'a ComponentGraph,
}

impl<'a> ComponentContext<'a> {
    pub(crate) fn new(name: &'a str, config_path: &'a str, graph: &'a ComponentGraph) -> Self {
        Self {
            name,
            config_path,
            graph,
        }
    }

    /// Name under which the component is declared.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Root of the component's configuration subtree.
    pub fn config_path(&self) -> &str {
        self.config_path
    }

    pub fn config(&self) -> &dyn Config {
        self.graph.config()
    }

    /// Full path of `sub` inside the component's configuration subtree.
    pub fn key(&self, sub: &str) -> String {
        format!("{}/{}", self.config_path, sub.trim_start_matches('/'))
    }

    /// Shorthand for `config().value(key(sub))`.
    pub fn value(&self, sub: &str) -> Option<String> {
        self.config().value(&self.key(sub))
    }

    /// Resolve a dependency, constructing it first if needed.
    pub fn find(&self, name: &str) -> Result<Arc<dyn Component>, ComponentError> {
        self.graph.find(name)
    }

    pub fn find_as<T: Component>(&self, name: &str) -> Result<Arc<T>, ComponentError> {
        self.graph.find_as::<T>(name)
    }

    /// The daemon's global context, when the graph is owned by one.
    pub fn globals(&self) -> Option<Arc<GlobalContext>> {
        self.graph.globals().upgrade()
    }

    pub fn globals_weak(&self) -> Weak<GlobalContext> {
        self.graph.globals()
    }
}
