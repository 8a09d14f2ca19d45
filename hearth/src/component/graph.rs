//! # Component Graph
//!
//! Owns every component instance and builds them on first use.
//!
//! ## Core Algorithm
//! `find(name)` on an entry:
//! 1. `Loaded`: return the shared instance
//! 2. `Failed`: report the recorded construction failure, never retry
//! 3. `Loading`: the name is already on the load stack, so this request
//!    closes a cycle
//! 4. `Declared`: mark `Loading`, push the name on the load stack, run the
//!    factory (which may call `find` recursively), then record the result
//!
//! ## Thread Safety
//! The whole graph sits behind one re-entrant mutex. The constructing thread
//! may recurse into `find` from inside a factory; any other thread asking for
//! a component blocks until that construction finishes, so each component is
//! built at most once. The inner `RefCell` is never borrowed across a factory
//! or lifecycle hook call.

use std::any::type_name;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, Weak};

use hearth_api::{Component, Config};
use parking_lot::ReentrantMutex;
use tracing::{debug, error, info, warn};

use super::context::ComponentContext;
use super::loader::Loader;
use crate::error::{panic_message, ComponentError, DaemonError};
use crate::globals::GlobalContext;

/// Construction state of one declared component.
enum Slot {
    Declared,
    Loading,
    Loaded(Arc<dyn Component>),
    Failed(String),
}

impl Slot {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Declared => "declared",
            Self::Loading => "loading",
            Self::Loaded(_) => "loaded",
            Self::Failed(_) => "failed",
        }
    }
}

struct ComponentEntry {
    component_type: String,
    config_path: String,
    slot: Slot,
}

#[derive(Default)]
struct GraphState {
    entries: HashMap<String, ComponentEntry>,
    declared: Vec<String>,
    load_order: Vec<String>,
    load_stack: Vec<String>,
    load_sent: bool,
    unload_sent: bool,
}

struct GraphInner {
    loader: Arc<Loader>,
    config: Arc<dyn Config>,
    globals: OnceLock<Weak<GlobalContext>>,
    state: ReentrantMutex<RefCell<GraphState>>,
}

impl Drop for GraphInner {
    fn drop(&mut self) {
        let mut state = std::mem::take(self.state.get_mut().get_mut());
        for name in state.load_order.iter().rev() {
            if let Some(entry) = state.entries.remove(name) {
                debug!(component = %name, "Releasing component");
                drop(entry);
            }
        }
    }
}

/// Named components and their construction state.
///
/// Cloning yields another handle to the same graph.
#[derive(Clone)]
pub struct ComponentGraph {
    inner: Arc<GraphInner>,
}

impl fmt::Debug for ComponentGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        let mut map = f.debug_map();
        for name in &state.declared {
            if let Some(entry) = state.entries.get(name) {
                map.entry(name, &entry.slot.as_str());
            }
        }
        map.finish()
    }
}

impl ComponentGraph {
    pub fn new(loader: Arc<Loader>, config: Arc<dyn Config>) -> Self {
        Self {
            inner: Arc::new(GraphInner {
                loader,
                config,
                globals: OnceLock::new(),
                state: ReentrantMutex::new(RefCell::new(GraphState::default())),
            }),
        }
    }

    pub fn config(&self) -> &dyn Config {
        self.inner.config.as_ref()
    }

    pub fn loader(&self) -> &Loader {
        &self.inner.loader
    }

    /// Let components reach the global context. Only the first call counts.
    pub(crate) fn attach_globals(&self, globals: Weak<GlobalContext>) {
        let _ = self.inner.globals.set(globals);
    }

    pub(crate) fn globals(&self) -> Weak<GlobalContext> {
        self.inner.globals.get().cloned().unwrap_or_default()
    }

    /// Record a component without constructing it.
    pub fn declare(
        &self,
        name: &str,
        component_type: &str,
        config_path: &str,
    ) -> Result<(), ComponentError> {
        let guard = self.inner.state.lock();
        let mut state = guard.borrow_mut();
        if state.entries.contains_key(name) {
            return Err(ComponentError::Duplicate(name.to_string()));
        }
        state.entries.insert(
            name.to_string(),
            ComponentEntry {
                component_type: component_type.to_string(),
                config_path: config_path.to_string(),
                slot: Slot::Declared,
            },
        );
        state.declared.push(name.to_string());
        debug!(component = %name, component_type = %component_type, "Component declared");
        Ok(())
    }

    /// Declare every `components/<name>` entry, its type read from
    /// `components/<name>/type`.
    pub fn declare_from_config(&self) -> Result<(), DaemonError> {
        let config = Arc::clone(&self.inner.config);
        for name in config.subkeys("components") {
            let config_path = format!("components/{}", name);
            let component_type = config.as_string(&format!("{}/type", config_path))?;
            self.declare(&name, &component_type, &config_path)?;
        }
        Ok(())
    }

    /// Return the named component, constructing it and its dependencies on
    /// first use.
    ///
    /// # Errors
    /// * `NotDeclared` - no component of that name
    /// * `UnknownComponentType` - no factory for its type; the entry stays
    ///   declared
    /// * `CyclicDependency` - the component is already under construction on
    ///   this thread
    /// * `ConstructionFailed` - its factory failed, now or earlier
    pub fn find(&self, name: &str) -> Result<Arc<dyn Component>, ComponentError> {
        let guard = self.inner.state.lock();

        let (component_type, config_path) = {
            let state = guard.borrow();
            let entry = state
                .entries
                .get(name)
                .ok_or_else(|| ComponentError::NotDeclared(name.to_string()))?;
            match &entry.slot {
                Slot::Loaded(component) => return Ok(Arc::clone(component)),
                Slot::Failed(reason) => {
                    return Err(ComponentError::ConstructionFailed {
                        name: name.to_string(),
                        reason: reason.clone(),
                    })
                }
                Slot::Loading => {
                    let start = state
                        .load_stack
                        .iter()
                        .position(|loading| loading == name)
                        .unwrap_or(0);
                    let mut cycle = state.load_stack[start..].to_vec();
                    cycle.push(name.to_string());
                    return Err(ComponentError::CyclicDependency(cycle));
                }
                Slot::Declared => (entry.component_type.clone(), entry.config_path.clone()),
            }
        };

        let factory = self.inner.loader.find_factory(&component_type).map_err(|_| {
            ComponentError::UnknownComponentType {
                name: name.to_string(),
                component_type: component_type.clone(),
            }
        })?;

        {
            let mut state = guard.borrow_mut();
            state.load_stack.push(name.to_string());
            if let Some(entry) = state.entries.get_mut(name) {
                entry.slot = Slot::Loading;
            }
        }
        debug!(component = %name, component_type = %component_type, "Constructing component");

        let context = ComponentContext::new(name, &config_path, self);
        let created = panic::catch_unwind(AssertUnwindSafe(|| factory.create(&context)));

        let mut state = guard.borrow_mut();
        state.load_stack.pop();
        let outcome = match created {
            Ok(Ok(component)) => Ok(Arc::<dyn Component>::from(component)),
            Ok(Err(e)) => match e.downcast_ref::<ComponentError>() {
                Some(ComponentError::CyclicDependency(cycle)) => {
                    Err(ComponentError::CyclicDependency(cycle.clone()))
                }
                _ => Err(ComponentError::ConstructionFailed {
                    name: name.to_string(),
                    reason: format!("{:#}", e),
                }),
            },
            Err(payload) => Err(ComponentError::ConstructionFailed {
                name: name.to_string(),
                reason: format!("panicked: {}", panic_message(payload.as_ref())),
            }),
        };

        let slot = match &outcome {
            Ok(component) => {
                state.load_order.push(name.to_string());
                Slot::Loaded(Arc::clone(component))
            }
            Err(e) => {
                warn!(component = %name, error = %e, "Component construction failed");
                match e {
                    ComponentError::ConstructionFailed { reason, .. } => Slot::Failed(reason.clone()),
                    other => Slot::Failed(other.to_string()),
                }
            }
        };
        if let Some(entry) = state.entries.get_mut(name) {
            entry.slot = slot;
        }
        outcome
    }

    /// [`find`](Self::find) followed by a downcast to the concrete type.
    pub fn find_as<T: Component>(&self, name: &str) -> Result<Arc<T>, ComponentError> {
        self.find(name)?
            .downcast_arc::<T>()
            .map_err(|_| ComponentError::TypeMismatch {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Construct every declared component, then call `on_load` on each in
    /// load order. Only the first call does anything.
    pub fn send_on_load_to_all(&self) -> Result<(), ComponentError> {
        let guard = self.inner.state.lock();
        let declared = {
            let mut state = guard.borrow_mut();
            if state.load_sent {
                return Ok(());
            }
            state.load_sent = true;
            state.declared.clone()
        };

        for name in &declared {
            self.find(name)?;
        }

        let loaded = self.loaded_in_order(&guard.borrow());
        drop(guard);

        for (name, component) in loaded {
            match panic::catch_unwind(AssertUnwindSafe(|| component.on_load())) {
                Ok(Ok(())) => debug!(component = %name, "Component loaded"),
                Ok(Err(e)) => {
                    return Err(ComponentError::LoadFailed {
                        name,
                        reason: format!("{:#}", e),
                    })
                }
                Err(payload) => {
                    return Err(ComponentError::LoadFailed {
                        name,
                        reason: format!("panicked: {}", panic_message(payload.as_ref())),
                    })
                }
            }
        }
        info!(components = declared.len(), "All components loaded");
        Ok(())
    }

    /// Call `on_unload` on every constructed component in reverse load
    /// order. Every component is attempted; failures are collected.
    pub fn send_on_unload_to_all(&self) -> Result<(), ComponentError> {
        let loaded = {
            let guard = self.inner.state.lock();
            let mut state = guard.borrow_mut();
            if state.unload_sent {
                return Ok(());
            }
            state.unload_sent = true;
            self.loaded_in_order(&state)
        };

        let mut failures = Vec::new();
        for (name, component) in loaded.into_iter().rev() {
            let reason = match panic::catch_unwind(AssertUnwindSafe(|| component.on_unload())) {
                Ok(Ok(())) => {
                    debug!(component = %name, "Component unloaded");
                    continue;
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };
            error!(component = %name, error = %reason, "Component failed to unload");
            failures.push((name, reason));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ComponentError::UnloadFailed(failures))
        }
    }

    fn loaded_in_order(&self, state: &GraphState) -> Vec<(String, Arc<dyn Component>)> {
        state
            .load_order
            .iter()
            .filter_map(|name| match state.entries.get(name).map(|entry| &entry.slot) {
                Some(Slot::Loaded(component)) => Some((name.clone(), Arc::clone(component))),
                _ => None,
            })
            .collect()
    }

    /// Declared component names, in declaration order.
    pub fn names(&self) -> Vec<String> {
        self.inner.state.lock().borrow().declared.clone()
    }

    /// Names of constructed components, in construction order.
    pub fn load_order(&self) -> Vec<String> {
        self.inner.state.lock().borrow().load_order.clone()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        matches!(state.entries.get(name).map(|e| &e.slot), Some(Slot::Loaded(_)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.state.lock().borrow().entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().borrow().declared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
