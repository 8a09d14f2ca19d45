//! # Component Loader
//!
//! Keeps the table of component factories and the plugin libraries that
//! registered them.
//!
//! A module (statically linked or a shared library) exposes one entry point
//! of type [`ModuleEntry`]. The loader calls it with a [`FactoryRegistrar`]
//! scoped to the module name, and every factory added through it becomes
//! reachable as `"<module>:<factory>"`.
//!
//! A shared library module exports the entry point under
//! [`MODULE_ENTRY_SYMBOL`]:
//!
//! ```rust,ignore
//! #[no_mangle]
//! pub fn hearth_register_factories(registrar: &mut FactoryRegistrar<'_>) {
//!     registrar.add("logger", |ctx| Ok(Box::new(FileLogger::new(ctx)?)));
//! }
//! ```
//!
//! The library must be built with the same compiler and `hearth` version as
//! the host.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use hearth_api::{Component, Config};
use tracing::{debug, info, warn};

use super::context::ComponentContext;
use crate::error::LoaderError;

/// Symbol looked up in shared library modules.
pub const MODULE_ENTRY_SYMBOL: &[u8] = b"hearth_register_factories";

/// Name of the module holding the factories compiled into this crate.
pub const BUILTIN_MODULE: &str = "hearth";

/// Registration entry point of a module.
pub type ModuleEntry = fn(&mut FactoryRegistrar<'_>);

/// Constructor for one component type.
pub trait ComponentFactory: Send + Sync {
    fn create(&self, context: &ComponentContext<'_>) -> anyhow::Result<Box<dyn Component>>;
}

impl<F> ComponentFactory for F
where
    F: Fn(&ComponentContext<'_>) -> anyhow::Result<Box<dyn Component>> + Send + Sync,
{
    fn create(&self, context: &ComponentContext<'_>) -> anyhow::Result<Box<dyn Component>> {
        self(context)
    }
}

type FactoryMap = HashMap<String, Arc<dyn ComponentFactory>>;

/// Handle passed to a module entry point.
pub struct FactoryRegistrar<'a> {
    module: &'a str,
    factories: &'a mut FactoryMap,
}

impl FactoryRegistrar<'_> {
    pub fn module(&self) -> &str {
        self.module
    }

    /// Register a factory closure under `"<module>:<name>"`.
    pub fn add<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ComponentContext<'_>) -> anyhow::Result<Box<dyn Component>> + Send + Sync + 'static,
    {
        self.add_factory(name, Arc::new(factory));
    }

    /// Register a shared factory. The last registration of a key wins.
    pub fn add_factory(&mut self, name: &str, factory: Arc<dyn ComponentFactory>) {
        let key = format!("{}:{}", self.module, name);
        if self.factories.insert(key.clone(), factory).is_some() {
            warn!(factory = %key, "Component factory registered twice, replacing previous one");
        } else {
            debug!(factory = %key, "Component factory registered");
        }
    }
}

/// Factory table plus the libraries backing it.
pub struct Loader {
    // Declared before `libraries`: factory code must be dropped while the
    // library that contains it is still mapped.
    factories: FactoryMap,
    libraries: Vec<(String, libloading::Library)>,
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut factories: Vec<&String> = self.factories.keys().collect();
        factories.sort();
        f.debug_struct("Loader")
            .field("factories", &factories)
            .field(
                "libraries",
                &self.libraries.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader {
    /// Loader with the built-in `hearth` module registered.
    pub fn new() -> Self {
        let mut loader = Self::empty();
        loader.register_module(BUILTIN_MODULE, crate::builtin::register_factories);
        loader
    }

    /// Loader with no factories at all.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
            libraries: Vec::new(),
        }
    }

    /// Load every module listed under `modules/<name>/path`.
    pub fn init(&mut self, config: &dyn Config) -> Result<(), LoaderError> {
        for name in config.subkeys("modules") {
            let path = config
                .as_string(&format!("modules/{}/path", name))
                .map_err(|e| LoaderError::ModuleLoad {
                    name: name.clone(),
                    path: String::new(),
                    reason: e.to_string(),
                })?;
            self.load_module(&name, &path)?;
        }
        Ok(())
    }

    /// Run a statically linked module entry point.
    pub fn register_module(&mut self, name: &str, entry: ModuleEntry) {
        entry(&mut self.registrar(name));
    }

    /// Registrar for factories added directly by the embedding program.
    pub fn registrar<'a>(&'a mut self, module: &'a str) -> FactoryRegistrar<'a> {
        FactoryRegistrar {
            module,
            factories: &mut self.factories,
        }
    }

    /// Open a shared library and run its registration entry point.
    ///
    /// # Errors
    /// `LoaderError::ModuleLoad` with the dynamic loader's diagnostic when the
    /// library cannot be opened or lacks [`MODULE_ENTRY_SYMBOL`].
    pub fn load_module(&mut self, name: &str, path: impl AsRef<Path>) -> Result<(), LoaderError> {
        let path = path.as_ref();
        let load_error = |reason: String| LoaderError::ModuleLoad {
            name: name.to_string(),
            path: path.display().to_string(),
            reason,
        };

        // SAFETY: loading a library runs its initializers; modules are trusted
        // configuration supplied by the operator.
        let library = unsafe { libloading::Library::new(path) }.map_err(|e| load_error(e.to_string()))?;

        // SAFETY: the symbol is declared by the module contract with the
        // `ModuleEntry` signature, and `library` outlives every use of it.
        let entry: ModuleEntry = unsafe {
            library
                .get::<ModuleEntry>(MODULE_ENTRY_SYMBOL)
                .map(|symbol| *symbol)
                .map_err(|e| load_error(e.to_string()))?
        };

        self.register_module(name, entry);
        self.libraries.push((name.to_string(), library));
        info!(module = %name, path = %path.display(), "Module loaded");
        Ok(())
    }

    /// Look up the factory registered under `component_type`.
    pub fn find_factory(&self, component_type: &str) -> Result<Arc<dyn ComponentFactory>, LoaderError> {
        self.factories
            .get(component_type)
            .cloned()
            .ok_or_else(|| LoaderError::UnknownComponentType(component_type.to_string()))
    }

    pub fn has_factory(&self, component_type: &str) -> bool {
        self.factories.contains_key(component_type)
    }

    /// Registered factory keys, sorted.
    pub fn factory_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}
