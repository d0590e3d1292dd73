//! Runtime backend registry for selecting backends by name.
//!
//! Backend crates register a constructor under a name; the hybrid backend and the C runtime
//! resolve member backends through this registry once, at configuration time.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use super::spec::Backend;

/// Factory function that creates a new backend instance.
pub type BackendConstructor = Box<dyn Fn() -> Arc<dyn Backend> + Send + Sync>;

/// Global backend registry mapping backend names to constructors.
struct BackendRegistry {
    backends: RwLock<HashMap<String, BackendConstructor>>,
}

impl BackendRegistry {
    fn new() -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, name: String, constructor: BackendConstructor) {
        let replaced = self
            .backends
            .write()
            .expect("backend registry poisoned")
            .insert(name.clone(), constructor)
            .is_some();
        if replaced {
            log::debug!("backend `{name}` re-registered");
        }
    }

    fn create(&self, name: &str) -> Option<Arc<dyn Backend>> {
        let registry = self.backends.read().expect("backend registry poisoned");
        let constructor = registry.get(name)?;
        Some(constructor())
    }

    fn list_backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .backends
            .read()
            .expect("backend registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn has_backend(&self, name: &str) -> bool {
        self.backends
            .read()
            .expect("backend registry poisoned")
            .contains_key(name)
    }
}

static GLOBAL_REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();

fn global_registry() -> &'static BackendRegistry {
    GLOBAL_REGISTRY.get_or_init(BackendRegistry::new)
}

/// Register a backend by name. A later registration under the same name replaces it.
///
/// The constructor runs each time the backend is requested via [`create_backend`].
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use hybrid_rs::backend::registry::{create_backend, register_backend};
/// use hybrid_rs::backend::spec::{Backend, BackendResult};
/// use hybrid_rs::{Function, TensorRef};
///
/// struct Null;
///
/// impl Backend for Null {
///     fn backend_name(&self) -> &str {
///         "null"
///     }
///     fn compile(&self, _function: &Function) -> BackendResult<()> {
///         Ok(())
///     }
///     fn call(&self, _: &Function, _: &[TensorRef], _: &[TensorRef]) -> BackendResult<()> {
///         Ok(())
///     }
/// }
///
/// register_backend("null", || Arc::new(Null) as Arc<dyn Backend>);
/// assert_eq!(create_backend("null").unwrap().backend_name(), "null");
/// ```
pub fn register_backend<F>(name: impl Into<String>, constructor: F)
where
    F: Fn() -> Arc<dyn Backend> + Send + Sync + 'static,
{
    global_registry().register(name.into(), Box::new(constructor));
}

/// Create a backend instance by name.
///
/// Returns `None` if no backend with the given name has been registered.
pub fn create_backend(name: &str) -> Option<Arc<dyn Backend>> {
    global_registry().create(name)
}

/// List all registered backend names, sorted.
pub fn list_backends() -> Vec<String> {
    global_registry().list_backends()
}

/// Check if a backend with the given name is registered.
pub fn has_backend(name: &str) -> bool {
    global_registry().has_backend(name)
}
