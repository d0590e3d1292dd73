//! Loads backends from shared libraries exposing the hybrid-rs factory entry points.
//!
//! A backend library exports three C symbols:
//! - `hybrid_rs_version_string() -> *const c_char`
//! - `hybrid_rs_new_backend(configuration: *const c_char) -> *mut BackendHandle` (null on error)
//! - `hybrid_rs_delete_backend(handle: *mut BackendHandle)`
//!
//! The handle carries a Rust trait object, so the library must be built from the same
//! hybrid-rs version with the same toolchain. The version string is checked on open.

use std::ffi::{c_char, CStr, CString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

use libloading::Library;

use crate::graph::Function;
use crate::tensor::TensorRef;

use super::spec::{Backend, BackendError, BackendResult, Operation, TensorSpec};

pub const VERSION_SYMBOL: &[u8] = b"hybrid_rs_version_string\0";
pub const NEW_BACKEND_SYMBOL: &[u8] = b"hybrid_rs_new_backend\0";
pub const DELETE_BACKEND_SYMBOL: &[u8] = b"hybrid_rs_delete_backend\0";

type VersionFn = unsafe extern "C" fn() -> *const c_char;
type NewBackendFn = unsafe extern "C" fn(*const c_char) -> *mut BackendHandle;
type DeleteBackendFn = unsafe extern "C" fn(*mut BackendHandle);

/// Opaque owner of a backend instance handed across the C boundary.
#[repr(C)]
pub struct BackendHandle {
    backend: Arc<dyn Backend>,
}

impl BackendHandle {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }
}

/// An opened backend library with its factory symbols resolved.
pub struct BackendLibrary {
    library: Arc<Library>,
    path: PathBuf,
    version: String,
    new_backend: NewBackendFn,
    delete_backend: DeleteBackendFn,
}

impl BackendLibrary {
    /// Opens `path`, resolves the factory symbols and checks the library version.
    ///
    /// # Safety
    /// Loading a library runs its initialisers, and the resolved symbols are trusted to have
    /// the signatures documented at module level.
    pub unsafe fn open(path: impl AsRef<Path>) -> BackendResult<Self> {
        let path = path.as_ref().to_path_buf();
        let library = Library::new(&path).map_err(|err| {
            BackendError::library(format!("failed to load {}: {err}", path.display()))
        })?;
        let symbol_error = |name: &[u8], err: libloading::Error| {
            BackendError::library(format!(
                "{} does not export {}: {err}",
                path.display(),
                String::from_utf8_lossy(&name[..name.len() - 1])
            ))
        };

        let version_fn = *library
            .get::<VersionFn>(VERSION_SYMBOL)
            .map_err(|err| symbol_error(VERSION_SYMBOL, err))?;
        let new_backend = *library
            .get::<NewBackendFn>(NEW_BACKEND_SYMBOL)
            .map_err(|err| symbol_error(NEW_BACKEND_SYMBOL, err))?;
        let delete_backend = *library
            .get::<DeleteBackendFn>(DELETE_BACKEND_SYMBOL)
            .map_err(|err| symbol_error(DELETE_BACKEND_SYMBOL, err))?;

        let raw_version = version_fn();
        if raw_version.is_null() {
            return Err(BackendError::library(format!(
                "{} returned a null version string",
                path.display()
            )));
        }
        let version = CStr::from_ptr(raw_version).to_string_lossy().into_owned();
        if version != crate::VERSION {
            return Err(BackendError::library(format!(
                "{} was built against hybrid-rs {version}, host is {}",
                path.display(),
                crate::VERSION
            )));
        }
        log::debug!("loaded backend library {} ({version})", path.display());

        Ok(Self {
            library: Arc::new(library),
            path,
            version,
            new_backend,
            delete_backend,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Instantiates a backend from a configuration string.
    pub fn create(&self, configuration: &str) -> BackendResult<LoadedBackend> {
        let configuration = CString::new(configuration)
            .map_err(|_| BackendError::config("configuration contains a NUL byte"))?;
        let raw = unsafe { (self.new_backend)(configuration.as_ptr()) };
        let handle = NonNull::new(raw).ok_or_else(|| {
            BackendError::library(format!(
                "{} rejected configuration {configuration:?}",
                self.path.display()
            ))
        })?;
        Ok(LoadedBackend {
            handle,
            delete_backend: self.delete_backend,
            _library: Arc::clone(&self.library),
        })
    }
}

impl fmt::Debug for BackendLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendLibrary")
            .field("path", &self.path)
            .field("version", &self.version)
            .finish()
    }
}

/// Backend instance owned by a loaded library. Destroyed through the library on drop.
pub struct LoadedBackend {
    handle: NonNull<BackendHandle>,
    delete_backend: DeleteBackendFn,
    _library: Arc<Library>,
}

// SAFETY: the handle wraps an `Arc<dyn Backend>`, which is `Send + Sync`, and is only
// freed in `Drop`.
unsafe impl Send for LoadedBackend {}
unsafe impl Sync for LoadedBackend {}

impl LoadedBackend {
    fn inner(&self) -> &dyn Backend {
        unsafe { self.handle.as_ref() }.backend.as_ref()
    }
}

impl Backend for LoadedBackend {
    fn backend_name(&self) -> &str {
        self.inner().backend_name()
    }

    fn create_tensor(&self, spec: TensorSpec) -> BackendResult<TensorRef> {
        self.inner().create_tensor(spec)
    }

    unsafe fn create_tensor_with_memory(
        &self,
        spec: TensorSpec,
        memory: NonNull<u8>,
    ) -> BackendResult<TensorRef> {
        self.inner().create_tensor_with_memory(spec, memory)
    }

    fn supports(&self, op: &Operation) -> bool {
        self.inner().supports(op)
    }

    fn compile(&self, function: &Function) -> BackendResult<()> {
        self.inner().compile(function)
    }

    fn call(
        &self,
        function: &Function,
        outputs: &[TensorRef],
        inputs: &[TensorRef],
    ) -> BackendResult<()> {
        self.inner().call(function, outputs, inputs)
    }
}

impl Drop for LoadedBackend {
    fn drop(&mut self) {
        unsafe { (self.delete_backend)(self.handle.as_ptr()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_is_a_library_error() {
        let err = unsafe { BackendLibrary::open("/nonexistent/libhybrid_rs_missing.so") }
            .unwrap_err();
        assert!(matches!(err, BackendError::Library { .. }));
    }
}
