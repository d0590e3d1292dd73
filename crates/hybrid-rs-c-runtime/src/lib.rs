//! C ABI factory entry points for the hybrid backend.
//!
//! Built as a `cdylib`, this crate is what [`hybrid_rs::backend::loader::BackendLibrary`]
//! opens. Every backend compiled into the library is registered before the configuration
//! is resolved, so configuration strings may name any of them.

use std::ffi::{c_char, CStr};
use std::ptr;
use std::sync::Arc;

use anyhow::{Context, Result};
use hybrid_rs::backend::loader::BackendHandle;
use hybrid_rs::{HybridBackend, HybridConfig};
use hybrid_rs_backend_ref_cpu::register_cpu_backend;

/// Returns the hybrid-rs version this library was built against. The string is static.
#[no_mangle]
pub extern "C" fn hybrid_rs_version_string() -> *const c_char {
    hybrid_rs::VERSION_CSTR.as_ptr().cast()
}

#[no_mangle]
/// Builds a hybrid backend from a configuration string. Returns null on failure.
///
/// # Safety
/// `configuration` must be null or point to a NUL-terminated string that stays valid for
/// the duration of the call. A null pointer is treated as an empty configuration.
pub unsafe extern "C" fn hybrid_rs_new_backend(configuration: *const c_char) -> *mut BackendHandle {
    let configuration = if configuration.is_null() {
        Ok("")
    } else {
        unsafe { CStr::from_ptr(configuration) }.to_str()
    };
    let result = configuration
        .context("configuration is not valid UTF-8")
        .and_then(build_backend);
    match result {
        Ok(handle) => Box::into_raw(Box::new(handle)),
        Err(err) => {
            log::warn!("hybrid_rs_new_backend failed: {err:#}");
            ptr::null_mut()
        }
    }
}

#[no_mangle]
/// Destroys a backend created by [`hybrid_rs_new_backend`]. Null is ignored.
///
/// # Safety
/// `handle` must be null or a pointer returned by [`hybrid_rs_new_backend`] that has not
/// been deleted yet.
pub unsafe extern "C" fn hybrid_rs_delete_backend(handle: *mut BackendHandle) {
    if !handle.is_null() {
        drop(unsafe { Box::from_raw(handle) });
    }
}

fn build_backend(configuration: &str) -> Result<BackendHandle> {
    register_cpu_backend();
    let config = HybridConfig::parse(configuration)
        .with_context(|| format!("invalid configuration {configuration:?}"))?;
    let backend =
        HybridBackend::from_config(&config).context("failed to assemble hybrid backend")?;
    log::debug!("created hybrid backend over {:?}", backend.placements());
    Ok(BackendHandle::new(Arc::new(backend)))
}
