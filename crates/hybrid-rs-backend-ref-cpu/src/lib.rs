pub mod cpu;

use std::sync::Arc;

use hybrid_rs::backend::registry;
use hybrid_rs::Backend;

pub use cpu::{CpuBackend, CpuTensor, TensorData};

/// Register the CPU backend with the global backend registry under `"cpu"`.
///
/// This function is called automatically via a static initializer, but can also
/// be called manually to ensure the backend is registered.
pub fn register_cpu_backend() {
    registry::register_backend("cpu", || Arc::new(CpuBackend::new()) as Arc<dyn Backend>);
}

// Auto-register on library load
#[cfg(not(target_family = "wasm"))]
#[used]
#[link_section = ".init_array"]
static REGISTER_CPU_BACKEND: extern "C" fn() = {
    extern "C" fn register() {
        register_cpu_backend();
    }
    register
};
