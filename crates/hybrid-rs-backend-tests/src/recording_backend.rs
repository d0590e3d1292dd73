use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use hybrid_rs::backend::spec::{Backend, BackendResult, Operation, TensorSpec};
use hybrid_rs::{Function, TensorRef};

/// Per-entry-point invocation counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub compiles: usize,
    pub calls: usize,
    pub tensors: usize,
}

/// Test-only wrapper that records how often each backend entry point was invoked and
/// which functions it saw, then forwards to the wrapped backend.
pub struct RecordingBackend {
    inner: Arc<dyn Backend>,
    counts: Mutex<CallCounts>,
    compiled: Mutex<Vec<String>>,
}

impl RecordingBackend {
    pub fn new(inner: Arc<dyn Backend>) -> Self {
        Self {
            inner,
            counts: Mutex::new(CallCounts::default()),
            compiled: Mutex::new(Vec::new()),
        }
    }

    pub fn counts(&self) -> CallCounts {
        *self.counts.lock().expect("backend mutex poisoned")
    }

    /// Names of compiled functions, in compile order.
    pub fn compiled_functions(&self) -> Vec<String> {
        self.compiled.lock().expect("backend mutex poisoned").clone()
    }

    fn bump(&self, update: impl FnOnce(&mut CallCounts)) {
        update(&mut self.counts.lock().expect("backend mutex poisoned"));
    }
}

impl Backend for RecordingBackend {
    fn backend_name(&self) -> &str {
        self.inner.backend_name()
    }

    fn create_tensor(&self, spec: TensorSpec) -> BackendResult<TensorRef> {
        self.bump(|counts| counts.tensors += 1);
        self.inner.create_tensor(spec)
    }

    unsafe fn create_tensor_with_memory(
        &self,
        spec: TensorSpec,
        memory: NonNull<u8>,
    ) -> BackendResult<TensorRef> {
        self.bump(|counts| counts.tensors += 1);
        self.inner.create_tensor_with_memory(spec, memory)
    }

    fn supports(&self, op: &Operation) -> bool {
        self.inner.supports(op)
    }

    fn compile(&self, function: &Function) -> BackendResult<()> {
        self.bump(|counts| counts.compiles += 1);
        self.compiled
            .lock()
            .expect("backend mutex poisoned")
            .push(function.name().to_string());
        self.inner.compile(function)
    }

    fn call(
        &self,
        function: &Function,
        outputs: &[TensorRef],
        inputs: &[TensorRef],
    ) -> BackendResult<()> {
        self.bump(|counts| counts.calls += 1);
        self.inner.call(function, outputs, inputs)
    }
}
