//! Host-backed tensor shared by every backend.

use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, RwLock};

use crate::backend::spec::{BackendError, BackendResult, Shape, TensorLiteral, TensorSpec};

use super::storage::{self, Scalar};

/// Shared handle to a host tensor. Cloning the handle aliases the buffer.
pub type TensorRef = Arc<HostTensor>;

enum Storage {
    Owned(Box<[u8]>),
    /// Caller-owned memory; validity is guaranteed by the `from_external` contract.
    External {
        ptr: NonNull<u8>,
        len: usize,
    },
}

// SAFETY: external memory is only reachable through the surrounding `RwLock`, and the
// creator of an external tensor promises exclusive access for the tensor's lifetime.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

impl Storage {
    fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Owned(bytes) => bytes,
            Storage::External { ptr, len } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), *len)
            },
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Storage::Owned(bytes) => bytes,
            Storage::External { ptr, len } => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr(), *len)
            },
        }
    }
}

/// Dense little-endian tensor living in host memory.
///
/// The spec is immutable; the payload sits behind a lock so a backend can fill an output
/// tensor through a shared [`TensorRef`].
pub struct HostTensor {
    spec: TensorSpec,
    storage: RwLock<Storage>,
}

fn required_len(spec: &TensorSpec) -> BackendResult<usize> {
    spec.byte_len().ok_or_else(|| {
        BackendError::execution(format!("tensor shape {} overflows usize", spec.shape))
    })
}

impl HostTensor {
    /// Allocates a zero-filled tensor.
    pub fn zeroed(spec: TensorSpec) -> BackendResult<Self> {
        let len = required_len(&spec)?;
        Ok(Self {
            spec,
            storage: RwLock::new(Storage::Owned(vec![0u8; len].into_boxed_slice())),
        })
    }

    /// Wraps an owned byte buffer, validating its length against the spec.
    pub fn from_bytes(spec: TensorSpec, bytes: Vec<u8>) -> BackendResult<Self> {
        let len = required_len(&spec)?;
        if bytes.len() != len {
            return Err(BackendError::ShapeMismatch {
                slot: "tensor payload".to_string(),
                expected: format!("{len} bytes"),
                found: format!("{} bytes", bytes.len()),
            });
        }
        Ok(Self {
            spec,
            storage: RwLock::new(Storage::Owned(bytes.into_boxed_slice())),
        })
    }

    pub fn from_literal(literal: &TensorLiteral) -> BackendResult<Self> {
        Self::from_bytes(literal.spec.clone(), literal.bytes.to_vec())
    }

    /// Builds a tensor from typed values; the dtype follows `T`.
    pub fn from_values<T: Scalar>(shape: impl Into<Shape>, values: &[T]) -> BackendResult<Self> {
        let spec = TensorSpec::new(T::DTYPE, shape);
        let expected = spec.element_count().unwrap_or(usize::MAX);
        if values.len() != expected {
            return Err(BackendError::ShapeMismatch {
                slot: "tensor values".to_string(),
                expected: format!("{expected} elements for shape {}", spec.shape),
                found: format!("{} elements", values.len()),
            });
        }
        Self::from_bytes(spec, storage::encode(values))
    }

    /// Wraps caller-owned memory without copying.
    ///
    /// # Safety
    /// `memory` must point to at least `spec.byte_len()` bytes that stay valid, and are not
    /// accessed through any other path, for as long as the tensor is alive.
    pub unsafe fn from_external(spec: TensorSpec, memory: NonNull<u8>) -> BackendResult<Self> {
        let len = required_len(&spec)?;
        Ok(Self {
            spec,
            storage: RwLock::new(Storage::External { ptr: memory, len }),
        })
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn shape(&self) -> &Shape {
        &self.spec.shape
    }

    pub fn is_external(&self) -> bool {
        matches!(
            *self.storage.read().expect("host tensor lock poisoned"),
            Storage::External { .. }
        )
    }

    /// Runs `f` against the raw payload under a read lock.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.storage.read().expect("host tensor lock poisoned");
        f(guard.as_slice())
    }

    pub fn read_bytes(&self) -> Vec<u8> {
        self.with_bytes(<[u8]>::to_vec)
    }

    /// Overwrites the payload. `bytes` must match the tensor's byte length exactly.
    pub fn write_bytes(&self, bytes: &[u8]) -> BackendResult<()> {
        let mut guard = self.storage.write().expect("host tensor lock poisoned");
        let target = guard.as_mut_slice();
        if target.len() != bytes.len() {
            return Err(BackendError::ShapeMismatch {
                slot: "tensor payload".to_string(),
                expected: format!("{} bytes", target.len()),
                found: format!("{} bytes", bytes.len()),
            });
        }
        target.copy_from_slice(bytes);
        Ok(())
    }

    /// Copies the payload of `source` into `self`. Specs must match.
    pub fn copy_from(&self, source: &HostTensor) -> BackendResult<()> {
        if std::ptr::eq(self, source) {
            return Ok(());
        }
        if self.spec.dtype != source.spec.dtype {
            return Err(BackendError::TypeMismatch {
                slot: "tensor copy".to_string(),
                expected: self.spec.dtype,
                found: source.spec.dtype,
            });
        }
        if self.spec.shape != source.spec.shape {
            return Err(BackendError::ShapeMismatch {
                slot: "tensor copy".to_string(),
                expected: self.spec.shape.to_string(),
                found: source.spec.shape.to_string(),
            });
        }
        source.with_bytes(|bytes| self.write_bytes(bytes))
    }

    /// Decodes the payload as `T`, rejecting a dtype mismatch.
    pub fn to_vec<T: Scalar>(&self) -> BackendResult<Vec<T>> {
        if self.spec.dtype != T::DTYPE {
            return Err(BackendError::TypeMismatch {
                slot: "tensor read".to_string(),
                expected: T::DTYPE,
                found: self.spec.dtype,
            });
        }
        Ok(self.with_bytes(storage::decode::<T>))
    }

    pub fn to_literal(&self) -> TensorLiteral {
        TensorLiteral::new(self.spec.clone(), Arc::from(self.read_bytes()))
    }
}

impl fmt::Debug for HostTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostTensor")
            .field("spec", &self.spec)
            .field("external", &self.is_external())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::DType;

    #[test]
    fn from_values_rejects_wrong_element_count() {
        let err = HostTensor::from_values([2, 2], &[1.0f32, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, BackendError::ShapeMismatch { .. }));
    }

    #[test]
    fn to_vec_checks_dtype() {
        let tensor = HostTensor::from_values([2], &[1i32, 2]).unwrap();
        assert_eq!(tensor.to_vec::<i32>().unwrap(), vec![1, 2]);
        let err = tensor.to_vec::<f32>().unwrap_err();
        assert!(matches!(
            err,
            BackendError::TypeMismatch {
                expected: DType::F32,
                found: DType::Si32,
                ..
            }
        ));
    }

    #[test]
    fn external_memory_is_written_in_place() {
        let mut backing = [0u8; 8];
        let ptr = NonNull::new(backing.as_mut_ptr()).unwrap();
        {
            let tensor =
                unsafe { HostTensor::from_external(TensorSpec::new(DType::F32, [2]), ptr) }
                    .unwrap();
            let source = HostTensor::from_values([2], &[1.5f32, -2.0]).unwrap();
            tensor.copy_from(&source).unwrap();
            assert!(tensor.is_external());
        }
        assert_eq!(storage::decode::<f32>(&backing), vec![1.5, -2.0]);
    }

    #[test]
    fn copy_from_self_is_a_no_op() {
        let tensor = HostTensor::from_values([3], &[1.0f32, 2.0, 3.0]).unwrap();
        tensor.copy_from(&tensor).unwrap();
        assert_eq!(tensor.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
    }
}
