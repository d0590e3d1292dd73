//! Host tensors exchanged between backends.
//!
//! Every backend in this crate allocates [`HostTensor`]s, so a buffer produced by one backend
//! can be consumed by another without a device transfer. Hand-off between sub-functions still
//! goes through the consumer's allocator; see the hybrid engine.

mod host_tensor;
pub mod storage;

pub use host_tensor::{HostTensor, TensorRef};
pub use storage::Scalar;
