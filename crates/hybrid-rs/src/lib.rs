//! Placement-based hybrid execution over heterogeneous backends.
//!
//! A [`Function`] is tagged with placements, split into single-placement sub-functions by
//! [`partition::partition`], and executed by [`HybridBackend`], which implements the same
//! [`Backend`] contract as the backends it composes.

pub mod backend;
mod env;
pub mod graph;
pub mod hybrid;
pub mod partition;
pub mod placement;
pub mod tensor;

pub use backend::spec::{
    Backend, BackendError, BackendResult, DType, Operation, OperationKind, Shape, TensorLiteral,
    TensorSpec,
};
pub use graph::{Function, FunctionBuilder, FunctionId, NodeId, ValueRef};
pub use hybrid::{HybridBackend, HybridConfig};
pub use placement::Placement;
pub use tensor::{HostTensor, TensorRef};

/// Version reported by the factory entry points and checked by the library loader.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// [`VERSION`] as a NUL-terminated string for the C entry points.
pub const VERSION_CSTR: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
