//! Dataflow graph model: functions, nodes, and construction.

mod builder;
mod display;
mod function;
pub(crate) mod infer;
pub mod topology;

pub use builder::FunctionBuilder;
pub use function::{Function, FunctionId, Node, NodeId, ValueRef};
pub use topology::{validate_function_topology, TopologyError};
