use std::fmt;

use super::function::{Function, NodeId, ValueRef};

/// Structural defect found by [`validate_function_topology`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// An operand refers to a node that is not defined before its consumer.
    MissingValue { value: ValueRef, consumer: NodeId },
    /// An operand refers past the producer's output list.
    MissingOutput { value: ValueRef, consumer: NodeId },
    /// A result node is consumed, or does not have exactly one operand.
    MalformedResult { result: NodeId },
    /// Parameter/result lists name a node of the wrong kind.
    MisplacedBoundary { node: NodeId },
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyError::MissingValue { value, consumer } => write!(
                f,
                "operand value {value} is missing before node {consumer}"
            ),
            TopologyError::MissingOutput { value, consumer } => write!(
                f,
                "node {consumer} reads output {} which {} does not produce",
                value.output, value.node
            ),
            TopologyError::MalformedResult { result } => {
                write!(f, "result node {result} is malformed")
            }
            TopologyError::MisplacedBoundary { node } => {
                write!(f, "node {node} is listed as a boundary of the wrong kind")
            }
        }
    }
}

impl std::error::Error for TopologyError {}

/// Checks the arena invariants: every operand is produced by an earlier node, results are
/// sinks with one operand, and the parameter/result lists name nodes of the right kind.
pub fn validate_function_topology(function: &Function) -> Result<(), TopologyError> {
    for node in function.nodes() {
        for input in node.inputs() {
            let producer = match function.node(input.node) {
                Some(producer) if input.node < node.id() => producer,
                _ => {
                    return Err(TopologyError::MissingValue {
                        value: *input,
                        consumer: node.id(),
                    })
                }
            };
            if input.output as usize >= producer.outputs().len() {
                return Err(TopologyError::MissingOutput {
                    value: *input,
                    consumer: node.id(),
                });
            }
        }
        if node.is_result() && (node.inputs().len() != 1 || !function.users(node.id()).is_empty())
        {
            return Err(TopologyError::MalformedResult { result: node.id() });
        }
    }

    for id in function.parameters() {
        if !function.node(*id).is_some_and(|node| node.is_parameter()) {
            return Err(TopologyError::MisplacedBoundary { node: *id });
        }
    }
    for id in function.results() {
        if !function.node(*id).is_some_and(|node| node.is_result()) {
            return Err(TopologyError::MisplacedBoundary { node: *id });
        }
    }
    Ok(())
}
