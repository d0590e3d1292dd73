use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::backend::spec::{BackendError, BackendResult, Operation, TensorSpec};
use crate::placement::Placement;

static FUNCTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a built [`Function`].
///
/// Two structurally identical functions still carry different ids; caches key on identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(u64);

impl FunctionId {
    pub(crate) fn next() -> Self {
        FunctionId(FUNCTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

/// Index of a node inside its function's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// One output of one node; the unit that flows along an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueRef {
    pub node: NodeId,
    pub output: u32,
}

impl ValueRef {
    pub fn new(node: NodeId, output: u32) -> Self {
        Self { node, output }
    }
}

impl From<NodeId> for ValueRef {
    fn from(node: NodeId) -> Self {
        ValueRef { node, output: 0 }
    }
}

impl fmt::Display for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.output == 0 {
            write!(f, "{}", self.node)
        } else {
            write!(f, "{}#{}", self.node, self.output)
        }
    }
}

/// Typed operation with ordered operand edges and one or more outputs.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) op: Operation,
    pub(crate) inputs: SmallVec<[ValueRef; 4]>,
    pub(crate) outputs: SmallVec<[TensorSpec; 1]>,
    pub(crate) placement: Option<Placement>,
    pub(crate) origin: Option<NodeId>,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn op(&self) -> &Operation {
        &self.op
    }

    pub fn inputs(&self) -> &[ValueRef] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    pub fn placement(&self) -> Option<&Placement> {
        self.placement.as_ref()
    }

    /// Node in the source function this node was copied from, for partition outputs.
    pub fn origin(&self) -> Option<NodeId> {
        self.origin
    }

    pub fn is_parameter(&self) -> bool {
        self.op.is_parameter()
    }

    pub fn is_result(&self) -> bool {
        self.op.is_result()
    }
}

/// Dataflow graph with ordered parameters and results.
///
/// Nodes live in an arena in topological order: every input edge refers to an earlier node.
/// A built function is immutable apart from placement tags, which need `&mut self`, so a
/// function shared behind an `Arc` is frozen. Use [`Function::clone_function`] to get an
/// owned copy with a fresh identity.
#[derive(Debug)]
pub struct Function {
    id: FunctionId,
    name: String,
    nodes: Vec<Node>,
    parameters: Vec<NodeId>,
    results: Vec<NodeId>,
    users: Vec<SmallVec<[NodeId; 4]>>,
}

impl Function {
    /// Assembles a function from an arena already in topological order.
    pub(crate) fn from_parts(
        name: String,
        nodes: Vec<Node>,
        parameters: Vec<NodeId>,
        results: Vec<NodeId>,
    ) -> Self {
        let users = compute_users(&nodes);
        Self {
            id: FunctionId::next(),
            name,
            nodes,
            parameters,
            results,
            users,
        }
    }

    pub fn id(&self) -> FunctionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn parameters(&self) -> &[NodeId] {
        &self.parameters
    }

    pub fn results(&self) -> &[NodeId] {
        &self.results
    }

    /// Nodes consuming any output of `id`, in arena order without duplicates.
    pub fn users(&self, id: NodeId) -> &[NodeId] {
        self.users
            .get(id.index())
            .map(|users| users.as_slice())
            .unwrap_or(&[])
    }

    pub fn value_spec(&self, value: ValueRef) -> Option<&TensorSpec> {
        self.node(value.node)?.outputs.get(value.output as usize)
    }

    /// Value feeding the result node at `position`.
    pub fn result_value(&self, position: usize) -> Option<ValueRef> {
        let result = self.results.get(position)?;
        self.node(*result)?.inputs.first().copied()
    }

    pub fn parameter_specs(&self) -> Vec<TensorSpec> {
        self.parameters
            .iter()
            .filter_map(|id| self.node(*id))
            .filter_map(|node| node.outputs.first().cloned())
            .collect()
    }

    pub fn result_specs(&self) -> Vec<TensorSpec> {
        (0..self.results.len())
            .filter_map(|position| self.result_value(position))
            .filter_map(|value| self.value_spec(value).cloned())
            .collect()
    }

    /// Writes (or clears) the placement tag of one node.
    pub fn set_placement(
        &mut self,
        node: NodeId,
        placement: Option<Placement>,
    ) -> BackendResult<()> {
        let slot = self
            .nodes
            .get_mut(node.index())
            .ok_or_else(|| BackendError::graph(format!("node {node} is out of range")))?;
        slot.placement = placement;
        Ok(())
    }

    /// Overwrites every tag at once; `tags` is indexed by arena position.
    pub(crate) fn replace_placements(&mut self, tags: Vec<Option<Placement>>) {
        for (node, tag) in self.nodes.iter_mut().zip(tags) {
            node.placement = tag;
        }
    }

    pub fn clear_placements(&mut self) {
        for node in &mut self.nodes {
            node.placement = None;
        }
    }

    /// Returns the first node without a placement tag, in arena order.
    pub fn first_unplaced(&self) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|node| node.placement.is_none())
            .map(|node| node.id)
    }

    /// Distinct placements in order of first appearance.
    pub fn placements(&self) -> Vec<Placement> {
        let mut seen: Vec<Placement> = Vec::new();
        for placement in self.nodes.iter().filter_map(|node| node.placement.as_ref()) {
            if !seen.contains(placement) {
                seen.push(placement.clone());
            }
        }
        seen
    }

    /// Deep copy with a fresh arena and a fresh [`FunctionId`]. Node ids and tags carry over.
    pub fn clone_function(&self) -> Function {
        Function {
            id: FunctionId::next(),
            name: self.name.clone(),
            nodes: self.nodes.clone(),
            parameters: self.parameters.clone(),
            results: self.results.clone(),
            users: self.users.clone(),
        }
    }
}

fn compute_users(nodes: &[Node]) -> Vec<SmallVec<[NodeId; 4]>> {
    let mut users: Vec<SmallVec<[NodeId; 4]>> = vec![SmallVec::new(); nodes.len()];
    for node in nodes {
        for input in &node.inputs {
            if let Some(list) = users.get_mut(input.node.index()) {
                if list.last() != Some(&node.id) {
                    list.push(node.id);
                }
            }
        }
    }
    users
}
