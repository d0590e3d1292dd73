//! Placement tags and the annotator that assigns them before partitioning.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::backend::spec::{Backend, Operation};
use crate::graph::{Function, NodeId};

/// Backend identifier attached to a node. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Placement(Arc<str>);

impl Placement {
    pub fn new(name: impl AsRef<str>) -> Self {
        Placement(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Placement {
    fn from(name: &str) -> Self {
        Placement::new(name)
    }
}

impl From<String> for Placement {
    fn from(name: String) -> Self {
        Placement(Arc::from(name))
    }
}

impl From<&Placement> for Placement {
    fn from(placement: &Placement) -> Self {
        placement.clone()
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Placement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Placement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Placement::from)
    }
}

/// Decides the placement of one node. Returning `None` leaves the node to inference.
pub trait PlacementPolicy: Send + Sync {
    fn place(&self, function: &Function, node: NodeId) -> Option<Placement>;

    /// Placement for nodes nothing could be inferred for, such as a parameter that only
    /// feeds a result in a function with no compute nodes.
    fn fallback(&self) -> Option<Placement> {
        None
    }
}

impl<F> PlacementPolicy for F
where
    F: Fn(&Function, NodeId) -> Option<Placement> + Send + Sync,
{
    fn place(&self, function: &Function, node: NodeId) -> Option<Placement> {
        self(function, node)
    }
}

/// Places every node on one backend.
#[derive(Debug, Clone)]
pub struct FixedPlacement(pub Placement);

impl FixedPlacement {
    pub fn new(placement: impl Into<Placement>) -> Self {
        FixedPlacement(placement.into())
    }
}

impl PlacementPolicy for FixedPlacement {
    fn place(&self, _function: &Function, _node: NodeId) -> Option<Placement> {
        Some(self.0.clone())
    }
}

/// Keeps whatever tags the function was built with and decides nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreassignedPlacement;

impl PlacementPolicy for PreassignedPlacement {
    fn place(&self, function: &Function, node: NodeId) -> Option<Placement> {
        function.node(node)?.placement().cloned()
    }
}

/// Routes each compute node to the first backend, in priority order, that supports its op.
///
/// A pre-existing tag naming a known backend wins. Parameters and results are left to
/// inference so they follow their neighbours.
pub struct CapabilityPlacement {
    backends: Vec<(Placement, Arc<dyn Backend>)>,
}

impl CapabilityPlacement {
    pub fn new(backends: Vec<(Placement, Arc<dyn Backend>)>) -> Self {
        Self { backends }
    }

    fn first_supporting(&self, op: &Operation) -> Option<Placement> {
        self.backends
            .iter()
            .find(|(_, backend)| backend.supports(op))
            .map(|(placement, _)| placement.clone())
    }
}

impl PlacementPolicy for CapabilityPlacement {
    fn place(&self, function: &Function, node: NodeId) -> Option<Placement> {
        let node = function.node(node)?;
        if let Some(existing) = node.placement() {
            if self.backends.iter().any(|(known, _)| known == existing) {
                return Some(existing.clone());
            }
        }
        if node.op().kind().is_structural() {
            return None;
        }
        self.first_supporting(node.op())
    }

    /// The highest-priority backend.
    fn fallback(&self) -> Option<Placement> {
        self.backends.first().map(|(placement, _)| placement.clone())
    }
}

impl fmt::Debug for CapabilityPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.backends.iter().map(|(placement, _)| placement.as_str()))
            .finish()
    }
}

/// Tags the nodes of `function` using `policy`, then fills in parameters and results.
///
/// A node keeps its existing tag unless the policy returns one. Untagged parameters take
/// the tag of their first tagged compute consumer; results take their producer's tag;
/// parameters with no such consumer fall back to the first tag in the function, or to
/// [`PlacementPolicy::fallback`] when the function has none. Returns the number of nodes
/// that carry a tag afterwards.
pub fn assign_placement(function: &mut Function, policy: &dyn PlacementPolicy) -> usize {
    let decisions = function
        .nodes()
        .iter()
        .map(|node| policy.place(function, node.id()))
        .collect::<Vec<_>>();
    let mut tags = function
        .nodes()
        .iter()
        .zip(decisions)
        .map(|(node, decision)| decision.or_else(|| node.placement().cloned()))
        .collect::<Vec<_>>();

    for &parameter in function.parameters() {
        if tags[parameter.index()].is_some() {
            continue;
        }
        let inherited = function
            .users(parameter)
            .iter()
            .filter(|user| function.node(**user).is_some_and(|node| !node.is_result()))
            .find_map(|user| tags[user.index()].clone());
        tags[parameter.index()] = inherited;
    }

    resolve_results(function, &mut tags);

    let fallback = tags
        .iter()
        .flatten()
        .next()
        .cloned()
        .or_else(|| policy.fallback());
    for &parameter in function.parameters() {
        if tags[parameter.index()].is_none() {
            tags[parameter.index()] = fallback.clone();
        }
    }
    resolve_results(function, &mut tags);

    let tagged = tags.iter().filter(|tag| tag.is_some()).count();
    function.replace_placements(tags);
    log::trace!(
        "assigned placements to {tagged}/{} nodes of {}",
        function.node_count(),
        function.name()
    );
    tagged
}

fn resolve_results(function: &Function, tags: &mut [Option<Placement>]) {
    for &result in function.results() {
        if tags[result.index()].is_some() {
            continue;
        }
        let producer = function
            .node(result)
            .and_then(|node| node.inputs().first())
            .map(|value| value.node);
        if let Some(producer) = producer {
            tags[result.index()] = tags[producer.index()].clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{BackendResult, DType, ElementwiseUnaryOp, TensorSpec};
    use crate::graph::FunctionBuilder;
    use crate::tensor::TensorRef;

    struct NullBackend;

    impl Backend for NullBackend {
        fn backend_name(&self) -> &str {
            "null"
        }

        fn compile(&self, _function: &Function) -> BackendResult<()> {
            Ok(())
        }

        fn call(&self, _: &Function, _: &[TensorRef], _: &[TensorRef]) -> BackendResult<()> {
            Ok(())
        }
    }

    fn chain() -> Function {
        let mut builder = FunctionBuilder::new();
        let x = builder.add_parameter(TensorSpec::new(DType::F32, [2]));
        let y = builder
            .emit_single(Operation::ElementwiseUnary(ElementwiseUnaryOp::Neg), &[x])
            .unwrap();
        builder.add_result(y).unwrap();
        builder.finish("chain").unwrap()
    }

    #[test]
    fn parameters_and_results_follow_compute_nodes() {
        let mut function = chain();
        let policy = |function: &Function, node: NodeId| {
            let node = function.node(node)?;
            (!node.op().kind().is_structural()).then(|| Placement::from("gpu"))
        };
        assert_eq!(assign_placement(&mut function, &policy), 3);
        assert!(function
            .nodes()
            .iter()
            .all(|node| node.placement().map(Placement::as_str) == Some("gpu")));
    }

    #[test]
    fn pass_through_function_takes_the_policy_fallback() {
        let mut builder = FunctionBuilder::new();
        let x = builder.add_parameter(TensorSpec::new(DType::F32, [2]));
        builder.add_result(x).unwrap();
        let mut function = builder.finish("echo").unwrap();

        let backends: Vec<(Placement, Arc<dyn Backend>)> = vec![
            (Placement::from("first"), Arc::new(NullBackend)),
            (Placement::from("second"), Arc::new(NullBackend)),
        ];
        let tagged = assign_placement(&mut function, &CapabilityPlacement::new(backends));
        assert_eq!(tagged, 2);
        assert_eq!(function.placements(), vec![Placement::from("first")]);

        let mut function = function.clone_function();
        function.clear_placements();
        assign_placement(&mut function, &PreassignedPlacement);
        assert_eq!(function.first_unplaced(), Some(NodeId(0)));
    }

    #[test]
    fn policy_overrides_existing_tags() {
        let mut function = chain();
        assign_placement(&mut function, &FixedPlacement::new("a"));
        assign_placement(&mut function, &FixedPlacement::new("b"));
        assert_eq!(function.placements(), vec![Placement::from("b")]);
    }

    #[test]
    fn preassigned_policy_keeps_builder_tags() {
        let mut builder = FunctionBuilder::new();
        let x = builder.add_parameter(TensorSpec::new(DType::F32, [2]));
        let y = builder
            .emit_single(Operation::ElementwiseUnary(ElementwiseUnaryOp::Abs), &[x])
            .unwrap();
        builder.set_placement(y.node, "x").unwrap();
        builder.add_result(y).unwrap();
        let mut function = builder.finish("pre").unwrap();

        assign_placement(&mut function, &PreassignedPlacement);
        assert_eq!(function.first_unplaced(), None);
        assert_eq!(function.placements(), vec![Placement::from("x")]);
    }
}
