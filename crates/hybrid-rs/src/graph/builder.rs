use smallvec::SmallVec;

use crate::backend::spec::{BackendError, BackendResult, Operation, TensorLiteral, TensorSpec};
use crate::placement::Placement;

use super::function::{Function, Node, NodeId, ValueRef};
use super::infer::{infer_outputs, OutputSpecs};

/// Incrementally assembles a [`Function`].
///
/// Every emitted operation is type-checked against its operands. `finish` drops nodes that
/// no result depends on (parameters are always kept) and renumbers the arena.
#[derive(Debug, Default)]
pub struct FunctionBuilder {
    nodes: Vec<Node>,
    parameters: Vec<NodeId>,
    results: Vec<NodeId>,
    default_placement: Option<Placement>,
}

impl FunctionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags every node left untagged at `finish` with `placement`.
    pub fn with_default_placement(mut self, placement: impl Into<Placement>) -> Self {
        self.default_placement = Some(placement.into());
        self
    }

    fn next_id(&self) -> NodeId {
        NodeId(self.nodes.len() as u32)
    }

    fn spec_of(&self, value: ValueRef) -> BackendResult<&TensorSpec> {
        let node = self
            .nodes
            .get(value.node.index())
            .ok_or_else(|| BackendError::graph(format!("operand {value} is not defined")))?;
        node.outputs.get(value.output as usize).ok_or_else(|| {
            BackendError::graph(format!(
                "operand {value} refers to output {} of a node with {} output(s)",
                value.output,
                node.outputs.len()
            ))
        })
    }

    pub(crate) fn push_node(
        &mut self,
        op: Operation,
        inputs: SmallVec<[ValueRef; 4]>,
        outputs: OutputSpecs,
    ) -> NodeId {
        let id = self.next_id();
        self.nodes.push(Node {
            id,
            op,
            inputs,
            outputs,
            placement: None,
            origin: None,
        });
        id
    }

    pub fn add_parameter(&mut self, spec: TensorSpec) -> ValueRef {
        let id = self.push_node(
            Operation::Parameter,
            SmallVec::new(),
            SmallVec::from_elem(spec, 1),
        );
        self.parameters.push(id);
        ValueRef::from(id)
    }

    /// Emits `op` over `inputs` and returns one value per inferred output.
    pub fn emit(&mut self, op: Operation, inputs: &[ValueRef]) -> BackendResult<Vec<ValueRef>> {
        let specs = inputs
            .iter()
            .map(|value| self.spec_of(*value))
            .collect::<BackendResult<Vec<_>>>()?;
        let outputs = infer_outputs(&op, &specs)?;
        let count = outputs.len() as u32;
        let id = self.push_node(op, inputs.iter().copied().collect(), outputs);
        Ok((0..count).map(|output| ValueRef::new(id, output)).collect())
    }

    /// Emits a single-output operation.
    pub fn emit_single(&mut self, op: Operation, inputs: &[ValueRef]) -> BackendResult<ValueRef> {
        let kind = op.kind();
        let values = self.emit(op, inputs)?;
        match values.as_slice() {
            [value] => Ok(*value),
            _ => Err(BackendError::graph(format!(
                "{kind} produced {} outputs where one was expected",
                values.len()
            ))),
        }
    }

    pub fn constant(&mut self, literal: TensorLiteral) -> BackendResult<ValueRef> {
        self.emit_single(Operation::Constant(literal), &[])
    }

    /// Marks `value` as the next function output.
    pub fn add_result(&mut self, value: ValueRef) -> BackendResult<NodeId> {
        self.spec_of(value)?;
        let id = self.push_node(
            Operation::Result,
            SmallVec::from_elem(value, 1),
            SmallVec::new(),
        );
        self.results.push(id);
        Ok(id)
    }

    pub fn set_placement(
        &mut self,
        node: NodeId,
        placement: impl Into<Placement>,
    ) -> BackendResult<()> {
        let slot = self
            .nodes
            .get_mut(node.index())
            .ok_or_else(|| BackendError::graph(format!("node {node} is not defined")))?;
        slot.placement = Some(placement.into());
        Ok(())
    }

    pub(crate) fn set_tags(
        &mut self,
        node: NodeId,
        placement: Option<Placement>,
        origin: Option<NodeId>,
    ) {
        if let Some(slot) = self.nodes.get_mut(node.index()) {
            slot.placement = placement;
            slot.origin = origin;
        }
    }

    pub fn finish(self, name: impl Into<String>) -> BackendResult<Function> {
        let FunctionBuilder {
            nodes,
            parameters,
            results,
            default_placement,
        } = self;

        let mut live = vec![false; nodes.len()];
        for id in parameters.iter().chain(results.iter()) {
            live[id.index()] = true;
        }
        for node in nodes.iter().rev() {
            if !live[node.id.index()] {
                continue;
            }
            for input in &node.inputs {
                live[input.node.index()] = true;
            }
        }

        let mut remap: Vec<Option<NodeId>> = vec![None; nodes.len()];
        let mut kept = Vec::with_capacity(nodes.len());
        for mut node in nodes.into_iter().filter(|node| live[node.id.index()]) {
            let new_id = NodeId(kept.len() as u32);
            remap[node.id.index()] = Some(new_id);
            for input in node.inputs.iter_mut() {
                input.node = remap[input.node.index()].ok_or_else(|| {
                    BackendError::graph(format!("node {} consumes a dropped value", node.id))
                })?;
            }
            node.id = new_id;
            if node.placement.is_none() {
                node.placement = default_placement.clone();
            }
            kept.push(node);
        }

        let renumber = |ids: Vec<NodeId>| -> Vec<NodeId> {
            ids.into_iter()
                .filter_map(|id| remap[id.index()])
                .collect()
        };
        let parameters = renumber(parameters);
        let results = renumber(results);
        Ok(Function::from_parts(name.into(), kept, parameters, results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{DType, ElementwiseUnaryOp, SplitSpec};

    #[test]
    fn finish_drops_dead_nodes_but_keeps_parameters() {
        let mut builder = FunctionBuilder::new();
        let spec = TensorSpec::new(DType::F32, [2]);
        let x = builder.add_parameter(spec.clone());
        let _unused = builder.add_parameter(spec);
        let _dead = builder
            .emit_single(Operation::ElementwiseUnary(ElementwiseUnaryOp::Exp), &[x])
            .unwrap();
        let live = builder
            .emit_single(Operation::ElementwiseUnary(ElementwiseUnaryOp::Neg), &[x])
            .unwrap();
        builder.add_result(live).unwrap();
        let function = builder.finish("prune").unwrap();

        assert_eq!(function.node_count(), 4);
        assert_eq!(function.parameters(), &[NodeId(0), NodeId(1)]);
        assert_eq!(function.results(), &[NodeId(3)]);
        assert_eq!(function.node(NodeId(2)).unwrap().inputs(), &[ValueRef::from(NodeId(0))]);
    }

    #[test]
    fn emit_single_rejects_multi_output_ops() {
        let mut builder = FunctionBuilder::new();
        let x = builder.add_parameter(TensorSpec::new(DType::F32, [4]));
        let op = Operation::Split(SplitSpec {
            axis: 0,
            sizes: vec![2, 2],
        });
        assert!(builder.emit_single(op.clone(), &[x]).is_err());
        assert_eq!(builder.emit(op, &[x]).unwrap().len(), 2);
    }

    #[test]
    fn default_placement_only_fills_missing_tags() {
        let mut builder = FunctionBuilder::new().with_default_placement("cpu");
        let x = builder.add_parameter(TensorSpec::new(DType::F32, [1]));
        let y = builder
            .emit_single(Operation::ElementwiseUnary(ElementwiseUnaryOp::Abs), &[x])
            .unwrap();
        builder.set_placement(y.node, "gpu").unwrap();
        builder.add_result(y).unwrap();
        let function = builder.finish("tags").unwrap();

        let tags = function
            .nodes()
            .iter()
            .map(|node| node.placement().map(|p| p.as_str().to_string()))
            .collect::<Vec<_>>();
        assert_eq!(
            tags,
            vec![
                Some("cpu".to_string()),
                Some("gpu".to_string()),
                Some("cpu".to_string())
            ]
        );
    }

    #[test]
    fn unknown_operands_are_rejected() {
        let mut builder = FunctionBuilder::new();
        let bogus = ValueRef::from(NodeId(7));
        let err = builder
            .emit_single(Operation::ElementwiseUnary(ElementwiseUnaryOp::Neg), &[bogus])
            .unwrap_err();
        assert!(matches!(err, BackendError::Graph { .. }));
    }
}
