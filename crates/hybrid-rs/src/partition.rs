//! Splits a placed function into single-placement sub-functions.
//!
//! Nodes are clustered by union-find over same-placement edges. A merge is refused when it
//! would close a cycle through a third cluster, so the resulting region graph is always a DAG
//! and regions can run one after another. Values crossing regions become a synthetic result
//! in the producer and a synthetic parameter in each consumer, linked by the boundary map.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;

use smallvec::SmallVec;

use crate::backend::spec::{BackendError, BackendResult};
use crate::graph::{validate_function_topology, Function, FunctionBuilder, NodeId, ValueRef};
use crate::placement::Placement;

/// A parameter or result slot of one sub-function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Port {
    pub sub_function: usize,
    pub position: usize,
}

impl Port {
    pub fn new(sub_function: usize, position: usize) -> Self {
        Self {
            sub_function,
            position,
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.sub_function, self.position)
    }
}

/// Where a sub-function parameter gets its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterBinding {
    /// Caller input at this position of the source function.
    Input(usize),
    /// Synthetic parameter fed through the boundary map.
    Boundary,
}

/// Where a sub-function result goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultBinding {
    /// Caller output at this position of the source function.
    Output(usize),
    /// Synthetic result exported to later sub-functions.
    Boundary,
}

/// One region of the source function, runnable on a single backend.
#[derive(Debug)]
pub struct SubFunction {
    pub function: Function,
    pub placement: Placement,
    pub parameters: Vec<ParameterBinding>,
    pub results: Vec<ResultBinding>,
}

impl SubFunction {
    /// Source node ids carried by this sub-function, excluding synthetic nodes.
    pub fn source_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.function.nodes().iter().filter_map(|node| node.origin())
    }
}

/// Synthetic parameter port to the synthetic result port that supplies it.
pub type BoundaryMap = BTreeMap<Port, Port>;

#[derive(Debug)]
pub struct Partition {
    pub sub_functions: Vec<SubFunction>,
    pub boundary_map: BoundaryMap,
}

struct Clusters {
    parent: Vec<usize>,
    members: Vec<Vec<usize>>,
}

impl Clusters {
    fn new(count: usize) -> Self {
        Self {
            parent: (0..count).collect(),
            members: (0..count).map(|index| vec![index]).collect(),
        }
    }

    fn find(&mut self, mut index: usize) -> usize {
        while self.parent[index] != index {
            self.parent[index] = self.parent[self.parent[index]];
            index = self.parent[index];
        }
        index
    }

    fn union(&mut self, a: usize, b: usize) {
        let (a, b) = (self.find(a), self.find(b));
        if a == b {
            return;
        }
        let (large, small) = if self.members[a].len() >= self.members[b].len() {
            (a, b)
        } else {
            (b, a)
        };
        self.parent[small] = large;
        let moved = std::mem::take(&mut self.members[small]);
        self.members[large].extend(moved);
    }

    fn successors(&mut self, function: &Function, cluster: usize) -> HashSet<usize> {
        let members = self.members[cluster].clone();
        let mut next = HashSet::new();
        for member in members {
            for user in function.users(NodeId(member as u32)) {
                next.insert(self.find(user.index()));
            }
        }
        next
    }

    /// True when `to` is reachable from `from` through at least one other cluster.
    fn reachable_indirectly(&mut self, function: &Function, from: usize, to: usize) -> bool {
        let mut queue: VecDeque<usize> = self
            .successors(function, from)
            .into_iter()
            .filter(|cluster| *cluster != from && *cluster != to)
            .collect();
        let mut visited: HashSet<usize> = queue.iter().copied().collect();
        while let Some(cluster) = queue.pop_front() {
            for next in self.successors(function, cluster) {
                if next == to {
                    return true;
                }
                if next != from && visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        false
    }
}

/// Partitions a fully placed function.
///
/// Sub-functions come back in execution order. Each one lists the source parameters it
/// owns (in source order) followed by synthetic parameters (in producer order), and the
/// source results it owns followed by synthetic exports.
pub fn partition(function: &Function) -> BackendResult<Partition> {
    if let Some(node) = function.first_unplaced() {
        return Err(BackendError::invalid_placement(node, "node has no placement"));
    }
    let tags = function
        .nodes()
        .iter()
        .map(|node| node.placement().cloned())
        .collect::<Option<Vec<Placement>>>()
        .ok_or_else(|| BackendError::graph("placement disappeared during partitioning"))?;

    let mut clusters = Clusters::new(function.node_count());
    for node in function.nodes() {
        for input in node.inputs() {
            let (producer, consumer) = (input.node.index(), node.id().index());
            if tags[producer] != tags[consumer] {
                continue;
            }
            let (from, to) = (clusters.find(producer), clusters.find(consumer));
            if from == to || clusters.reachable_indirectly(function, from, to) {
                continue;
            }
            clusters.union(from, to);
        }
    }

    // Nodes with no edges at all (unused parameters) join the earliest same-tag cluster.
    for node in function.nodes() {
        let index = node.id().index();
        if !node.inputs().is_empty() || !function.users(node.id()).is_empty() {
            continue;
        }
        if let Some(host) = (0..function.node_count()).find(|other| {
            *other != index && tags[*other] == tags[index]
        }) {
            clusters.union(index, host);
        }
    }

    let mut roots: Vec<usize> = (0..function.node_count())
        .map(|index| clusters.find(index))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    for root in &roots {
        clusters.members[*root].sort_unstable();
    }
    roots.sort_by_key(|root| clusters.members[*root][0]);

    let mut region_of = vec![0usize; function.node_count()];
    for (region, root) in roots.iter().enumerate() {
        for member in &clusters.members[*root] {
            region_of[*member] = region;
        }
    }

    let order = order_regions(function, &region_of, roots.len())?;

    let mut imports: Vec<BTreeSet<ValueRef>> = vec![BTreeSet::new(); roots.len()];
    let mut exports: Vec<BTreeSet<ValueRef>> = vec![BTreeSet::new(); roots.len()];
    for node in function.nodes() {
        let consumer = region_of[node.id().index()];
        for input in node.inputs() {
            let producer = region_of[input.node.index()];
            if producer != consumer {
                imports[consumer].insert(*input);
                exports[producer].insert(*input);
            }
        }
    }

    let mut sub_functions = Vec::with_capacity(roots.len());
    let mut boundary_map = BoundaryMap::new();
    let mut export_ports: HashMap<ValueRef, Port> = HashMap::new();
    for (position, region) in order.iter().copied().enumerate() {
        let members = &clusters.members[roots[region]];
        let placement = tags[members[0]].clone();
        let sub = build_sub_function(
            function,
            position,
            &placement,
            members,
            &imports[region],
            &exports[region],
        )?;

        let boundary_params = sub
            .parameters
            .iter()
            .enumerate()
            .filter(|(_, binding)| matches!(binding, ParameterBinding::Boundary))
            .map(|(slot, _)| slot);
        for (slot, value) in boundary_params.zip(imports[region].iter()) {
            let source = export_ports.get(value).copied().ok_or_else(|| {
                BackendError::graph(format!(
                    "value {value} is imported by sub-function {position} before it is exported"
                ))
            })?;
            boundary_map.insert(Port::new(position, slot), source);
        }

        let boundary_results = sub
            .results
            .iter()
            .enumerate()
            .filter(|(_, binding)| matches!(binding, ResultBinding::Boundary))
            .map(|(slot, _)| slot);
        for (slot, value) in boundary_results.zip(exports[region].iter()) {
            export_ports.insert(*value, Port::new(position, slot));
        }

        sub_functions.push(sub);
    }

    log::debug!(
        "partitioned {} ({} nodes) into {} sub-function(s) with {} boundary value(s)",
        function.name(),
        function.node_count(),
        sub_functions.len(),
        boundary_map.len()
    );

    Ok(Partition {
        sub_functions,
        boundary_map,
    })
}

/// Kahn's algorithm over the region graph, preferring the region with the earliest node.
fn order_regions(
    function: &Function,
    region_of: &[usize],
    region_count: usize,
) -> BackendResult<Vec<usize>> {
    let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); region_count];
    for node in function.nodes() {
        let consumer = region_of[node.id().index()];
        for input in node.inputs() {
            let producer = region_of[input.node.index()];
            if producer != consumer {
                successors[producer].insert(consumer);
            }
        }
    }
    let mut in_degree = vec![0usize; region_count];
    for targets in &successors {
        for target in targets {
            in_degree[*target] += 1;
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..region_count)
        .filter(|region| in_degree[*region] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(region_count);
    while let Some(Reverse(region)) = ready.pop() {
        order.push(region);
        for target in &successors[region] {
            in_degree[*target] -= 1;
            if in_degree[*target] == 0 {
                ready.push(Reverse(*target));
            }
        }
    }

    if order.len() != region_count {
        return Err(BackendError::graph(format!(
            "placement regions of {} form a cycle",
            function.name()
        )));
    }
    Ok(order)
}

fn build_sub_function(
    source: &Function,
    position: usize,
    placement: &Placement,
    members: &[usize],
    imports: &BTreeSet<ValueRef>,
    exports: &BTreeSet<ValueRef>,
) -> BackendResult<SubFunction> {
    let in_region: HashSet<usize> = members.iter().copied().collect();
    let mut builder = FunctionBuilder::new();
    let mut values: HashMap<ValueRef, ValueRef> = HashMap::new();
    let mut parameters = Vec::new();
    let mut results = Vec::new();

    let spec_of = |value: ValueRef| {
        source
            .value_spec(value)
            .cloned()
            .ok_or_else(|| BackendError::graph(format!("value {value} has no type")))
    };

    for (index, parameter) in source.parameters().iter().enumerate() {
        if !in_region.contains(&parameter.index()) {
            continue;
        }
        let source_value = ValueRef::from(*parameter);
        let value = builder.add_parameter(spec_of(source_value)?);
        builder.set_tags(value.node, Some(placement.clone()), Some(*parameter));
        values.insert(source_value, value);
        parameters.push(ParameterBinding::Input(index));
    }
    for import in imports {
        let value = builder.add_parameter(spec_of(*import)?);
        builder.set_tags(value.node, Some(placement.clone()), None);
        values.insert(*import, value);
        parameters.push(ParameterBinding::Boundary);
    }

    for &member in members {
        let node = &source.nodes()[member];
        if node.is_parameter() || node.is_result() {
            continue;
        }
        let inputs = node
            .inputs()
            .iter()
            .map(|input| {
                values.get(input).copied().ok_or_else(|| {
                    BackendError::graph(format!(
                        "node {} reads {input}, which is unavailable in sub-function {position}",
                        node.id()
                    ))
                })
            })
            .collect::<BackendResult<SmallVec<[ValueRef; 4]>>>()?;
        let id = builder.push_node(node.op().clone(), inputs, node.outputs().into());
        builder.set_tags(id, Some(placement.clone()), Some(node.id()));
        for output in 0..node.outputs().len() as u32 {
            values.insert(ValueRef::new(node.id(), output), ValueRef::new(id, output));
        }
    }

    for (index, result) in source.results().iter().enumerate() {
        if !in_region.contains(&result.index()) {
            continue;
        }
        let value = source
            .result_value(index)
            .and_then(|value| values.get(&value).copied())
            .ok_or(BackendError::DisconnectedOutput { result: *result })?;
        let id = builder.add_result(value)?;
        builder.set_tags(id, Some(placement.clone()), Some(*result));
        results.push(ResultBinding::Output(index));
    }
    for export in exports {
        let value = values.get(export).copied().ok_or_else(|| {
            BackendError::graph(format!("exported value {export} is not produced here"))
        })?;
        let id = builder.add_result(value)?;
        builder.set_tags(id, Some(placement.clone()), None);
        results.push(ResultBinding::Boundary);
    }

    let function = builder.finish(format!("{}_{}_{}", source.name(), position, placement))?;
    Ok(SubFunction {
        function,
        placement: placement.clone(),
        parameters,
        results,
    })
}

impl Partition {
    /// Checks the structural guarantees of a partition against its source function.
    ///
    /// Every source node appears in exactly one sub-function, each sub-function carries a
    /// single placement, every synthetic parameter has exactly one earlier supplier of the
    /// same type, and source inputs and outputs are each bound exactly once.
    pub fn verify(&self, source: &Function) -> BackendResult<()> {
        let mut seen = vec![0usize; source.node_count()];
        let mut inputs = vec![0usize; source.parameters().len()];
        let mut outputs = vec![0usize; source.results().len()];

        for (index, sub) in self.sub_functions.iter().enumerate() {
            validate_function_topology(&sub.function).map_err(|err| {
                BackendError::graph(format!("sub-function {index} is malformed: {err}"))
            })?;
            for node in sub.function.nodes() {
                if node.placement() != Some(&sub.placement) {
                    return Err(BackendError::invalid_placement(
                        node.id(),
                        format!("sub-function {index} mixes placements"),
                    ));
                }
            }
            for origin in sub.source_nodes() {
                let slot = seen.get_mut(origin.index()).ok_or_else(|| {
                    BackendError::graph(format!("sub-function {index} names unknown {origin}"))
                })?;
                *slot += 1;
            }
            for binding in &sub.parameters {
                if let ParameterBinding::Input(position) = binding {
                    inputs[*position] += 1;
                }
            }
            for binding in &sub.results {
                if let ResultBinding::Output(position) = binding {
                    outputs[*position] += 1;
                }
            }

            let param_specs = sub.function.parameter_specs();
            for (slot, binding) in sub.parameters.iter().enumerate() {
                if *binding != ParameterBinding::Boundary {
                    continue;
                }
                let port = Port::new(index, slot);
                let supplier = self.boundary_map.get(&port).ok_or_else(|| {
                    BackendError::graph(format!("boundary parameter {port} has no supplier"))
                })?;
                if supplier.sub_function >= index {
                    return Err(BackendError::graph(format!(
                        "boundary parameter {port} is supplied by later port {supplier}"
                    )));
                }
                let producer = &self.sub_functions[supplier.sub_function];
                if producer.results.get(supplier.position) != Some(&ResultBinding::Boundary) {
                    return Err(BackendError::graph(format!(
                        "port {supplier} is not a boundary result"
                    )));
                }
                let produced = producer.function.result_specs();
                if produced.get(supplier.position) != param_specs.get(slot) {
                    return Err(BackendError::graph(format!(
                        "boundary {supplier} -> {port} changes the value type"
                    )));
                }
            }
        }

        let boundary_params: usize = self
            .sub_functions
            .iter()
            .map(|sub| {
                sub.parameters
                    .iter()
                    .filter(|binding| **binding == ParameterBinding::Boundary)
                    .count()
            })
            .sum();
        if boundary_params != self.boundary_map.len() {
            return Err(BackendError::graph(format!(
                "boundary map has {} entries for {} boundary parameters",
                self.boundary_map.len(),
                boundary_params
            )));
        }
        if let Some(index) = seen.iter().position(|count| *count != 1) {
            return Err(BackendError::graph(format!(
                "source node %{index} appears {} times across sub-functions",
                seen[index]
            )));
        }
        if inputs.iter().chain(outputs.iter()).any(|count| *count != 1) {
            return Err(BackendError::graph(
                "source inputs and outputs must each be bound exactly once",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{DType, ElementwiseUnaryOp, Operation, TensorSpec};

    fn unary(builder: &mut FunctionBuilder, input: ValueRef, tag: &str) -> ValueRef {
        let value = builder
            .emit_single(Operation::ElementwiseUnary(ElementwiseUnaryOp::Neg), &[input])
            .unwrap();
        builder.set_placement(value.node, tag).unwrap();
        value
    }

    #[test]
    fn unplaced_node_is_reported() {
        let mut builder = FunctionBuilder::new();
        let x = builder.add_parameter(TensorSpec::new(DType::F32, [1]));
        builder.add_result(x).unwrap();
        let function = builder.finish("bare").unwrap();
        let err = partition(&function).unwrap_err();
        assert!(matches!(
            err,
            BackendError::InvalidPlacement { node: NodeId(0), .. }
        ));
    }

    #[test]
    fn unused_parameter_joins_a_same_tag_region() {
        let mut builder = FunctionBuilder::new().with_default_placement("x");
        let spec = TensorSpec::new(DType::F32, [2]);
        let x = builder.add_parameter(spec.clone());
        let _unused = builder.add_parameter(spec);
        let y = unary(&mut builder, x, "x");
        builder.add_result(y).unwrap();
        let function = builder.finish("unused").unwrap();

        let partition = partition(&function).unwrap();
        assert_eq!(partition.sub_functions.len(), 1);
        assert_eq!(
            partition.sub_functions[0].parameters,
            vec![ParameterBinding::Input(0), ParameterBinding::Input(1)]
        );
        partition.verify(&function).unwrap();
    }

    #[test]
    fn shared_export_feeds_several_regions() {
        let mut builder = FunctionBuilder::new();
        let x = builder.add_parameter(TensorSpec::new(DType::F32, [2]));
        let a = unary(&mut builder, x, "x");
        let b = unary(&mut builder, a, "y");
        let c = unary(&mut builder, a, "z");
        builder.add_result(b).unwrap();
        builder.add_result(c).unwrap();
        let mut function = builder.finish("fanout").unwrap();
        crate::placement::assign_placement(
            &mut function,
            &crate::placement::PreassignedPlacement,
        );

        let partition = partition(&function).unwrap();
        assert_eq!(partition.sub_functions.len(), 3);
        assert_eq!(
            partition.sub_functions[0].results,
            vec![ResultBinding::Boundary]
        );
        let suppliers: BTreeSet<Port> = partition.boundary_map.values().copied().collect();
        assert_eq!(suppliers.len(), 1);
        partition.verify(&function).unwrap();
    }
}
