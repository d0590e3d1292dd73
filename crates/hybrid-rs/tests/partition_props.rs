//! Property tests: random DAGs with random placements partition soundly and compute the same
//! results as the unpartitioned function.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{host, outputs_filled};
use hybrid_rs::backend::spec::{
    Backend, DType, ElementwiseBinaryOp, ElementwiseUnaryOp, Operation, TensorSpec,
};
use hybrid_rs::partition::{partition, ResultBinding};
use hybrid_rs::placement::{assign_placement, PreassignedPlacement};
use hybrid_rs::{Function, FunctionBuilder, HybridBackend, ValueRef};
use hybrid_rs_backend_ref_cpu::CpuBackend;
use proptest::prelude::*;

const TAGS: [&str; 3] = ["x", "y", "z"];

#[derive(Debug, Clone)]
struct NodeSpec {
    binary: bool,
    lhs: usize,
    rhs: usize,
    tag: usize,
}

fn arb_node() -> impl Strategy<Value = NodeSpec> {
    (any::<bool>(), any::<usize>(), any::<usize>(), 0..TAGS.len()).prop_map(
        |(binary, lhs, rhs, tag)| NodeSpec {
            binary,
            lhs,
            rhs,
            tag,
        },
    )
}

fn arb_graph() -> impl Strategy<Value = (usize, Vec<NodeSpec>, bool)> {
    (
        1usize..4,
        prop::collection::vec(arb_node(), 1..24),
        any::<bool>(),
    )
}

/// Graphs that always return their first parameter, possibly with no compute nodes at all.
fn arb_echo_graph() -> impl Strategy<Value = (usize, Vec<NodeSpec>)> {
    (1usize..4, prop::collection::vec(arb_node(), 0..8))
}

/// Builds a function whose sinks are its results. Every value is an `f32[2]`. With `echo`,
/// the first parameter is also returned as-is.
fn build(parameters: usize, nodes: &[NodeSpec], echo: bool) -> Function {
    let spec = TensorSpec::new(DType::F32, [2]);
    let mut builder = FunctionBuilder::new();
    let mut values: Vec<ValueRef> = (0..parameters)
        .map(|_| builder.add_parameter(spec.clone()))
        .collect();
    let mut consumed: HashSet<ValueRef> = HashSet::new();

    for node in nodes {
        let lhs = values[node.lhs % values.len()];
        let value = if node.binary {
            let rhs = values[node.rhs % values.len()];
            consumed.insert(rhs);
            builder
                .emit_single(
                    Operation::ElementwiseBinary(ElementwiseBinaryOp::Add),
                    &[lhs, rhs],
                )
                .unwrap()
        } else {
            builder
                .emit_single(Operation::ElementwiseUnary(ElementwiseUnaryOp::Neg), &[lhs])
                .unwrap()
        };
        consumed.insert(lhs);
        builder.set_placement(value.node, TAGS[node.tag]).unwrap();
        values.push(value);
    }

    if echo {
        builder.add_result(values[0]).unwrap();
    }
    for value in values.iter().skip(parameters) {
        if !consumed.contains(value) {
            builder.add_result(*value).unwrap();
        }
    }
    builder.finish("random").unwrap()
}

fn inputs(parameters: usize) -> Vec<hybrid_rs::TensorRef> {
    (0..parameters)
        .map(|index| host(&[2], &[index as f32 + 0.5, -(index as f32) * 1.25]))
        .collect()
}

fn members() -> Vec<Arc<dyn Backend>> {
    TAGS.iter()
        .map(|tag| Arc::new(CpuBackend::named(*tag)) as Arc<dyn Backend>)
        .collect()
}

fn assert_matches_reference(
    hybrid: &HybridBackend,
    function: &Function,
    parameters: usize,
) -> Result<(), TestCaseError> {
    let inputs = inputs(parameters);
    let expected = outputs_filled(function, 0.0f32);
    CpuBackend::new().call(function, &expected, &inputs).unwrap();
    let actual = outputs_filled(function, 0.0f32);
    hybrid.call(function, &actual, &inputs).unwrap();

    for (lhs, rhs) in expected.iter().zip(&actual) {
        prop_assert_eq!(lhs.to_vec::<f32>().unwrap(), rhs.to_vec::<f32>().unwrap());
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_partition_is_sound((parameters, nodes, echo) in arb_graph()) {
        let mut function = build(parameters, &nodes, echo);
        assign_placement(&mut function, &PreassignedPlacement);
        prop_assert_eq!(function.first_unplaced(), None);

        let partition = partition(&function).unwrap();
        prop_assert!(partition.verify(&function).is_ok());

        for (consumer, supplier) in &partition.boundary_map {
            prop_assert!(supplier.sub_function < consumer.sub_function);
            let producer = &partition.sub_functions[supplier.sub_function];
            prop_assert_eq!(producer.results[supplier.position], ResultBinding::Boundary);
        }
        for sub in &partition.sub_functions {
            prop_assert_eq!(sub.function.placements(), vec![sub.placement.clone()]);
        }
        let covered: usize = partition
            .sub_functions
            .iter()
            .map(|sub| sub.source_nodes().count())
            .sum();
        prop_assert_eq!(covered, function.node_count());
    }

    #[test]
    fn prop_hybrid_matches_single_backend((parameters, nodes, echo) in arb_graph()) {
        let function = build(parameters, &nodes, echo);
        let hybrid = HybridBackend::new(members())
            .unwrap()
            .with_policy(PreassignedPlacement)
            .with_partition_verification(true);
        assert_matches_reference(&hybrid, &function, parameters)?;
    }

    #[test]
    fn prop_default_policy_runs_echo_graphs((parameters, nodes) in arb_echo_graph()) {
        let function = build(parameters, &nodes, true);
        let hybrid = HybridBackend::new(members())
            .unwrap()
            .with_partition_verification(true);
        assert_matches_reference(&hybrid, &function, parameters)?;
    }
}
