mod common;

use std::collections::BTreeMap;

use common::{binary, init_logging, unary};
use hybrid_rs::backend::spec::{
    BackendError, DType, ElementwiseBinaryOp, ElementwiseUnaryOp, TensorSpec,
};
use hybrid_rs::partition::{partition, ParameterBinding, Port, ResultBinding};
use hybrid_rs::placement::{assign_placement, PreassignedPlacement};
use hybrid_rs::{Function, FunctionBuilder, Placement};

fn vector() -> TensorSpec {
    TensorSpec::new(DType::F32, [2])
}

fn finish_preassigned(builder: FunctionBuilder, name: &str) -> Function {
    let mut function = builder.finish(name).unwrap();
    assign_placement(&mut function, &PreassignedPlacement);
    assert_eq!(function.first_unplaced(), None);
    function
}

fn placements(partition: &hybrid_rs::partition::Partition) -> Vec<&str> {
    partition
        .sub_functions
        .iter()
        .map(|sub| sub.placement.as_str())
        .collect()
}

#[test]
fn single_backend_function_is_left_whole() {
    init_logging();
    let mut builder = FunctionBuilder::new().with_default_placement("cpu");
    let a = builder.add_parameter(vector());
    let b = builder.add_parameter(vector());
    let sum = binary(&mut builder, ElementwiseBinaryOp::Add, a, b, "cpu");
    let out = unary(&mut builder, ElementwiseUnaryOp::Tanh, sum, "cpu");
    builder.add_result(out).unwrap();
    let function = builder.finish("single").unwrap();

    let partition = partition(&function).unwrap();
    assert_eq!(partition.sub_functions.len(), 1);
    assert!(partition.boundary_map.is_empty());

    let sub = &partition.sub_functions[0];
    assert_eq!(sub.placement, Placement::from("cpu"));
    assert_eq!(sub.function.node_count(), function.node_count());
    assert_eq!(
        sub.parameters,
        vec![ParameterBinding::Input(0), ParameterBinding::Input(1)]
    );
    assert_eq!(sub.results, vec![ResultBinding::Output(0)]);
    assert_eq!(sub.function.parameter_specs(), function.parameter_specs());
    assert_eq!(sub.function.result_specs(), function.result_specs());
    partition.verify(&function).unwrap();
}

#[test]
fn chain_across_two_placements_links_every_boundary() {
    init_logging();
    let mut builder = FunctionBuilder::new();
    let p = builder.add_parameter(vector());
    let a = unary(&mut builder, ElementwiseUnaryOp::Neg, p, "x");
    let b = unary(&mut builder, ElementwiseUnaryOp::Abs, a, "y");
    let c = unary(&mut builder, ElementwiseUnaryOp::Neg, b, "x");
    builder.add_result(c).unwrap();
    let function = finish_preassigned(builder, "chain");

    let partition = partition(&function).unwrap();
    assert_eq!(placements(&partition), vec!["x", "y", "x"]);

    let subs = &partition.sub_functions;
    assert_eq!(subs[0].parameters, vec![ParameterBinding::Input(0)]);
    assert_eq!(subs[0].results, vec![ResultBinding::Boundary]);
    assert_eq!(subs[1].parameters, vec![ParameterBinding::Boundary]);
    assert_eq!(subs[1].results, vec![ResultBinding::Boundary]);
    assert_eq!(subs[2].parameters, vec![ParameterBinding::Boundary]);
    assert_eq!(subs[2].results, vec![ResultBinding::Output(0)]);

    let expected: BTreeMap<Port, Port> = [
        (Port::new(1, 0), Port::new(0, 0)),
        (Port::new(2, 0), Port::new(1, 0)),
    ]
    .into_iter()
    .collect();
    assert_eq!(partition.boundary_map, expected);
    partition.verify(&function).unwrap();
}

#[test]
fn sub_function_names_and_origins_point_back_to_source() {
    let mut builder = FunctionBuilder::new();
    let p = builder.add_parameter(vector());
    let a = unary(&mut builder, ElementwiseUnaryOp::Neg, p, "x");
    let b = unary(&mut builder, ElementwiseUnaryOp::Abs, a, "y");
    builder.add_result(b).unwrap();
    let function = finish_preassigned(builder, "named");

    let partition = partition(&function).unwrap();
    assert_eq!(partition.sub_functions[0].function.name(), "named_0_x");
    assert_eq!(partition.sub_functions[1].function.name(), "named_1_y");

    let mut origins: Vec<_> = partition
        .sub_functions
        .iter()
        .flat_map(|sub| sub.source_nodes())
        .collect();
    origins.sort();
    let all: Vec<_> = function.nodes().iter().map(|node| node.id()).collect();
    assert_eq!(origins, all);
}

#[test]
fn alternating_chain_keeps_regions_apart() {
    init_logging();
    let mut builder = FunctionBuilder::new();
    let mut value = builder.add_parameter(vector());
    for step in 0..6 {
        let tag = if step % 2 == 0 { "x" } else { "y" };
        value = unary(&mut builder, ElementwiseUnaryOp::Neg, value, tag);
    }
    builder.add_result(value).unwrap();
    let function = finish_preassigned(builder, "alternating");

    let partition = partition(&function).unwrap();
    assert_eq!(placements(&partition), vec!["x", "y", "x", "y", "x", "y"]);
    for (consumer, supplier) in &partition.boundary_map {
        assert_eq!(supplier.sub_function + 1, consumer.sub_function);
    }
    partition.verify(&function).unwrap();
}

#[test]
fn diamond_through_other_placement_is_not_merged() {
    init_logging();
    let mut builder = FunctionBuilder::new();
    let p = builder.add_parameter(vector());
    let a = unary(&mut builder, ElementwiseUnaryOp::Neg, p, "x");
    let b = unary(&mut builder, ElementwiseUnaryOp::Abs, a, "y");
    let c = binary(&mut builder, ElementwiseBinaryOp::Add, a, b, "x");
    builder.add_result(c).unwrap();
    let function = finish_preassigned(builder, "diamond");

    let partition = partition(&function).unwrap();
    assert_eq!(placements(&partition), vec!["x", "y", "x"]);

    // `a` is exported once and consumed by both later regions.
    assert_eq!(partition.sub_functions[0].results, vec![ResultBinding::Boundary]);
    assert_eq!(
        partition.sub_functions[2].parameters,
        vec![ParameterBinding::Boundary, ParameterBinding::Boundary]
    );
    let expected: BTreeMap<Port, Port> = [
        (Port::new(1, 0), Port::new(0, 0)),
        (Port::new(2, 0), Port::new(0, 0)),
        (Port::new(2, 1), Port::new(1, 0)),
    ]
    .into_iter()
    .collect();
    assert_eq!(partition.boundary_map, expected);
    partition.verify(&function).unwrap();
}

#[test]
fn independent_same_placement_branches_share_a_region() {
    let mut builder = FunctionBuilder::new();
    let p = builder.add_parameter(vector());
    let a = unary(&mut builder, ElementwiseUnaryOp::Neg, p, "x");
    let b = unary(&mut builder, ElementwiseUnaryOp::Abs, p, "y");
    let c = unary(&mut builder, ElementwiseUnaryOp::Tanh, p, "x");
    builder.add_result(a).unwrap();
    builder.add_result(b).unwrap();
    builder.add_result(c).unwrap();
    let function = finish_preassigned(builder, "branches");

    let partition = partition(&function).unwrap();
    assert_eq!(placements(&partition), vec!["x", "y"]);
    assert_eq!(
        partition.sub_functions[0].results,
        vec![
            ResultBinding::Output(0),
            ResultBinding::Output(2),
            ResultBinding::Boundary
        ]
    );
    assert_eq!(
        partition.sub_functions[1].results,
        vec![ResultBinding::Output(1)]
    );
    partition.verify(&function).unwrap();
}

#[test]
fn verify_rejects_a_dropped_boundary_entry() {
    let mut builder = FunctionBuilder::new();
    let p = builder.add_parameter(vector());
    let a = unary(&mut builder, ElementwiseUnaryOp::Neg, p, "x");
    let b = unary(&mut builder, ElementwiseUnaryOp::Abs, a, "y");
    builder.add_result(b).unwrap();
    let function = finish_preassigned(builder, "tampered");

    let mut partition = partition(&function).unwrap();
    partition.verify(&function).unwrap();
    partition.boundary_map.remove(&Port::new(1, 0));
    let err = partition.verify(&function).unwrap_err();
    assert!(matches!(err, BackendError::Graph { .. }), "{err}");
}

#[test]
fn unplaced_function_is_rejected() {
    let mut builder = FunctionBuilder::new();
    let p = builder.add_parameter(vector());
    let a = unary(&mut builder, ElementwiseUnaryOp::Neg, p, "x");
    builder.add_result(a).unwrap();
    let function = builder.finish("partly_placed").unwrap();

    let err = partition(&function).unwrap_err();
    assert!(matches!(err, BackendError::InvalidPlacement { .. }));
}
