use std::sync::Arc;

use hybrid_rs::backend::registry;
use hybrid_rs::backend::spec::{
    Backend, BackendError, ElementwiseUnaryOp, Operation, OperationKind, TensorSpec,
};
use hybrid_rs::{DType, FunctionBuilder};
use hybrid_rs_backend_ref_cpu::{register_cpu_backend, CpuBackend};
use hybrid_rs_backend_tests::define_backend_tests;

define_backend_tests!(cpu_backend, || Arc::new(CpuBackend::new()));

fn tanh_function() -> hybrid_rs::Function {
    let mut builder = FunctionBuilder::new();
    let x = builder.add_parameter(TensorSpec::new(DType::F32, [4]));
    let y = builder
        .emit_single(Operation::ElementwiseUnary(ElementwiseUnaryOp::Tanh), &[x])
        .unwrap();
    builder.add_result(y).unwrap();
    builder.finish("tanh").unwrap()
}

#[test]
fn restricted_backend_rejects_unsupported_operation() {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = CpuBackend::with_supported_ops("matmul-only", [OperationKind::MatMul]);
    let function = tanh_function();

    assert!(!backend.supports(&Operation::ElementwiseUnary(ElementwiseUnaryOp::Tanh)));
    assert!(backend.supports(&Operation::Parameter));
    let err = backend.compile(&function).unwrap_err();
    match err {
        BackendError::UnsupportedOperation { backend, op } => {
            assert_eq!(backend, "matmul-only");
            assert_eq!(op, OperationKind::ElementwiseUnary);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!backend.is_compiled(function.id()));
}

#[test]
fn compile_marks_function_identity() {
    let backend = CpuBackend::named("x");
    let function = tanh_function();
    let twin = tanh_function();

    backend.compile(&function).unwrap();
    assert!(backend.is_compiled(function.id()));
    assert!(!backend.is_compiled(twin.id()));
    assert_eq!(backend.backend_name(), "x");
}

#[test]
fn registration_exposes_cpu_backend() {
    register_cpu_backend();
    assert!(registry::has_backend("cpu"));
    let backend = registry::create_backend("cpu").expect("cpu backend registered");
    assert_eq!(backend.backend_name(), "cpu");
}
