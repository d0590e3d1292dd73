#![allow(dead_code)]

use std::sync::Arc;

use hybrid_rs::backend::spec::{
    Backend, ElementwiseBinaryOp, ElementwiseUnaryOp, Operation, TensorSpec,
};
use hybrid_rs::tensor::Scalar;
use hybrid_rs::{Function, FunctionBuilder, HostTensor, TensorRef, ValueRef};
use hybrid_rs_backend_ref_cpu::CpuBackend;
use hybrid_rs_backend_tests::RecordingBackend;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn host<T: Scalar>(dims: &[usize], values: &[T]) -> TensorRef {
    Arc::new(HostTensor::from_values(dims, values).unwrap())
}

pub fn zeroed(spec: TensorSpec) -> TensorRef {
    Arc::new(HostTensor::zeroed(spec).unwrap())
}

/// Caller output tensors for `function`, pre-filled with `fill`.
pub fn outputs_filled<T: Scalar>(function: &Function, fill: T) -> Vec<TensorRef> {
    function
        .result_specs()
        .into_iter()
        .map(|spec| {
            let count = spec.element_count().unwrap();
            Arc::new(HostTensor::from_values(spec.shape.clone(), &vec![fill; count]).unwrap())
        })
        .collect()
}

/// Emits a unary op tagged with `tag`.
pub fn unary(
    builder: &mut FunctionBuilder,
    op: ElementwiseUnaryOp,
    input: ValueRef,
    tag: &str,
) -> ValueRef {
    let value = builder
        .emit_single(Operation::ElementwiseUnary(op), &[input])
        .unwrap();
    builder.set_placement(value.node, tag).unwrap();
    value
}

/// Emits a binary op tagged with `tag`.
pub fn binary(
    builder: &mut FunctionBuilder,
    op: ElementwiseBinaryOp,
    lhs: ValueRef,
    rhs: ValueRef,
    tag: &str,
) -> ValueRef {
    let value = builder
        .emit_single(Operation::ElementwiseBinary(op), &[lhs, rhs])
        .unwrap();
    builder.set_placement(value.node, tag).unwrap();
    value
}

/// Two recording CPU backends named `x` and `y`.
pub fn recording_pair() -> (Arc<RecordingBackend>, Arc<RecordingBackend>) {
    (
        Arc::new(RecordingBackend::new(Arc::new(CpuBackend::named("x")))),
        Arc::new(RecordingBackend::new(Arc::new(CpuBackend::named("y")))),
    )
}

pub fn as_members(backends: &[&Arc<RecordingBackend>]) -> Vec<Arc<dyn Backend>> {
    backends
        .iter()
        .map(|backend| Arc::clone(*backend) as Arc<dyn Backend>)
        .collect()
}
