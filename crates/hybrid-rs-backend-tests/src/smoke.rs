use std::sync::Arc;

use hybrid_rs::backend::spec::{
    Backend, BackendError, CastSpec, ConcatSpec, DType, ElementwiseBinaryOp, ElementwiseUnaryOp,
    Operation, ReshapeSpec, Shape, SplitSpec, TensorLiteral, TensorSpec, TransposeSpec,
};
use hybrid_rs::tensor::storage::{encode, Scalar};
use hybrid_rs::{Function, FunctionBuilder, TensorRef};

fn tensor<T: Scalar>(backend: &dyn Backend, dims: &[usize], values: &[T]) -> TensorRef {
    let tensor = backend
        .create_tensor(TensorSpec::new(T::DTYPE, dims))
        .unwrap();
    tensor.write_bytes(&encode(values)).unwrap();
    tensor
}

fn outputs_for(backend: &dyn Backend, function: &Function) -> Vec<TensorRef> {
    function
        .result_specs()
        .into_iter()
        .map(|spec| backend.create_tensor(spec).unwrap())
        .collect()
}

fn binary(op: ElementwiseBinaryOp) -> Operation {
    Operation::ElementwiseBinary(op)
}

pub fn elementwise_chain_matches_expected(backend: &dyn Backend) {
    let spec = TensorSpec::new(DType::F32, [2, 3]);
    let mut builder = FunctionBuilder::new();
    let a = builder.add_parameter(spec.clone());
    let b = builder.add_parameter(spec);
    let sum = builder
        .emit_single(binary(ElementwiseBinaryOp::Add), &[a, b])
        .unwrap();
    let product = builder
        .emit_single(binary(ElementwiseBinaryOp::Mul), &[sum, a])
        .unwrap();
    let diff = builder
        .emit_single(binary(ElementwiseBinaryOp::Sub), &[product, b])
        .unwrap();
    let relu = builder
        .emit_single(Operation::ElementwiseUnary(ElementwiseUnaryOp::Relu), &[diff])
        .unwrap();
    builder.add_result(relu).unwrap();
    let function = builder.finish("elementwise_chain").unwrap();

    let lhs = [1.0f32, -2.0, 3.0, -4.0, 0.5, -6.0];
    let rhs = [0.5f32, 1.0, -1.0, 2.0, 4.0, 3.0];
    let inputs = vec![
        tensor(backend, &[2, 3], &lhs),
        tensor(backend, &[2, 3], &rhs),
    ];
    let outputs = outputs_for(backend, &function);
    backend.call(&function, &outputs, &inputs).unwrap();

    let expected: Vec<f32> = lhs
        .iter()
        .zip(&rhs)
        .map(|(&x, &y)| ((x + y) * x - y).max(0.0))
        .collect();
    assert_eq!(outputs[0].to_vec::<f32>().unwrap(), expected);
}

pub fn matmul_matches_expected(backend: &dyn Backend) {
    let mut builder = FunctionBuilder::new();
    let a = builder.add_parameter(TensorSpec::new(DType::F32, [2, 2]));
    let b = builder.add_parameter(TensorSpec::new(DType::F32, [2, 2]));
    let c = builder.emit_single(Operation::MatMul, &[a, b]).unwrap();
    builder.add_result(c).unwrap();
    let function = builder.finish("matmul").unwrap();

    let inputs = vec![
        tensor(backend, &[2, 2], &[1.0f32, 2.0, 3.0, 4.0]),
        tensor(backend, &[2, 2], &[5.0f32, 6.0, 7.0, 8.0]),
    ];
    let outputs = outputs_for(backend, &function);
    backend.call(&function, &outputs, &inputs).unwrap();

    assert_eq!(
        outputs[0].to_vec::<f32>().unwrap(),
        vec![19.0, 22.0, 43.0, 50.0]
    );
}

pub fn split_concat_rotates_columns(backend: &dyn Backend) {
    let mut builder = FunctionBuilder::new();
    let x = builder.add_parameter(TensorSpec::new(DType::Si32, [2, 4]));
    let parts = builder
        .emit(
            Operation::Split(SplitSpec {
                axis: 1,
                sizes: vec![1, 3],
            }),
            &[x],
        )
        .unwrap();
    assert_eq!(parts.len(), 2);
    let rotated = builder
        .emit_single(
            Operation::Concat(ConcatSpec { axis: 1 }),
            &[parts[1], parts[0]],
        )
        .unwrap();
    builder.add_result(rotated).unwrap();
    let function = builder.finish("rotate_columns").unwrap();

    let inputs = vec![tensor(backend, &[2, 4], &[0i32, 1, 2, 3, 4, 5, 6, 7])];
    let outputs = outputs_for(backend, &function);
    backend.call(&function, &outputs, &inputs).unwrap();

    assert_eq!(
        outputs[0].to_vec::<i32>().unwrap(),
        vec![1, 2, 3, 0, 5, 6, 7, 4]
    );
}

pub fn transpose_reshape_cast_matches_expected(backend: &dyn Backend) {
    let mut builder = FunctionBuilder::new();
    let x = builder.add_parameter(TensorSpec::new(DType::F32, [2, 3]));
    let transposed = builder
        .emit_single(
            Operation::Transpose(TransposeSpec { perm: vec![1, 0] }),
            &[x],
        )
        .unwrap();
    let flat = builder
        .emit_single(
            Operation::Reshape(ReshapeSpec {
                shape: Shape::new(vec![6]),
            }),
            &[transposed],
        )
        .unwrap();
    let ints = builder
        .emit_single(Operation::Cast(CastSpec { dtype: DType::Si32 }), &[flat])
        .unwrap();
    builder.add_result(ints).unwrap();
    let function = builder.finish("transpose_reshape_cast").unwrap();
    assert_eq!(
        function.result_specs(),
        vec![TensorSpec::new(DType::Si32, [6])]
    );

    let inputs = vec![tensor(
        backend,
        &[2, 3],
        &[1.5f32, 2.5, -3.7, 4.0, 5.0, 6.0],
    )];
    let outputs = outputs_for(backend, &function);
    backend.call(&function, &outputs, &inputs).unwrap();

    assert_eq!(
        outputs[0].to_vec::<i32>().unwrap(),
        vec![1, 4, 2, 5, -3, 6]
    );
}

pub fn multiple_results_are_written_in_order(backend: &dyn Backend) {
    let mut builder = FunctionBuilder::new();
    let a = builder.add_parameter(TensorSpec::new(DType::Si64, [3]));
    let doubled = builder
        .emit_single(binary(ElementwiseBinaryOp::Add), &[a, a])
        .unwrap();
    let negated = builder
        .emit_single(Operation::ElementwiseUnary(ElementwiseUnaryOp::Neg), &[a])
        .unwrap();
    builder.add_result(negated).unwrap();
    builder.add_result(doubled).unwrap();
    let function = builder.finish("two_results").unwrap();

    let inputs = vec![tensor(backend, &[3], &[1i64, -2, 3])];
    let outputs = outputs_for(backend, &function);
    backend.call(&function, &outputs, &inputs).unwrap();

    assert_eq!(outputs[0].to_vec::<i64>().unwrap(), vec![-1, 2, -3]);
    assert_eq!(outputs[1].to_vec::<i64>().unwrap(), vec![2, -4, 6]);
}

pub fn constant_operand_is_folded_into_result(backend: &dyn Backend) {
    let spec = TensorSpec::new(DType::F64, [2]);
    let mut builder = FunctionBuilder::new();
    let x = builder.add_parameter(spec.clone());
    let scale = builder
        .constant(TensorLiteral::new(
            spec,
            Arc::from(encode(&[10.0f64, 20.0])),
        ))
        .unwrap();
    let scaled = builder
        .emit_single(binary(ElementwiseBinaryOp::Mul), &[x, scale])
        .unwrap();
    builder.add_result(scaled).unwrap();
    let function = builder.finish("scale").unwrap();

    let inputs = vec![tensor(backend, &[2], &[0.5f64, -1.0])];
    let outputs = outputs_for(backend, &function);
    backend.call(&function, &outputs, &inputs).unwrap();

    assert_eq!(outputs[0].to_vec::<f64>().unwrap(), vec![5.0, -20.0]);
}

fn negate_function() -> Function {
    let mut builder = FunctionBuilder::new();
    let x = builder.add_parameter(TensorSpec::new(DType::F32, [2]));
    let y = builder
        .emit_single(Operation::ElementwiseUnary(ElementwiseUnaryOp::Neg), &[x])
        .unwrap();
    builder.add_result(y).unwrap();
    builder.finish("negate").unwrap()
}

pub fn mismatched_input_dtype_is_rejected(backend: &dyn Backend) {
    let function = negate_function();
    let inputs = vec![tensor(backend, &[2], &[1i32, 2])];
    let outputs = vec![tensor(backend, &[2], &[7.0f32, 7.0])];

    let err = backend.call(&function, &outputs, &inputs).unwrap_err();
    assert!(
        matches!(
            err,
            BackendError::TypeMismatch {
                expected: DType::F32,
                found: DType::Si32,
                ..
            }
        ),
        "unexpected error: {err}"
    );
    assert_eq!(outputs[0].to_vec::<f32>().unwrap(), vec![7.0, 7.0]);
}

pub fn wrong_input_count_is_rejected(backend: &dyn Backend) {
    let function = negate_function();
    let outputs = outputs_for(backend, &function);

    let err = backend.call(&function, &outputs, &[]).unwrap_err();
    assert!(
        matches!(err, BackendError::ShapeMismatch { .. }),
        "unexpected error: {err}"
    );
}

pub fn compile_is_idempotent(backend: &dyn Backend) {
    let function = negate_function();
    backend.compile(&function).unwrap();
    backend.compile(&function).unwrap();

    let inputs = vec![tensor(backend, &[2], &[1.5f32, -2.0])];
    let outputs = outputs_for(backend, &function);
    backend.call(&function, &outputs, &inputs).unwrap();
    assert_eq!(outputs[0].to_vec::<f32>().unwrap(), vec![-1.5, 2.0]);
}
