//! Output type inference for graph operations.

use smallvec::{smallvec, SmallVec};

use crate::backend::spec::{
    BackendError, BackendResult, DType, ElementwiseUnaryOp, Operation, Shape, TensorSpec,
};

pub(crate) type OutputSpecs = SmallVec<[TensorSpec; 1]>;

fn expect_arity(op: &Operation, inputs: &[&TensorSpec], arity: usize) -> BackendResult<()> {
    if inputs.len() != arity {
        return Err(BackendError::graph(format!(
            "{} expects {} operand(s), got {}",
            op.kind(),
            arity,
            inputs.len()
        )));
    }
    Ok(())
}

fn reject_bool(op: &Operation, spec: &TensorSpec) -> BackendResult<()> {
    if spec.dtype == DType::I1 {
        return Err(BackendError::graph(format!(
            "{} does not accept {} operands",
            op.kind(),
            spec.dtype
        )));
    }
    Ok(())
}

/// Computes the output specs of `op` applied to operands of the given specs.
pub(crate) fn infer_outputs(op: &Operation, inputs: &[&TensorSpec]) -> BackendResult<OutputSpecs> {
    match op {
        Operation::Parameter | Operation::Result => Err(BackendError::graph(format!(
            "{} nodes are created through the builder, not emitted",
            op.kind()
        ))),
        Operation::Constant(literal) => {
            expect_arity(op, inputs, 0)?;
            let expected = literal.spec.byte_len();
            if expected != Some(literal.byte_len()) {
                return Err(BackendError::graph(format!(
                    "constant payload has {} bytes but {} requires {:?}",
                    literal.byte_len(),
                    literal.spec,
                    expected
                )));
            }
            Ok(smallvec![literal.spec.clone()])
        }
        Operation::ElementwiseUnary(unary) => {
            expect_arity(op, inputs, 1)?;
            let input = inputs[0];
            reject_bool(op, input)?;
            let float_only = matches!(
                unary,
                ElementwiseUnaryOp::Exp | ElementwiseUnaryOp::Log | ElementwiseUnaryOp::Tanh
            );
            if float_only && !input.dtype.is_float() {
                return Err(BackendError::graph(format!(
                    "{unary:?} requires a floating-point operand, got {}",
                    input.dtype
                )));
            }
            Ok(smallvec![input.clone()])
        }
        Operation::ElementwiseBinary(binary) => {
            expect_arity(op, inputs, 2)?;
            let (lhs, rhs) = (inputs[0], inputs[1]);
            reject_bool(op, lhs)?;
            if lhs != rhs {
                return Err(BackendError::graph(format!(
                    "{binary:?} operands disagree: {lhs} vs {rhs}"
                )));
            }
            Ok(smallvec![lhs.clone()])
        }
        Operation::Reshape(reshape) => {
            expect_arity(op, inputs, 1)?;
            let input = inputs[0];
            if input.shape.element_count() != reshape.shape.element_count() {
                return Err(BackendError::graph(format!(
                    "cannot reshape {} into {}",
                    input.shape, reshape.shape
                )));
            }
            Ok(smallvec![TensorSpec::new(input.dtype, reshape.shape.clone())])
        }
        Operation::Transpose(transpose) => {
            expect_arity(op, inputs, 1)?;
            let input = inputs[0];
            let rank = input.shape.rank();
            let mut seen = vec![false; rank];
            if transpose.perm.len() != rank {
                return Err(BackendError::graph(format!(
                    "permutation {:?} does not match rank {rank}",
                    transpose.perm
                )));
            }
            for &axis in &transpose.perm {
                if axis >= rank || std::mem::replace(&mut seen[axis], true) {
                    return Err(BackendError::graph(format!(
                        "{:?} is not a permutation of 0..{rank}",
                        transpose.perm
                    )));
                }
            }
            let dims = transpose
                .perm
                .iter()
                .map(|&axis| input.shape.dims()[axis])
                .collect::<Vec<_>>();
            Ok(smallvec![TensorSpec::new(input.dtype, dims)])
        }
        Operation::MatMul => {
            expect_arity(op, inputs, 2)?;
            let (lhs, rhs) = (inputs[0], inputs[1]);
            reject_bool(op, lhs)?;
            if lhs.dtype != rhs.dtype {
                return Err(BackendError::graph(format!(
                    "matmul dtypes disagree: {} vs {}",
                    lhs.dtype, rhs.dtype
                )));
            }
            let (l, r) = (lhs.shape.dims(), rhs.shape.dims());
            if l.len() != 2 || r.len() != 2 || l[1] != r[0] {
                return Err(BackendError::graph(format!(
                    "matmul expects [m, k] x [k, n], got {} x {}",
                    lhs.shape, rhs.shape
                )));
            }
            Ok(smallvec![TensorSpec::new(lhs.dtype, [l[0], r[1]])])
        }
        Operation::Split(split) => {
            expect_arity(op, inputs, 1)?;
            let input = inputs[0];
            let dims = input.shape.dims();
            if split.axis >= dims.len() {
                return Err(BackendError::graph(format!(
                    "split axis {} out of range for {}",
                    split.axis, input.shape
                )));
            }
            if split.sizes.is_empty() || split.sizes.iter().sum::<usize>() != dims[split.axis] {
                return Err(BackendError::graph(format!(
                    "split sizes {:?} do not cover axis {} of {}",
                    split.sizes, split.axis, input.shape
                )));
            }
            Ok(split
                .sizes
                .iter()
                .map(|&size| {
                    let mut out = dims.to_vec();
                    out[split.axis] = size;
                    TensorSpec::new(input.dtype, out)
                })
                .collect())
        }
        Operation::Concat(concat) => {
            let first = inputs.first().ok_or_else(|| {
                BackendError::graph("concat expects at least one operand".to_string())
            })?;
            let rank = first.shape.rank();
            if concat.axis >= rank {
                return Err(BackendError::graph(format!(
                    "concat axis {} out of range for {}",
                    concat.axis, first.shape
                )));
            }
            let mut dims = first.shape.dims().to_vec();
            dims[concat.axis] = 0;
            for input in inputs {
                let compatible = input.dtype == first.dtype
                    && input.shape.rank() == rank
                    && input
                        .shape
                        .dims()
                        .iter()
                        .zip(first.shape.dims())
                        .enumerate()
                        .all(|(axis, (a, b))| axis == concat.axis || a == b);
                if !compatible {
                    return Err(BackendError::graph(format!(
                        "concat operand {input} is incompatible with {first}"
                    )));
                }
                dims[concat.axis] += input.shape.dims()[concat.axis];
            }
            Ok(smallvec![TensorSpec::new(first.dtype, Shape::new(dims))])
        }
        Operation::Cast(cast) => {
            expect_arity(op, inputs, 1)?;
            Ok(smallvec![TensorSpec::new(
                cast.dtype,
                inputs[0].shape.clone()
            )])
        }
    }
}
