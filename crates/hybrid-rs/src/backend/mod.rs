//! Backend contract, registry, and dynamic loading.

pub mod loader;
pub mod registry;
pub mod spec;

use crate::graph::Function;
use crate::tensor::TensorRef;

use spec::{BackendError, BackendResult, TensorSpec};

fn check_slot(slot: String, expected: &TensorSpec, found: &TensorSpec) -> BackendResult<()> {
    if expected.dtype != found.dtype {
        return Err(BackendError::TypeMismatch {
            slot,
            expected: expected.dtype,
            found: found.dtype,
        });
    }
    if expected.shape != found.shape {
        return Err(BackendError::ShapeMismatch {
            slot,
            expected: expected.shape.to_string(),
            found: found.shape.to_string(),
        });
    }
    Ok(())
}

/// Checks caller tensors against the signature of `function` before anything runs.
///
/// Counts are checked first, then each input and output slot in order: dtype before shape.
pub fn validate_call(
    function: &Function,
    outputs: &[TensorRef],
    inputs: &[TensorRef],
) -> BackendResult<()> {
    let parameters = function.parameter_specs();
    let results = function.result_specs();
    if inputs.len() != parameters.len() {
        return Err(BackendError::ShapeMismatch {
            slot: "inputs".to_string(),
            expected: format!("{} tensors", parameters.len()),
            found: format!("{} tensors", inputs.len()),
        });
    }
    if outputs.len() != results.len() {
        return Err(BackendError::ShapeMismatch {
            slot: "outputs".to_string(),
            expected: format!("{} tensors", results.len()),
            found: format!("{} tensors", outputs.len()),
        });
    }
    for (index, (spec, tensor)) in parameters.iter().zip(inputs).enumerate() {
        check_slot(format!("input {index}"), spec, tensor.spec())?;
    }
    for (index, (spec, tensor)) in results.iter().zip(outputs).enumerate() {
        check_slot(format!("output {index}"), spec, tensor.spec())?;
    }
    Ok(())
}
