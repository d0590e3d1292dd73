//! Runs a compiled [`FunctionInstance`] sub-function by sub-function.

use std::collections::HashMap;
use std::sync::Arc;

use log::trace;

use crate::backend::spec::{Backend, BackendError, BackendResult};
use crate::partition::{ParameterBinding, Port, ResultBinding};
use crate::placement::Placement;
use crate::tensor::TensorRef;

use super::cache::FunctionInstance;

/// Copies `tensor` into a fresh tensor allocated by `consumer`.
fn hand_off(consumer: &dyn Backend, tensor: &TensorRef) -> BackendResult<TensorRef> {
    let local = consumer.create_tensor(tensor.spec().clone())?;
    local.copy_from(tensor)?;
    Ok(local)
}

/// Executes every sub-function in order, then copies source results into `outputs`.
///
/// Caller outputs are only written once every sub-function has succeeded; on error they
/// are left as they were.
pub(crate) fn execute<'a, F>(
    instance: &FunctionInstance,
    member: F,
    outputs: &[TensorRef],
    inputs: &[TensorRef],
) -> BackendResult<()>
where
    F: Fn(&Placement) -> BackendResult<&'a Arc<dyn Backend>>,
{
    let mut produced: HashMap<Port, (Placement, TensorRef)> = HashMap::new();
    let mut finals: Vec<Option<TensorRef>> = vec![None; outputs.len()];

    for (index, sub) in instance.sub_functions().iter().enumerate() {
        let backend = member(&sub.placement)?;

        let mut bound = Vec::with_capacity(sub.parameters.len());
        for (slot, binding) in sub.parameters.iter().enumerate() {
            let tensor = match binding {
                ParameterBinding::Input(position) => {
                    inputs.get(*position).cloned().ok_or_else(|| {
                        BackendError::execution(format!("missing caller input {position}"))
                    })?
                }
                ParameterBinding::Boundary => {
                    let port = Port::new(index, slot);
                    let supplier = instance.boundary_map().get(&port).ok_or_else(|| {
                        BackendError::graph(format!("boundary parameter {port} has no supplier"))
                    })?;
                    let (producer, tensor) = produced.get(supplier).ok_or_else(|| {
                        BackendError::execution(format!(
                            "boundary value {supplier} was not produced before {port}"
                        ))
                    })?;
                    if producer == &sub.placement {
                        Arc::clone(tensor)
                    } else {
                        trace!("hand-off {supplier} -> {port}: {producer} to {}", sub.placement);
                        hand_off(backend.as_ref(), tensor)?
                    }
                }
            };
            bound.push(tensor);
        }

        let sub_outputs = sub
            .function
            .result_specs()
            .into_iter()
            .map(|spec| backend.create_tensor(spec))
            .collect::<BackendResult<Vec<_>>>()?;

        trace!(
            "dispatching {} on {} ({} inputs, {} outputs)",
            sub.function.name(),
            sub.placement,
            bound.len(),
            sub_outputs.len()
        );
        backend.call(&sub.function, &sub_outputs, &bound)?;

        for (slot, (binding, tensor)) in sub.results.iter().zip(sub_outputs).enumerate() {
            match binding {
                ResultBinding::Output(position) => {
                    if let Some(target) = finals.get_mut(*position) {
                        *target = Some(tensor);
                    }
                }
                ResultBinding::Boundary => {
                    produced.insert(Port::new(index, slot), (sub.placement.clone(), tensor));
                }
            }
        }
        for port in instance.release_after(index) {
            produced.remove(port);
        }
    }

    let results = instance.function().results();
    let finals = finals
        .into_iter()
        .enumerate()
        .map(|(position, value)| {
            value.ok_or_else(|| BackendError::DisconnectedOutput {
                result: results[position],
            })
        })
        .collect::<BackendResult<Vec<_>>>()?;
    for (target, value) in outputs.iter().zip(&finals) {
        target.copy_from(value)?;
    }
    Ok(())
}
