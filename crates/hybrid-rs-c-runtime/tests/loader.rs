//! Opens the built factory library through the dynamic loader, when cargo produced one.

use std::path::PathBuf;
use std::sync::Arc;

use hybrid_rs::backend::loader::BackendLibrary;
use hybrid_rs::backend::spec::{ElementwiseBinaryOp, Operation};
use hybrid_rs::{Backend, BackendError, DType, FunctionBuilder, HostTensor, TensorSpec};

fn built_library() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let deps = exe.parent()?;
    let file = libloading::library_filename("hybrid_rs_c_runtime");
    [deps.to_path_buf(), deps.parent()?.to_path_buf()]
        .into_iter()
        .map(|dir| dir.join(&file))
        .find(|path| path.exists())
}

#[test]
fn loaded_backend_runs_a_function() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let Some(path) = built_library() else {
        log::warn!("factory library not found next to the test binary, skipping");
        return Ok(());
    };

    let library = unsafe { BackendLibrary::open(&path) }?;
    assert_eq!(library.version(), hybrid_rs::VERSION);
    let backend = library.create("HYBRID:cpu")?;
    assert_eq!(backend.backend_name(), "hybrid");

    let spec = TensorSpec::new(DType::F32, [3]);
    let mut builder = FunctionBuilder::new();
    let a = builder.add_parameter(spec.clone());
    let b = builder.add_parameter(spec.clone());
    let sum = builder.emit_single(
        Operation::ElementwiseBinary(ElementwiseBinaryOp::Add),
        &[a, b],
    )?;
    builder.add_result(sum)?;
    let function = builder.finish("add")?;

    let inputs = vec![
        Arc::new(HostTensor::from_values([3], &[1.0f32, 2.0, 3.0])?),
        Arc::new(HostTensor::from_values([3], &[10.0f32, 20.0, 30.0])?),
    ];
    let outputs = vec![Arc::new(HostTensor::zeroed(spec)?)];
    backend.call(&function, &outputs, &inputs)?;
    assert_eq!(outputs[0].to_vec::<f32>()?, vec![11.0, 22.0, 33.0]);
    Ok(())
}

#[test]
fn loaded_library_rejects_bad_configuration() -> anyhow::Result<()> {
    let Some(path) = built_library() else {
        return Ok(());
    };
    let library = unsafe { BackendLibrary::open(&path) }?;
    assert!(matches!(
        library.create("cpu,missing"),
        Err(BackendError::Library { .. })
    ));
    Ok(())
}
