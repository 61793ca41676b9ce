//! Basic workflow example
//!
//! Probes the platform, loads an engine (building it first when given an
//! ONNX model), runs one zero-filled inference with per-layer profiling, and
//! prints the top-5 classes of every float32 output.
//!
//! ```text
//! cargo run --example basic_workflow -- model.onnx [model.engine]
//! ```
//!
//! With `--features mock`, pass a mock network description instead of ONNX,
//! e.g. a file containing:
//!
//! ```text
//! trtbind-mock-network v1
//! input input float32 1,3,224,224
//! output output float32 1,1000
//! ```

use std::error::Error;
use tracing::info;
use trtbind::{classify, probe, DataType, EngineLoader, HostTensor, LoaderConfig};

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let model = args.next().ok_or("usage: basic_workflow <model> [engine-out]")?;
    let engine_out = args.next();

    // Step 1: locate TensorRT and CUDA, select a device
    let device = probe()?;
    info!(platform = %device.platform(), device = device.ordinal(), "probed");

    // Step 2: load (or build) the engine
    let loader = EngineLoader::new(&device, LoaderConfig::default())?;
    let engine = loader.load_file(&model)?;
    for binding in engine.bindings() {
        println!(
            "{:?} {} {}{:?}",
            binding.io, binding.name, binding.dtype, binding.shape
        );
    }

    if let Some(path) = engine_out {
        engine.save(&path)?;
        info!(path = %path, "saved engine artifact");
    }

    // Step 3: run once with zeroed inputs
    let mut session = engine.create_session()?;
    for input in engine.inputs() {
        session.bind(&input.name, HostTensor::zeros(input.dtype, input.shape.clone()))?;
    }
    session.start_profiling("basic_workflow", &model)?;
    session.run()?;
    session.end_profiling()?;

    // Step 4: report
    for output in engine.outputs().filter(|o| o.dtype == DataType::Float32) {
        let ranked = classify(session.output(&output.name)?, 5)?;
        println!("{}: {}", output.name, serde_json::to_string(&ranked)?);
    }
    if let Some(profile) = session.read_profile()? {
        println!("profile: {}", profile.to_json()?);
    }

    session.destroy()?;
    Ok(())
}
