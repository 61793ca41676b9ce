#![cfg(feature = "mock")]

mod common;

use common::{
    classifier, device, device_with_ordinal, fake_sdk, loader, probe_config, CLASSIFIER,
    INPUT_ELEMENTS,
};
use trtbind::format::{self, HEADER_LEN};
use trtbind::{
    cuda, probe_with, DataType, EngineLoader, Error, ErrorClass, HostTensor, LoaderConfig,
    Platform, TensorIo,
};

#[test]
fn build_lists_bindings_in_order() {
    common::init_tracing();
    let engine = classifier();

    let bindings = engine.bindings();
    assert_eq!(bindings.len(), 2);
    assert_eq!(bindings[0].name, "input");
    assert_eq!(bindings[0].shape, vec![1, 3, 224, 224]);
    assert_eq!(bindings[0].dtype, DataType::Float32);
    assert_eq!(bindings[0].io, TensorIo::Input);
    assert_eq!(bindings[1].name, "output");
    assert_eq!(bindings[1].shape, vec![1, 1000]);
    assert_eq!(bindings[1].io, TensorIo::Output);
}

#[test]
fn saved_artifact_takes_the_fast_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("classifier.engine");

    let loader = loader();
    let built = loader.build_from_onnx(CLASSIFIER).unwrap();
    built.save(&path).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert!(format::is_artifact(&bytes));

    let loaded = loader.load_file(&path).unwrap();
    assert_eq!(loaded.bindings(), built.bindings());
}

#[test]
fn one_artifact_loads_into_independent_engines() {
    let loader = loader();
    let artifact = loader.build_from_onnx(CLASSIFIER).unwrap().to_artifact().unwrap();

    let first = loader.load_bytes(&artifact).unwrap();
    let second = loader.load_bytes(&artifact).unwrap();
    assert_eq!(first.bindings(), second.bindings());
    assert_eq!(first.handle_count(), 1);
    assert_eq!(second.handle_count(), 1);

    drop(first);
    let mut session = second.create_session().unwrap();
    session
        .bind(
            "input",
            HostTensor::from_f32(vec![1, 3, 224, 224], &vec![0.0; INPUT_ELEMENTS]).unwrap(),
        )
        .unwrap();
    session.run().unwrap();
    assert_eq!(session.output("output").unwrap().to_f32_vec().unwrap()[3], 3.0);
}

#[test]
fn engines_are_loaded_onto_the_probed_device() {
    let device = device_with_ordinal(1);
    let loader = EngineLoader::new(&device, LoaderConfig::default()).unwrap();

    cuda::set_device(0).unwrap();
    let engine = loader.build_from_onnx(CLASSIFIER).unwrap();
    cuda::set_device(0).unwrap();
    let reloaded = loader.load_bytes(&engine.to_artifact().unwrap()).unwrap();

    for engine in [engine, reloaded] {
        let mut session = engine.create_session().unwrap();
        session
            .bind(
                "input",
                HostTensor::from_f32(vec![1, 3, 224, 224], &vec![0.0; INPUT_ELEMENTS]).unwrap(),
            )
            .unwrap();
        session.run().unwrap();
    }
}

#[test]
fn load_bytes_dispatches_on_magic() {
    let loader = loader();
    let from_network = loader.load_bytes(CLASSIFIER).unwrap();
    let artifact = from_network.to_artifact().unwrap();
    let from_artifact = loader.load_bytes(&artifact).unwrap();
    assert_eq!(from_network.bindings(), from_artifact.bindings());
}

#[test]
fn damaged_artifacts_are_rejected() {
    let loader = loader();
    let artifact = classifier().to_artifact().unwrap();

    let mut flipped = artifact.clone();
    flipped[HEADER_LEN + 3] ^= 0x20;
    let err = loader.load_bytes(&flipped).unwrap_err();
    assert!(matches!(err, Error::Corruption(_)), "got {:?}", err);
    assert_eq!(err.class(), ErrorClass::BadArtifact);

    let err = loader.load_bytes(&artifact[..HEADER_LEN - 8]).unwrap_err();
    assert!(matches!(err, Error::Corruption(_)), "got {:?}", err);

    let err = loader.load_bytes(&artifact[..artifact.len() - 10]).unwrap_err();
    assert!(matches!(err, Error::Corruption(_)), "got {:?}", err);
}

#[test]
fn foreign_platform_is_a_format_error() {
    let here = Platform::current().unwrap();
    let other = match here {
        Platform::X86_64 => Platform::Aarch64,
        Platform::Aarch64 => Platform::X86_64,
    };
    let plan = b"trtbind-mock-plan v1\ninput x float32 1\noutput y float32 1\n";
    let artifact = format::encode(other, plan);

    let err = loader().load_bytes(&artifact).unwrap_err();
    assert!(matches!(err, Error::Format(_)), "got {:?}", err);
}

#[test]
fn unrecognized_bytes_are_a_format_error() {
    let err = loader().load_bytes(b"\x08\x07\x12\x04junk").unwrap_err();
    assert!(matches!(err, Error::Format(_)), "got {:?}", err);
    assert_eq!(err.class(), ErrorClass::BadArtifact);
}

#[test]
fn dynamic_dimensions_are_rejected() {
    let network = b"trtbind-mock-network v1\ninput x float32 -1,4\noutput y float32 4\n";
    let err = loader().build_from_onnx(network).unwrap_err();
    match err {
        Error::Format(msg) => assert!(msg.contains("dynamic"), "{}", msg),
        other => panic!("expected format error, got {:?}", other),
    }
}

#[test]
fn missing_file_is_io() {
    let err = loader().load_file("/nonexistent/model.engine").unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}

#[test]
fn building_needs_the_onnx_parser() {
    let root = fake_sdk(&[
        "include/NvInfer.h",
        "include/cuda_runtime_api.h",
        "lib/libnvinfer.so",
        "lib/libcudart.so",
    ]);
    let device = probe_with(&probe_config(root.path())).unwrap();
    let loader = EngineLoader::new(&device, LoaderConfig::default()).unwrap();

    let err = loader.build_from_onnx(CLASSIFIER).unwrap_err();
    match err {
        Error::Environment { missing, .. } => assert_eq!(missing, vec!["libnvonnxparser"]),
        other => panic!("expected environment error, got {:?}", other),
    }

    // Artifacts still load without it
    let artifact = classifier().to_artifact().unwrap();
    assert!(loader.load_bytes(&artifact).is_ok());
}

#[test]
fn build_cache_is_written_and_repaired() {
    let cache = tempfile::tempdir().unwrap();
    let config = LoaderConfig {
        cache_dir: Some(cache.path().join("engines")),
        ..LoaderConfig::default()
    };
    let loader = EngineLoader::new(&device(), config).unwrap();

    let first = loader.build_from_onnx(CLASSIFIER).unwrap();
    let entries: Vec<_> = std::fs::read_dir(cache.path().join("engines"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(entries.len(), 1);
    let cached = std::fs::read(&entries[0]).unwrap();
    assert!(format::decode(&cached, Platform::current().unwrap()).is_ok());

    let second = loader.build_from_onnx(CLASSIFIER).unwrap();
    assert_eq!(first.bindings(), second.bindings());

    // A damaged entry is rebuilt and overwritten
    std::fs::write(&entries[0], b"TRTB garbage").unwrap();
    let third = loader.build_from_onnx(CLASSIFIER).unwrap();
    assert_eq!(first.bindings(), third.bindings());
    let repaired = std::fs::read(&entries[0]).unwrap();
    assert!(format::decode(&repaired, Platform::current().unwrap()).is_ok());
}
