#![allow(dead_code)]

use std::fs;
use std::path::Path;
use tempfile::TempDir;
use trtbind::{probe_with, DeviceHandle, Engine, EngineLoader, LoaderConfig, Platform, ProbeConfig};

/// The classifier-shaped network used throughout the tests
pub const CLASSIFIER: &[u8] = b"trtbind-mock-network v1
input input float32 1,3,224,224
output output float32 1,1000
";

pub const INPUT_ELEMENTS: usize = 3 * 224 * 224;

const SDK_FILES: [&str; 5] = [
    "include/NvInfer.h",
    "include/cuda_runtime_api.h",
    "lib/libnvinfer.so.10",
    "lib/libcudart.so.12",
    "lib/libnvonnxparser.so.10",
];

/// Lay out empty SDK files under a temporary root
pub fn fake_sdk(files: &[&str]) -> TempDir {
    let root = tempfile::tempdir().unwrap();
    for file in files {
        let path = root.path().join(file);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }
    root
}

pub fn probe_config(root: &Path) -> ProbeConfig {
    ProbeConfig::empty(Platform::current().unwrap())
        .with_include_dir(root.join("include"))
        .with_library_dir(root.join("lib"))
}

/// A probed device backed by a complete fake SDK
pub fn device() -> DeviceHandle {
    device_with_ordinal(0)
}

/// Like [`device`], selecting CUDA device `ordinal`
pub fn device_with_ordinal(ordinal: i32) -> DeviceHandle {
    let root = fake_sdk(&SDK_FILES);
    probe_with(&probe_config(root.path()).with_device(ordinal)).unwrap()
}

pub fn loader() -> EngineLoader {
    EngineLoader::new(&device(), LoaderConfig::default()).unwrap()
}

pub fn classifier() -> Engine {
    loader().build_from_onnx(CLASSIFIER).unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
