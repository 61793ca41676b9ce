//! Engine loading
//!
//! [`EngineLoader`] turns bytes into an [`Engine`] along one of two paths:
//!
//! - **Fast path**: the bytes are an engine artifact (see [`crate::format`]);
//!   the header is checked and the payload is deserialized directly.
//! - **Slow path**: anything else is treated as an ONNX network description;
//!   it is parsed, compiled by the builder, then deserialized. With a
//!   `cache_dir` configured, compiled engines are saved and reused.

use crate::compiler::compile_network;
use crate::cuda;
use crate::error::{Error, Result};
use crate::format::{self, FORMAT_VERSION};
use crate::logger::Logger;
use crate::probe::DeviceHandle;
use crate::runtime::{CudaEngine, Runtime};
use crate::session::Session;
use crate::tensor::{BindingSpec, DataType, TensorIo};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use trtbind_sys::{TRTB_TENSOR_IO_INPUT, TRTB_TENSOR_IO_OUTPUT};

/// Loader settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Workspace memory-pool limit for engine builds, in bytes
    pub workspace_size: usize,
    /// Directory for compiled engines built from ONNX
    pub cache_dir: Option<PathBuf>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            workspace_size: 1 << 30,
            cache_dir: None,
        }
    }
}

/// Loads engines onto a probed device
pub struct EngineLoader {
    device: DeviceHandle,
    config: LoaderConfig,
    logger: Arc<Logger>,
    runtime: Arc<Runtime>,
}

impl EngineLoader {
    /// Create a loader whose native messages go to `tracing`
    pub fn new(device: &DeviceHandle, config: LoaderConfig) -> Result<Self> {
        Self::with_logger(device, config, Logger::tracing()?)
    }

    /// Create a loader with a custom native logger
    pub fn with_logger(device: &DeviceHandle, config: LoaderConfig, logger: Logger) -> Result<Self> {
        let logger = Arc::new(logger);
        let runtime = Arc::new(Runtime::new(Arc::clone(&logger))?);
        Ok(EngineLoader {
            device: device.clone(),
            config,
            logger,
            runtime,
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Read a file and load it with [`load_bytes`](Self::load_bytes)
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Engine> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        debug!(path = %path.display(), bytes = bytes.len(), "read engine source");
        self.load_bytes(&bytes)
    }

    /// Load an engine artifact, or build from an ONNX description
    pub fn load_bytes(&self, bytes: &[u8]) -> Result<Engine> {
        if format::is_artifact(bytes) {
            self.load_artifact(bytes)
        } else {
            self.build_from_onnx(bytes)
        }
    }

    /// Fast path: validate the artifact header, then deserialize
    pub fn load_artifact(&self, bytes: &[u8]) -> Result<Engine> {
        let payload = format::decode(bytes, self.device.platform())?;
        let engine = self.load_plan(payload)?;
        info!(bindings = engine.bindings().len(), "loaded engine artifact");
        Ok(engine)
    }

    /// Deserialize a bare native plan, as produced by the builder
    pub fn load_plan(&self, plan: &[u8]) -> Result<Engine> {
        cuda::set_device(self.device.ordinal())?;
        let native = self.runtime.deserialize_cuda_engine(plan)?;
        Engine::from_native(native, self.device.clone())
    }

    /// Slow path: parse, compile, and deserialize an ONNX network
    pub fn build_from_onnx(&self, onnx: &[u8]) -> Result<Engine> {
        if !self.device.has_onnx_parser() {
            return Err(Error::missing(vec!["libnvonnxparser".to_string()]));
        }

        let cache_path = self.cache_path(onnx);
        if let Some(path) = &cache_path {
            if let Some(engine) = self.load_cached(path) {
                return Ok(engine);
            }
        }

        let started = Instant::now();
        let plan = self.build_plan(onnx)?;
        let engine = self.load_plan(&plan)?;
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            bindings = engine.bindings().len(),
            "built engine from network description"
        );

        if let Some(path) = &cache_path {
            self.store_cached(path, &plan);
        }
        Ok(engine)
    }

    fn build_plan(&self, onnx: &[u8]) -> Result<Vec<u8>> {
        cuda::set_device(self.device.ordinal())?;
        compile_network(&self.logger, onnx, self.config.workspace_size)
    }

    fn cache_path(&self, onnx: &[u8]) -> Option<PathBuf> {
        let dir = self.config.cache_dir.as_ref()?;
        let digest = Sha256::digest(onnx);
        let hash: String = digest[..16].iter().map(|b| format!("{:02x}", b)).collect();
        Some(dir.join(format!(
            "{}-v{}-{}.engine",
            self.device.platform(),
            FORMAT_VERSION,
            hash
        )))
    }

    fn load_cached(&self, path: &Path) -> Option<Engine> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "engine cache miss");
                return None;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable engine cache entry, rebuilding");
                return None;
            }
        };
        match self.load_artifact(&bytes) {
            Ok(engine) => {
                info!(path = %path.display(), "engine cache hit");
                Some(engine)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "invalid engine cache entry, rebuilding");
                None
            }
        }
    }

    fn store_cached(&self, path: &Path, plan: &[u8]) {
        let artifact = format::encode(self.device.platform(), plan);
        let written = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|_| std::fs::write(path, &artifact));
        match written {
            Ok(()) => debug!(path = %path.display(), bytes = artifact.len(), "cached engine"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to cache engine"),
        }
    }
}

impl fmt::Debug for EngineLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineLoader")
            .field("device", &self.device)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct EngineInner {
    native: CudaEngine,
    bindings: Vec<BindingSpec>,
    device: DeviceHandle,
}

/// A compiled network bound to a device
///
/// Cloning is cheap; all clones and every [`Session`] created from them share
/// one native engine, which is released when the last of them is dropped.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    fn from_native(native: CudaEngine, device: DeviceHandle) -> Result<Self> {
        let count = native.get_nb_io_tensors()?;
        let mut bindings = Vec::with_capacity(count.max(0) as usize);

        for index in 0..count {
            let name = native.get_tensor_name(index)?;
            let io = match native.get_tensor_io_mode(&name)? {
                TRTB_TENSOR_IO_INPUT => TensorIo::Input,
                TRTB_TENSOR_IO_OUTPUT => TensorIo::Output,
                mode => {
                    return Err(Error::Format(format!(
                        "tensor `{}` has unsupported I/O mode {}",
                        name, mode
                    )))
                }
            };
            let dtype = DataType::from_native(native.get_tensor_dtype(&name)?)?;
            let shape = native
                .get_tensor_shape(&name)?
                .into_iter()
                .map(|d| {
                    usize::try_from(d).map_err(|_| {
                        Error::Format(format!("tensor `{}` has a dynamic dimension", name))
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            bindings.push(BindingSpec {
                name,
                shape,
                dtype,
                io,
            });
        }

        Ok(Engine {
            inner: Arc::new(EngineInner {
                native,
                bindings,
                device,
            }),
        })
    }

    /// Declared bindings, in engine order
    pub fn bindings(&self) -> &[BindingSpec] {
        &self.inner.bindings
    }

    pub fn binding(&self, name: &str) -> Option<&BindingSpec> {
        self.inner.bindings.iter().find(|b| b.name == name)
    }

    pub fn inputs(&self) -> impl Iterator<Item = &BindingSpec> {
        self.inner.bindings.iter().filter(|b| b.is_input())
    }

    pub fn outputs(&self) -> impl Iterator<Item = &BindingSpec> {
        self.inner.bindings.iter().filter(|b| !b.is_input())
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.inner.device
    }

    /// Serialize into an engine artifact for later fast-path loads
    pub fn to_artifact(&self) -> Result<Vec<u8>> {
        let plan = self.inner.native.serialize()?;
        Ok(format::encode(self.inner.device.platform(), &plan))
    }

    /// Write [`to_artifact`](Self::to_artifact) to `path`
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let artifact = self.to_artifact()?;
        std::fs::write(path.as_ref(), artifact)?;
        Ok(())
    }

    /// Shorthand for [`Session::new`]
    pub fn create_session(&self) -> Result<Session> {
        Session::new(self)
    }

    pub(crate) fn native(&self) -> &CudaEngine {
        &self.inner.native
    }

    /// Number of live clones plus sessions holding this engine
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("bindings", &self.inner.bindings)
            .field("device", &self.inner.device)
            .finish()
    }
}
