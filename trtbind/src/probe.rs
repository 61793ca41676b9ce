//! Platform probe
//!
//! Locates the TensorRT and CUDA installation for the running architecture and
//! confirms a usable device before any engine is touched. Explicit overrides
//! from the environment are searched before the fixed per-architecture
//! defaults.

use crate::cuda;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const REQUIRED_HEADERS: [&str; 2] = ["NvInfer.h", "cuda_runtime_api.h"];
const REQUIRED_LIBRARIES: [&str; 2] = ["nvinfer", "cudart"];
const ONNX_PARSER_LIBRARY: &str = "nvonnxparser";

/// Supported host architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    X86_64,
    Aarch64,
}

impl Platform {
    /// Architecture of the running process
    pub fn current() -> Result<Self> {
        Self::from_arch(std::env::consts::ARCH)
    }

    /// Map a Rust architecture name to a platform
    pub fn from_arch(arch: &str) -> Result<Self> {
        match arch {
            "x86_64" => Ok(Platform::X86_64),
            "aarch64" => Ok(Platform::Aarch64),
            other => Err(Error::missing(vec![format!(
                "supported architecture (found {})",
                other
            )])),
        }
    }

    pub fn arch(&self) -> &'static str {
        match self {
            Platform::X86_64 => "x86_64",
            Platform::Aarch64 => "aarch64",
        }
    }

    /// Tag stored in engine artifact headers
    pub(crate) fn tag(&self) -> u8 {
        match self {
            Platform::X86_64 => 1,
            Platform::Aarch64 => 2,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Platform::X86_64),
            2 => Some(Platform::Aarch64),
            _ => None,
        }
    }

    fn default_include_dirs(&self) -> Vec<PathBuf> {
        vec![
            PathBuf::from("/usr/local/cuda/include"),
            PathBuf::from(format!("/usr/include/{}-linux-gnu", self.arch())),
            PathBuf::from("/opt/frameworks/tensorrt/include"),
            PathBuf::from("/usr/include"),
        ]
    }

    fn default_library_dirs(&self) -> Vec<PathBuf> {
        vec![
            PathBuf::from("/usr/local/cuda/lib64"),
            PathBuf::from("/opt/frameworks/tensorrt/lib"),
            PathBuf::from(format!("/usr/lib/{}-linux-gnu", self.arch())),
        ]
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.arch())
    }
}

/// Where to look for the SDK and which device to use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub platform: Platform,
    /// Searched in order
    pub include_dirs: Vec<PathBuf>,
    /// Searched in order
    pub library_dirs: Vec<PathBuf>,
    pub device_ordinal: i32,
}

impl ProbeConfig {
    /// Only the fixed defaults for `platform`
    pub fn for_platform(platform: Platform) -> Self {
        ProbeConfig {
            platform,
            include_dirs: platform.default_include_dirs(),
            library_dirs: platform.default_library_dirs(),
            device_ordinal: 0,
        }
    }

    /// Empty search paths; callers add directories explicitly
    pub fn empty(platform: Platform) -> Self {
        ProbeConfig {
            platform,
            include_dirs: Vec::new(),
            library_dirs: Vec::new(),
            device_ordinal: 0,
        }
    }

    /// Read overrides from the process environment
    ///
    /// | Variable | Effect |
    /// |---|---|
    /// | `TENSORRT_DIR` | adds `$TENSORRT_DIR/include` and `$TENSORRT_DIR/lib` |
    /// | `CUDA_ROOT` | adds `$CUDA_ROOT/include` and `$CUDA_ROOT/lib64` |
    /// | `TRTBIND_INCLUDE_PATH` | extra header dirs, `PATH`-style list |
    /// | `TRTBIND_LIBRARY_PATH` | extra library dirs, `PATH`-style list |
    /// | `TRTBIND_DEVICE` | device ordinal, default `0` |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(Platform::current()?, |key| std::env::var_os(key))
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source
    pub fn from_lookup(
        platform: Platform,
        lookup: impl Fn(&str) -> Option<OsString>,
    ) -> Result<Self> {
        let mut include_dirs = Vec::new();
        let mut library_dirs = Vec::new();

        if let Some(dir) = lookup("TENSORRT_DIR") {
            include_dirs.push(Path::new(&dir).join("include"));
            library_dirs.push(Path::new(&dir).join("lib"));
        }
        if let Some(dir) = lookup("CUDA_ROOT") {
            include_dirs.push(Path::new(&dir).join("include"));
            library_dirs.push(Path::new(&dir).join("lib64"));
        }
        if let Some(paths) = lookup("TRTBIND_INCLUDE_PATH") {
            include_dirs.extend(std::env::split_paths(&paths));
        }
        if let Some(paths) = lookup("TRTBIND_LIBRARY_PATH") {
            library_dirs.extend(std::env::split_paths(&paths));
        }

        let device_ordinal = match lookup("TRTBIND_DEVICE") {
            Some(value) => {
                let value = value.to_string_lossy();
                value.trim().parse::<i32>().map_err(|_| {
                    Error::InvalidArgument(format!("TRTBIND_DEVICE must be an integer, got `{}`", value))
                })?
            }
            None => 0,
        };

        include_dirs.extend(platform.default_include_dirs());
        library_dirs.extend(platform.default_library_dirs());

        Ok(ProbeConfig {
            platform,
            include_dirs,
            library_dirs,
            device_ordinal,
        })
    }

    pub fn with_include_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.include_dirs.push(dir.into());
        self
    }

    pub fn with_library_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.library_dirs.push(dir.into());
        self
    }

    pub fn with_device(mut self, ordinal: i32) -> Self {
        self.device_ordinal = ordinal;
        self
    }
}

/// Resolved locations of the SDK components
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkComponents {
    pub headers: BTreeMap<String, PathBuf>,
    pub libraries: BTreeMap<String, PathBuf>,
    /// Present when networks can be built from ONNX
    pub onnx_parser: Option<PathBuf>,
}

/// Proof that the platform was probed and a device selected
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    platform: Platform,
    ordinal: i32,
    components: Arc<SdkComponents>,
}

impl DeviceHandle {
    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn ordinal(&self) -> i32 {
        self.ordinal
    }

    pub fn components(&self) -> &SdkComponents {
        &self.components
    }

    pub fn has_onnx_parser(&self) -> bool {
        self.components.onnx_parser.is_some()
    }
}

/// Probe using [`ProbeConfig::from_env`]
pub fn probe() -> Result<DeviceHandle> {
    probe_with(&ProbeConfig::from_env()?)
}

/// Locate every required component, then select the configured device.
///
/// All missing components are reported together in one
/// [`Error::Environment`]; the device is only queried once the SDK is complete.
pub fn probe_with(config: &ProbeConfig) -> Result<DeviceHandle> {
    let mut missing = Vec::new();
    let mut headers = BTreeMap::new();
    let mut libraries = BTreeMap::new();

    for header in REQUIRED_HEADERS {
        match find_file(&config.include_dirs, |name| name == header) {
            Some(path) => {
                headers.insert(header.to_string(), path);
            }
            None => missing.push(header.to_string()),
        }
    }
    for lib in REQUIRED_LIBRARIES {
        match find_library(&config.library_dirs, lib) {
            Some(path) => {
                libraries.insert(lib.to_string(), path);
            }
            None => missing.push(format!("lib{}", lib)),
        }
    }

    if !missing.is_empty() {
        debug!(
            include_dirs = ?config.include_dirs,
            library_dirs = ?config.library_dirs,
            "SDK search failed"
        );
        return Err(Error::missing(missing));
    }

    let onnx_parser = if trtbind_sys::ONNX_PARSER_LINKED {
        find_library(&config.library_dirs, ONNX_PARSER_LIBRARY)
    } else {
        None
    };

    let count = cuda::device_count()?;
    if count <= 0 {
        return Err(Error::missing(vec!["CUDA device".to_string()]));
    }
    if config.device_ordinal < 0 || config.device_ordinal >= count {
        return Err(Error::missing(vec![format!(
            "CUDA device {} ({} visible)",
            config.device_ordinal, count
        )]));
    }
    cuda::set_device(config.device_ordinal)?;

    info!(
        platform = %config.platform,
        device = config.device_ordinal,
        onnx_parser = onnx_parser.is_some(),
        "platform probe succeeded"
    );

    Ok(DeviceHandle {
        platform: config.platform,
        ordinal: config.device_ordinal,
        components: Arc::new(SdkComponents {
            headers,
            libraries,
            onnx_parser,
        }),
    })
}

fn find_library(dirs: &[PathBuf], lib: &str) -> Option<PathBuf> {
    let prefix = format!("lib{}.so", lib);
    find_file(dirs, |name| name.starts_with(&prefix))
}

fn find_file(dirs: &[PathBuf], matches: impl Fn(&str) -> bool) -> Option<PathBuf> {
    dirs.iter().find_map(|dir| {
        std::fs::read_dir(dir).ok()?.flatten().find_map(|entry| {
            let name = entry.file_name();
            matches(name.to_str()?).then(|| entry.path())
        })
    })
}
