//! Safe Rust bindings to NVIDIA TensorRT
//!
//! This crate ties a host program to the TensorRT inference library and the
//! CUDA runtime on Linux (x86_64 and aarch64). It locates the SDK, loads or
//! builds engines, and runs inference sessions with named tensor bindings.
//!
//! # Workflow
//!
//! 1. [`probe`] the platform to get a [`DeviceHandle`]
//! 2. Create an [`EngineLoader`] and load an [`Engine`], either from an
//!    engine artifact (fast) or an ONNX network description (builds first)
//! 3. Create a [`Session`], [`bind`](Session::bind) every input
//! 4. [`run`](Session::run) or [`run_async`](Session::run_async), then read
//!    outputs
//!
//! # Example
//!
//! ```rust,no_run
//! use trtbind::{probe, EngineLoader, HostTensor, LoaderConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = probe()?;
//! let loader = EngineLoader::new(&device, LoaderConfig::default())?;
//! let engine = loader.load_file("resnet50.engine")?;
//!
//! let mut session = engine.create_session()?;
//! let input = HostTensor::from_f32(vec![1, 3, 224, 224], &vec![0.0; 150_528])?;
//! session.bind("input", input)?;
//! session.run()?;
//!
//! let scores = session.output("output")?;
//! let top5 = trtbind::classify(scores, 5)?;
//! println!("{:?}", top5[0]);
//! # Ok(())
//! # }
//! ```
//!
//! # Native messages
//!
//! TensorRT diagnostics are forwarded to `tracing` by default (see
//! [`TracingLogHandler`]). Supply a custom [`LogHandler`] through
//! [`EngineLoader::with_logger`].
//!
//! # Features
//!
//! - `mock`: replace the native SDK with an in-process simulation, for
//!   development and tests on machines without TensorRT or a GPU
//!   (`cargo test --features mock`).

mod compiler;
pub mod cuda;
pub mod error;
pub mod executor;
pub mod format;
pub mod loader;
pub mod logger;
pub mod probe;
pub mod profile;
mod runtime;
pub mod session;
pub mod tensor;

// Re-export commonly used types
pub use cuda::{synchronize, DeviceBuffer, Stream};
pub use error::{Error, ErrorClass, Result};
pub use executor::{classify, execute, execute_zeroed, Prediction, TensorInput, TensorOutput};
pub use loader::{Engine, EngineLoader, LoaderConfig};
pub use logger::{LogHandler, Logger, Severity, TracingLogHandler};
pub use probe::{probe, probe_with, DeviceHandle, Platform, ProbeConfig};
pub use profile::{Profile, ProfileEntry};
pub use session::{PendingRun, Session, SessionState};
pub use tensor::{BindingSpec, DataType, HostTensor, TensorIo};
