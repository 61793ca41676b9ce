//! Error types for binding operations

use std::ffi::{c_char, NulError};
use thiserror::Error;
use trtbind_sys::*;

/// Result type for binding operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when probing, loading engines, or running sessions
#[derive(Debug, Error)]
pub enum Error {
    /// A required native component (header, library, device) is missing
    #[error("Environment error: {message}")]
    Environment {
        /// Names of the missing components
        missing: Vec<String>,
        message: String,
    },

    /// Engine artifact or network description is not in a recognized format
    #[error("Format error: {0}")]
    Format(String),

    /// Engine artifact failed a structural or checksum check
    #[error("Corrupted engine artifact: {0}")]
    Corruption(String),

    /// Device allocation failed
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Host tensor disagrees with the engine's declaration for a binding
    #[error("Shape mismatch for binding `{name}`: expected {expected}, got {actual}")]
    ShapeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// The engine declares no binding with this name
    #[error("Unknown binding: {0}")]
    UnknownBinding(String),

    /// `run` was called before every input was bound
    #[error("Incomplete binding: inputs not bound: {}", .missing.join(", "))]
    IncompleteBinding { missing: Vec<String> },

    /// A session method was called after `destroy`
    #[error("Use after free: `{0}` called on a destroyed session")]
    UseAfterFree(&'static str),

    /// Invalid argument provided to function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Runtime error from TensorRT
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// CUDA error
    #[error("CUDA error: {0}")]
    Cuda(String),

    /// Unrecognized native status
    #[error("Unknown error (status {code}): {message}")]
    Unknown { code: i32, message: String },

    /// String conversion error
    #[error("String conversion error: {0}")]
    StringConversion(#[from] NulError),

    /// UTF-8 conversion error
    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a caller is expected to react to an error.
///
/// The binding itself never retries; this only classifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Missing dependency or native failure; not retryable
    Fatal,
    /// Bad engine artifact; retry with a different one
    BadArtifact,
    /// Device memory exhausted; retry after releasing other sessions
    ResourceExhausted,
    /// Programming error in the caller
    Usage,
    /// Session lifecycle violated
    Lifecycle,
}

impl Error {
    /// Create error from FFI error code and message buffer
    pub(crate) fn from_ffi(code: i32, error_msg: &[c_char]) -> Self {
        let msg = Self::parse_error_msg(error_msg);

        match code {
            TRTB_ERROR_INVALID_ARGUMENT => Error::InvalidArgument(msg),
            TRTB_ERROR_OUT_OF_MEMORY => Error::OutOfMemory(msg),
            TRTB_ERROR_RUNTIME_ERROR => Error::Runtime(msg),
            TRTB_ERROR_CUDA_ERROR => Error::Cuda(msg),
            TRTB_ERROR_NO_DEVICE => Error::Environment {
                missing: vec!["CUDA device".to_string()],
                message: msg,
            },
            TRTB_ERROR_FORMAT => Error::Format(msg),
            TRTB_ERROR_CORRUPTED => Error::Corruption(msg),
            TRTB_ERROR_UNKNOWN_TENSOR => Error::UnknownBinding(msg),
            code => Error::Unknown { code, message: msg },
        }
    }

    /// Environment error listing every missing component
    pub(crate) fn missing(missing: Vec<String>) -> Self {
        let message = format!("missing components: {}", missing.join(", "));
        Error::Environment { missing, message }
    }

    /// Native status code corresponding to this error
    pub fn code(&self) -> i32 {
        match self {
            Error::Environment { .. } => TRTB_ERROR_NO_DEVICE,
            Error::Format(_) => TRTB_ERROR_FORMAT,
            Error::Corruption(_) => TRTB_ERROR_CORRUPTED,
            Error::OutOfMemory(_) => TRTB_ERROR_OUT_OF_MEMORY,
            Error::UnknownBinding(_) => TRTB_ERROR_UNKNOWN_TENSOR,
            Error::ShapeMismatch { .. }
            | Error::IncompleteBinding { .. }
            | Error::UseAfterFree(_)
            | Error::InvalidArgument(_)
            | Error::StringConversion(_)
            | Error::Utf8(_) => TRTB_ERROR_INVALID_ARGUMENT,
            Error::Runtime(_) => TRTB_ERROR_RUNTIME_ERROR,
            Error::Cuda(_) => TRTB_ERROR_CUDA_ERROR,
            Error::Unknown { code, .. } => *code,
            Error::Json(_) | Error::Io(_) => TRTB_ERROR_UNKNOWN,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Format(_) | Error::Corruption(_) => ErrorClass::BadArtifact,
            Error::OutOfMemory(_) => ErrorClass::ResourceExhausted,
            Error::ShapeMismatch { .. }
            | Error::UnknownBinding(_)
            | Error::IncompleteBinding { .. }
            | Error::InvalidArgument(_)
            | Error::StringConversion(_)
            | Error::Utf8(_) => ErrorClass::Usage,
            Error::UseAfterFree(_) => ErrorClass::Lifecycle,
            Error::Environment { .. }
            | Error::Runtime(_)
            | Error::Cuda(_)
            | Error::Unknown { .. }
            | Error::Json(_)
            | Error::Io(_) => ErrorClass::Fatal,
        }
    }

    /// Parse error message from C string buffer
    fn parse_error_msg(buffer: &[c_char]) -> String {
        // Find null terminator
        let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());

        // c_char is i8 on x86_64 and u8 on aarch64
        let bytes: Vec<u8> = buffer[..len].iter().map(|&c| c as u8).collect();

        String::from_utf8_lossy(&bytes).into_owned()
    }
}
