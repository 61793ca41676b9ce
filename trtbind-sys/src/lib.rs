//! Raw FFI bindings to NVIDIA TensorRT and the CUDA runtime
//!
//! This crate provides low-level, unsafe bindings to the C shim in `wrapper.hpp`,
//! which wraps the TensorRT C++ API and the parts of the CUDA runtime needed to
//! drive an inference session. For a safe API, use the `trtbind` crate instead.
//!
//! Every fallible function returns an `i32` status (`TRTB_SUCCESS` or one of the
//! `TRTB_ERROR_*` codes) and writes a NUL-terminated message into the caller's
//! error buffer.
//!
//! With the `mock` feature the native shim is replaced by an in-process
//! simulation exposing the same functions, so dependent crates build and test
//! without TensorRT or a GPU.
//!
//! # Safety
//!
//! All functions in this crate are `unsafe` as they directly call into C++ code
//! and perform no safety checks. Callers must ensure:
//!
//! - Pointers are valid and properly aligned
//! - Lifetimes are managed correctly
//! - Thread safety requirements are met
//! - CUDA context is properly initialized

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

// Include the generated bindings
#[cfg(not(feature = "mock"))]
include!(concat!(env!("OUT_DIR"), "/bindings.rs"));

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::*;

/// Whether the `trtb_onnx_parser_*` functions are backed by `libnvonnxparser`.
///
/// When the parser was not found at build time they fail with
/// `TRTB_ERROR_RUNTIME_ERROR`.
pub const ONNX_PARSER_LINKED: bool = cfg!(any(feature = "mock", trtb_onnx_parser));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        // Verify error codes are defined
        assert_eq!(TRTB_SUCCESS, 0);
        assert_ne!(TRTB_ERROR_INVALID_ARGUMENT, TRTB_SUCCESS);
        assert_ne!(TRTB_ERROR_NOT_READY, TRTB_SUCCESS);
    }
}
