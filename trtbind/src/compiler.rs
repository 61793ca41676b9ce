//! Network compilation for the loader's slow path
//!
//! An ONNX description is parsed into a fresh network definition and compiled
//! into a serialized plan. The native builder objects never leave this module.

use crate::error::{Error, Result};
use crate::logger::Logger;
use std::ffi::{c_char, c_void};
use trtbind_sys::*;

/// `NetworkDefinitionCreationFlag::kEXPLICIT_BATCH`
const EXPLICIT_BATCH: u32 = 1;
/// `MemoryPoolType::kWORKSPACE`
const WORKSPACE_POOL: i32 = 0;

/// A native object released by its `trtb_*_destroy` function
struct Owned<T> {
    ptr: *mut T,
    destroy: unsafe extern "C" fn(*mut T),
}

impl<T> Drop for Owned<T> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { (self.destroy)(self.ptr) }
        }
    }
}

fn check(call: impl FnOnce(*mut c_char, usize) -> i32) -> Result<()> {
    let mut error_msg = [0 as c_char; 1024];
    let result = call(error_msg.as_mut_ptr(), error_msg.len());
    if result != TRTB_SUCCESS {
        return Err(Error::from_ffi(result, &error_msg));
    }
    Ok(())
}

fn create<T>(
    destroy: unsafe extern "C" fn(*mut T),
    call: impl FnOnce(*mut *mut T, *mut c_char, usize) -> i32,
) -> Result<Owned<T>> {
    let mut ptr: *mut T = std::ptr::null_mut();
    check(|msg, len| call(&mut ptr as *mut *mut T, msg, len))?;
    Ok(Owned { ptr, destroy })
}

/// Parse `description` and compile it into a serialized plan
///
/// Unparseable input is [`Error::Format`]; a network the builder rejects is
/// [`Error::Runtime`]. `workspace_size` caps the builder's scratch memory.
pub(crate) fn compile_network(
    logger: &Logger,
    description: &[u8],
    workspace_size: usize,
) -> Result<Vec<u8>> {
    let builder = create(trtb_builder_destroy, |out, msg, len| unsafe {
        trtb_builder_create(logger.as_ptr(), out, msg, len)
    })?;
    let network = create(trtb_network_destroy, |out, msg, len| unsafe {
        trtb_builder_create_network(builder.ptr, EXPLICIT_BATCH, out, msg, len)
    })?;

    // The parser must be gone before the network is compiled
    {
        let parser = create(trtb_onnx_parser_destroy, |out, msg, len| unsafe {
            trtb_onnx_parser_create(network.ptr, logger.as_ptr(), out, msg, len)
        })?;
        check(|msg, len| unsafe {
            trtb_onnx_parser_parse(
                parser.ptr,
                description.as_ptr() as *const c_void,
                description.len(),
                msg,
                len,
            )
        })?;
    }

    let config = create(trtb_builder_config_destroy, |out, msg, len| unsafe {
        trtb_builder_create_builder_config(builder.ptr, out, msg, len)
    })?;
    check(|msg, len| unsafe {
        trtb_builder_config_set_memory_pool_limit(config.ptr, WORKSPACE_POOL, workspace_size, msg, len)
    })?;

    let mut data: *mut c_void = std::ptr::null_mut();
    let mut size: usize = 0;
    check(|msg, len| unsafe {
        trtb_builder_build_serialized_network(
            builder.ptr,
            network.ptr,
            config.ptr,
            &mut data,
            &mut size,
            msg,
            len,
        )
    })?;

    Ok(unsafe { take_native_buffer(data, size) })
}

/// Copy a buffer returned by the shim into a `Vec` and free it.
///
/// # Safety
/// `data` must be null or a buffer of at least `size` bytes allocated by the shim.
pub(crate) unsafe fn take_native_buffer(data: *mut c_void, size: usize) -> Vec<u8> {
    if data.is_null() {
        return Vec::new();
    }
    let vec = std::slice::from_raw_parts(data as *const u8, size).to_vec();
    trtb_free_buffer(data);
    vec
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::logger::{LogHandler, Severity};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<String>>>);

    impl LogHandler for Captured {
        fn log(&self, _severity: Severity, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    #[test]
    fn test_compile_produces_a_plan() {
        let logger = Logger::tracing().unwrap();
        let plan = compile_network(
            &logger,
            b"trtbind-mock-network v1\ninput x float32 4\noutput y float32 4\n",
            1 << 20,
        )
        .unwrap();
        assert!(!plan.is_empty());
    }

    #[test]
    fn test_workspace_limit_reaches_the_builder() {
        let captured = Captured::default();
        let logger = Logger::new(captured.clone()).unwrap();
        compile_network(
            &logger,
            b"trtbind-mock-network v1\ninput x float32 4\noutput y float32 4\n",
            4096,
        )
        .unwrap();

        let messages = captured.0.lock().unwrap();
        assert!(messages
            .iter()
            .any(|m| m.contains("workspace limit 4096 bytes")));
    }

    #[test]
    fn test_network_without_output_is_rejected() {
        let logger = Logger::tracing().unwrap();
        let err = compile_network(&logger, b"trtbind-mock-network v1\ninput x float32 4\n", 1 << 20)
            .unwrap_err();
        assert!(matches!(err, Error::Runtime(_)), "got {:?}", err);
    }

    #[test]
    fn test_garbage_is_a_format_error() {
        let logger = Logger::tracing().unwrap();
        let err = compile_network(&logger, &[0xde, 0xad, 0xbe, 0xef], 1 << 20).unwrap_err();
        assert!(matches!(err, Error::Format(_)), "got {:?}", err);
    }
}
