//! Runtime for deserializing and managing TensorRT engines

use crate::compiler::take_native_buffer;
use crate::error::{Error, Result};
use crate::logger::Logger;
use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::Arc;
use trtbind_sys::*;

/// Runtime for deserializing engines
pub(crate) struct Runtime {
    inner: *mut TrtbRuntime,
    _logger: Arc<Logger>,
}

impl Runtime {
    /// Create a new runtime
    pub(crate) fn new(logger: Arc<Logger>) -> Result<Self> {
        let mut runtime_ptr: *mut TrtbRuntime = std::ptr::null_mut();
        let mut error_msg = [0 as c_char; 1024];

        let result = unsafe {
            trtb_runtime_create(
                logger.as_ptr(),
                &mut runtime_ptr,
                error_msg.as_mut_ptr(),
                error_msg.len(),
            )
        };

        if result != TRTB_SUCCESS {
            return Err(Error::from_ffi(result, &error_msg));
        }

        Ok(Runtime {
            inner: runtime_ptr,
            _logger: logger,
        })
    }

    /// Deserialize a CUDA engine from a native plan
    ///
    /// The engine keeps the runtime alive.
    pub(crate) fn deserialize_cuda_engine(self: &Arc<Self>, data: &[u8]) -> Result<CudaEngine> {
        let mut engine_ptr: *mut TrtbCudaEngine = std::ptr::null_mut();
        let mut error_msg = [0 as c_char; 1024];

        let result = unsafe {
            trtb_runtime_deserialize_cuda_engine(
                self.inner,
                data.as_ptr() as *const c_void,
                data.len(),
                &mut engine_ptr,
                error_msg.as_mut_ptr(),
                error_msg.len(),
            )
        };

        if result != TRTB_SUCCESS {
            return Err(Error::from_ffi(result, &error_msg));
        }

        Ok(CudaEngine {
            inner: engine_ptr,
            _runtime: Arc::clone(self),
        })
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if !self.inner.is_null() {
            unsafe {
                trtb_runtime_destroy(self.inner);
            }
        }
    }
}

unsafe impl Send for Runtime {}
unsafe impl Sync for Runtime {}

/// A deserialized engine
pub(crate) struct CudaEngine {
    inner: *mut TrtbCudaEngine,
    // Destroyed after the engine
    _runtime: Arc<Runtime>,
}

impl CudaEngine {
    /// Get the number of I/O tensors
    pub(crate) fn get_nb_io_tensors(&self) -> Result<i32> {
        let mut count: i32 = 0;

        let result = unsafe { trtb_cuda_engine_get_nb_io_tensors(self.inner, &mut count) };

        if result != TRTB_SUCCESS {
            return Err(Error::from_ffi(result, &[]));
        }

        Ok(count)
    }

    /// Get the name of a tensor by index
    pub(crate) fn get_tensor_name(&self, index: i32) -> Result<String> {
        let mut name_ptr: *const c_char = std::ptr::null();
        let mut error_msg = [0 as c_char; 1024];

        let result = unsafe {
            trtb_cuda_engine_get_tensor_name(
                self.inner,
                index,
                &mut name_ptr,
                error_msg.as_mut_ptr(),
                error_msg.len(),
            )
        };

        if result != TRTB_SUCCESS {
            return Err(Error::from_ffi(result, &error_msg));
        }

        let name = unsafe { CStr::from_ptr(name_ptr) }.to_str()?.to_string();

        Ok(name)
    }

    /// Declared dimensions of a tensor; `-1` marks a dynamic dimension
    pub(crate) fn get_tensor_shape(&self, name: &str) -> Result<Vec<i64>> {
        let name_cstr = CString::new(name)?;
        let mut dims = [0i64; TRTB_MAX_DIMS as usize];
        let mut nb_dims: i32 = 0;
        let mut error_msg = [0 as c_char; 1024];

        let result = unsafe {
            trtb_cuda_engine_get_tensor_shape(
                self.inner,
                name_cstr.as_ptr(),
                dims.as_mut_ptr(),
                TRTB_MAX_DIMS,
                &mut nb_dims,
                error_msg.as_mut_ptr(),
                error_msg.len(),
            )
        };

        if result != TRTB_SUCCESS {
            return Err(Error::from_ffi(result, &error_msg));
        }

        let nb_dims = usize::try_from(nb_dims)
            .ok()
            .filter(|&n| n <= dims.len())
            .ok_or_else(|| {
                Error::Format(format!("tensor `{}` reports {} dimensions", name, nb_dims))
            })?;

        Ok(dims[..nb_dims].to_vec())
    }

    /// Native data type code of a tensor
    pub(crate) fn get_tensor_dtype(&self, name: &str) -> Result<i32> {
        let name_cstr = CString::new(name)?;
        let mut dtype: i32 = 0;
        let mut error_msg = [0 as c_char; 1024];

        let result = unsafe {
            trtb_cuda_engine_get_tensor_dtype(
                self.inner,
                name_cstr.as_ptr(),
                &mut dtype,
                error_msg.as_mut_ptr(),
                error_msg.len(),
            )
        };

        if result != TRTB_SUCCESS {
            return Err(Error::from_ffi(result, &error_msg));
        }

        Ok(dtype)
    }

    /// Native I/O mode of a tensor (`TRTB_TENSOR_IO_*`)
    pub(crate) fn get_tensor_io_mode(&self, name: &str) -> Result<i32> {
        let name_cstr = CString::new(name)?;
        let mut mode: i32 = TRTB_TENSOR_IO_NONE;
        let mut error_msg = [0 as c_char; 1024];

        let result = unsafe {
            trtb_cuda_engine_get_tensor_io_mode(
                self.inner,
                name_cstr.as_ptr(),
                &mut mode,
                error_msg.as_mut_ptr(),
                error_msg.len(),
            )
        };

        if result != TRTB_SUCCESS {
            return Err(Error::from_ffi(result, &error_msg));
        }

        Ok(mode)
    }

    /// Serialize the engine back to a native plan
    pub(crate) fn serialize(&self) -> Result<Vec<u8>> {
        let mut data_ptr: *mut c_void = std::ptr::null_mut();
        let mut size: usize = 0;
        let mut error_msg = [0 as c_char; 1024];

        let result = unsafe {
            trtb_cuda_engine_serialize(
                self.inner,
                &mut data_ptr,
                &mut size,
                error_msg.as_mut_ptr(),
                error_msg.len(),
            )
        };

        if result != TRTB_SUCCESS {
            return Err(Error::from_ffi(result, &error_msg));
        }

        Ok(unsafe { take_native_buffer(data_ptr, size) })
    }

    /// Create an execution context for inference
    ///
    /// The context must be dropped before this engine.
    pub(crate) fn create_execution_context(&self) -> Result<ExecutionContext> {
        let mut context_ptr: *mut TrtbExecutionContext = std::ptr::null_mut();
        let mut error_msg = [0 as c_char; 1024];

        let result = unsafe {
            trtb_cuda_engine_create_execution_context(
                self.inner,
                &mut context_ptr,
                error_msg.as_mut_ptr(),
                error_msg.len(),
            )
        };

        if result != TRTB_SUCCESS {
            return Err(Error::from_ffi(result, &error_msg));
        }

        Ok(ExecutionContext { inner: context_ptr })
    }
}

impl Drop for CudaEngine {
    fn drop(&mut self) {
        if !self.inner.is_null() {
            unsafe {
                trtb_cuda_engine_destroy(self.inner);
            }
        }
    }
}

unsafe impl Send for CudaEngine {}
unsafe impl Sync for CudaEngine {}

/// Execution context for running inference
pub(crate) struct ExecutionContext {
    inner: *mut TrtbExecutionContext,
}

impl ExecutionContext {
    /// Set the address of a tensor for input or output
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `data` points to valid CUDA device memory
    /// - The memory remains valid for the lifetime of inference
    /// - The memory is large enough for the tensor's size
    pub(crate) unsafe fn set_tensor_address(&mut self, name: &str, data: *mut c_void) -> Result<()> {
        let name_cstr = CString::new(name)?;
        let mut error_msg = [0 as c_char; 1024];

        let result = trtb_execution_context_set_tensor_address(
            self.inner,
            name_cstr.as_ptr(),
            data,
            error_msg.as_mut_ptr(),
            error_msg.len(),
        );

        if result != TRTB_SUCCESS {
            return Err(Error::from_ffi(result, &error_msg));
        }

        Ok(())
    }

    /// Install or clear (`callback == None`) the per-layer profiler
    ///
    /// # Safety
    ///
    /// `user_data` must stay valid until the profiler is cleared or the
    /// context is dropped.
    pub(crate) unsafe fn set_profiler(
        &mut self,
        callback: TrtbProfilerCallback,
        user_data: *mut c_void,
    ) -> Result<()> {
        let mut error_msg = [0 as c_char; 1024];

        let result = trtb_execution_context_set_profiler(
            self.inner,
            callback,
            user_data,
            error_msg.as_mut_ptr(),
            error_msg.len(),
        );

        if result != TRTB_SUCCESS {
            return Err(Error::from_ffi(result, &error_msg));
        }

        Ok(())
    }

    /// Enqueue inference work on a CUDA stream
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `cuda_stream` is a valid CUDA stream handle
    /// - All tensor addresses have been set
    /// - The bound memory outlives the queued work
    pub(crate) unsafe fn enqueue_v3(&mut self, cuda_stream: *mut c_void) -> Result<()> {
        let mut error_msg = [0 as c_char; 1024];

        let result = trtb_execution_context_enqueue_v3(
            self.inner,
            cuda_stream,
            error_msg.as_mut_ptr(),
            error_msg.len(),
        );

        if result != TRTB_SUCCESS {
            return Err(Error::from_ffi(result, &error_msg));
        }

        Ok(())
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if !self.inner.is_null() {
            unsafe {
                trtb_execution_context_destroy(self.inner);
            }
        }
    }
}

unsafe impl Send for ExecutionContext {}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;

    const PLAN: &[u8] = b"trtbind-mock-plan v1\ninput x float32 1,4\noutput y float32 2\n";

    #[test]
    fn test_engine_introspection() {
        let logger = Arc::new(Logger::tracing().unwrap());
        let runtime = Arc::new(Runtime::new(logger).unwrap());
        let engine = runtime.deserialize_cuda_engine(PLAN).unwrap();

        assert_eq!(engine.get_nb_io_tensors().unwrap(), 2);
        assert_eq!(engine.get_tensor_name(0).unwrap(), "x");
        assert_eq!(engine.get_tensor_shape("x").unwrap(), vec![1, 4]);
        assert_eq!(engine.get_tensor_io_mode("y").unwrap(), TRTB_TENSOR_IO_OUTPUT);
        assert_eq!(engine.get_tensor_io_mode("nope").unwrap(), TRTB_TENSOR_IO_NONE);
        assert!(matches!(
            engine.get_tensor_dtype("nope"),
            Err(Error::UnknownBinding(_))
        ));
    }

    #[test]
    fn test_engine_outlives_runtime_handle() {
        let logger = Arc::new(Logger::tracing().unwrap());
        let engine = {
            let runtime = Arc::new(Runtime::new(logger).unwrap());
            runtime.deserialize_cuda_engine(PLAN).unwrap()
        };
        assert_eq!(engine.serialize().unwrap(), PLAN);
    }

    #[test]
    fn test_rejected_plan_is_corruption() {
        let logger = Arc::new(Logger::tracing().unwrap());
        let runtime = Arc::new(Runtime::new(logger).unwrap());
        let err = runtime
            .deserialize_cuda_engine(b"not a plan")
            .err()
            .unwrap();
        assert!(matches!(err, Error::Corruption(_)));
    }
}
