//! CUDA memory and stream management

use crate::error::{Error, Result};
use std::ffi::{c_char, c_void};
use trtbind_sys::*;

/// RAII wrapper for CUDA device memory
pub struct DeviceBuffer {
    ptr: *mut c_void,
    size: usize,
}

impl DeviceBuffer {
    /// Allocate CUDA device memory
    ///
    /// Allocation failure is reported as [`Error::OutOfMemory`].
    pub fn new(size: usize) -> Result<Self> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        let mut error_msg = [0 as c_char; 1024];

        let result =
            unsafe { trtb_cuda_malloc(&mut ptr, size, error_msg.as_mut_ptr(), error_msg.len()) };

        if result != TRTB_SUCCESS {
            return Err(Error::from_ffi(result, &error_msg));
        }

        Ok(DeviceBuffer { ptr, size })
    }

    /// Get the raw device pointer
    pub fn as_ptr(&self) -> *mut c_void {
        self.ptr
    }

    /// Get the size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy data from host to device
    pub fn copy_from_host(&mut self, data: &[u8]) -> Result<()> {
        self.check_len(data.len())?;
        let mut error_msg = [0 as c_char; 1024];

        let result = unsafe {
            trtb_cuda_memcpy_host_to_device(
                self.ptr,
                data.as_ptr() as *const c_void,
                data.len(),
                error_msg.as_mut_ptr(),
                error_msg.len(),
            )
        };

        if result != TRTB_SUCCESS {
            return Err(Error::from_ffi(result, &error_msg));
        }

        Ok(())
    }

    /// Copy data from device to host
    pub fn copy_to_host(&self, data: &mut [u8]) -> Result<()> {
        self.check_len(data.len())?;
        let mut error_msg = [0 as c_char; 1024];

        let result = unsafe {
            trtb_cuda_memcpy_device_to_host(
                data.as_mut_ptr() as *mut c_void,
                self.ptr,
                data.len(),
                error_msg.as_mut_ptr(),
                error_msg.len(),
            )
        };

        if result != TRTB_SUCCESS {
            return Err(Error::from_ffi(result, &error_msg));
        }

        Ok(())
    }

    /// Queue a host to device copy on `stream`
    ///
    /// # Safety
    ///
    /// `data` must stay alive and unmodified until `stream` has drained.
    pub unsafe fn copy_from_host_async(&mut self, data: &[u8], stream: &Stream) -> Result<()> {
        self.check_len(data.len())?;
        let mut error_msg = [0 as c_char; 1024];

        let result = trtb_cuda_memcpy_host_to_device_async(
            self.ptr,
            data.as_ptr() as *const c_void,
            data.len(),
            stream.as_ptr(),
            error_msg.as_mut_ptr(),
            error_msg.len(),
        );

        if result != TRTB_SUCCESS {
            return Err(Error::from_ffi(result, &error_msg));
        }

        Ok(())
    }

    /// Queue a device to host copy on `stream`
    ///
    /// # Safety
    ///
    /// `data` must stay alive and must not be read until `stream` has drained.
    pub unsafe fn copy_to_host_async(&self, data: &mut [u8], stream: &Stream) -> Result<()> {
        self.check_len(data.len())?;
        let mut error_msg = [0 as c_char; 1024];

        let result = trtb_cuda_memcpy_device_to_host_async(
            data.as_mut_ptr() as *mut c_void,
            self.ptr,
            data.len(),
            stream.as_ptr(),
            error_msg.as_mut_ptr(),
            error_msg.len(),
        );

        if result != TRTB_SUCCESS {
            return Err(Error::from_ffi(result, &error_msg));
        }

        Ok(())
    }

    /// Release the allocation, reporting a failed free instead of ignoring it
    pub fn free(mut self) -> Result<()> {
        let ptr = std::mem::replace(&mut self.ptr, std::ptr::null_mut());
        let mut error_msg = [0 as c_char; 1024];

        let result = unsafe { trtb_cuda_free(ptr, error_msg.as_mut_ptr(), error_msg.len()) };

        if result != TRTB_SUCCESS {
            return Err(Error::from_ffi(result, &error_msg));
        }

        Ok(())
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len > self.size {
            return Err(Error::InvalidArgument(format!(
                "data size {} exceeds buffer size {}",
                len, self.size
            )));
        }
        Ok(())
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            let mut error_msg = [0 as c_char; 1024];
            let result =
                unsafe { trtb_cuda_free(self.ptr, error_msg.as_mut_ptr(), error_msg.len()) };
            if result != TRTB_SUCCESS {
                tracing::warn!(
                    error = %Error::from_ffi(result, &error_msg),
                    "failed to free device buffer"
                );
            }
        }
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .finish()
    }
}

unsafe impl Send for DeviceBuffer {}

/// RAII wrapper for a CUDA stream
pub struct Stream {
    inner: *mut c_void,
}

impl Stream {
    /// Create a new stream on the current device
    pub fn new() -> Result<Self> {
        let mut stream_ptr: *mut c_void = std::ptr::null_mut();
        let mut error_msg = [0 as c_char; 1024];

        let result = unsafe {
            trtb_cuda_stream_create(&mut stream_ptr, error_msg.as_mut_ptr(), error_msg.len())
        };

        if result != TRTB_SUCCESS {
            return Err(Error::from_ffi(result, &error_msg));
        }

        Ok(Stream { inner: stream_ptr })
    }

    /// Block until all work queued on this stream has finished
    pub fn synchronize(&self) -> Result<()> {
        let mut error_msg = [0 as c_char; 1024];

        let result = unsafe {
            trtb_cuda_stream_synchronize(self.inner, error_msg.as_mut_ptr(), error_msg.len())
        };

        if result != TRTB_SUCCESS {
            return Err(Error::from_ffi(result, &error_msg));
        }

        Ok(())
    }

    /// Whether all queued work has finished, without blocking
    pub fn is_idle(&self) -> Result<bool> {
        let mut error_msg = [0 as c_char; 1024];

        let result =
            unsafe { trtb_cuda_stream_query(self.inner, error_msg.as_mut_ptr(), error_msg.len()) };

        match result {
            TRTB_SUCCESS => Ok(true),
            TRTB_ERROR_NOT_READY => Ok(false),
            code => Err(Error::from_ffi(code, &error_msg)),
        }
    }

    /// Queue `callback(user_data)` to run on a driver thread once prior work
    /// on this stream completes.
    ///
    /// # Safety
    ///
    /// `user_data` must remain valid until the callback has run, and the
    /// callback must not call back into CUDA.
    pub(crate) unsafe fn launch_host_func(
        &self,
        callback: TrtbHostCallback,
        user_data: *mut c_void,
    ) -> Result<()> {
        let mut error_msg = [0 as c_char; 1024];

        let result = trtb_cuda_launch_host_func(
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

    /// Destroy the stream, reporting a failure instead of ignoring it
    pub fn destroy(mut self) -> Result<()> {
        let inner = std::mem::replace(&mut self.inner, std::ptr::null_mut());
        let mut error_msg = [0 as c_char; 1024];

        let result =
            unsafe { trtb_cuda_stream_destroy(inner, error_msg.as_mut_ptr(), error_msg.len()) };

        if result != TRTB_SUCCESS {
            return Err(Error::from_ffi(result, &error_msg));
        }

        Ok(())
    }

    /// Get the raw stream handle
    pub fn as_ptr(&self) -> *mut c_void {
        self.inner
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.inner.is_null() {
            let mut error_msg = [0 as c_char; 1024];
            let result = unsafe {
                trtb_cuda_stream_destroy(self.inner, error_msg.as_mut_ptr(), error_msg.len())
            };
            if result != TRTB_SUCCESS {
                tracing::warn!(
                    error = %Error::from_ffi(result, &error_msg),
                    "failed to destroy CUDA stream"
                );
            }
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("inner", &self.inner).finish()
    }
}

// CUDA streams may be used from any host thread
unsafe impl Send for Stream {}
unsafe impl Sync for Stream {}

/// Synchronize CUDA device
pub fn synchronize() -> Result<()> {
    let mut error_msg = [0 as c_char; 1024];

    let result = unsafe { trtb_cuda_synchronize(error_msg.as_mut_ptr(), error_msg.len()) };

    if result != TRTB_SUCCESS {
        return Err(Error::from_ffi(result, &error_msg));
    }

    Ok(())
}

/// Number of CUDA devices visible to this process
pub fn device_count() -> Result<i32> {
    let mut count: i32 = 0;
    let mut error_msg = [0 as c_char; 1024];

    let result =
        unsafe { trtb_cuda_get_device_count(&mut count, error_msg.as_mut_ptr(), error_msg.len()) };

    if result != TRTB_SUCCESS {
        return Err(Error::from_ffi(result, &error_msg));
    }

    Ok(count)
}

/// Make `ordinal` the current device for the calling thread
pub fn set_device(ordinal: i32) -> Result<()> {
    let mut error_msg = [0 as c_char; 1024];

    let result = unsafe { trtb_cuda_set_device(ordinal, error_msg.as_mut_ptr(), error_msg.len()) };

    if result != TRTB_SUCCESS {
        return Err(Error::from_ffi(result, &error_msg));
    }

    Ok(())
}
