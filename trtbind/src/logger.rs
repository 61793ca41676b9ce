//! Logger interface for TensorRT
//!
//! The native library reports diagnostics through a callback. A [`Logger`]
//! owns the native logger object and forwards each message to a
//! [`LogHandler`]. The default handler, [`TracingLogHandler`], re-emits
//! messages as `tracing` events under the `trtbind::native` target, demoting
//! TensorRT's chatty info level to `debug`.

use crate::error::Result;
use std::ffi::{c_char, c_void, CStr};
use trtbind_sys::*;

/// Severity level for log messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum Severity {
    /// Internal error (most severe)
    InternalError = TRTB_SEVERITY_INTERNAL_ERROR,
    /// Error
    Error = TRTB_SEVERITY_ERROR,
    /// Warning
    Warning = TRTB_SEVERITY_WARNING,
    /// Info
    Info = TRTB_SEVERITY_INFO,
    /// Verbose (most detailed)
    Verbose = TRTB_SEVERITY_VERBOSE,
}

impl Severity {
    fn from_native(severity: i32) -> Self {
        match severity {
            TRTB_SEVERITY_INTERNAL_ERROR => Severity::InternalError,
            TRTB_SEVERITY_ERROR => Severity::Error,
            TRTB_SEVERITY_WARNING => Severity::Warning,
            TRTB_SEVERITY_INFO => Severity::Info,
            _ => Severity::Verbose,
        }
    }
}

/// Trait for handling log messages from TensorRT
pub trait LogHandler: Send + Sync {
    /// Called when TensorRT emits a log message
    fn log(&self, severity: Severity, message: &str);
}

/// Forwards native messages to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogHandler;

impl LogHandler for TracingLogHandler {
    fn log(&self, severity: Severity, message: &str) {
        match severity {
            Severity::InternalError | Severity::Error => {
                tracing::error!(target: "trtbind::native", "{}", message)
            }
            Severity::Warning => tracing::warn!(target: "trtbind::native", "{}", message),
            Severity::Info => tracing::debug!(target: "trtbind::native", "{}", message),
            Severity::Verbose => tracing::trace!(target: "trtbind::native", "{}", message),
        }
    }
}

/// Logger wrapper that interfaces with TensorRT
pub struct Logger {
    inner: *mut TrtbLogger,
    // The native logger holds a pointer into this box
    _handler: Box<Box<dyn LogHandler>>,
}

impl Logger {
    /// Create a new logger with a custom handler
    pub fn new<H: LogHandler + 'static>(handler: H) -> Result<Self> {
        let handler: Box<Box<dyn LogHandler>> = Box::new(Box::new(handler));
        let user_data = &*handler as *const Box<dyn LogHandler> as *mut c_void;

        let mut logger_ptr: *mut TrtbLogger = std::ptr::null_mut();
        let mut error_msg = [0 as c_char; 1024];

        let result = unsafe {
            trtb_logger_create(
                Some(Self::log_callback),
                user_data,
                &mut logger_ptr,
                error_msg.as_mut_ptr(),
                error_msg.len(),
            )
        };

        if result != TRTB_SUCCESS {
            return Err(crate::error::Error::from_ffi(result, &error_msg));
        }

        Ok(Logger {
            inner: logger_ptr,
            _handler: handler,
        })
    }

    /// Create a logger that forwards to `tracing`
    pub fn tracing() -> Result<Self> {
        Self::new(TracingLogHandler)
    }

    /// Get the raw pointer (for internal use)
    pub(crate) fn as_ptr(&self) -> *mut TrtbLogger {
        self.inner
    }

    /// C callback function that bridges to Rust trait
    unsafe extern "C" fn log_callback(user_data: *mut c_void, severity: i32, msg: *const c_char) {
        if user_data.is_null() || msg.is_null() {
            return;
        }

        let handler = &*(user_data as *const Box<dyn LogHandler>);
        let msg = CStr::from_ptr(msg).to_string_lossy();
        handler.log(Severity::from_native(severity), &msg);
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        if !self.inner.is_null() {
            unsafe {
                trtb_logger_destroy(self.inner);
            }
        }
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").field("inner", &self.inner).finish()
    }
}

// Logger must be Send and Sync to be used across threads
unsafe impl Send for Logger {}
unsafe impl Sync for Logger {}
