//! Inference sessions
//!
//! A [`Session`] owns everything one caller needs to run an [`Engine`]: an
//! execution context, one device buffer per declared binding, host staging
//! tensors for outputs, and a private CUDA stream for blocking runs.
//!
//! ```text
//! Created --bind--> Bound --run/run_async--> Running --complete--> Bound
//!    \                 \                                            /
//!     `-----------------`---------------destroy--------------------'--> Destroyed
//! ```
//!
//! Every method on a destroyed session fails with [`Error::UseAfterFree`],
//! except the plain accessors [`Session::state`] (which then reports
//! [`SessionState::Destroyed`]) and [`Session::engine`].
//!
//! CUDA's current device is per host thread, so creating and running a
//! session first selects the engine's device on the calling thread.

use crate::cuda::{self, DeviceBuffer, Stream};
use crate::error::{Error, Result};
use crate::loader::Engine;
use crate::profile::{report_layer_time, Profile, ProfileRecorder};
use crate::runtime::ExecutionContext;
use crate::tensor::{describe, BindingSpec, HostTensor, TensorIo};
use parking_lot::Mutex;
use std::ffi::c_void;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tracing::{debug, error, warn};

/// Lifecycle state of a [`Session`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Bound,
    Running,
    Destroyed,
}

struct Slot {
    spec: BindingSpec,
    device: DeviceBuffer,
    // Outputs always hold a staging tensor
    host: Option<HostTensor>,
}

// Field order is drop order: the context goes before the memory it points at.
struct Resources {
    context: ExecutionContext,
    recorder: Box<ProfileRecorder>,
    slots: Vec<Slot>,
    stream: Stream,
}

/// Mutable execution state for one [`Engine`]
pub struct Session {
    state: SessionState,
    resources: Option<Resources>,
    engine: Engine,
}

impl Session {
    /// Allocate device memory for every binding of `engine`
    ///
    /// On failure nothing stays allocated.
    pub fn new(engine: &Engine) -> Result<Self> {
        cuda::set_device(engine.device().ordinal())?;
        let mut context = engine.native().create_execution_context()?;
        let stream = Stream::new()?;

        let mut slots = Vec::with_capacity(engine.bindings().len());
        for spec in engine.bindings() {
            let device = DeviceBuffer::new(spec.byte_size())?;
            unsafe {
                context.set_tensor_address(&spec.name, device.as_ptr())?;
            }
            let host = match spec.io {
                TensorIo::Input => None,
                TensorIo::Output => Some(HostTensor::zeros(spec.dtype, spec.shape.clone())),
            };
            slots.push(Slot {
                spec: spec.clone(),
                device,
                host,
            });
        }

        let device_bytes: usize = slots.iter().map(|s| s.device.size()).sum();
        debug!(bindings = slots.len(), device_bytes, "created session");

        Ok(Session {
            state: SessionState::Created,
            resources: Some(Resources {
                context,
                recorder: Box::default(),
                slots,
                stream,
            }),
            engine: engine.clone(),
        })
    }

    /// Current lifecycle state; valid after [`destroy`](Self::destroy)
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The engine this session executes; valid after [`destroy`](Self::destroy)
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Attach a host tensor to the binding `name`
    ///
    /// The tensor's dtype and shape must equal the engine's declaration.
    /// Binding an output supplies the tensor results are copied into.
    pub fn bind(&mut self, name: &str, tensor: HostTensor) -> Result<()> {
        let resources = self.live_mut("bind")?;
        let slot = resources
            .slots
            .iter_mut()
            .find(|s| s.spec.name == name)
            .ok_or_else(|| Error::UnknownBinding(name.to_string()))?;

        if !tensor.matches(&slot.spec) {
            return Err(Error::ShapeMismatch {
                name: name.to_string(),
                expected: describe(slot.spec.dtype, &slot.spec.shape),
                actual: tensor.describe(),
            });
        }

        slot.host = Some(tensor);
        self.state = SessionState::Bound;
        Ok(())
    }

    /// Whether a host tensor is attached to `name`
    pub fn is_bound(&self, name: &str) -> Result<bool> {
        let resources = self.live("is_bound")?;
        resources
            .slots
            .iter()
            .find(|s| s.spec.name == name)
            .map(|s| s.host.is_some())
            .ok_or_else(|| Error::UnknownBinding(name.to_string()))
    }

    /// Execute synchronously on the session's own stream
    pub fn run(&mut self) -> Result<()> {
        self.check_runnable("run")?;
        cuda::set_device(self.engine.device().ordinal())?;
        self.state = SessionState::Running;

        let result = match self.resources.as_mut() {
            Some(Resources {
                context,
                slots,
                stream,
                ..
            }) => enqueue(context, slots, stream).and_then(|()| stream.synchronize()),
            None => Err(Error::UseAfterFree("run")),
        };

        self.state = SessionState::Bound;
        result
    }

    /// Queue execution on `stream` and return a handle to await it
    ///
    /// The session stays mutably borrowed until the handle completes or is
    /// dropped; dropping an unfinished handle blocks until `stream` drains.
    pub fn run_async<'s>(&'s mut self, stream: &'s Stream) -> Result<PendingRun<'s>> {
        self.check_runnable("run_async")?;
        cuda::set_device(self.engine.device().ordinal())?;
        let resources = self.live_mut("run_async")?;
        enqueue(&mut resources.context, &mut resources.slots, stream)?;

        let completion = Arc::new(Completion::default());
        let user_data = Arc::into_raw(Arc::clone(&completion)) as *mut c_void;
        let launched = unsafe { stream.launch_host_func(Some(signal_completion), user_data) };
        if let Err(e) = launched {
            // The callback will never run, reclaim its reference
            drop(unsafe { Arc::from_raw(user_data as *const Completion) });
            drain(stream);
            return Err(e);
        }

        self.state = SessionState::Running;
        Ok(PendingRun {
            session: self,
            stream,
            completion,
            finished: false,
        })
    }

    /// Result tensor for `name`
    pub fn output(&self, name: &str) -> Result<&HostTensor> {
        let resources = self.live("output")?;
        let slot = resources
            .slots
            .iter()
            .find(|s| s.spec.name == name)
            .ok_or_else(|| Error::UnknownBinding(name.to_string()))?;
        slot.host.as_ref().ok_or_else(|| {
            Error::InvalidArgument(format!("binding `{}` has no host tensor", name))
        })
    }

    /// Move the result tensor for `name` out, leaving zeros in its place
    pub fn take_output(&mut self, name: &str) -> Result<HostTensor> {
        let resources = self.live_mut("take_output")?;
        let slot = resources
            .slots
            .iter_mut()
            .find(|s| s.spec.name == name)
            .ok_or_else(|| Error::UnknownBinding(name.to_string()))?;
        if slot.spec.is_input() {
            return Err(Error::InvalidArgument(format!(
                "binding `{}` is an input",
                name
            )));
        }
        let staged = HostTensor::zeros(slot.spec.dtype, slot.spec.shape.clone());
        Ok(slot.host.replace(staged).unwrap_or_else(|| {
            HostTensor::zeros(slot.spec.dtype, slot.spec.shape.clone())
        }))
    }

    /// Begin collecting per-layer timings for subsequent runs
    pub fn start_profiling(&mut self, name: &str, metadata: &str) -> Result<()> {
        let resources = self.live_mut("start_profiling")?;
        resources.recorder.start(name, metadata);
        let user_data = resources.recorder.as_user_data();
        // SAFETY: the recorder is boxed and outlives the context (field order).
        unsafe {
            resources
                .context
                .set_profiler(Some(report_layer_time), user_data)
        }
    }

    /// Stop collecting; the profile remains readable
    pub fn end_profiling(&mut self) -> Result<()> {
        let resources = self.live_mut("end_profiling")?;
        resources.recorder.end();
        unsafe { resources.context.set_profiler(None, std::ptr::null_mut()) }
    }

    /// Stop collecting and discard the profile
    pub fn disable_profiling(&mut self) -> Result<()> {
        let resources = self.live_mut("disable_profiling")?;
        resources.recorder.clear();
        unsafe { resources.context.set_profiler(None, std::ptr::null_mut()) }
    }

    /// Profile collected since the last `start_profiling`, if any
    pub fn read_profile(&self) -> Result<Option<Profile>> {
        Ok(self.live("read_profile")?.recorder.snapshot())
    }

    /// Release device memory and the execution context
    ///
    /// Every buffer is released even if one release fails; the first failure
    /// is returned.
    pub fn destroy(&mut self) -> Result<()> {
        let resources = self.resources.take().ok_or(Error::UseAfterFree("destroy"))?;
        self.state = SessionState::Destroyed;

        let Resources {
            context,
            recorder,
            slots,
            stream,
        } = resources;
        drop(context);
        drop(recorder);

        let mut first_error = None;
        for slot in slots {
            if let Err(e) = slot.device.free() {
                error!(binding = %slot.spec.name, error = %e, "failed to free binding memory");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = stream.destroy() {
            first_error.get_or_insert(e);
        }

        debug!("destroyed session");
        first_error.map_or(Ok(()), Err)
    }

    fn live(&self, op: &'static str) -> Result<&Resources> {
        self.resources.as_ref().ok_or(Error::UseAfterFree(op))
    }

    fn live_mut(&mut self, op: &'static str) -> Result<&mut Resources> {
        self.resources.as_mut().ok_or(Error::UseAfterFree(op))
    }

    fn check_runnable(&self, op: &'static str) -> Result<()> {
        let resources = self.live(op)?;
        let missing: Vec<String> = resources
            .slots
            .iter()
            .filter(|s| s.spec.is_input() && s.host.is_none())
            .map(|s| s.spec.name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(Error::IncompleteBinding { missing });
        }
        Ok(())
    }
}

/// Queue input copies, execution, and output copies on `stream`.
///
/// On failure the stream is drained so no queued copy outlives the call.
fn enqueue(context: &mut ExecutionContext, slots: &mut [Slot], stream: &Stream) -> Result<()> {
    let result = enqueue_work(context, slots, stream);
    if result.is_err() {
        drain(stream);
    }
    result
}

fn enqueue_work(context: &mut ExecutionContext, slots: &mut [Slot], stream: &Stream) -> Result<()> {
    for slot in slots.iter_mut().filter(|s| s.spec.is_input()) {
        let host = slot.host.as_ref().ok_or_else(|| Error::IncompleteBinding {
            missing: vec![slot.spec.name.clone()],
        })?;
        // SAFETY: host tensors are only replaced through `&mut Session`,
        // which stays borrowed until the stream has drained.
        unsafe { slot.device.copy_from_host_async(host.as_bytes(), stream)? };
    }

    unsafe { context.enqueue_v3(stream.as_ptr())? };

    for slot in slots.iter_mut().filter(|s| !s.spec.is_input()) {
        if let Some(host) = slot.host.as_mut() {
            unsafe { slot.device.copy_to_host_async(host.as_bytes_mut(), stream)? };
        }
    }
    Ok(())
}

fn drain(stream: &Stream) {
    if let Err(e) = stream.synchronize() {
        error!(error = %e, "failed to synchronize stream");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.resources.is_some() {
            if let Err(e) = self.destroy() {
                warn!(error = %e, "error releasing session");
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Completion {
    done: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

/// Host callback queued behind a run; `user_data` is an `Arc<Completion>`
unsafe extern "C" fn signal_completion(user_data: *mut c_void) {
    if user_data.is_null() {
        return;
    }
    let completion = Arc::from_raw(user_data as *const Completion);
    completion.done.store(true, Ordering::Release);
    let waker = completion.waker.lock().take();
    if let Some(waker) = waker {
        waker.wake();
    }
}

/// An in-flight [`Session::run_async`]
///
/// Resolve it by `.await`, [`wait`](Self::wait), or polling
/// [`is_complete`](Self::is_complete).
#[must_use = "dropping a PendingRun blocks until the stream drains"]
pub struct PendingRun<'s> {
    session: &'s mut Session,
    stream: &'s Stream,
    completion: Arc<Completion>,
    finished: bool,
}

impl PendingRun<'_> {
    /// Whether the queued work has finished
    pub fn is_complete(&self) -> Result<bool> {
        if self.finished || self.completion.done.load(Ordering::Acquire) {
            return Ok(true);
        }
        self.stream.is_idle()
    }

    /// Block until the run finishes
    pub fn wait(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let result = self.stream.synchronize();
        self.session.state = SessionState::Bound;
        result
    }
}

impl Future for PendingRun<'_> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.finished || this.completion.done.load(Ordering::Acquire) {
            return Poll::Ready(this.finish());
        }

        *this.completion.waker.lock() = Some(cx.waker().clone());

        // The callback may have fired before the waker was stored
        if this.completion.done.load(Ordering::Acquire) {
            return Poll::Ready(this.finish());
        }
        Poll::Pending
    }
}

impl Drop for PendingRun<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.finish() {
                warn!(error = %e, "abandoned run finished with an error");
            }
        }
    }
}

impl fmt::Debug for PendingRun<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRun")
            .field("finished", &self.finished)
            .field("signalled", &self.completion.done.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::probe::{DeviceHandle, Platform, ProbeConfig};
    use crate::loader::{EngineLoader, LoaderConfig};
    use crate::tensor::DataType;

    fn device() -> DeviceHandle {
        let root = tempfile::tempdir().unwrap();
        for file in [
            "include/NvInfer.h",
            "include/cuda_runtime_api.h",
            "lib/libnvinfer.so",
            "lib/libcudart.so",
            "lib/libnvonnxparser.so",
        ] {
            let path = root.path().join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"").unwrap();
        }
        let config = ProbeConfig::empty(Platform::current().unwrap())
            .with_include_dir(root.path().join("include"))
            .with_library_dir(root.path().join("lib"));
        crate::probe::probe_with(&config).unwrap()
    }

    fn engine() -> Engine {
        let loader = EngineLoader::new(&device(), LoaderConfig::default()).unwrap();
        loader
            .build_from_onnx(b"trtbind-mock-network v1\ninput a float32 2\ninput b int32 1\noutput y float32 3\n")
            .unwrap()
    }

    #[test]
    fn test_state_transitions() {
        let engine = engine();
        let mut session = Session::new(&engine).unwrap();
        assert_eq!(session.state(), SessionState::Created);

        session
            .bind("a", HostTensor::from_f32(vec![2], &[1.0, 2.0]).unwrap())
            .unwrap();
        assert_eq!(session.state(), SessionState::Bound);

        let err = session.run().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Incomplete binding: inputs not bound: b"
        );

        session
            .bind("b", HostTensor::from_i32(vec![1], &[4]).unwrap())
            .unwrap();
        session.run().unwrap();
        assert_eq!(session.state(), SessionState::Bound);
        assert_eq!(
            session.output("y").unwrap().to_f32_vec().unwrap(),
            vec![7.0, 8.0, 9.0]
        );

        session.destroy().unwrap();
        assert_eq!(session.state(), SessionState::Destroyed);
        assert_eq!(session.engine().bindings().len(), 3);
        assert!(matches!(session.run(), Err(Error::UseAfterFree("run"))));
    }

    #[test]
    fn test_take_output_restages() {
        let engine = engine();
        let mut session = Session::new(&engine).unwrap();
        let out = session.take_output("y").unwrap();
        assert_eq!(out.dtype(), DataType::Float32);
        assert!(session.output("y").is_ok());
        assert!(matches!(
            session.take_output("a"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            session.take_output("z"),
            Err(Error::UnknownBinding(_))
        ));
    }

    #[test]
    fn test_pending_run_wait() {
        let engine = engine();
        let mut session = Session::new(&engine).unwrap();
        session
            .bind("a", HostTensor::from_f32(vec![2], &[0.5, 0.5]).unwrap())
            .unwrap();
        session
            .bind("b", HostTensor::from_i32(vec![1], &[0]).unwrap())
            .unwrap();

        let stream = Stream::new().unwrap();
        let pending = session.run_async(&stream).unwrap();
        assert!(pending.is_complete().unwrap());
        pending.wait().unwrap();

        assert_eq!(session.state(), SessionState::Bound);
        assert_eq!(
            session.output("y").unwrap().to_f32_vec().unwrap(),
            vec![1.0, 2.0, 3.0]
        );
    }
}
