//! Per-layer execution profiles

use crate::error::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ffi::{c_char, c_void, CStr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Timing of one layer
///
/// Layers are laid end to end: each entry starts where the previous one
/// finished, measured from the start of the profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub layer: String,
    pub start_ns: u64,
    pub duration_ns: u64,
}

/// A named profile covering one or more runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub metadata: String,
    /// Wall clock start, nanoseconds since the Unix epoch
    pub started_at_ns: u64,
    pub ended_at_ns: Option<u64>,
    pub entries: Vec<ProfileEntry>,
}

impl Profile {
    fn new(name: &str, metadata: &str) -> Self {
        Profile {
            name: name.to_string(),
            metadata: metadata.to_string(),
            started_at_ns: now_ns(),
            ended_at_ns: None,
            entries: Vec::new(),
        }
    }

    /// Sum of all layer durations
    pub fn total_duration(&self) -> Duration {
        Duration::from_nanos(self.entries.iter().map(|e| e.duration_ns).sum())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Default)]
struct RecorderState {
    profile: Option<Profile>,
    active: bool,
    cursor_ns: u64,
}

/// Collects layer timings reported by the native profiler.
///
/// Reports may arrive on a driver thread while a run is in flight.
#[derive(Debug, Default)]
pub(crate) struct ProfileRecorder {
    state: Mutex<RecorderState>,
}

impl ProfileRecorder {
    /// Begin a fresh profile, replacing any previous one
    pub(crate) fn start(&self, name: &str, metadata: &str) {
        let mut state = self.state.lock();
        state.profile = Some(Profile::new(name, metadata));
        state.active = true;
        state.cursor_ns = 0;
    }

    /// Stop recording; the profile stays readable
    pub(crate) fn end(&self) {
        let mut state = self.state.lock();
        state.active = false;
        if let Some(profile) = state.profile.as_mut() {
            profile.ended_at_ns.get_or_insert_with(now_ns);
        }
    }

    /// Stop recording and discard the profile
    pub(crate) fn clear(&self) {
        *self.state.lock() = RecorderState::default();
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub(crate) fn snapshot(&self) -> Option<Profile> {
        self.state.lock().profile.clone()
    }

    fn record(&self, layer: &str, ms: f32) {
        let mut state = self.state.lock();
        if !state.active {
            return;
        }
        let duration_ns = (f64::from(ms.max(0.0)) * 1e6) as u64;
        let start_ns = state.cursor_ns;
        state.cursor_ns += duration_ns;
        if let Some(profile) = state.profile.as_mut() {
            profile.entries.push(ProfileEntry {
                layer: layer.to_string(),
                start_ns,
                duration_ns,
            });
        }
    }

    pub(crate) fn as_user_data(&self) -> *mut c_void {
        self as *const ProfileRecorder as *mut c_void
    }
}

/// Native profiler callback; `user_data` is a `ProfileRecorder`
pub(crate) unsafe extern "C" fn report_layer_time(
    user_data: *mut c_void,
    layer_name: *const c_char,
    ms: f32,
) {
    if user_data.is_null() || layer_name.is_null() {
        return;
    }
    let recorder = &*(user_data as *const ProfileRecorder);
    let layer = CStr::from_ptr(layer_name).to_string_lossy();
    recorder.record(&layer, ms);
}
