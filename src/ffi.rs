//! C FFI layer for kinetic_pulse.
//!
//! Provides an opaque handle-based API for the mobile host (JNI / Swift).
//! The generated C header is written to `include/kinetic_pulse.h` by cbindgen.

use crate::classifier::InferenceModel;
use crate::config::PipelineConfig;
use crate::engine::{EngineBuilder, MotionEngine};
use crate::error::LastError;
use crate::types::{AccelSample, GyroSample, MovementEvent, MovementKind, SensorSource};
use crate::{KineticError, Result};
use std::ffi::{c_char, c_int, c_void, CStr};
use std::time::Duration;

static LAST_ERROR: LastError = LastError::new();

/// Opaque engine handle for C consumers.
pub struct KpEngine(MotionEngine);

/// Inference callback supplied by the host.
///
/// Receives `input_len` window features and must write `output_len` class
/// scores. Returns 0 on success.
pub type KpInferFn = Option<
    unsafe extern "C" fn(
        user_data: *mut c_void,
        input: *const f32,
        input_len: usize,
        output: *mut f32,
        output_len: usize,
    ) -> c_int,
>;

/// Accepted movement in C-compatible layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct KpEvent {
    /// 0 LEFT, 1 RIGHT, 2 UP, 3 BACK, 4 DANCE.
    pub kind: c_int,
    /// 0 ESP32, 1 phone gyro, 2 AI classifier.
    pub source: c_int,
    pub timestamp_ms: u64,
}

impl From<MovementEvent> for KpEvent {
    fn from(event: MovementEvent) -> Self {
        KpEvent {
            kind: event.kind as c_int,
            source: event.source as c_int,
            timestamp_ms: event.timestamp_ms,
        }
    }
}

/// Per-direction movement totals.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct KpCounts {
    pub left: u32,
    pub right: u32,
    pub up: u32,
    pub back: u32,
    pub dance: u32,
}

struct CallbackModel {
    infer: unsafe extern "C" fn(*mut c_void, *const f32, usize, *mut f32, usize) -> c_int,
    user_data: *mut c_void,
}

// SAFETY: the host promises the callback and `user_data` may be used from the
// inference worker thread. Calls are serialized by that single thread.
unsafe impl Send for CallbackModel {}

impl InferenceModel for CallbackModel {
    fn infer(&mut self, input: &[f32], output: &mut [f32]) -> Result<()> {
        // SAFETY: both slices are valid for their lengths for the whole call.
        let rc = unsafe {
            (self.infer)(
                self.user_data,
                input.as_ptr(),
                input.len(),
                output.as_mut_ptr(),
                output.len(),
            )
        };
        if rc != 0 {
            return Err(KineticError::Inference(format!("host callback returned {}", rc)));
        }
        Ok(())
    }
}

/// Create an engine configured from `KINETIC_*` environment variables.
/// Pass a null `infer` to run without the activity model.
/// Returns NULL on error (check kp_last_error()).
///
/// # Safety
/// `infer` and `user_data` must stay valid until `kp_engine_free`, and be
/// callable from a background thread.
#[no_mangle]
pub unsafe extern "C" fn kp_engine_new(infer: KpInferFn, user_data: *mut c_void) -> *mut KpEngine {
    let mut builder = EngineBuilder::new().config(PipelineConfig::from_env());
    if let Some(infer) = infer {
        builder = builder.model(Box::new(CallbackModel { infer, user_data }));
    }
    match builder.build() {
        Ok(engine) => {
            LAST_ERROR.clear();
            Box::into_raw(Box::new(KpEngine(engine)))
        }
        Err(e) => {
            LAST_ERROR.set(&e);
            std::ptr::null_mut()
        }
    }
}

/// Stop all threads and free the engine.
///
/// # Safety
/// `engine` must be a pointer returned by `kp_engine_new`, or null.
#[no_mangle]
pub unsafe extern "C" fn kp_engine_free(engine: *mut KpEngine) {
    if !engine.is_null() {
        drop(Box::from_raw(engine));
    }
}

unsafe fn engine_ref<'a>(engine: *const KpEngine) -> Option<&'a MotionEngine> {
    engine.as_ref().map(|e| &e.0)
}

fn emitted(event: Option<MovementEvent>) -> c_int {
    event.is_some() as c_int
}

/// Feed a gyroscope sample (rad/s, nanosecond timestamp).
/// Returns 1 if a movement was accepted, 0 if not, -1 on a null handle.
///
/// # Safety
/// `engine` must be a valid engine pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kp_push_gyro(
    engine: *const KpEngine,
    wx: f32,
    wy: f32,
    wz: f32,
    timestamp_ns: i64,
) -> c_int {
    match engine_ref(engine) {
        Some(engine) => emitted(engine.push_gyro(GyroSample::new(wx, wy, wz, timestamp_ns))),
        None => -1,
    }
}

/// Feed an ESP32 accelerometer triple. Same return values as `kp_push_gyro`.
///
/// # Safety
/// `engine` must be a valid engine pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kp_push_accel(engine: *const KpEngine, ax: f32, ay: f32, az: f32) -> c_int {
    match engine_ref(engine) {
        Some(engine) => emitted(engine.push_accel(AccelSample::new(ax, ay, az))),
        None => -1,
    }
}

/// Feed one complete BLE payload line (without the newline).
/// Same return values as `kp_push_gyro`.
///
/// # Safety
/// `engine` must be a valid engine pointer, or null. `line` must be a
/// null-terminated string, or null.
#[no_mangle]
pub unsafe extern "C" fn kp_push_ble_line(engine: *const KpEngine, line: *const c_char) -> c_int {
    let Some(engine) = engine_ref(engine) else {
        return -1;
    };
    if line.is_null() {
        return -1;
    }
    let line = CStr::from_ptr(line).to_string_lossy();
    emitted(engine.push_ble_line(&line))
}

/// Feed a raw BLE notification chunk. Returns the number of accepted
/// movements, or -1 on a null pointer.
///
/// # Safety
/// `engine` must be a valid engine pointer, or null. `bytes` must point to
/// `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn kp_push_ble_bytes(
    engine: *const KpEngine,
    bytes: *const u8,
    len: usize,
) -> c_int {
    let Some(engine) = engine_ref(engine) else {
        return -1;
    };
    if bytes.is_null() {
        return -1;
    }
    let chunk = std::slice::from_raw_parts(bytes, len);
    engine.push_ble_notification(chunk).len() as c_int
}

/// Switch the active source: 0 ESP32 accelerometer, 1 phone gyro, 2 AI.
/// Returns 0 on success, -1 on a null handle or unknown source.
///
/// # Safety
/// `engine` must be a valid engine pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kp_set_source(engine: *const KpEngine, source: c_int) -> c_int {
    let Some(engine) = engine_ref(engine) else {
        return -1;
    };
    match u8::try_from(source).ok().and_then(SensorSource::from_code) {
        Some(source) => {
            engine.set_active_source(source);
            0
        }
        None => {
            LAST_ERROR.set(&KineticError::InvalidConfig(format!("unknown source {}", source)));
            -1
        }
    }
}

/// Enter manual mode waiting for `kind` (see `KpEvent::kind`).
/// Returns 0 on success, -1 on a null handle or unknown kind.
///
/// # Safety
/// `engine` must be a valid engine pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kp_select_target(engine: *const KpEngine, kind: c_int) -> c_int {
    let Some(engine) = engine_ref(engine) else {
        return -1;
    };
    match MovementKind::from_code(kind) {
        Some(kind) => {
            engine.select_target_movement(kind);
            0
        }
        None => {
            LAST_ERROR.set(&KineticError::InvalidConfig(format!("unknown movement {}", kind)));
            -1
        }
    }
}

/// # Safety
/// `engine` must be a valid engine pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kp_clear_target(engine: *const KpEngine) {
    if let Some(engine) = engine_ref(engine) {
        engine.clear_target();
    }
}

/// # Safety
/// `engine` must be a valid engine pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kp_enable_auto_detection(engine: *const KpEngine, enabled: bool) {
    if let Some(engine) = engine_ref(engine) {
        engine.enable_auto_detection(enabled);
    }
}

/// Start calibration and live gyro detection, or stop it.
///
/// # Safety
/// `engine` must be a valid engine pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kp_enable_live_detection(engine: *const KpEngine, enabled: bool) {
    if let Some(engine) = engine_ref(engine) {
        engine.enable_live_detection(enabled);
    }
}

/// # Safety
/// `engine` must be a valid engine pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kp_set_gyro_available(engine: *const KpEngine, available: bool) {
    if let Some(engine) = engine_ref(engine) {
        engine.set_gyro_available(available);
    }
}

/// Set the user id attached to sync payloads. Null or empty clears it.
///
/// # Safety
/// `engine` must be a valid engine pointer, or null. `user_id` must be a
/// null-terminated string, or null.
#[no_mangle]
pub unsafe extern "C" fn kp_set_user_id(engine: *const KpEngine, user_id: *const c_char) {
    let Some(engine) = engine_ref(engine) else {
        return;
    };
    let user_id = if user_id.is_null() {
        None
    } else {
        Some(CStr::from_ptr(user_id).to_string_lossy().into_owned())
    };
    engine.set_user_id(user_id);
}

/// Zero counts and timers and restart the classifier window.
///
/// # Safety
/// `engine` must be a valid engine pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kp_reset(engine: *const KpEngine) {
    if let Some(engine) = engine_ref(engine) {
        engine.reset();
    }
}

/// Receive the next accepted movement.
/// `timeout_ms`: 0 = try without blocking, negative = block until one arrives.
/// Returns 0 on success, -1 on error/timeout.
///
/// # Safety
/// `engine` and `out` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn kp_poll_event(
    engine: *const KpEngine,
    out: *mut KpEvent,
    timeout_ms: c_int,
) -> c_int {
    let Some(engine) = engine_ref(engine) else {
        return -1;
    };
    if out.is_null() {
        return -1;
    }

    let result = if timeout_ms == 0 {
        engine
            .try_recv_event()
            .and_then(|event| event.ok_or(KineticError::Timeout))
    } else if timeout_ms < 0 {
        engine.recv_event()
    } else {
        engine.recv_event_timeout(Duration::from_millis(timeout_ms as u64))
    };

    match result {
        Ok(event) => {
            out.write(KpEvent::from(event));
            0
        }
        Err(e) => {
            LAST_ERROR.set(&e);
            -1
        }
    }
}

/// Status bitmap (see `Status`): bit 0 gyro available, 1 model loaded,
/// 2 live detection, 3 calibrating, 4 auto detection, 5 manual mode,
/// 6 device attached.
///
/// # Safety
/// `engine` must be a valid engine pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kp_status(engine: *const KpEngine) -> u32 {
    engine_ref(engine).map(|e| e.status().bits()).unwrap_or(0)
}

/// Winning score of the most recent inference, 0 if none.
///
/// # Safety
/// `engine` must be a valid engine pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn kp_last_confidence(engine: *const KpEngine) -> f32 {
    engine_ref(engine).map(|e| e.last_confidence()).unwrap_or(0.0)
}

/// Copy the movement totals into `out`. Returns 0 on success, -1 on null.
///
/// # Safety
/// `engine` and `out` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn kp_counts(engine: *const KpEngine, out: *mut KpCounts) -> c_int {
    let Some(engine) = engine_ref(engine) else {
        return -1;
    };
    if out.is_null() {
        return -1;
    }
    let counts = engine.counts();
    out.write(KpCounts {
        left: counts.left,
        right: counts.right,
        up: counts.up,
        back: counts.back,
        dance: counts.dance,
    });
    0
}

/// Get the last error message. Returns NULL if no error.
/// The returned pointer is valid until the next kinetic_pulse API call.
#[no_mangle]
pub extern "C" fn kp_last_error() -> *const c_char {
    LAST_ERROR.as_ptr()
}
