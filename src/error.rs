use std::fmt;

/// Errors raised by the motion core.
///
/// Per-sample entry points on [`crate::MotionEngine`] never return these to the
/// sensor callback; they are logged and turned into "no signal". Component-level
/// APIs return them so callers can decide.
#[derive(Debug, thiserror::Error)]
pub enum KineticError {
    #[error("Invalid sample: non-finite value in {0}")]
    InvalidSample(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Malformed BLE payload: {0}")]
    MalformedPayload(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Model output has {got} classes, expected {expected}")]
    OutputShape { expected: usize, got: usize },

    #[error("Inference model not loaded")]
    ModelNotLoaded,

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Event stream stopped")]
    StreamStopped,

    #[error("Timeout waiting for data")]
    Timeout,

    #[error("Channel disconnected")]
    ChannelDisconnected,
}

/// Thread-safe last-error storage for the C FFI layer.
pub(crate) struct LastError {
    message: std::sync::Mutex<String>,
}

impl LastError {
    pub const fn new() -> Self {
        Self {
            message: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn set(&self, err: &KineticError) {
        if let Ok(mut msg) = self.message.lock() {
            *msg = fmt::format(format_args!("{}\0", err));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut msg) = self.message.lock() {
            msg.clear();
        }
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        match self.message.lock() {
            Ok(msg) if !msg.is_empty() => msg.as_ptr() as *const std::ffi::c_char,
            _ => std::ptr::null(),
        }
    }
}
