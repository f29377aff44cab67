//! # kinetic_pulse - real-time motion classification core
//!
//! Turns noisy sensor streams into debounced, mutually exclusive movement
//! events (LEFT / RIGHT / UP / BACK / DANCE). Three detectors feed one
//! arbiter:
//! - ESP32 accelerometer triples over BLE, per-axis threshold detection
//! - Phone gyroscope, angle integration and pose classification after a
//!   guided calibration
//! - A windowed activity classifier running a host-supplied model on a
//!   dedicated worker thread
//!
//! A C FFI is provided for the mobile host.
//!
//! ## Quick Start
//! ```no_run
//! use kinetic_pulse::{Feedback, MotionEngine, SensorSource};
//! use std::time::Duration;
//!
//! let engine = MotionEngine::builder()
//!     .source(SensorSource::Esp32Accel)
//!     .feedback(Feedback::new().on_movement(|e| println!("{:?}", e.kind)))
//!     .build()
//!     .unwrap();
//!
//! engine.push_ble_line(r#"{"ax":-3.1,"ay":0.2,"az":9.7}"#);
//! let event = engine.recv_event_timeout(Duration::from_secs(1)).unwrap();
//! println!("{:?} from {:?}", event.kind, event.source);
//! ```

pub mod error;
pub mod types;
pub mod clock;
pub mod config;
pub mod integrator;
pub mod pose;
pub mod calibration;
pub mod gyro;
pub mod threshold;
pub mod classifier;
pub mod arbiter;
pub mod protocol;
pub mod device;
pub mod worker;
pub mod engine;
pub mod ffi;

pub use error::KineticError;
pub use types::*;
pub use arbiter::{ArbiterConfig, Feedback, MovementEventArbiter};
pub use calibration::{CalibrationEvent, CalibrationPhase};
pub use classifier::{ClassifierConfig, InferenceModel, WindowedActivityClassifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PipelineConfig;
pub use device::{
    ChannelDevice, DeviceSource, DeviceStream, NotificationSender, ScriptedDevice, StreamCompletion,
};
pub use engine::{EngineBuilder, MotionEngine};
pub use gyro::{GyroConfig, GyroTracker};
pub use protocol::{BlePacket, LedCommand};

/// Result type alias for kinetic_pulse operations.
pub type Result<T> = std::result::Result<T, KineticError>;
