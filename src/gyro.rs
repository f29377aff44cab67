//! Phone gyroscope pose tracking.
//!
//! Composes the angle integrator, the pose classifier and the calibration
//! sequencer into the live-detection flow used when the phone itself is the
//! motion sensor.

use crate::calibration::{CalibrationEvent, CalibrationPhase, CalibrationSequencer, DEFAULT_PHASE_MS};
use crate::integrator::{AngleIntegrator, AngleState, DEFAULT_MAX_DT_S};
use crate::pose::{PoseClassifier, PoseConfig};
use crate::types::{GyroSample, MovementKind, Pose};
use crate::Result;

#[derive(Debug, Clone)]
pub struct GyroConfig {
    pub pose: PoseConfig,
    /// Integrated angles are clamped to +/- this, radians.
    pub max_angle_rad: f32,
    pub max_dt_s: f32,
    pub calibration_phase_ms: u64,
}

impl Default for GyroConfig {
    fn default() -> Self {
        Self {
            pose: PoseConfig::default(),
            max_angle_rad: std::f32::consts::FRAC_PI_2,
            max_dt_s: DEFAULT_MAX_DT_S,
            calibration_phase_ms: DEFAULT_PHASE_MS,
        }
    }
}

/// Result of feeding one gyro sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GyroUpdate {
    pub angles: AngleState,
    /// Calibration advanced on this sample.
    pub calibration: Option<CalibrationEvent>,
    /// Accepted pose transition.
    pub transition: Option<Pose>,
}

impl GyroUpdate {
    pub fn movement(&self) -> Option<MovementKind> {
        self.transition.map(|pose| pose.movement())
    }
}

#[derive(Debug)]
pub struct GyroTracker {
    integrator: AngleIntegrator,
    pose: PoseClassifier,
    calibration: CalibrationSequencer,
    live: bool,
    available: bool,
}

impl GyroTracker {
    pub fn new(config: &GyroConfig) -> Result<Self> {
        Ok(Self {
            integrator: AngleIntegrator::new(config.max_angle_rad, config.max_dt_s),
            pose: PoseClassifier::new(&config.pose),
            calibration: CalibrationSequencer::new(config.calibration_phase_ms)?,
            live: false,
            available: true,
        })
    }

    /// Start calibration (enable) or drop back to idle (disable).
    ///
    /// Enabling while already live restarts calibration. Enabling without a
    /// gyroscope is refused and returns no events.
    pub fn set_live_detection(&mut self, enabled: bool, now_ms: u64) -> Vec<CalibrationEvent> {
        if !enabled {
            if self.live {
                log::info!("Live gyro detection disabled");
            }
            self.stop();
            return Vec::new();
        }
        if !self.available {
            log::warn!("Gyroscope not available, live detection stays off");
            return Vec::new();
        }

        self.live = true;
        self.integrator.reset();
        self.pose.reset();
        self.calibration.start(now_ms).to_vec()
    }

    /// Integrate one sample, advance calibration and evaluate transitions.
    ///
    /// Pose output is suppressed until calibration completes; the integrator
    /// keeps running and is re-zeroed on every phase change.
    pub fn process(&mut self, sample: &GyroSample, now_ms: u64) -> GyroUpdate {
        if !self.live || !self.available {
            return GyroUpdate::default();
        }

        let angles = self.integrator.integrate(sample);
        let mut update = GyroUpdate {
            angles,
            ..GyroUpdate::default()
        };

        if self.calibration.is_calibrating() {
            if let Some(event) = self.calibration.tick(now_ms) {
                self.integrator.reset();
                update.calibration = Some(event);
            }
            return update;
        }

        if let Some(pose) = self.pose.evaluate(&angles, now_ms) {
            self.integrator.reset();
            update.transition = Some(pose);
        }
        update
    }

    /// Record sensor availability. Losing the gyroscope stops live detection.
    pub fn set_available(&mut self, available: bool) {
        self.available = available;
        if !available && self.live {
            log::warn!("Gyroscope lost, stopping live detection");
            self.stop();
        }
    }

    /// Back to idle: integrator zeroed, pose MIDDLE, calibration NONE.
    pub fn reset(&mut self) {
        self.stop();
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibration.is_calibrating()
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.calibration.phase()
    }

    pub fn current_pose(&self) -> Pose {
        self.pose.current()
    }

    pub fn angles(&self) -> AngleState {
        self.integrator.state()
    }

    fn stop(&mut self) {
        self.live = false;
        self.calibration.disable();
        self.pose.reset();
        self.integrator.reset();
    }
}
