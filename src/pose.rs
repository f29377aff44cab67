//! Pose classification from integrated gyro angles.

use crate::integrator::AngleState;
use crate::types::Pose;

/// Thresholds for pose detection, degrees and milliseconds.
#[derive(Debug, Clone)]
pub struct PoseConfig {
    /// Yaw beyond which the pose is LEFT/RIGHT.
    pub yaw_threshold_deg: f32,
    /// Pitch below the negative of which the pose is BACK.
    pub pitch_threshold_deg: f32,
    /// Either angle must exceed this before any transition is accepted.
    pub min_movement_deg: f32,
    /// Minimum time between accepted transitions.
    pub debounce_ms: u64,
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self {
            yaw_threshold_deg: 10.0,
            pitch_threshold_deg: 10.0,
            min_movement_deg: 5.0,
            debounce_ms: 300,
        }
    }
}

/// Maps angles to a [`Pose`] and tracks the debounced current pose.
#[derive(Debug, Clone)]
pub struct PoseClassifier {
    yaw_threshold: f32,
    pitch_threshold: f32,
    min_movement: f32,
    debounce_ms: u64,
    current: Pose,
    last_transition_ms: Option<u64>,
}

impl PoseClassifier {
    pub fn new(config: &PoseConfig) -> Self {
        Self {
            yaw_threshold: config.yaw_threshold_deg.to_radians(),
            pitch_threshold: config.pitch_threshold_deg.to_radians(),
            min_movement: config.min_movement_deg.to_radians(),
            debounce_ms: config.debounce_ms,
            current: Pose::Middle,
            last_transition_ms: None,
        }
    }

    /// Instantaneous pose for the given angles.
    ///
    /// The dominant axis decides. A forward pitch is reported as MIDDLE: the
    /// forward/jump position is the neutral pose, only a backward tilt is a
    /// distinct one.
    pub fn classify(&self, angles: &AngleState) -> Pose {
        if angles.yaw.abs() > angles.pitch.abs() {
            if angles.yaw > self.yaw_threshold {
                Pose::Right
            } else if angles.yaw < -self.yaw_threshold {
                Pose::Left
            } else {
                Pose::Middle
            }
        } else if angles.pitch < -self.pitch_threshold {
            Pose::Back
        } else {
            Pose::Middle
        }
    }

    /// Classify and decide whether this is an accepted transition.
    ///
    /// Returns the new pose when it differs from the current one, the motion
    /// is above the minimum magnitude and the debounce interval has passed.
    /// The caller is expected to re-zero the integrator on `Some`.
    pub fn evaluate(&mut self, angles: &AngleState, now_ms: u64) -> Option<Pose> {
        let pose = self.classify(angles);
        if pose == self.current {
            return None;
        }

        let significant =
            angles.yaw.abs() > self.min_movement || angles.pitch.abs() > self.min_movement;
        if !significant {
            return None;
        }

        if let Some(last) = self.last_transition_ms {
            if now_ms.saturating_sub(last) < self.debounce_ms {
                log::trace!("Pose {:?} within debounce window, ignored", pose);
                return None;
            }
        }

        log::debug!(
            "pose={:?} yaw={:.1}° pitch={:.1}°",
            pose,
            angles.yaw_deg(),
            angles.pitch_deg()
        );
        self.current = pose;
        self.last_transition_ms = Some(now_ms);
        Some(pose)
    }

    pub fn current(&self) -> Pose {
        self.current
    }

    /// Back to MIDDLE with no debounce history.
    pub fn reset(&mut self) {
        self.current = Pose::Middle;
        self.last_transition_ms = None;
    }
}

impl Default for PoseClassifier {
    fn default() -> Self {
        Self::new(&PoseConfig::default())
    }
}
