//! Per-sample threshold detection for ESP32 accelerometer triples.

use crate::types::{AccelSample, MovementKind};
use crate::{KineticError, Result};

/// Default magnitude an axis must exceed, in the peripheral's native units.
pub const DEFAULT_ACCEL_THRESHOLD: f32 = 2.0;

/// Stateless axis-priority detector: X (left/right) is checked before Y
/// (forward/back). Z is ignored.
#[derive(Debug, Clone, Copy)]
pub struct AccelerometerThresholdDetector {
    threshold: f32,
}

impl AccelerometerThresholdDetector {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Map one sample to a direction, if any axis clears the threshold.
    ///
    /// Non-finite input is rejected with [`KineticError::InvalidSample`]; the
    /// caller logs it and treats it as no signal.
    pub fn detect(&self, sample: &AccelSample) -> Result<Option<MovementKind>> {
        if !sample.is_finite() {
            return Err(KineticError::InvalidSample("accelerometer triple"));
        }

        let t = self.threshold;
        let kind = if sample.ax.abs() > t {
            if sample.ax > t {
                MovementKind::Right
            } else {
                MovementKind::Left
            }
        } else if sample.ay.abs() > t {
            if sample.ay > t {
                MovementKind::Up
            } else {
                MovementKind::Back
            }
        } else {
            return Ok(None);
        };
        Ok(Some(kind))
    }
}

impl Default for AccelerometerThresholdDetector {
    fn default() -> Self {
        Self::new(DEFAULT_ACCEL_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(ax: f32, ay: f32, az: f32) -> Result<Option<MovementKind>> {
        AccelerometerThresholdDetector::default().detect(&AccelSample::new(ax, ay, az))
    }

    #[test]
    fn test_axis_directions() {
        assert_eq!(detect(3.0, 0.0, 0.0).unwrap(), Some(MovementKind::Right));
        assert_eq!(detect(-3.0, 0.0, 0.0).unwrap(), Some(MovementKind::Left));
        assert_eq!(detect(0.0, 3.0, 0.0).unwrap(), Some(MovementKind::Up));
        assert_eq!(detect(0.0, -3.0, 0.0).unwrap(), Some(MovementKind::Back));
    }

    #[test]
    fn test_below_threshold_is_none() {
        assert_eq!(detect(0.1, 0.1, 0.1).unwrap(), None);
        assert_eq!(detect(2.0, -2.0, 9.0).unwrap(), None);
    }

    #[test]
    fn test_x_axis_has_priority() {
        assert_eq!(detect(-2.5, 8.0, 0.0).unwrap(), Some(MovementKind::Left));
    }

    #[test]
    fn test_non_finite_rejected() {
        assert!(matches!(
            detect(f32::NAN, 0.0, 0.0),
            Err(KineticError::InvalidSample(_))
        ));
        assert!(detect(0.0, f32::INFINITY, 0.0).is_err());
        assert!(detect(0.0, 0.0, f32::NEG_INFINITY).is_err());
    }
}
