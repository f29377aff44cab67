//! Gyroscope angle integration.
//!
//! Integrates yaw (z) and pitch (x) angular velocity into bounded angles. The
//! angles are relative to the last reset, which callers perform on every
//! confirmed pose transition and calibration phase change.

use crate::types::GyroSample;

/// Largest plausible gap between consecutive samples before the step is
/// treated as a clock anomaly.
pub const DEFAULT_MAX_DT_S: f32 = 1.0;

/// Integrated orientation relative to the last baseline.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AngleState {
    /// Radians, positive = right.
    pub yaw: f32,
    /// Radians, positive = forward tilt.
    pub pitch: f32,
    /// Timestamp of the previous sample; `None` until a baseline exists.
    pub last_timestamp_ns: Option<i64>,
}

impl AngleState {
    pub fn yaw_deg(&self) -> f32 {
        self.yaw.to_degrees()
    }

    pub fn pitch_deg(&self) -> f32 {
        self.pitch.to_degrees()
    }
}

#[derive(Debug, Clone)]
pub struct AngleIntegrator {
    state: AngleState,
    max_angle: f32,
    max_dt_s: f32,
}

impl AngleIntegrator {
    /// `max_angle` is the symmetric clamp bound in radians.
    pub fn new(max_angle: f32, max_dt_s: f32) -> Self {
        Self {
            state: AngleState::default(),
            max_angle,
            max_dt_s,
        }
    }

    /// Fold one sample into the angle state.
    ///
    /// The first sample after a reset only records its timestamp. Samples with
    /// a non-positive or implausibly large `dt` move the baseline forward
    /// without integrating. Non-finite rates are dropped entirely.
    pub fn integrate(&mut self, sample: &GyroSample) -> AngleState {
        if !sample.is_finite() {
            log::warn!(
                "Dropping non-finite gyro sample wx={} wz={}",
                sample.wx,
                sample.wz
            );
            return self.state;
        }

        let ts = sample.timestamp_ns;
        let last = match self.state.last_timestamp_ns.replace(ts) {
            Some(last) => last,
            None => return self.state,
        };

        let dt = ts.saturating_sub(last) as f64 / 1_000_000_000.0;
        if dt <= 0.0 || dt > self.max_dt_s as f64 {
            log::debug!("Gyro clock anomaly (dt={:.4}s), skipping integration", dt);
            return self.state;
        }

        let dt = dt as f32;
        self.state.yaw = (self.state.yaw + sample.wz * dt).clamp(-self.max_angle, self.max_angle);
        self.state.pitch =
            (self.state.pitch + sample.wx * dt).clamp(-self.max_angle, self.max_angle);
        self.state
    }

    /// Zero both angles and forget the baseline timestamp.
    pub fn reset(&mut self) {
        self.state = AngleState::default();
    }

    pub fn state(&self) -> AngleState {
        self.state
    }
}

impl Default for AngleIntegrator {
    fn default() -> Self {
        Self::new(std::f32::consts::FRAC_PI_2, DEFAULT_MAX_DT_S)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    const MS: i64 = 1_000_000;

    #[test]
    fn test_first_sample_sets_baseline_only() {
        let mut integrator = AngleIntegrator::default();
        let state = integrator.integrate(&GyroSample::new(5.0, 0.0, 5.0, 10 * MS));
        assert_eq!(state.yaw, 0.0);
        assert_eq!(state.pitch, 0.0);
        assert_eq!(state.last_timestamp_ns, Some(10 * MS));
    }

    #[test]
    fn test_integrates_yaw_and_pitch() {
        let mut integrator = AngleIntegrator::default();
        integrator.integrate(&GyroSample::new(0.0, 0.0, 0.0, 0));
        let state = integrator.integrate(&GyroSample::new(0.5, 9.0, -1.0, 100 * MS));
        assert!((state.yaw - (-0.1)).abs() < 1e-6);
        assert!((state.pitch - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_angles_clamped_to_quarter_turn() {
        let mut integrator = AngleIntegrator::default();
        let mut ts = 0;
        for i in 0..200 {
            // Alternate direction bursts to exercise both bounds.
            let rate = if i < 100 { 20.0 } else { -40.0 };
            let state = integrator.integrate(&GyroSample::new(rate, 0.0, rate, ts));
            assert!(state.yaw.abs() <= FRAC_PI_2);
            assert!(state.pitch.abs() <= FRAC_PI_2);
            ts += 16 * MS;
        }
        assert_eq!(integrator.state().yaw, -FRAC_PI_2);
    }

    #[test]
    fn test_reset_then_single_sample_stays_zero() {
        let mut integrator = AngleIntegrator::default();
        integrator.integrate(&GyroSample::new(1.0, 0.0, 1.0, 0));
        integrator.integrate(&GyroSample::new(1.0, 0.0, 1.0, 200 * MS));
        assert!(integrator.state().yaw > 0.0);

        integrator.reset();
        let state = integrator.integrate(&GyroSample::new(3.0, 0.0, 3.0, 400 * MS));
        assert_eq!(state.yaw, 0.0);
        assert_eq!(state.pitch, 0.0);
    }

    #[test]
    fn test_clock_anomalies_skip_but_move_baseline() {
        let mut integrator = AngleIntegrator::default();
        integrator.integrate(&GyroSample::new(0.0, 0.0, 1.0, 500 * MS));

        // Backwards in time.
        let state = integrator.integrate(&GyroSample::new(0.0, 0.0, 1.0, 400 * MS));
        assert_eq!(state.yaw, 0.0);
        assert_eq!(state.last_timestamp_ns, Some(400 * MS));

        // Duplicate timestamp.
        let state = integrator.integrate(&GyroSample::new(0.0, 0.0, 1.0, 400 * MS));
        assert_eq!(state.yaw, 0.0);

        // Five second gap.
        let state = integrator.integrate(&GyroSample::new(0.0, 0.0, 1.0, 5_400 * MS));
        assert_eq!(state.yaw, 0.0);

        // Normal step after the anomaly integrates from the new baseline.
        let state = integrator.integrate(&GyroSample::new(0.0, 0.0, 1.0, 5_500 * MS));
        assert!((state.yaw - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_non_finite_sample_is_ignored() {
        let mut integrator = AngleIntegrator::default();
        integrator.integrate(&GyroSample::new(0.0, 0.0, 0.0, 0));
        let state = integrator.integrate(&GyroSample::new(f32::NAN, 0.0, 1.0, 100 * MS));
        assert_eq!(state.yaw, 0.0);
        assert_eq!(state.last_timestamp_ns, Some(0));
    }
}
