//! Pipeline configuration with environment overrides.

use crate::arbiter::ArbiterConfig;
use crate::classifier::ClassifierConfig;
use crate::gyro::GyroConfig;
use crate::threshold::DEFAULT_ACCEL_THRESHOLD;
use crate::{KineticError, Result};

/// Default depth of the inference worker queue.
pub const DEFAULT_WORKER_QUEUE: usize = 256;

pub const ENV_CALIBRATION_PHASE_MS: &str = "KINETIC_CALIBRATION_PHASE_MS";
pub const ENV_MOVEMENT_COOLDOWN_MS: &str = "KINETIC_MOVEMENT_COOLDOWN_MS";
pub const ENV_ACCEL_THRESHOLD: &str = "KINETIC_ACCEL_THRESHOLD";
pub const ENV_AI_CONFIDENCE_THRESHOLD: &str = "KINETIC_AI_CONFIDENCE_THRESHOLD";
pub const ENV_STABILITY_THRESHOLD: &str = "KINETIC_STABILITY_THRESHOLD";
pub const ENV_AUTO_DETECTION: &str = "KINETIC_AUTO_DETECTION";

/// Everything the engine needs to build its components.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub gyro: GyroConfig,
    pub classifier: ClassifierConfig,
    pub arbiter: ArbiterConfig,
    /// ESP32 per-axis threshold.
    pub accel_threshold: f32,
    /// Samples buffered for the inference worker before new ones are dropped.
    pub worker_queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            gyro: GyroConfig::default(),
            classifier: ClassifierConfig::default(),
            arbiter: ArbiterConfig::default(),
            accel_threshold: DEFAULT_ACCEL_THRESHOLD,
            worker_queue_capacity: DEFAULT_WORKER_QUEUE,
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `KINETIC_*` environment variables. Unparseable
    /// values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let env = EnvReader { lookup };

        config.gyro.calibration_phase_ms =
            env.parse(ENV_CALIBRATION_PHASE_MS, config.gyro.calibration_phase_ms);
        config.arbiter.cooldown_ms = env.parse(ENV_MOVEMENT_COOLDOWN_MS, config.arbiter.cooldown_ms);
        config.accel_threshold = env.parse(ENV_ACCEL_THRESHOLD, config.accel_threshold);
        config.classifier.confidence_threshold =
            env.parse(ENV_AI_CONFIDENCE_THRESHOLD, config.classifier.confidence_threshold);
        config.classifier.stability_threshold =
            env.parse(ENV_STABILITY_THRESHOLD, config.classifier.stability_threshold);
        config.arbiter.auto_detection_default =
            env.flag(ENV_AUTO_DETECTION, config.arbiter.auto_detection_default);

        config
    }

    /// Reject out-of-range constants before any component is built.
    pub fn validate(&self) -> Result<()> {
        crate::calibration::validate_phase_duration(self.gyro.calibration_phase_ms)?;

        let positive = [
            ("yaw threshold", self.gyro.pose.yaw_threshold_deg),
            ("pitch threshold", self.gyro.pose.pitch_threshold_deg),
            ("max angle", self.gyro.max_angle_rad),
            ("max dt", self.gyro.max_dt_s),
            ("accelerometer threshold", self.accel_threshold),
            ("normalisation target", self.classifier.normalization_target),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(KineticError::InvalidConfig(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }

        if !(self.gyro.pose.min_movement_deg.is_finite() && self.gyro.pose.min_movement_deg >= 0.0) {
            return Err(KineticError::InvalidConfig(format!(
                "min movement must be non-negative, got {}",
                self.gyro.pose.min_movement_deg
            )));
        }
        if !(0.0..1.0).contains(&self.classifier.confidence_threshold) {
            return Err(KineticError::InvalidConfig(format!(
                "confidence threshold {} outside [0, 1)",
                self.classifier.confidence_threshold
            )));
        }
        if self.classifier.stability_threshold == 0 {
            return Err(KineticError::InvalidConfig(
                "stability threshold must be at least 1".into(),
            ));
        }
        if self.worker_queue_capacity == 0 || self.arbiter.event_capacity == 0 {
            return Err(KineticError::InvalidConfig(
                "queue capacities must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: std::str::FromStr + Copy>(&self, name: &str, default: T) -> T {
        match (self.lookup)(name) {
            Some(raw) => match raw.trim().parse::<T>() {
                Ok(v) => v,
                Err(_) => {
                    log::warn!("Ignoring {}={:?}: not a valid value", name, raw);
                    default
                }
            },
            None => default,
        }
    }

    fn flag(&self, name: &str, default: bool) -> bool {
        (self.lookup)(name)
            .and_then(|v| {
                let v = v.trim().to_ascii_lowercase();
                match v.as_str() {
                    "1" | "true" | "yes" | "on" => Some(true),
                    "0" | "false" | "no" | "off" => Some(false),
                    _ => None,
                }
            })
            .unwrap_or(default)
    }
}
