use serde::{Deserialize, Serialize};

/// One accelerometer triple as delivered by the ESP32 peripheral.
///
/// Units are whatever the upstream sensor emits (g or raw counts); nothing in
/// the core assumes an absolute calibration.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AccelSample {
    pub ax: f32,
    pub ay: f32,
    pub az: f32,
}

impl AccelSample {
    pub fn new(ax: f32, ay: f32, az: f32) -> Self {
        Self { ax, ay, az }
    }

    pub fn magnitude(&self) -> f32 {
        (self.ax * self.ax + self.ay * self.ay + self.az * self.az).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.ax.is_finite() && self.ay.is_finite() && self.az.is_finite()
    }
}

/// One phone gyroscope reading.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GyroSample {
    /// Angular velocity around x (pitch rate), rad/s.
    pub wx: f32,
    /// Angular velocity around y (roll rate, unused by pose detection), rad/s.
    pub wy: f32,
    /// Angular velocity around z (yaw rate), rad/s.
    pub wz: f32,
    /// Sensor timestamp in nanoseconds.
    pub timestamp_ns: i64,
}

impl GyroSample {
    pub fn new(wx: f32, wy: f32, wz: f32, timestamp_ns: i64) -> Self {
        Self {
            wx,
            wy,
            wz,
            timestamp_ns,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.wx.is_finite() && self.wy.is_finite() && self.wz.is_finite()
    }
}

/// Raw sample from any transport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorSample {
    Accel(AccelSample),
    Gyro(GyroSample),
}

/// Canonical movement directions.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MovementKind {
    Left = 0,
    Right = 1,
    /// Forward / up jump.
    Up = 2,
    Back = 3,
    Dance = 4,
}

impl MovementKind {
    pub const ALL: [MovementKind; 5] = [
        MovementKind::Left,
        MovementKind::Right,
        MovementKind::Up,
        MovementKind::Back,
        MovementKind::Dance,
    ];

    /// Parse a direction word as sent by the ESP32 firmware (`MOVE:<DIR>`,
    /// JSON `"event"`). Case-insensitive.
    pub fn from_direction(word: &str) -> Option<MovementKind> {
        match word.trim().to_ascii_uppercase().as_str() {
            "LEFT" => Some(MovementKind::Left),
            "RIGHT" => Some(MovementKind::Right),
            "FORWARD" | "UP" => Some(MovementKind::Up),
            "BACK" | "BACKWARD" => Some(MovementKind::Back),
            "DANCE" => Some(MovementKind::Dance),
            _ => None,
        }
    }

    pub fn from_code(code: i32) -> Option<MovementKind> {
        match code {
            0 => Some(MovementKind::Left),
            1 => Some(MovementKind::Right),
            2 => Some(MovementKind::Up),
            3 => Some(MovementKind::Back),
            4 => Some(MovementKind::Dance),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MovementKind::Left => "LEFT",
            MovementKind::Right => "RIGHT",
            MovementKind::Up => "UP",
            MovementKind::Back => "BACK",
            MovementKind::Dance => "DANCE",
        }
    }
}

/// Which detector produced a movement.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    Esp32 = 0,
    PhoneGyro = 1,
    AiClassifier = 2,
}

/// Arbitrated, de-duplicated movement. Immutable once emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementEvent {
    pub kind: MovementKind,
    pub source: Source,
    /// Clock time at acceptance, milliseconds.
    pub timestamp_ms: u64,
}

/// Discrete orientation bucket derived from integrated gyro angles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pose {
    Left,
    Right,
    #[default]
    Middle,
    Back,
}

impl Pose {
    /// Movement reported when the tracker transitions into this pose.
    /// MIDDLE is the forward/jump position.
    pub fn movement(&self) -> MovementKind {
        match self {
            Pose::Left => MovementKind::Left,
            Pose::Right => MovementKind::Right,
            Pose::Middle => MovementKind::Up,
            Pose::Back => MovementKind::Back,
        }
    }
}

/// The single active sensor mode.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SensorSource {
    #[default]
    Esp32Accel = 0,
    PhoneGyro = 1,
    AiAutoDetect = 2,
}

impl SensorSource {
    pub fn from_code(code: u8) -> Option<SensorSource> {
        match code {
            0 => Some(SensorSource::Esp32Accel),
            1 => Some(SensorSource::PhoneGyro),
            2 => Some(SensorSource::AiAutoDetect),
            _ => None,
        }
    }
}

/// Output of the windowed activity classifier: one of the model's classes or
/// a sentinel describing why no class is available.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ActivityLabel {
    Boxing = 0,
    Clapping = 1,
    Running = 2,
    SittingDown = 3,
    StandingUp = 4,
    Walking = 5,
    #[default]
    CollectingData = 6,
    Uncertain = 7,
    Error = 8,
    AiNotLoaded = 9,
}

impl ActivityLabel {
    /// Model output order.
    pub const CLASSES: [ActivityLabel; 6] = [
        ActivityLabel::Boxing,
        ActivityLabel::Clapping,
        ActivityLabel::Running,
        ActivityLabel::SittingDown,
        ActivityLabel::StandingUp,
        ActivityLabel::Walking,
    ];

    pub fn from_class_index(index: usize) -> Option<ActivityLabel> {
        Self::CLASSES.get(index).copied()
    }

    pub fn from_code(code: u8) -> ActivityLabel {
        match code {
            0 => ActivityLabel::Boxing,
            1 => ActivityLabel::Clapping,
            2 => ActivityLabel::Running,
            3 => ActivityLabel::SittingDown,
            4 => ActivityLabel::StandingUp,
            5 => ActivityLabel::Walking,
            7 => ActivityLabel::Uncertain,
            8 => ActivityLabel::Error,
            9 => ActivityLabel::AiNotLoaded,
            _ => ActivityLabel::CollectingData,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityLabel::Boxing => "boxing",
            ActivityLabel::Clapping => "clapping",
            ActivityLabel::Running => "running",
            ActivityLabel::SittingDown => "sitting down",
            ActivityLabel::StandingUp => "standing up",
            ActivityLabel::Walking => "walking",
            ActivityLabel::CollectingData => "collecting_data",
            ActivityLabel::Uncertain => "uncertain",
            ActivityLabel::Error => "error",
            ActivityLabel::AiNotLoaded => "ai_not_loaded",
        }
    }

    /// True for the six model classes, false for sentinels.
    pub fn is_activity(&self) -> bool {
        (*self as u8) < 6
    }

    /// Movement a confirmed activity stands for, if any.
    pub fn movement(&self) -> Option<MovementKind> {
        match self {
            ActivityLabel::Boxing | ActivityLabel::Clapping => Some(MovementKind::Dance),
            ActivityLabel::Walking | ActivityLabel::Running => Some(MovementKind::Up),
            _ => None,
        }
    }
}

/// Label plus the model value at the winning index.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Classification {
    pub label: ActivityLabel,
    pub confidence: f32,
}

impl Classification {
    pub fn sentinel(label: ActivityLabel) -> Self {
        Self {
            label,
            confidence: 0.0,
        }
    }
}

/// Per-direction tally of accepted movements.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MovementCounts {
    pub left: u32,
    pub right: u32,
    pub up: u32,
    pub back: u32,
    pub dance: u32,
}

impl MovementCounts {
    pub fn increment(&mut self, kind: MovementKind) {
        let slot = match kind {
            MovementKind::Left => &mut self.left,
            MovementKind::Right => &mut self.right,
            MovementKind::Up => &mut self.up,
            MovementKind::Back => &mut self.back,
            MovementKind::Dance => &mut self.dance,
        };
        *slot = slot.saturating_add(1);
    }

    pub fn get(&self, kind: MovementKind) -> u32 {
        match kind {
            MovementKind::Left => self.left,
            MovementKind::Right => self.right,
            MovementKind::Up => self.up,
            MovementKind::Back => self.back,
            MovementKind::Dance => self.dance,
        }
    }

    /// Sum of every direction. Widened so saturated counters cannot overflow.
    pub fn total(&self) -> u64 {
        [self.left, self.right, self.up, self.back, self.dance]
            .iter()
            .map(|&n| u64::from(n))
            .sum()
    }
}

/// Cumulative counts handed to the backend sync collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    pub left_count: u32,
    pub right_count: u32,
    pub up_count: u32,
    pub back_count: u32,
    pub user_id: String,
}

impl SyncPayload {
    pub fn new(counts: &MovementCounts, user_id: &str) -> Self {
        Self {
            left_count: counts.left,
            right_count: counts.right,
            up_count: counts.up,
            back_count: counts.back,
            user_id: user_id.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// What the ESP32 peripheral has told us about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub firmware_version: Option<String>,
    /// IMU WHO_AM_I register, formatted as `0xNN`.
    pub who_am_i: Option<String>,
    pub imu_on: Option<bool>,
    pub last_ack: Option<String>,
    pub last_error: Option<String>,
}

bitflags::bitflags! {
    /// Sticky engine status for diagnostic display.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Status: u32 {
        const GYRO_AVAILABLE  = 1 << 0;
        const MODEL_LOADED    = 1 << 1;
        const LIVE_DETECTION  = 1 << 2;
        const CALIBRATING     = 1 << 3;
        const AUTO_DETECTION  = 1 << 4;
        const MANUAL_MODE     = 1 << 5;
        const DEVICE_ATTACHED = 1 << 6;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_total_with_saturated_slots() {
        let mut counts = MovementCounts {
            left: u32::MAX,
            dance: u32::MAX,
            ..MovementCounts::default()
        };
        counts.increment(MovementKind::Left);
        counts.increment(MovementKind::Up);
        assert_eq!(counts.get(MovementKind::Left), u32::MAX);
        assert_eq!(counts.get(MovementKind::Up), 1);
        assert_eq!(counts.total(), 2 * u64::from(u32::MAX) + 1);
    }

    #[test]
    fn test_activity_labels_vs_sentinels() {
        assert!(ActivityLabel::CLASSES.iter().all(|l| l.is_activity()));
        assert!(!ActivityLabel::CollectingData.is_activity());
        assert!(!ActivityLabel::AiNotLoaded.is_activity());
        assert_eq!(ActivityLabel::SittingDown.movement(), None);
    }
}
