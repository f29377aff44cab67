//! Guided calibration sequence run before live gyro detection.
//!
//! `NONE -> STEADY -> LEFT -> RIGHT -> FORWARD -> BACK -> COMPLETE`, one step
//! per elapsed phase duration. Time is polled: nothing happens unless
//! [`CalibrationSequencer::tick`] is called.

use crate::{KineticError, Result};

/// Shortest accepted phase duration.
pub const MIN_PHASE_MS: u64 = 500;
/// Longest accepted phase duration.
pub const MAX_PHASE_MS: u64 = 3000;
pub const DEFAULT_PHASE_MS: u64 = 1200;

// ARGB indicator colours.
pub const COLOR_WHITE: u32 = 0xFFFF_FFFF;
pub const COLOR_YELLOW: u32 = 0xFFFF_FF00;
pub const COLOR_GREEN: u32 = 0xFF00_FF00;
pub const COLOR_MAGENTA: u32 = 0xFFFF_00FF;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalibrationPhase {
    #[default]
    None,
    Steady,
    Left,
    Right,
    Forward,
    Back,
    Complete,
}

impl CalibrationPhase {
    fn next(self) -> CalibrationPhase {
        match self {
            CalibrationPhase::Steady => CalibrationPhase::Left,
            CalibrationPhase::Left => CalibrationPhase::Right,
            CalibrationPhase::Right => CalibrationPhase::Forward,
            CalibrationPhase::Forward => CalibrationPhase::Back,
            CalibrationPhase::Back => CalibrationPhase::Complete,
            CalibrationPhase::None | CalibrationPhase::Complete => self,
        }
    }

    /// Prompt shown to the user while in this phase.
    pub fn instruction(&self) -> &'static str {
        match self {
            CalibrationPhase::None => "",
            CalibrationPhase::Steady => "Hold device steady",
            CalibrationPhase::Left => "Tilt LEFT",
            CalibrationPhase::Right => "Tilt RIGHT",
            CalibrationPhase::Forward => "Tilt FORWARD",
            CalibrationPhase::Back => "Tilt BACK",
            CalibrationPhase::Complete => "Calibration complete! Motion detection active.",
        }
    }

    pub fn color(&self) -> u32 {
        match self {
            CalibrationPhase::Left => COLOR_YELLOW,
            CalibrationPhase::Right | CalibrationPhase::Complete => COLOR_GREEN,
            CalibrationPhase::Back => COLOR_MAGENTA,
            _ => COLOR_WHITE,
        }
    }

    /// Phases during which detection output is suppressed.
    pub fn is_in_progress(&self) -> bool {
        !matches!(self, CalibrationPhase::None | CalibrationPhase::Complete)
    }
}

/// Notification for the calibration UI sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalibrationEvent {
    Started,
    Phase {
        phase: CalibrationPhase,
        instruction: &'static str,
        color: u32,
    },
    Completed,
}

impl CalibrationEvent {
    fn phase(phase: CalibrationPhase) -> Self {
        CalibrationEvent::Phase {
            phase,
            instruction: phase.instruction(),
            color: phase.color(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CalibrationSequencer {
    phase: CalibrationPhase,
    phase_started_ms: u64,
    phase_duration_ms: u64,
}

impl CalibrationSequencer {
    pub fn new(phase_duration_ms: u64) -> Result<Self> {
        validate_phase_duration(phase_duration_ms)?;
        Ok(Self {
            phase: CalibrationPhase::None,
            phase_started_ms: 0,
            phase_duration_ms,
        })
    }

    /// Enter STEADY. Restarts from the beginning if already running.
    pub fn start(&mut self, now_ms: u64) -> [CalibrationEvent; 2] {
        self.phase = CalibrationPhase::Steady;
        self.phase_started_ms = now_ms;
        log::info!("Starting calibration - {}", self.phase.instruction());
        [
            CalibrationEvent::Started,
            CalibrationEvent::phase(CalibrationPhase::Steady),
        ]
    }

    /// Advance at most one phase if the current one has run its course.
    pub fn tick(&mut self, now_ms: u64) -> Option<CalibrationEvent> {
        if !self.phase.is_in_progress() {
            return None;
        }
        if now_ms.saturating_sub(self.phase_started_ms) < self.phase_duration_ms {
            return None;
        }

        self.phase = self.phase.next();
        self.phase_started_ms = now_ms;

        if self.phase == CalibrationPhase::Complete {
            log::info!("Calibration complete, motion detection active");
            Some(CalibrationEvent::Completed)
        } else {
            log::info!("Calibration: {}", self.phase.instruction());
            Some(CalibrationEvent::phase(self.phase))
        }
    }

    /// Drop back to NONE (live detection turned off).
    pub fn disable(&mut self) {
        self.phase = CalibrationPhase::None;
        self.phase_started_ms = 0;
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    pub fn is_calibrating(&self) -> bool {
        self.phase.is_in_progress()
    }

    pub fn is_complete(&self) -> bool {
        self.phase == CalibrationPhase::Complete
    }

    pub fn phase_duration_ms(&self) -> u64 {
        self.phase_duration_ms
    }
}

pub(crate) fn validate_phase_duration(phase_duration_ms: u64) -> Result<()> {
    if !(MIN_PHASE_MS..=MAX_PHASE_MS).contains(&phase_duration_ms) {
        return Err(KineticError::InvalidConfig(format!(
            "calibration phase duration {}ms outside {}..={}ms",
            phase_duration_ms, MIN_PHASE_MS, MAX_PHASE_MS
        )));
    }
    Ok(())
}
