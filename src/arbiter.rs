//! Cross-source movement arbitration.
//!
//! Every detector submits candidates here. A single global cooldown keeps
//! concurrent sources from double-firing, and manual target mode accepts only
//! the movement the user was asked to perform, once.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::calibration::CalibrationEvent;
use crate::protocol::LedCommand;
use crate::types::{MovementCounts, MovementEvent, MovementKind, Source, SyncPayload};
use crate::{KineticError, Result};

pub const DEFAULT_COOLDOWN_MS: u64 = 1500;
/// Accepted events buffered for polling consumers.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    /// Minimum time between any two accepted events.
    pub cooldown_ms: u64,
    /// Whether auto mode accepts candidates before the host says otherwise.
    pub auto_detection_default: bool,
    pub event_capacity: usize,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            auto_detection_default: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

type RefSink<T> = Option<Box<dyn Fn(&T) + Send + Sync>>;
type ValueSink<T> = Option<Box<dyn Fn(T) + Send + Sync>>;

/// Outbound collaborators.
///
/// Sinks run on whichever thread produced the notification, after the
/// arbiter lock has been released. They should return quickly.
#[derive(Default)]
pub struct Feedback {
    on_movement: RefSink<MovementEvent>,
    on_counts: RefSink<MovementCounts>,
    on_led: ValueSink<LedCommand>,
    on_sync: RefSink<SyncPayload>,
    on_target_completed: ValueSink<MovementKind>,
    on_calibration: RefSink<CalibrationEvent>,
}

impl Feedback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_movement(mut self, f: impl Fn(&MovementEvent) + Send + Sync + 'static) -> Self {
        self.on_movement = Some(Box::new(f));
        self
    }

    pub fn on_counts(mut self, f: impl Fn(&MovementCounts) + Send + Sync + 'static) -> Self {
        self.on_counts = Some(Box::new(f));
        self
    }

    pub fn on_led(mut self, f: impl Fn(LedCommand) + Send + Sync + 'static) -> Self {
        self.on_led = Some(Box::new(f));
        self
    }

    pub fn on_sync(mut self, f: impl Fn(&SyncPayload) + Send + Sync + 'static) -> Self {
        self.on_sync = Some(Box::new(f));
        self
    }

    pub fn on_target_completed(mut self, f: impl Fn(MovementKind) + Send + Sync + 'static) -> Self {
        self.on_target_completed = Some(Box::new(f));
        self
    }

    pub fn on_calibration(mut self, f: impl Fn(&CalibrationEvent) + Send + Sync + 'static) -> Self {
        self.on_calibration = Some(Box::new(f));
        self
    }

    pub(crate) fn calibration(&self, event: &CalibrationEvent) {
        if let Some(f) = &self.on_calibration {
            f(event);
        }
    }

    fn accepted(&self, accepted: &Accepted) {
        if let Some(f) = &self.on_movement {
            f(&accepted.event);
        }
        if let Some(f) = &self.on_counts {
            f(&accepted.counts);
        }
        if let Some(f) = &self.on_led {
            f(LedCommand::for_movement(accepted.event.kind));
        }
        if let (Some(f), Some(payload)) = (&self.on_sync, &accepted.sync) {
            f(payload);
        }
        if let (Some(f), Some(kind)) = (&self.on_target_completed, accepted.completed_target) {
            f(kind);
        }
    }
}

impl std::fmt::Debug for Feedback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feedback")
            .field("on_movement", &self.on_movement.is_some())
            .field("on_counts", &self.on_counts.is_some())
            .field("on_led", &self.on_led.is_some())
            .field("on_sync", &self.on_sync.is_some())
            .field("on_target_completed", &self.on_target_completed.is_some())
            .field("on_calibration", &self.on_calibration.is_some())
            .finish()
    }
}

/// Mutable arbitration state, only touched under the arbiter lock.
#[derive(Debug, Clone, Default)]
pub struct ArbiterState {
    pub last_movement_ms: Option<u64>,
    pub selected_target: Option<MovementKind>,
    pub manual_mode_active: bool,
    pub auto_detection: bool,
    pub counts: MovementCounts,
    pub user_id: Option<String>,
}

/// Everything collaborators need about one acceptance, captured under the
/// lock and delivered after it is released.
struct Accepted {
    event: MovementEvent,
    counts: MovementCounts,
    sync: Option<SyncPayload>,
    completed_target: Option<MovementKind>,
}

pub struct MovementEventArbiter {
    cooldown_ms: u64,
    auto_detection_default: bool,
    state: Mutex<ArbiterState>,
    feedback: Feedback,
    tx: Sender<MovementEvent>,
    rx: Receiver<MovementEvent>,
}

impl MovementEventArbiter {
    pub fn new(config: &ArbiterConfig, feedback: Feedback) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(config.event_capacity.max(1));
        Self {
            cooldown_ms: config.cooldown_ms,
            auto_detection_default: config.auto_detection_default,
            state: Mutex::new(ArbiterState {
                auto_detection: config.auto_detection_default,
                ..ArbiterState::default()
            }),
            feedback,
            tx,
            rx,
        }
    }

    /// Offer a candidate movement. Returns the emitted event if accepted.
    pub fn submit(&self, candidate: MovementKind, source: Source, now_ms: u64) -> Option<MovementEvent> {
        let accepted = {
            let mut state = self.lock();

            if let Some(last) = state.last_movement_ms {
                let elapsed = now_ms.saturating_sub(last);
                if elapsed < self.cooldown_ms {
                    log::debug!(
                        "{} from {:?} within cooldown ({}ms < {}ms)",
                        candidate.as_str(),
                        source,
                        elapsed,
                        self.cooldown_ms
                    );
                    return None;
                }
            }

            let mut completed_target = None;
            if state.manual_mode_active {
                if state.selected_target != Some(candidate) {
                    log::debug!(
                        "{} rejected, waiting for {:?}",
                        candidate.as_str(),
                        state.selected_target
                    );
                    return None;
                }
                state.selected_target = None;
                state.manual_mode_active = false;
                completed_target = Some(candidate);
            } else if !state.auto_detection {
                log::trace!("{} ignored, auto detection off", candidate.as_str());
                return None;
            }

            state.last_movement_ms = Some(now_ms);
            state.counts.increment(candidate);

            Accepted {
                event: MovementEvent {
                    kind: candidate,
                    source,
                    timestamp_ms: now_ms,
                },
                counts: state.counts,
                sync: state
                    .user_id
                    .as_deref()
                    .map(|user| SyncPayload::new(&state.counts, user)),
                completed_target,
            }
        };

        log::info!(
            "Movement {} from {:?} (#{}, total {})",
            accepted.event.kind.as_str(),
            source,
            accepted.counts.get(accepted.event.kind),
            accepted.counts.total()
        );
        if self.tx.try_send(accepted.event).is_err() {
            log::trace!("Event queue full, dropping {:?}", accepted.event);
        }
        self.feedback.accepted(&accepted);
        Some(accepted.event)
    }

    /// Enter manual mode waiting for `kind`.
    pub fn select_target(&self, kind: MovementKind) {
        let mut state = self.lock();
        state.selected_target = Some(kind);
        state.manual_mode_active = true;
        log::info!("Target movement selected: {}", kind.as_str());
    }

    pub fn clear_target(&self) {
        let mut state = self.lock();
        state.selected_target = None;
        state.manual_mode_active = false;
    }

    pub fn set_auto_detection(&self, enabled: bool) {
        self.lock().auto_detection = enabled;
        log::info!("Auto detection {}", if enabled { "enabled" } else { "disabled" });
    }

    /// `None` clears the id and stops sync payloads.
    pub fn set_user_id(&self, user_id: Option<String>) {
        self.lock().user_id = user_id.filter(|id| !id.is_empty());
    }

    pub fn counts(&self) -> MovementCounts {
        self.lock().counts
    }

    pub fn selected_target(&self) -> Option<MovementKind> {
        self.lock().selected_target
    }

    pub fn snapshot(&self) -> ArbiterState {
        self.lock().clone()
    }

    /// Zero counts and cooldown, leave manual mode, restore the default
    /// auto-detection setting and drain undelivered events. The user id is kept.
    pub fn reset(&self) {
        {
            let mut state = self.lock();
            let user_id = state.user_id.take();
            *state = ArbiterState {
                auto_detection: self.auto_detection_default,
                user_id,
                ..ArbiterState::default()
            };
        }
        while self.rx.try_recv().is_ok() {}
    }

    pub(crate) fn feedback(&self) -> &Feedback {
        &self.feedback
    }

    /// Block until the next accepted event.
    pub fn recv(&self) -> Result<MovementEvent> {
        self.rx.recv().map_err(|_| KineticError::StreamStopped)
    }

    pub fn try_recv(&self) -> Result<Option<MovementEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(KineticError::StreamStopped),
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<MovementEvent> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => KineticError::Timeout,
            RecvTimeoutError::Disconnected => KineticError::StreamStopped,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ArbiterState> {
        // State stays consistent across a panicking sink since sinks run unlocked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn arbiter() -> MovementEventArbiter {
        MovementEventArbiter::new(&ArbiterConfig::default(), Feedback::new())
    }

    #[test]
    fn test_cooldown_is_global() {
        let arbiter = arbiter();
        assert!(arbiter.submit(MovementKind::Left, Source::Esp32, 1_000).is_some());
        assert!(arbiter.submit(MovementKind::Right, Source::PhoneGyro, 1_200).is_none());
        assert!(arbiter.submit(MovementKind::Up, Source::AiClassifier, 2_499).is_none());
        let event = arbiter.submit(MovementKind::Back, Source::PhoneGyro, 2_500).unwrap();
        assert_eq!(event.kind, MovementKind::Back);
        assert_eq!(event.timestamp_ms, 2_500);
    }

    #[test]
    fn test_accepted_events_spaced_by_cooldown() {
        let arbiter = arbiter();
        let mut accepted = Vec::new();
        for t in (0..20_000).step_by(100) {
            let kind = MovementKind::ALL[(t / 100) as usize % 5];
            if let Some(event) = arbiter.submit(kind, Source::Esp32, t) {
                accepted.push(event.timestamp_ms);
            }
        }
        assert!(accepted.len() > 1);
        for pair in accepted.windows(2) {
            assert!(pair[1] - pair[0] >= DEFAULT_COOLDOWN_MS);
        }
    }

    #[test]
    fn test_manual_mode_exclusivity() {
        let completed = Arc::new(Mutex::new(Vec::new()));
        let sink = completed.clone();
        let arbiter = MovementEventArbiter::new(
            &ArbiterConfig::default(),
            Feedback::new().on_target_completed(move |kind| sink.lock().unwrap().push(kind)),
        );
        arbiter.select_target(MovementKind::Left);

        let mut now = 0;
        for kind in [MovementKind::Right, MovementKind::Up, MovementKind::Back] {
            now += 2_000;
            assert!(arbiter.submit(kind, Source::Esp32, now).is_none());
        }
        assert_eq!(arbiter.counts().total(), 0);

        now += 2_000;
        assert!(arbiter.submit(MovementKind::Left, Source::Esp32, now).is_some());
        assert_eq!(arbiter.selected_target(), None);
        assert!(!arbiter.snapshot().manual_mode_active);
        assert_eq!(*completed.lock().unwrap(), vec![MovementKind::Left]);

        // Back in auto mode: the next LEFT is an ordinary event, not a completion.
        now += 2_000;
        assert!(arbiter.submit(MovementKind::Left, Source::Esp32, now).is_some());
        assert_eq!(completed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_rejected_candidates_do_not_start_cooldown() {
        let arbiter = arbiter();
        arbiter.select_target(MovementKind::Up);
        assert!(arbiter.submit(MovementKind::Left, Source::Esp32, 100).is_none());
        assert!(arbiter.submit(MovementKind::Up, Source::Esp32, 200).is_some());
    }

    #[test]
    fn test_auto_detection_off_ignores_candidates() {
        let arbiter = arbiter();
        arbiter.set_auto_detection(false);
        assert!(arbiter.submit(MovementKind::Dance, Source::AiClassifier, 0).is_none());

        // Manual mode still works with auto detection off.
        arbiter.select_target(MovementKind::Dance);
        assert!(arbiter.submit(MovementKind::Dance, Source::AiClassifier, 10).is_some());
        assert_eq!(arbiter.counts().dance, 1);
    }

    #[test]
    fn test_feedback_and_sync() {
        let leds = Arc::new(Mutex::new(Vec::new()));
        let syncs = Arc::new(Mutex::new(Vec::new()));
        let (led_sink, sync_sink) = (leds.clone(), syncs.clone());
        let arbiter = MovementEventArbiter::new(
            &ArbiterConfig::default(),
            Feedback::new()
                .on_led(move |led| led_sink.lock().unwrap().push(led))
                .on_sync(move |payload| sync_sink.lock().unwrap().push(payload.clone())),
        );

        arbiter.submit(MovementKind::Left, Source::Esp32, 0);
        assert!(syncs.lock().unwrap().is_empty());

        arbiter.set_user_id(Some("user-42".into()));
        arbiter.submit(MovementKind::Back, Source::Esp32, 5_000);

        assert_eq!(*leds.lock().unwrap(), vec![LedCommand::Blue, LedCommand::Red]);
        let syncs = syncs.lock().unwrap();
        assert_eq!(syncs.len(), 1);
        assert_eq!(syncs[0].left_count, 1);
        assert_eq!(syncs[0].back_count, 1);
        assert_eq!(syncs[0].user_id, "user-42");
    }

    #[test]
    fn test_event_channel_and_reset() {
        let arbiter = arbiter();
        assert!(arbiter.try_recv().unwrap().is_none());
        arbiter.submit(MovementKind::Right, Source::Esp32, 0);
        let event = arbiter.recv_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(event.kind, MovementKind::Right);
        assert!(matches!(
            arbiter.recv_timeout(Duration::from_millis(1)),
            Err(KineticError::Timeout)
        ));

        arbiter.submit(MovementKind::Up, Source::Esp32, 2_000);
        arbiter.set_auto_detection(false);
        arbiter.reset();
        assert!(arbiter.try_recv().unwrap().is_none());
        assert_eq!(arbiter.counts(), MovementCounts::default());
        assert!(arbiter.snapshot().auto_detection);
        // Cooldown cleared too.
        assert!(arbiter.submit(MovementKind::Up, Source::Esp32, 2_001).is_some());
    }

    #[test]
    fn test_concurrent_submitters_respect_cooldown() {
        let arbiter = Arc::new(arbiter());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let arbiter = arbiter.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|_| arbiter.submit(MovementKind::ALL[i], Source::Esp32, 1_000).is_some())
                        .count()
                })
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1);
    }
}
