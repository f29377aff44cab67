//! The motion engine: routes raw samples from every source through the
//! matching detector into the shared arbiter.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::arbiter::{Feedback, MovementEventArbiter};
use crate::calibration::CalibrationPhase;
use crate::classifier::{InferenceModel, WindowedActivityClassifier};
use crate::clock::{Clock, SystemClock};
use crate::config::PipelineConfig;
use crate::device::{DeviceSource, DeviceStream};
use crate::gyro::GyroTracker;
use crate::protocol::{self, BlePacket, LineAssembler};
use crate::threshold::AccelerometerThresholdDetector;
use crate::types::{
    AccelSample, ActivityLabel, Classification, DeviceInfo, GyroSample, MovementCounts,
    MovementEvent, MovementKind, SensorSample, SensorSource, Source, Status,
};
use crate::worker::{InferenceWorker, WorkerHandle};
use crate::{KineticError, Result};

/// Configures and starts a [`MotionEngine`].
pub struct EngineBuilder {
    config: PipelineConfig,
    model: Option<Box<dyn InferenceModel>>,
    clock: Option<Arc<dyn Clock>>,
    feedback: Feedback,
    source: SensorSource,
    user_id: Option<String>,
    gyro_available: bool,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            model: None,
            clock: None,
            feedback: Feedback::default(),
            source: SensorSource::default(),
            user_id: None,
            gyro_available: true,
        }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn model(mut self, model: Box<dyn InferenceModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Load the activity model, leaving the AI path disabled if it fails.
    pub fn load_model<L>(mut self, loader: L) -> Self
    where
        L: FnOnce() -> Result<Box<dyn InferenceModel>>,
    {
        self.model = match loader() {
            Ok(model) => Some(model),
            Err(e) => {
                log::error!("Failed to load activity model: {}", e);
                None
            }
        };
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn feedback(mut self, feedback: Feedback) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn source(mut self, source: SensorSource) -> Self {
        self.source = source;
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn gyro_available(mut self, available: bool) -> Self {
        self.gyro_available = available;
        self
    }

    pub fn build(self) -> Result<MotionEngine> {
        self.config.validate()?;

        let mut gyro = GyroTracker::new(&self.config.gyro)?;
        gyro.set_available(self.gyro_available);

        let arbiter = MovementEventArbiter::new(&self.config.arbiter, self.feedback);
        arbiter.set_user_id(self.user_id);

        let shared = Arc::new(Shared {
            source: AtomicU8::new(self.source as u8),
            gyro: Mutex::new(gyro),
            threshold: AccelerometerThresholdDetector::new(self.config.accel_threshold),
            arbiter,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock::new())),
            device_info: Mutex::new(DeviceInfo::default()),
        });

        let classifier = WindowedActivityClassifier::new(self.config.classifier.clone(), self.model);
        let on_result = {
            let shared = shared.clone();
            move |classification: Classification, queued_under: SensorSource| {
                shared.classified(classification, queued_under)
            }
        };
        let worker = InferenceWorker::start(classifier, self.config.worker_queue_capacity, on_result)?;
        let handle = worker.handle().ok_or(KineticError::StreamStopped)?;

        log::info!(
            "Motion engine ready (source {:?}, model loaded: {})",
            self.source,
            worker.diagnostics().model_loaded()
        );

        Ok(MotionEngine {
            device: Mutex::new(None),
            assembler: Mutex::new(LineAssembler::new()),
            router: Router {
                shared,
                worker: handle,
            },
            worker,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State reachable from the BLE reader and inference threads.
struct Shared {
    source: AtomicU8,
    gyro: Mutex<GyroTracker>,
    threshold: AccelerometerThresholdDetector,
    arbiter: MovementEventArbiter,
    clock: Arc<dyn Clock>,
    device_info: Mutex<DeviceInfo>,
}

impl Shared {
    fn active_source(&self) -> SensorSource {
        SensorSource::from_code(self.source.load(Ordering::Acquire)).unwrap_or_default()
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn gyro(&self) -> MutexGuard<'_, GyroTracker> {
        self.gyro.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn device_info(&self) -> MutexGuard<'_, DeviceInfo> {
        self.device_info
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Confirmed activity labels become candidates only in AI mode. A sample
    /// queued under another source never counts, even if the switch to AI
    /// happened while it waited.
    fn classified(&self, classification: Classification, queued_under: SensorSource) {
        if queued_under != SensorSource::AiAutoDetect
            || self.active_source() != SensorSource::AiAutoDetect
            || !classification.label.is_activity()
        {
            return;
        }
        if let Some(kind) = classification.label.movement() {
            log::debug!(
                "Activity {} ({:.2}) -> {}",
                classification.label.as_str(),
                classification.confidence,
                kind.as_str()
            );
            self.arbiter.submit(kind, Source::AiClassifier, self.now_ms());
        }
    }
}

/// Sample entry points shared by the engine and the BLE reader thread.
#[derive(Clone)]
struct Router {
    shared: Arc<Shared>,
    worker: WorkerHandle,
}

impl Router {
    fn accel(&self, sample: AccelSample) -> Option<MovementEvent> {
        let source = self.shared.active_source();
        if self.worker.diagnostics().model_loaded() {
            self.worker.push(sample, source);
        }
        if source != SensorSource::Esp32Accel {
            return None;
        }
        match self.shared.threshold.detect(&sample) {
            Ok(Some(kind)) => self
                .shared
                .arbiter
                .submit(kind, Source::Esp32, self.shared.now_ms()),
            Ok(None) => None,
            Err(e) => {
                log::warn!("{}", e);
                None
            }
        }
    }

    fn gyro(&self, sample: GyroSample) -> Option<MovementEvent> {
        if self.shared.active_source() != SensorSource::PhoneGyro {
            return None;
        }
        let now = self.shared.now_ms();
        let update = self.shared.gyro().process(&sample, now);

        if let Some(event) = &update.calibration {
            self.shared.arbiter.feedback().calibration(event);
        }
        let kind = update.movement()?;
        self.shared.arbiter.submit(kind, Source::PhoneGyro, now)
    }

    fn packet(&self, packet: BlePacket) -> Option<MovementEvent> {
        match packet {
            BlePacket::Accel(sample) => return self.accel(sample),
            BlePacket::Move(kind) => {
                if self.shared.active_source() == SensorSource::Esp32Accel {
                    return self
                        .shared
                        .arbiter
                        .submit(kind, Source::Esp32, self.shared.now_ms());
                }
                log::trace!("Device movement {} ignored, ESP32 not active", kind.as_str());
            }
            BlePacket::Ack(cmd) => {
                log::info!("Device ack cmd={}", cmd);
                let mut info = self.shared.device_info();
                match cmd.to_ascii_uppercase().as_str() {
                    "ON" => info.imu_on = Some(true),
                    "OFF" => info.imu_on = Some(false),
                    _ => {}
                }
                info.last_ack = Some(cmd);
            }
            BlePacket::SensorState(on) => {
                log::info!("Device IMU {}", if on { "on" } else { "off" });
                self.shared.device_info().imu_on = Some(on);
            }
            BlePacket::Boot {
                firmware,
                who_am_i,
                imu_on,
            } => {
                let mut info = self.shared.device_info();
                if firmware.is_some() {
                    info.firmware_version = firmware;
                }
                if let Some(who) = who_am_i {
                    info.who_am_i = Some(format!("0x{:X}", who));
                }
                if imu_on.is_some() {
                    info.imu_on = imu_on;
                }
                log::info!(
                    "Device boot: fw={:?} who={:?} imu={:?}",
                    info.firmware_version,
                    info.who_am_i,
                    info.imu_on
                );
            }
            BlePacket::DeviceError(message) => {
                log::warn!("Device reported error: {}", message);
                self.shared.device_info().last_error = Some(message);
            }
            BlePacket::Unknown(line) => {
                log::debug!("Ignoring unrecognised payload: {}", line);
            }
        }
        None
    }
}

/// Thread-safe facade over the whole detection pipeline.
///
/// Every `push_*` method may be called from any thread. They never fail:
/// invalid input is logged and treated as no signal.
pub struct MotionEngine {
    device: Mutex<Option<DeviceStream>>,
    assembler: Mutex<LineAssembler>,
    // Must drop before `worker`: the worker joins once every sender is gone.
    router: Router,
    worker: InferenceWorker,
}

impl MotionEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    // -- Sample entry points --

    /// Feed a phone gyroscope reading. Used only while PhoneGyro is active.
    pub fn push_gyro(&self, sample: GyroSample) -> Option<MovementEvent> {
        self.router.gyro(sample)
    }

    /// Feed an accelerometer triple from the ESP32.
    pub fn push_accel(&self, sample: AccelSample) -> Option<MovementEvent> {
        self.router.accel(sample)
    }

    /// Feed a sample from whichever transport produced it.
    pub fn push_sample(&self, sample: SensorSample) -> Option<MovementEvent> {
        match sample {
            SensorSample::Accel(accel) => self.push_accel(accel),
            SensorSample::Gyro(gyro) => self.push_gyro(gyro),
        }
    }

    /// Feed one complete payload line.
    pub fn push_ble_line(&self, line: &str) -> Option<MovementEvent> {
        match protocol::parse_payload(line) {
            Ok(packet) => self.router.packet(packet),
            Err(e) => {
                log::warn!("{}", e);
                None
            }
        }
    }

    /// Feed a raw notification chunk; complete lines are processed in order.
    pub fn push_ble_notification(&self, bytes: &[u8]) -> Vec<MovementEvent> {
        let lines = self
            .assembler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(bytes);
        lines
            .iter()
            .filter_map(|line| self.push_ble_line(line))
            .collect()
    }

    pub fn push_packet(&self, packet: BlePacket) -> Option<MovementEvent> {
        self.router.packet(packet)
    }

    // -- Device --

    /// Start draining `device` on a background thread, replacing any
    /// previously attached device.
    pub fn attach_device<D>(&self, device: D) -> Result<()>
    where
        D: DeviceSource + 'static,
    {
        self.detach_device();
        *self.router.shared.device_info() = DeviceInfo {
            name: device.name().to_string(),
            ..DeviceInfo::default()
        };

        let router = self.router.clone();
        let stream = DeviceStream::start(device, move |packet| {
            router.packet(packet);
        })?;
        log::info!("Device {} attached", stream.name());
        *self.device_slot() = Some(stream);
        Ok(())
    }

    /// Stop the device reader, if any.
    pub fn detach_device(&self) {
        if let Some(stream) = self.device_slot().take() {
            log::info!("Device {} detached", stream.name());
            stream.stop();
        }
    }

    /// Block until an attached scripted device runs dry. False on timeout or
    /// when no device is attached.
    pub fn wait_device_finished(&self, timeout: Duration) -> bool {
        let completion = match self.device_slot().as_ref() {
            Some(stream) => stream.completion(),
            None => return false,
        };
        completion.wait(timeout)
    }

    pub fn device_info(&self) -> DeviceInfo {
        self.router.shared.device_info().clone()
    }

    // -- Commands --

    /// Switch the active sensor. A change resets the gyro tracker and the
    /// classifier window, and samples still queued for the classifier are
    /// discarded. Safe to call from a feedback sink.
    pub fn set_active_source(&self, source: SensorSource) {
        let previous = self.router.shared.source.swap(source as u8, Ordering::AcqRel);
        if previous == source as u8 {
            return;
        }
        log::info!(
            "Active source {:?} -> {:?}",
            SensorSource::from_code(previous).unwrap_or_default(),
            source
        );
        self.router.shared.gyro().reset();
        self.worker.reset();
    }

    pub fn select_target_movement(&self, kind: MovementKind) {
        self.router.shared.arbiter.select_target(kind);
    }

    pub fn clear_target(&self) {
        self.router.shared.arbiter.clear_target();
    }

    pub fn enable_auto_detection(&self, enabled: bool) {
        self.router.shared.arbiter.set_auto_detection(enabled);
    }

    /// Start (with calibration) or stop live gyro detection.
    pub fn enable_live_detection(&self, enabled: bool) {
        let now = self.router.shared.now_ms();
        let events = self.router.shared.gyro().set_live_detection(enabled, now);
        for event in &events {
            self.router.shared.arbiter.feedback().calibration(event);
        }
    }

    pub fn set_gyro_available(&self, available: bool) {
        self.router.shared.gyro().set_available(available);
    }

    /// Empty or `None` disables sync payloads.
    pub fn set_user_id(&self, user_id: Option<String>) {
        self.router.shared.arbiter.set_user_id(user_id);
    }

    /// Zero counts and timers, stop live detection and clear the classifier
    /// window. The active source and attached device are kept. Never waits
    /// on the inference queue, so sinks may call it.
    pub fn reset(&self) {
        self.router.shared.arbiter.reset();
        self.router.shared.gyro().reset();
        self.worker.reset();
        self.assembler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        log::info!("Motion engine reset");
    }

    /// Wait for the inference worker to catch up with queued samples.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        self.worker.flush(timeout)
    }

    // -- Queries --

    pub fn status(&self) -> Status {
        let mut status = Status::empty();
        {
            let gyro = self.router.shared.gyro();
            status.set(Status::GYRO_AVAILABLE, gyro.is_available());
            status.set(Status::LIVE_DETECTION, gyro.is_live());
            status.set(Status::CALIBRATING, gyro.is_calibrating());
        }
        let arbiter = self.router.shared.arbiter.snapshot();
        status.set(Status::AUTO_DETECTION, arbiter.auto_detection);
        status.set(Status::MANUAL_MODE, arbiter.manual_mode_active);
        status.set(Status::MODEL_LOADED, self.model_loaded());
        status.set(
            Status::DEVICE_ATTACHED,
            self.device_slot().as_ref().is_some_and(|s| s.is_active()),
        );
        status
    }

    pub fn counts(&self) -> MovementCounts {
        self.router.shared.arbiter.counts()
    }

    pub fn last_confidence(&self) -> f32 {
        self.worker.diagnostics().last_confidence()
    }

    pub fn last_activity(&self) -> ActivityLabel {
        self.worker.diagnostics().last_label()
    }

    pub fn model_loaded(&self) -> bool {
        self.worker.diagnostics().model_loaded()
    }

    pub fn active_source(&self) -> SensorSource {
        self.router.shared.active_source()
    }

    pub fn selected_target(&self) -> Option<MovementKind> {
        self.router.shared.arbiter.selected_target()
    }

    pub fn calibration_phase(&self) -> CalibrationPhase {
        self.router.shared.gyro().phase()
    }

    // -- Events --

    pub fn recv_event(&self) -> Result<MovementEvent> {
        self.router.shared.arbiter.recv()
    }

    pub fn try_recv_event(&self) -> Result<Option<MovementEvent>> {
        self.router.shared.arbiter.try_recv()
    }

    pub fn recv_event_timeout(&self, timeout: Duration) -> Result<MovementEvent> {
        self.router.shared.arbiter.recv_timeout(timeout)
    }

    fn device_slot(&self) -> MutexGuard<'_, Option<DeviceStream>> {
        self.device
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for MotionEngine {
    fn drop(&mut self) {
        self.detach_device();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationEvent;
    use crate::classifier::WINDOW_SIZE;
    use crate::clock::ManualClock;
    use crate::device::ScriptedDevice;
    use crate::protocol::LedCommand;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{OnceLock, Weak};

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Harness {
        clock: Arc<ManualClock>,
        engine: MotionEngine,
    }

    fn harness(builder: EngineBuilder) -> Harness {
        let clock = Arc::new(ManualClock::new(10_000));
        let engine = builder.clock(clock.clone()).build().unwrap();
        Harness { clock, engine }
    }

    fn model<F>(f: F) -> Box<dyn InferenceModel>
    where
        F: FnMut(&[f32], &mut [f32]) -> Result<()> + Send + 'static,
    {
        Box::new(f)
    }

    fn boxing_model() -> Box<dyn InferenceModel> {
        model(|_, out| {
            out.iter_mut().for_each(|v| *v = 0.0);
            out[0] = 0.95;
            Ok(())
        })
    }

    #[test]
    fn test_esp32_threshold_routing() {
        let h = harness(EngineBuilder::new());
        let event = h.engine.push_accel(AccelSample::new(-3.0, 0.0, 9.8)).unwrap();
        assert_eq!(event.kind, MovementKind::Left);
        assert_eq!(event.source, Source::Esp32);

        // Within cooldown, even from a different source kind.
        h.clock.advance(500);
        assert!(h.engine.push_ble_line("MOVE:RIGHT").is_none());

        h.clock.advance(1_000);
        let event = h.engine.push_ble_line("MOVE:RIGHT").unwrap();
        assert_eq!(event.kind, MovementKind::Right);

        assert_eq!(h.engine.counts().left, 1);
        assert_eq!(h.engine.counts().right, 1);
        assert_eq!(h.engine.try_recv_event().unwrap().map(|e| e.kind), Some(MovementKind::Left));
        assert_eq!(h.engine.try_recv_event().unwrap().map(|e| e.kind), Some(MovementKind::Right));
        assert_eq!(h.engine.try_recv_event().unwrap(), None);
    }

    #[test]
    fn test_inactive_sources_are_ignored() {
        let h = harness(EngineBuilder::new().source(SensorSource::PhoneGyro));
        assert!(h.engine.push_accel(AccelSample::new(5.0, 0.0, 0.0)).is_none());
        assert!(h.engine.push_ble_line("MOVE:LEFT").is_none());

        h.engine.set_active_source(SensorSource::Esp32Accel);
        assert!(h.engine.push_gyro(GyroSample::new(0.0, 0.0, -5.0, 0)).is_none());
        assert!(h.engine.push_ble_line("MOVE:LEFT").is_some());
    }

    #[test]
    fn test_invalid_input_is_no_signal() {
        let h = harness(EngineBuilder::new());
        assert!(h.engine.push_accel(AccelSample::new(f32::NAN, 0.0, 0.0)).is_none());
        assert!(h.engine.push_ble_line("ACCEL:1,nope,3").is_none());
        assert!(h.engine.push_ble_line("{broken").is_none());
        assert_eq!(h.engine.counts().total(), 0);
    }

    #[test]
    fn test_gyro_calibration_then_left() {
        let calibration = Arc::new(Mutex::new(Vec::new()));
        let sink = calibration.clone();
        let h = harness(
            EngineBuilder::new()
                .source(SensorSource::PhoneGyro)
                .feedback(Feedback::new().on_calibration(move |e| sink.lock().unwrap().push(e.clone()))),
        );
        h.engine.enable_live_detection(true);
        assert!(h.engine.status().contains(Status::LIVE_DETECTION | Status::CALIBRATING));

        let frame_ms = 16u64;
        let mut ts_ns = 0i64;
        let mut step = |wz: f32| {
            h.clock.advance(frame_ms);
            ts_ns += frame_ms as i64 * 1_000_000;
            h.engine.push_gyro(GyroSample::new(0.0, 0.0, wz, ts_ns))
        };

        // Swinging during calibration never emits.
        let mut i = 0;
        while h.engine.calibration_phase() != CalibrationPhase::Complete {
            let wz = if (i / 20) % 2 == 0 { 4.0 } else { -4.0 };
            assert!(step(wz).is_none());
            i += 1;
        }
        let events = calibration.lock().unwrap().clone();
        assert_eq!(events.first(), Some(&CalibrationEvent::Started));
        assert_eq!(events.last(), Some(&CalibrationEvent::Completed));

        let wz = (-15.0f32).to_radians() / 0.3;
        let emitted: Vec<_> = (0..19).filter_map(|_| step(wz)).collect();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].kind, MovementKind::Left);
        assert_eq!(emitted[0].source, Source::PhoneGyro);
    }

    #[test]
    fn test_manual_target_via_engine() {
        let completed = Arc::new(Mutex::new(Vec::new()));
        let leds = Arc::new(Mutex::new(Vec::new()));
        let (done_sink, led_sink) = (completed.clone(), leds.clone());
        let h = harness(
            EngineBuilder::new().feedback(
                Feedback::new()
                    .on_target_completed(move |k| done_sink.lock().unwrap().push(k))
                    .on_led(move |l| led_sink.lock().unwrap().push(l)),
            ),
        );

        h.engine.select_target_movement(MovementKind::Back);
        assert!(h.engine.status().contains(Status::MANUAL_MODE));
        assert!(h.engine.push_ble_line("MOVE:LEFT").is_none());
        h.clock.advance(2_000);
        assert!(h.engine.push_ble_line("Backward Jump").is_some());

        assert_eq!(h.engine.selected_target(), None);
        assert!(!h.engine.status().contains(Status::MANUAL_MODE));
        assert_eq!(*completed.lock().unwrap(), vec![MovementKind::Back]);
        assert_eq!(*leds.lock().unwrap(), vec![LedCommand::Red]);
    }

    #[test]
    fn test_ai_mode_submits_confirmed_labels() {
        let h = harness(
            EngineBuilder::new()
                .source(SensorSource::AiAutoDetect)
                .model(boxing_model()),
        );
        assert!(h.engine.model_loaded());
        for _ in 0..(WINDOW_SIZE + 2) {
            h.engine.push_ble_line(r#"{"ax":0.2,"ay":0.1,"az":9.8}"#);
        }
        h.engine.flush(TIMEOUT).unwrap();

        let event = h.engine.recv_event_timeout(TIMEOUT).unwrap();
        assert_eq!(event.kind, MovementKind::Dance);
        assert_eq!(event.source, Source::AiClassifier);
        assert_eq!(h.engine.last_activity(), ActivityLabel::Boxing);
        assert!((h.engine.last_confidence() - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_classifier_runs_as_diagnostics_in_esp32_mode() {
        let h = harness(EngineBuilder::new().model(boxing_model()));
        for _ in 0..(WINDOW_SIZE + 2) {
            h.engine.push_accel(AccelSample::new(0.1, 0.1, 1.0));
        }
        h.engine.flush(TIMEOUT).unwrap();
        assert_eq!(h.engine.last_activity(), ActivityLabel::Boxing);
        assert_eq!(h.engine.counts().total(), 0);
    }

    #[test]
    fn test_switching_source_resets_classifier() {
        let h = harness(EngineBuilder::new().model(boxing_model()));
        for _ in 0..(WINDOW_SIZE + 2) {
            h.engine.push_accel(AccelSample::new(0.1, 0.1, 1.0));
        }
        h.engine.set_active_source(SensorSource::AiAutoDetect);
        h.engine.flush(TIMEOUT).unwrap();
        assert_eq!(h.engine.last_activity(), ActivityLabel::CollectingData);
        assert_eq!(h.engine.last_confidence(), 0.0);
    }

    #[test]
    fn test_samples_queued_before_switch_never_count() {
        let h = harness(EngineBuilder::new().model(model(|_, out| {
            std::thread::sleep(Duration::from_millis(1));
            out.iter_mut().for_each(|v| *v = 0.0);
            out[0] = 0.95;
            Ok(())
        })));
        for _ in 0..(WINDOW_SIZE + 20) {
            h.engine.push_accel(AccelSample::new(0.1, 0.1, 1.0));
        }
        h.engine.set_active_source(SensorSource::AiAutoDetect);
        h.engine.flush(TIMEOUT).unwrap();
        assert_eq!(h.engine.counts().dance, 0);
        assert_eq!(h.engine.try_recv_event().unwrap(), None);

        // Samples pushed after the switch fill a fresh window and do count.
        for _ in 0..(WINDOW_SIZE + 2) {
            h.engine.push_accel(AccelSample::new(0.1, 0.1, 1.0));
        }
        h.engine.flush(TIMEOUT).unwrap();
        assert_eq!(h.engine.counts().dance, 1);
    }

    #[test]
    fn test_sink_may_reset_engine_while_queue_full() {
        let slot: Arc<OnceLock<Weak<MotionEngine>>> = Arc::new(OnceLock::new());
        let resets = Arc::new(AtomicUsize::new(0));
        let (sink_slot, sink_resets) = (slot.clone(), resets.clone());

        let mut config = PipelineConfig::default();
        config.worker_queue_capacity = 2;
        let engine = Arc::new(
            EngineBuilder::new()
                .config(config)
                .source(SensorSource::AiAutoDetect)
                .model(boxing_model())
                .clock(Arc::new(ManualClock::new(10_000)))
                .feedback(Feedback::new().on_movement(move |_| {
                    // Runs on the inference thread.
                    if let Some(engine) = sink_slot.get().and_then(Weak::upgrade) {
                        for _ in 0..8 {
                            engine.push_accel(AccelSample::new(0.1, 0.1, 1.0));
                        }
                        engine.reset();
                        sink_resets.fetch_add(1, Ordering::SeqCst);
                    }
                }))
                .build()
                .unwrap(),
        );
        slot.set(Arc::downgrade(&engine)).unwrap();

        for _ in 0..(WINDOW_SIZE + 10) {
            engine.push_accel(AccelSample::new(0.1, 0.1, 1.0));
            engine.flush(TIMEOUT).unwrap();
        }

        assert_eq!(resets.load(Ordering::SeqCst), 1);
        assert_eq!(engine.counts().total(), 0);
        assert_eq!(engine.try_recv_event().unwrap(), None);
        assert_eq!(engine.last_activity(), ActivityLabel::CollectingData);
        assert!(engine.flush(TIMEOUT).is_ok());
    }

    #[test]
    fn test_push_sample_dispatches_by_kind() {
        let h = harness(EngineBuilder::new());
        assert!(h
            .engine
            .push_sample(SensorSample::Gyro(GyroSample::new(0.0, 0.0, -5.0, 0)))
            .is_none());
        let event = h
            .engine
            .push_sample(SensorSample::Accel(AccelSample::new(0.0, 3.0, 9.8)))
            .unwrap();
        assert_eq!(event.kind, MovementKind::Up);
        assert_eq!(event.source, Source::Esp32);
    }

    #[test]
    fn test_missing_model_reports_not_loaded() {
        let h = harness(EngineBuilder::new().load_model(|| {
            Err(KineticError::Inference("model asset missing".into()))
        }));
        assert!(!h.engine.model_loaded());
        assert_eq!(h.engine.last_activity(), ActivityLabel::AiNotLoaded);
        assert!(!h.engine.status().contains(Status::MODEL_LOADED));
    }

    #[test]
    fn test_device_packets_update_info() {
        let h = harness(EngineBuilder::new());
        let device = ScriptedDevice::new([
            r#"{"boot":1,"fw":"2.0.1","who":229,"gyro":"OFF"}"#,
            r#"{"event":"ack","cmd":"ON"}"#,
            r#"{"error":"fifo overflow"}"#,
            "MOVE:FORWARD",
        ])
        .with_name("KP-ESP32")
        .chunked(5);
        h.engine.attach_device(device).unwrap();
        assert!(h.engine.wait_device_finished(TIMEOUT));

        let info = h.engine.device_info();
        assert_eq!(info.name, "KP-ESP32");
        assert_eq!(info.firmware_version.as_deref(), Some("2.0.1"));
        assert_eq!(info.who_am_i.as_deref(), Some("0xE5"));
        assert_eq!(info.imu_on, Some(true));
        assert_eq!(info.last_ack.as_deref(), Some("ON"));
        assert_eq!(info.last_error.as_deref(), Some("fifo overflow"));

        let event = h.engine.recv_event_timeout(TIMEOUT).unwrap();
        assert_eq!(event.kind, MovementKind::Up);
        assert!(!h.engine.status().contains(Status::DEVICE_ATTACHED));
        h.engine.detach_device();
    }

    #[test]
    fn test_waiting_for_device_does_not_block_other_calls() {
        let h = harness(EngineBuilder::new());
        let lines: Vec<String> = (0..50).map(|_| "ACCEL:0.1,0.1,9.8".to_string()).collect();
        let device = ScriptedDevice::new(lines).paced(Duration::from_millis(200));
        h.engine.attach_device(device).unwrap();

        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| h.engine.wait_device_finished(TIMEOUT));
            std::thread::sleep(Duration::from_millis(50));

            let started = std::time::Instant::now();
            assert!(h.engine.status().contains(Status::DEVICE_ATTACHED));
            h.engine.detach_device();
            assert!(started.elapsed() < Duration::from_secs(1));

            assert!(waiter.join().is_ok());
        });
    }

    #[test]
    fn test_notification_chunks_and_sync() {
        let syncs = Arc::new(Mutex::new(Vec::new()));
        let sink = syncs.clone();
        let h = harness(
            EngineBuilder::new()
                .user_id("u-1")
                .feedback(Feedback::new().on_sync(move |p| sink.lock().unwrap().push(p.to_json()))),
        );
        assert!(h.engine.push_ble_notification(b"MOVE:LE").is_empty());
        let events = h.engine.push_ble_notification(b"FT\nMOVE:RIGHT\n");
        assert_eq!(events.len(), 1);

        let syncs = syncs.lock().unwrap();
        assert_eq!(syncs.len(), 1);
        assert!(syncs[0].contains("\"leftCount\":1"));
        assert!(syncs[0].contains("\"userId\":\"u-1\""));
    }

    #[test]
    fn test_reset_and_status() {
        let h = harness(EngineBuilder::new().gyro_available(false));
        let status = h.engine.status();
        assert!(status.contains(Status::AUTO_DETECTION));
        assert!(!status.contains(Status::GYRO_AVAILABLE));

        h.engine.enable_live_detection(true);
        assert!(!h.engine.status().contains(Status::LIVE_DETECTION));

        h.engine.push_ble_line("MOVE:UP");
        h.engine.enable_auto_detection(false);
        assert!(!h.engine.status().contains(Status::AUTO_DETECTION));
        h.engine.reset();
        assert_eq!(h.engine.counts().total(), 0);
        assert!(h.engine.status().contains(Status::AUTO_DETECTION));
        assert_eq!(h.engine.try_recv_event().unwrap(), None);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = PipelineConfig::default();
        config.gyro.calibration_phase_ms = 100;
        assert!(matches!(
            EngineBuilder::new().config(config).build(),
            Err(KineticError::InvalidConfig(_))
        ));
    }
}
