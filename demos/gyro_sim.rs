//! Drive the phone-gyro path with a synthetic 60 Hz signal.
//!
//! Usage: cargo run --example gyro_sim
//! Runs calibration on a manual clock, then tilts left, right and back.

use std::sync::Arc;

use kinetic_pulse::{
    CalibrationEvent, Clock, Feedback, GyroSample, ManualClock, MotionEngine, SensorSource,
};

const FRAME_MS: u64 = 16;

fn main() {
    env_logger::init();

    let clock = Arc::new(ManualClock::new(0));
    let feedback = Feedback::new()
        .on_calibration(|event| match event {
            CalibrationEvent::Phase {
                instruction, color, ..
            } => println!("[calibration] {} (#{:08X})", instruction, color),
            other => println!("[calibration] {:?}", other),
        })
        .on_movement(|event| println!("[movement] {} at {}ms", event.kind.as_str(), event.timestamp_ms));

    let engine = match MotionEngine::builder()
        .source(SensorSource::PhoneGyro)
        .clock(clock.clone())
        .feedback(feedback)
        .build()
    {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Failed to start engine: {}", e);
            std::process::exit(1);
        }
    };

    engine.enable_live_detection(true);

    let feed = |wx: f32, wz: f32, frames: u32| {
        for _ in 0..frames {
            let now = clock.advance(FRAME_MS);
            engine.push_gyro(GyroSample::new(wx, 0.0, wz, now as i64 * 1_000_000));
        }
    };

    // Hold still through calibration (6 phases at the default 1200ms).
    feed(0.0, 0.0, 500);

    let rate = 1.0f32;
    // Left, pause past the cooldown, back to centre.
    feed(0.0, -rate, 20);
    feed(0.0, 0.0, 100);
    feed(0.0, rate, 40);
    feed(0.0, 0.0, 100);
    feed(-rate, 0.0, 20);
    feed(0.0, 0.0, 100);

    let counts = engine.counts();
    println!();
    println!(
        "t={}ms  L={} R={} U={} B={}",
        clock.now_ms(),
        counts.left,
        counts.right,
        counts.up,
        counts.back
    );
}
