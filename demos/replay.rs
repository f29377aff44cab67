//! Replay recorded ESP32 BLE payloads through the motion engine.
//!
//! Usage: cargo run --example replay [capture.txt]
//! Without a file, a short built-in session is replayed. Each accepted
//! movement is printed as one JSON line.

use std::time::Duration;

use kinetic_pulse::{
    Feedback, MotionEngine, MovementKind, ScriptedDevice, SensorSource, SyncPayload,
};

/// Longer than the default 1500 ms cooldown.
const PACE: Duration = Duration::from_millis(1600);

const BUILTIN: &[&str] = &[
    r#"{"boot":1,"fw":"1.3.0","who":229,"gyro":"ON"}"#,
    r#"{"event":"motion","ax":0.1,"ay":0.0,"az":9.8}"#,
    r#"{"event":"motion","ax":-3.2,"ay":0.4,"az":9.6}"#,
    "ACCEL:0.2,0.1,9.8",
    "MOVE:RIGHT",
    "Jump detected! Yahoo! ^^",
    r#"{"event":"ack","cmd":"OFF"}"#,
];

fn main() {
    env_logger::init();

    let lines: Vec<String> = match std::env::args().nth(1) {
        Some(path) => match std::fs::read_to_string(&path) {
            Ok(text) => text.lines().map(str::to_string).collect(),
            Err(e) => {
                eprintln!("Failed to read {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => BUILTIN.iter().map(|s| s.to_string()).collect(),
    };

    let feedback = Feedback::new()
        .on_movement(|event| match serde_json::to_string(event) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to encode event: {}", e),
        })
        .on_led(|led| log::info!("LED -> '{}'", led.code() as char))
        .on_sync(|payload: &SyncPayload| log::info!("sync {}", payload.to_json()));

    let engine = match MotionEngine::builder()
        .source(SensorSource::Esp32Accel)
        .user_id("replay")
        .feedback(feedback)
        .build()
    {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Failed to start engine: {}", e);
            std::process::exit(1);
        }
    };

    // Lines arrive further apart than the movement cooldown, so every
    // distinct movement in the capture can land.
    let device = ScriptedDevice::new(&lines)
        .with_name("replay")
        .paced(PACE);
    if let Err(e) = engine.attach_device(device) {
        eprintln!("Failed to attach device: {}", e);
        std::process::exit(1);
    }

    let budget = (PACE + Duration::from_millis(100)) * (lines.len() as u32 + 2);
    if !engine.wait_device_finished(budget) {
        eprintln!("Replay did not finish in {:?}", budget);
    }

    let info = engine.device_info();
    let counts = engine.counts();
    println!();
    println!("Device:   {} fw={:?} who={:?}", info.name, info.firmware_version, info.who_am_i);
    let tally: Vec<String> = MovementKind::ALL
        .iter()
        .map(|&kind| format!("{}={}", kind.as_str(), counts.get(kind)))
        .collect();
    println!("Counts:   {}", tally.join(" "));
    println!("Status:   {:?}", engine.status());
}
