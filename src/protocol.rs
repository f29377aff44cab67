//! ESP32 BLE payload framing and parsing.
//!
//! The peripheral speaks newline-terminated UTF-8 over a serial-style BLE
//! characteristic. Depending on firmware generation a line is a JSON object,
//! a `KEY:value` text record or a free-form legacy sentence.

use serde::Deserialize;

use crate::types::{AccelSample, MovementKind};
use crate::{KineticError, Result};

/// A partial line longer than this without a newline is discarded.
pub const MAX_LINE_BYTES: usize = 4096;

// -- Text record prefixes --
pub const PREFIX_ACCEL: &str = "ACCEL:";
pub const PREFIX_MOVE: &str = "MOVE:";

// -- Legacy firmware sentences --
const LEGACY_LEFT: &str = "Lateral-Left Movement Detected";
const LEGACY_RIGHT: &str = "Lateral- Right Movement Detected";
const LEGACY_JUMP: &str = "Jump detected";
const LEGACY_BACK: &[&str] = &["Back Movement Detected", "Backward Jump"];

/// Reassembles newline-terminated lines from arbitrarily split notifications.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every complete, non-empty line (trimmed).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }

        if self.buf.len() > MAX_LINE_BYTES {
            log::warn!(
                "Discarding {} buffered bytes without a line terminator",
                self.buf.len()
            );
            self.buf.clear();
        }
        lines
    }

    /// Bytes held for an incomplete line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// One decoded line from the peripheral.
#[derive(Debug, Clone, PartialEq)]
pub enum BlePacket {
    /// Raw accelerometer triple.
    Accel(AccelSample),
    /// Direction already detected on the device.
    Move(MovementKind),
    /// Command acknowledgement.
    Ack(String),
    /// IMU streaming switched on or off.
    SensorState(bool),
    Boot {
        firmware: Option<String>,
        who_am_i: Option<u32>,
        imu_on: Option<bool>,
    },
    DeviceError(String),
    /// Well-formed but not understood; logged and ignored.
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct JsonPacket {
    event: Option<String>,
    ax: Option<f32>,
    ay: Option<f32>,
    az: Option<f32>,
    cmd: Option<String>,
    state: Option<String>,
    gyro: Option<String>,
    boot: Option<serde_json::Value>,
    fw: Option<String>,
    who: Option<u32>,
    error: Option<String>,
}

/// Decode one trimmed line.
///
/// Malformed numbers (bad JSON types, unparsable `ACCEL:` fields) are errors;
/// anything merely unrecognised is [`BlePacket::Unknown`].
pub fn parse_payload(line: &str) -> Result<BlePacket> {
    let line = line.trim();
    if line.starts_with('{') {
        return parse_json(line);
    }
    if let Some(rest) = line.strip_prefix(PREFIX_ACCEL) {
        return parse_accel_fields(rest).map(BlePacket::Accel);
    }
    if let Some(dir) = line.strip_prefix(PREFIX_MOVE) {
        return Ok(match MovementKind::from_direction(dir) {
            Some(kind) => BlePacket::Move(kind),
            None => BlePacket::Unknown(line.to_string()),
        });
    }
    Ok(match parse_legacy(line) {
        Some(kind) => BlePacket::Move(kind),
        None => BlePacket::Unknown(line.to_string()),
    })
}

fn parse_json(line: &str) -> Result<BlePacket> {
    let packet: JsonPacket = serde_json::from_str(line)
        .map_err(|e| KineticError::MalformedPayload(format!("{}: {}", e, line)))?;

    if packet.boot.is_some() {
        return Ok(BlePacket::Boot {
            firmware: packet.fw,
            who_am_i: packet.who,
            imu_on: packet.gyro.as_deref().and_then(parse_on_off),
        });
    }
    if let Some(err) = packet.error {
        return Ok(BlePacket::DeviceError(err));
    }

    match packet.event.as_deref() {
        Some("ack") => {
            return Ok(BlePacket::Ack(packet.cmd.unwrap_or_else(|| "?".to_string())));
        }
        Some("motion") | None => {}
        Some(event) => {
            return Ok(match MovementKind::from_direction(event) {
                Some(kind) => BlePacket::Move(kind),
                None => BlePacket::Unknown(line.to_string()),
            });
        }
    }

    if let (Some(ax), Some(ay), Some(az)) = (packet.ax, packet.ay, packet.az) {
        return Ok(BlePacket::Accel(AccelSample::new(ax, ay, az)));
    }

    let state = match packet.state.as_deref() {
        Some("GYRO_ON") => Some(true),
        Some("GYRO_OFF") => Some(false),
        _ => packet.gyro.as_deref().and_then(parse_on_off),
    };
    Ok(match state {
        Some(on) => BlePacket::SensorState(on),
        None => BlePacket::Unknown(line.to_string()),
    })
}

fn parse_on_off(value: &str) -> Option<bool> {
    match value.trim().to_ascii_uppercase().as_str() {
        "ON" => Some(true),
        "OFF" => Some(false),
        _ => None,
    }
}

fn parse_accel_fields(fields: &str) -> Result<AccelSample> {
    let values = fields
        .split(',')
        .map(|f| {
            f.trim().parse::<f32>().map_err(|e| {
                KineticError::MalformedPayload(format!("accel field {:?}: {}", f, e))
            })
        })
        .collect::<Result<Vec<f32>>>()?;

    match values.as_slice() {
        [ax, ay, az] => Ok(AccelSample::new(*ax, *ay, *az)),
        _ => Err(KineticError::MalformedPayload(format!(
            "expected 3 accel fields, got {}",
            values.len()
        ))),
    }
}

fn parse_legacy(line: &str) -> Option<MovementKind> {
    if line.contains(LEGACY_LEFT) {
        Some(MovementKind::Left)
    } else if line.contains(LEGACY_JUMP) {
        Some(MovementKind::Up)
    } else if line.contains(LEGACY_RIGHT) {
        Some(MovementKind::Right)
    } else if LEGACY_BACK.iter().any(|s| line.contains(s)) {
        Some(MovementKind::Back)
    } else {
        None
    }
}

/// Single-character LED strip commands understood by the peripheral.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedCommand {
    White,
    Red,
    Blue,
    Green,
    Topaz,
    Lilac,
    Rainbow,
    Strobe,
    Off,
}

impl LedCommand {
    pub fn code(&self) -> u8 {
        match self {
            LedCommand::White => b'w',
            LedCommand::Red => b'r',
            LedCommand::Blue => b'b',
            LedCommand::Green => b'g',
            LedCommand::Topaz => b't',
            LedCommand::Lilac => b'l',
            LedCommand::Rainbow => b'a',
            LedCommand::Strobe => b'm',
            LedCommand::Off => b'o',
        }
    }

    pub fn from_code(code: u8) -> Option<LedCommand> {
        match code {
            b'w' => Some(LedCommand::White),
            b'r' => Some(LedCommand::Red),
            b'b' => Some(LedCommand::Blue),
            b'g' => Some(LedCommand::Green),
            b't' => Some(LedCommand::Topaz),
            b'l' => Some(LedCommand::Lilac),
            b'a' => Some(LedCommand::Rainbow),
            b'm' => Some(LedCommand::Strobe),
            b'o' => Some(LedCommand::Off),
            _ => None,
        }
    }

    /// Colour flashed when a movement is accepted.
    pub fn for_movement(kind: MovementKind) -> LedCommand {
        match kind {
            MovementKind::Left => LedCommand::Blue,
            MovementKind::Right => LedCommand::Green,
            MovementKind::Up => LedCommand::White,
            MovementKind::Back => LedCommand::Red,
            MovementKind::Dance => LedCommand::Rainbow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_split_chunks() {
        let mut asm = LineAssembler::new();
        assert!(asm.push(b"{\"ax\":1.0,").is_empty());
        assert_eq!(asm.pending(), 10);
        let lines = asm.push(b"\"ay\":2,\"az\":3}\r\nMOVE:LE");
        assert_eq!(lines, vec!["{\"ax\":1.0,\"ay\":2,\"az\":3}".to_string()]);
        let lines = asm.push(b"FT\n\n  \nACCEL:1,2,3\n");
        assert_eq!(lines, vec!["MOVE:LEFT".to_string(), "ACCEL:1,2,3".to_string()]);
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn test_assembler_discards_runaway_buffer() {
        let mut asm = LineAssembler::new();
        asm.push(&vec![b'x'; MAX_LINE_BYTES + 1]);
        assert_eq!(asm.pending(), 0);
        assert_eq!(asm.push(b"MOVE:UP\n"), vec!["MOVE:UP".to_string()]);
    }

    #[test]
    fn test_parse_json_accel() {
        let packet = parse_payload(r#"{"event":"motion","ax":0.5,"ay":-2.5,"az":9.8,"gx":1}"#).unwrap();
        assert_eq!(packet, BlePacket::Accel(AccelSample::new(0.5, -2.5, 9.8)));
        let packet = parse_payload(r#"{"ax":1,"ay":2,"az":3}"#).unwrap();
        assert_eq!(packet, BlePacket::Accel(AccelSample::new(1.0, 2.0, 3.0)));
    }

    #[test]
    fn test_parse_json_events() {
        assert_eq!(
            parse_payload(r#"{"event":"left","left_count":3}"#).unwrap(),
            BlePacket::Move(MovementKind::Left)
        );
        assert_eq!(
            parse_payload(r#"{"event":"forward"}"#).unwrap(),
            BlePacket::Move(MovementKind::Up)
        );
        assert_eq!(
            parse_payload(r#"{"event":"ack","cmd":"ON"}"#).unwrap(),
            BlePacket::Ack("ON".into())
        );
        assert_eq!(
            parse_payload(r#"{"state":"GYRO_OFF"}"#).unwrap(),
            BlePacket::SensorState(false)
        );
        assert_eq!(
            parse_payload(r#"{"gyro":"on"}"#).unwrap(),
            BlePacket::SensorState(true)
        );
        assert_eq!(
            parse_payload(r#"{"error":"imu init failed"}"#).unwrap(),
            BlePacket::DeviceError("imu init failed".into())
        );
    }

    #[test]
    fn test_parse_boot_packet() {
        let packet = parse_payload(r#"{"boot":1,"fw":"1.4.2","who":104,"gyro":"ON"}"#).unwrap();
        assert_eq!(
            packet,
            BlePacket::Boot {
                firmware: Some("1.4.2".into()),
                who_am_i: Some(0x68),
                imu_on: Some(true),
            }
        );
    }

    #[test]
    fn test_parse_text_records() {
        assert_eq!(
            parse_payload("ACCEL: 0.1, -3.0 ,9.7").unwrap(),
            BlePacket::Accel(AccelSample::new(0.1, -3.0, 9.7))
        );
        assert_eq!(parse_payload("MOVE:backward").unwrap(), BlePacket::Move(MovementKind::Back));
        assert_eq!(parse_payload("MOVE:UP").unwrap(), BlePacket::Move(MovementKind::Up));
        assert!(matches!(parse_payload("MOVE:SIDEWAYS").unwrap(), BlePacket::Unknown(_)));
    }

    #[test]
    fn test_parse_legacy_sentences() {
        assert_eq!(
            parse_payload("Lateral-Left Movement Detected").unwrap(),
            BlePacket::Move(MovementKind::Left)
        );
        assert_eq!(
            parse_payload("Lateral- Right Movement Detected").unwrap(),
            BlePacket::Move(MovementKind::Right)
        );
        assert_eq!(
            parse_payload("Jump detected! Yahoo! ^^").unwrap(),
            BlePacket::Move(MovementKind::Up)
        );
        assert_eq!(
            parse_payload("Backward Jump").unwrap(),
            BlePacket::Move(MovementKind::Back)
        );
        assert!(matches!(parse_payload("hello").unwrap(), BlePacket::Unknown(_)));
    }

    #[test]
    fn test_malformed_numbers_rejected() {
        assert!(matches!(
            parse_payload("ACCEL:1,abc,3"),
            Err(KineticError::MalformedPayload(_))
        ));
        assert!(parse_payload("ACCEL:1,2").is_err());
        assert!(parse_payload(r#"{"ax":"fast","ay":0,"az":0}"#).is_err());
        assert!(parse_payload("{not json").is_err());
    }

    #[test]
    fn test_led_codes() {
        assert_eq!(LedCommand::for_movement(MovementKind::Left).code(), b'b');
        assert_eq!(LedCommand::for_movement(MovementKind::Right).code(), b'g');
        assert_eq!(LedCommand::for_movement(MovementKind::Up).code(), b'w');
        assert_eq!(LedCommand::for_movement(MovementKind::Back).code(), b'r');
        assert_eq!(LedCommand::for_movement(MovementKind::Dance).code(), b'a');
        assert_eq!(LedCommand::from_code(b'm'), Some(LedCommand::Strobe));
        assert_eq!(LedCommand::from_code(b'z'), None);
    }
}
