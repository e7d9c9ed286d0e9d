//! Tracker frame decoder
//!
//! Turns the raw data a tracker channel delivers into typed [`Frame`]s.
//! Serial dongles deliver text lines (`"<label><sub-index>:<payload>"`),
//! BLE peripherals deliver per-characteristic notifications.
//!
//! # IMU payload layout
//!
//! ```text
//! [0-1]   : rotation x (i16 little-endian, / 180 * 0.01)
//! [2-3]   : rotation y
//! [4-5]   : rotation z (negated)
//! [6-7]   : rotation w (negated)
//! [8-13]  : reserved
//! [14-15] : gravity x (i16 little-endian, / 256), present when len >= 20
//! [16-17] : gravity y
//! [18-19] : gravity z
//! ```

use crate::domain::math::{Quaternion, Vector3};
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Minimum IMU payload length in bytes
pub const IMU_MIN_LEN: usize = 14;
/// IMU payload length that carries gravity
pub const IMU_GRAVITY_LEN: usize = 20;
/// Payload of a discovery frame while the dongle is still scanning
pub const SEARCHING_PAYLOAD: &str = "7f7f7f7f7f7f";

const ROTATION_SCALE: f32 = 0.01 / 180.0;
const GRAVITY_SCALE: f32 = 1.0 / 256.0;
const ANKLE_FRAME_LEN: usize = 24;
const ANKLE_SUFFIX_LEN: usize = 2;
const BUTTON_MAIN_INDEX: usize = 6;
const BUTTON_SUB_INDEX: usize = 9;

/// Trackers omit padding and sometimes leave trailing bits set.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("line {0:?} has no label separator")]
    MissingSeparator(String),
    #[error("label {0:?} has no valid sub-index")]
    InvalidSubIndex(String),
    #[error("IMU payload is {0} bytes, need at least 14")]
    TooShort(usize),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid button payload {0:?}")]
    InvalidButton(String),
    #[error("invalid battery payload: {0}")]
    InvalidBattery(String),
    #[error("battery percentage {0} out of range")]
    BatteryOutOfRange(i64),
    #[error("empty notification")]
    EmptyNotification,
    #[error("line from port {0}, which is not open")]
    UnknownPort(usize),
    #[error("line of {0} bytes exceeds the line limit")]
    LineTooLong(usize),
}

/// Decoded tracker frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Imu(ImuFrame),
    Discovery(DiscoveryFrame),
    Button(ButtonFrame),
    Battery(BatteryFrame),
    Mag(MagStatus),
    /// Packed settings string reported by the tracker
    SettingsEcho(String),
    Unrecognized(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuFrame {
    pub rotation: Quaternion,
    pub acceleration: Vector3,
    pub ankle: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFrame {
    pub raw: String,
    pub searching: bool,
}

/// Button press counters; BLE reports each button separately
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonFrame {
    pub main: Option<u8>,
    pub sub: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeStatus {
    Discharging,
    Charging,
    Charged,
    Unknown,
}

impl ChargeStatus {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "discharging" => Self::Discharging,
            "charging" => Self::Charging,
            "charged" | "full" => Self::Charged,
            _ => Self::Unknown,
        }
    }

    fn from_byte(value: u8) -> Self {
        match value {
            0 => Self::Discharging,
            1 => Self::Charging,
            2 => Self::Charged,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryFrame {
    pub percent: Option<u8>,
    pub voltage_mv: Option<u32>,
    pub charge: Option<ChargeStatus>,
}

/// Magnetometer accuracy reported over BLE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MagStatus {
    Red,
    Yellow,
    Green,
    Unknown(u8),
}

impl From<u8> for MagStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Red,
            1 => Self::Yellow,
            2 => Self::Green,
            other => Self::Unknown(other),
        }
    }
}

/// Characteristics a BLE tracker notifies on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BleCharacteristic {
    Sensor,
    Magnetometer,
    MainButton,
    SecondaryButton,
    BatteryLevel,
    BatteryVoltage,
    ChargeStatus,
    FpsSetting,
    SensorModeSetting,
    AutoCorrectionSetting,
    AnkleSetting,
}

/// A serial line split into its parts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialLine<'a> {
    pub label: &'a str,
    pub sub_index: u8,
    pub payload: &'a str,
}

/// Split `"<label><sub-index>:<payload>"`
pub fn split_serial_line(line: &str) -> Result<SerialLine<'_>, FrameError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (head, payload) = line
        .split_once(':')
        .ok_or_else(|| FrameError::MissingSeparator(line.to_string()))?;

    let digit_at = head
        .find(|c: char| c.is_ascii_digit())
        .ok_or_else(|| FrameError::InvalidSubIndex(head.to_string()))?;
    let (label, index) = head.split_at(digit_at);
    let sub_index = match index.parse::<u8>() {
        Ok(i @ (0 | 1)) => i,
        _ => return Err(FrameError::InvalidSubIndex(head.to_string())),
    };

    Ok(SerialLine {
        label,
        sub_index,
        payload,
    })
}

/// Decode a serial payload by its label
pub fn decode_serial(line: &SerialLine<'_>) -> Result<Frame, FrameError> {
    match line.label {
        "x" => decode_imu_text(line.payload).map(Frame::Imu),
        "a" => Ok(Frame::Discovery(DiscoveryFrame {
            raw: line.payload.to_string(),
            searching: line.payload == SEARCHING_PAYLOAD,
        })),
        "r" => decode_button_text(line.payload).map(Frame::Button),
        "v" => decode_battery_json(line.payload).map(Frame::Battery),
        "o" => Ok(Frame::SettingsEcho(line.payload.to_string())),
        _ => Ok(Frame::Unrecognized(format!(
            "{}{}:{}",
            line.label, line.sub_index, line.payload
        ))),
    }
}

/// Decode a BLE notification
pub fn decode_ble(characteristic: BleCharacteristic, data: &[u8]) -> Result<Frame, FrameError> {
    let first = *data.first().ok_or(FrameError::EmptyNotification)?;

    match characteristic {
        BleCharacteristic::Sensor => {
            let (rotation, acceleration) = decode_imu_bytes(data)?;
            Ok(Frame::Imu(ImuFrame {
                rotation,
                acceleration,
                ankle: None,
            }))
        }
        BleCharacteristic::Magnetometer => Ok(Frame::Mag(MagStatus::from(first))),
        BleCharacteristic::MainButton => Ok(Frame::Button(ButtonFrame {
            main: Some(first),
            sub: None,
        })),
        BleCharacteristic::SecondaryButton => Ok(Frame::Button(ButtonFrame {
            main: None,
            sub: Some(first),
        })),
        BleCharacteristic::BatteryLevel => {
            if first > 100 {
                return Err(FrameError::BatteryOutOfRange(i64::from(first)));
            }
            Ok(Frame::Battery(BatteryFrame {
                percent: Some(first),
                voltage_mv: None,
                charge: None,
            }))
        }
        BleCharacteristic::BatteryVoltage => {
            let voltage = match data {
                [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
                _ => u16::from(first),
            };
            Ok(Frame::Battery(BatteryFrame {
                percent: None,
                voltage_mv: Some(u32::from(voltage)),
                charge: None,
            }))
        }
        BleCharacteristic::ChargeStatus => Ok(Frame::Battery(BatteryFrame {
            percent: None,
            voltage_mv: None,
            charge: Some(ChargeStatus::from_byte(first)),
        })),
        other => Ok(Frame::Unrecognized(format!("{other:?}: {data:02X?}"))),
    }
}

/// Decode rotation and gravity from a raw IMU blob
pub fn decode_imu_bytes(bytes: &[u8]) -> Result<(Quaternion, Vector3), FrameError> {
    if bytes.len() < IMU_MIN_LEN {
        return Err(FrameError::TooShort(bytes.len()));
    }

    let component = |offset: usize| f32::from(i16::from_le_bytes([bytes[offset], bytes[offset + 1]]));

    let rotation = Quaternion {
        x: component(0) * ROTATION_SCALE,
        y: component(2) * ROTATION_SCALE,
        z: -component(4) * ROTATION_SCALE,
        w: -component(6) * ROTATION_SCALE,
    };

    let acceleration = if bytes.len() >= IMU_GRAVITY_LEN {
        Vector3 {
            x: component(14) * GRAVITY_SCALE,
            y: component(16) * GRAVITY_SCALE,
            z: component(18) * GRAVITY_SCALE,
        }
    } else {
        Vector3::ZERO
    };

    Ok((rotation, acceleration))
}

/// Decode a base64 IMU payload, splitting off the ankle suffix if present
pub fn decode_imu_text(payload: &str) -> Result<ImuFrame, FrameError> {
    let has_ankle = payload.len() == ANKLE_FRAME_LEN && !payload.ends_with("==");

    let (core, ankle) = if has_ankle && payload.is_char_boundary(ANKLE_FRAME_LEN - ANKLE_SUFFIX_LEN)
    {
        let (core, suffix) = payload.split_at(ANKLE_FRAME_LEN - ANKLE_SUFFIX_LEN);
        let ankle = match decode_ankle_suffix(suffix) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring undecodable ankle data {:?}: {}", suffix, e);
                None
            }
        };
        (core, ankle)
    } else {
        (payload, None)
    };

    let bytes = PAYLOAD_ENGINE.decode(core)?;
    let (rotation, acceleration) = decode_imu_bytes(&bytes)?;

    Ok(ImuFrame {
        rotation,
        acceleration,
        ankle,
    })
}

fn decode_ankle_suffix(suffix: &str) -> Result<u8, FrameError> {
    let bytes = PAYLOAD_ENGINE.decode(suffix)?;
    bytes.first().copied().ok_or(FrameError::TooShort(0))
}

/// Decode the button counters (index 6 = main, index 9 = sub)
pub fn decode_button_text(payload: &str) -> Result<ButtonFrame, FrameError> {
    let bytes = payload.as_bytes();
    let digit = |index: usize| {
        bytes
            .get(index)
            .and_then(|&b| (b as char).to_digit(16))
            .map(|d| d as u8)
            .ok_or_else(|| FrameError::InvalidButton(payload.to_string()))
    };

    Ok(ButtonFrame {
        main: Some(digit(BUTTON_MAIN_INDEX)?),
        sub: Some(digit(BUTTON_SUB_INDEX)?),
    })
}

#[derive(Debug, Deserialize)]
struct BatteryPayload {
    #[serde(rename = "battery remaining")]
    remaining: i64,
    #[serde(rename = "battery voltage")]
    voltage: u32,
    #[serde(rename = "charge status", default)]
    charge_status: Option<String>,
}

/// Decode the JSON battery report
pub fn decode_battery_json(payload: &str) -> Result<BatteryFrame, FrameError> {
    let report: BatteryPayload =
        serde_json::from_str(payload).map_err(|e| FrameError::InvalidBattery(e.to_string()))?;

    let percent = u8::try_from(report.remaining)
        .ok()
        .filter(|p| *p <= 100)
        .ok_or(FrameError::BatteryOutOfRange(report.remaining))?;

    Ok(BatteryFrame {
        percent: Some(percent),
        voltage_mv: Some(report.voltage),
        charge: report.charge_status.as_deref().map(ChargeStatus::parse),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_imu(rotation: Quaternion, gravity: Option<Vector3>) -> Vec<u8> {
        let quantize = |v: f32, scale: f32| ((v / scale).round() as i16).to_le_bytes();
        let mut bytes = Vec::new();
        bytes.extend(quantize(rotation.x, ROTATION_SCALE));
        bytes.extend(quantize(rotation.y, ROTATION_SCALE));
        bytes.extend(quantize(-rotation.z, ROTATION_SCALE));
        bytes.extend(quantize(-rotation.w, ROTATION_SCALE));
        bytes.extend([0u8; 6]);
        if let Some(g) = gravity {
            bytes.extend(quantize(g.x, GRAVITY_SCALE));
            bytes.extend(quantize(g.y, GRAVITY_SCALE));
            bytes.extend(quantize(g.z, GRAVITY_SCALE));
        }
        bytes
    }

    #[test]
    fn test_imu_round_trip_within_quantization() {
        let samples = [
            (
                Quaternion::new(0.1, -0.2, 0.3, 0.927),
                Vector3::new(0.0, 9.81, -0.5),
            ),
            (Quaternion::IDENTITY, Vector3::new(-3.25, 1.0, 12.0)),
            (
                Quaternion::new(-0.5, 0.5, -0.5, 0.5),
                Vector3::new(0.004, -0.004, 0.0),
            ),
        ];

        for (rotation, gravity) in samples {
            let bytes = encode_imu(rotation, Some(gravity));
            let (r, g) = decode_imu_bytes(&bytes).unwrap();
            let rot_tol = ROTATION_SCALE / 2.0 + 1e-6;
            assert!((r.x - rotation.x).abs() <= rot_tol);
            assert!((r.y - rotation.y).abs() <= rot_tol);
            assert!((r.z - rotation.z).abs() <= rot_tol);
            assert!((r.w - rotation.w).abs() <= rot_tol);
            let acc_tol = GRAVITY_SCALE / 2.0 + 1e-6;
            assert!((g.x - gravity.x).abs() <= acc_tol);
            assert!((g.y - gravity.y).abs() <= acc_tol);
            assert!((g.z - gravity.z).abs() <= acc_tol);
        }
    }

    #[test]
    fn test_imu_without_gravity_is_zero() {
        let bytes = encode_imu(Quaternion::new(0.0, 0.0, 0.6, 0.8), None);
        assert_eq!(bytes.len(), IMU_MIN_LEN);
        let (_, g) = decode_imu_bytes(&bytes).unwrap();
        assert_eq!(g, Vector3::ZERO);
    }

    #[test]
    fn test_z_and_w_are_negated() {
        let mut bytes = vec![0u8; IMU_MIN_LEN];
        bytes[4..6].copy_from_slice(&18000i16.to_le_bytes());
        bytes[6..8].copy_from_slice(&(-18000i16).to_le_bytes());
        let (r, _) = decode_imu_bytes(&bytes).unwrap();
        assert!((r.z + 1.0).abs() < 1e-6);
        assert!((r.w - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_short_imu_is_malformed() {
        assert_eq!(
            decode_imu_bytes(&[0u8; 13]),
            Err(FrameError::TooShort(13))
        );
        let short = PAYLOAD_ENGINE.encode([0u8; 10]);
        assert_eq!(decode_imu_text(&short), Err(FrameError::TooShort(10)));
    }

    #[test]
    fn test_padded_24_char_frame_is_plain_imu() {
        let mut bytes = encode_imu(Quaternion::IDENTITY, None);
        bytes.extend([0, 0]);
        let payload = PAYLOAD_ENGINE.encode(&bytes);
        assert_eq!(payload.len(), 24);
        assert!(payload.ends_with("=="));
        let frame = decode_imu_text(&payload).unwrap();
        assert_eq!(frame.ankle, None);
        assert!((frame.rotation.w - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_ankle_suffix_is_split_off() {
        let mut bytes = encode_imu(Quaternion::new(0.0, 0.6, 0.0, 0.8), None);
        bytes.extend([0, 0]);
        let core = PAYLOAD_ENGINE.encode(&bytes);
        // 16 bytes encode to 22 significant characters plus "=="
        let core = core.trim_end_matches('=');
        assert_eq!(core.len(), 22);
        let suffix = PAYLOAD_ENGINE.encode([0x5Au8]);
        let payload = format!("{}{}", core, suffix.trim_end_matches('='));
        assert_eq!(payload.len(), 24);

        let frame = decode_imu_text(&payload).unwrap();
        assert_eq!(frame.ankle, Some(0x5A));
        assert!((frame.rotation.y - 0.6).abs() < 1e-3);
    }

    #[test]
    fn test_bad_ankle_suffix_is_not_fatal() {
        let mut bytes = encode_imu(Quaternion::IDENTITY, None);
        bytes.extend([0, 0]);
        let core = PAYLOAD_ENGINE.encode(&bytes);
        let payload = format!("{}!!", core.trim_end_matches('='));
        let frame = decode_imu_text(&payload).unwrap();
        assert_eq!(frame.ankle, None);
    }

    #[test]
    fn test_split_serial_line() {
        let line = split_serial_line("x1:AAAA\r\n").unwrap();
        assert_eq!(line.label, "x");
        assert_eq!(line.sub_index, 1);
        assert_eq!(line.payload, "AAAA");

        assert!(matches!(
            split_serial_line("garbage"),
            Err(FrameError::MissingSeparator(_))
        ));
        assert!(matches!(
            split_serial_line("x2:AAAA"),
            Err(FrameError::InvalidSubIndex(_))
        ));
        assert!(matches!(
            split_serial_line("x:AAAA"),
            Err(FrameError::InvalidSubIndex(_))
        ));
    }

    #[test]
    fn test_discovery_frames() {
        let line = split_serial_line("a0:7f7f7f7f7f7f").unwrap();
        assert_eq!(
            decode_serial(&line).unwrap(),
            Frame::Discovery(DiscoveryFrame {
                raw: SEARCHING_PAYLOAD.to_string(),
                searching: true
            })
        );
        let line = split_serial_line("a1:7f7f7f7f7f00").unwrap();
        assert!(matches!(
            decode_serial(&line).unwrap(),
            Frame::Discovery(DiscoveryFrame {
                searching: false,
                ..
            })
        ));
    }

    #[test]
    fn test_button_counters() {
        let frame = decode_button_text("000000300a00").unwrap();
        assert_eq!(frame.main, Some(3));
        assert_eq!(frame.sub, Some(10));
        assert!(decode_button_text("00000").is_err());
        assert!(decode_button_text("000000z00000").is_err());
    }

    #[test]
    fn test_battery_json() {
        let frame = decode_battery_json(
            r#"{"battery remaining": 87, "battery voltage": 4012, "charge status": "Discharging"}"#,
        )
        .unwrap();
        assert_eq!(frame.percent, Some(87));
        assert_eq!(frame.voltage_mv, Some(4012));
        assert_eq!(frame.charge, Some(ChargeStatus::Discharging));

        assert!(matches!(
            decode_battery_json("{not json"),
            Err(FrameError::InvalidBattery(_))
        ));
        assert_eq!(
            decode_battery_json(r#"{"battery remaining": 140, "battery voltage": 4000}"#),
            Err(FrameError::BatteryOutOfRange(140))
        );
    }

    #[test]
    fn test_unknown_label_is_unrecognized() {
        let line = split_serial_line("i0:HaritoraX").unwrap();
        assert_eq!(
            decode_serial(&line).unwrap(),
            Frame::Unrecognized("i0:HaritoraX".to_string())
        );
    }

    #[test]
    fn test_ble_notifications() {
        assert_eq!(
            decode_ble(BleCharacteristic::MainButton, &[4]).unwrap(),
            Frame::Button(ButtonFrame {
                main: Some(4),
                sub: None
            })
        );
        assert_eq!(
            decode_ble(BleCharacteristic::BatteryVoltage, &[0xA0, 0x0F]).unwrap(),
            Frame::Battery(BatteryFrame {
                percent: None,
                voltage_mv: Some(4000),
                charge: None
            })
        );
        assert_eq!(
            decode_ble(BleCharacteristic::Magnetometer, &[2]).unwrap(),
            Frame::Mag(MagStatus::Green)
        );
        assert_eq!(
            decode_ble(BleCharacteristic::Sensor, &[]),
            Err(FrameError::EmptyNotification)
        );
        assert_eq!(
            decode_ble(BleCharacteristic::BatteryLevel, &[101]),
            Err(FrameError::BatteryOutOfRange(101))
        );
    }
}
