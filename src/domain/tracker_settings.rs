//! Tracker settings codec
//!
//! Translates [`TrackerSettings`] to and from the 14-character packed string
//! the tracker firmware uses for its configuration, and builds the paired
//! serial write that keeps both sub-channels of a dongle port in sync.
//!
//! ```text
//! index:  0 1 2 3 4 5 6 7 8 9 10 11 12 13
//!         0 0 0 0 0 F S 0 0 0 C  0  0  A
//!
//! F = posture data rate  ('0' = 50 FPS, '1' = 100 FPS)
//! S = sensor mode        ('1' = mode 1 / magnetometer on, '0' = mode 2)
//! C = auto-correction    (hex digit, accel 0x1 | gyro 0x2 | mag 0x4)
//! A = ankle motion       ('1' = enabled)
//! ```

use serde::{Deserialize, Serialize};

/// Width of the packed settings string
pub const SETTINGS_WIDTH: usize = 14;

const FPS_INDEX: usize = 5;
const SENSOR_MODE_INDEX: usize = 6;
const AUTO_CORRECTION_INDEX: usize = 10;
const ANKLE_INDEX: usize = 13;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("settings string must be at least 14 ASCII characters, got {0:?}")]
    InvalidWidth(String),
    #[error("unsupported FPS mode {0}")]
    UnsupportedFps(u32),
    #[error("unsupported sensor mode {0}")]
    UnsupportedSensorMode(u8),
    #[error("unknown auto-correction source {0:?}")]
    UnknownCorrection(String),
    #[error("auto-correction mask {0:#x} exceeds accel|gyro|mag")]
    MaskOutOfRange(u8),
    #[error("non-hex auto-correction digit {0:?}")]
    InvalidCorrectionDigit(char),
    #[error("{field} holds an unknown value {value:?} and cannot be encoded")]
    Unrepresentable { field: &'static str, value: char },
    #[error("sub-index must be 0 or 1, got {0}")]
    InvalidSubIndex(u8),
}

/// Posture data rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FpsMode {
    Fps50,
    Fps100,
    /// Digit the firmware reported that has no known meaning
    Unknown(char),
}

impl FpsMode {
    pub fn from_rate(rate: u32) -> Result<Self, SettingsError> {
        match rate {
            50 => Ok(Self::Fps50),
            100 => Ok(Self::Fps100),
            other => Err(SettingsError::UnsupportedFps(other)),
        }
    }
}

/// Sensor mode (mode 1 enables the magnetometer)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorMode {
    Mode1,
    Mode2,
    Unknown(char),
}

impl SensorMode {
    pub fn from_number(mode: u8) -> Result<Self, SettingsError> {
        match mode {
            1 => Ok(Self::Mode1),
            2 => Ok(Self::Mode2),
            other => Err(SettingsError::UnsupportedSensorMode(other)),
        }
    }
}

/// Ankle motion detection flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnkleMotion {
    Disabled,
    Enabled,
    Unknown(char),
}

impl From<bool> for AnkleMotion {
    fn from(enabled: bool) -> Self {
        if enabled {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

/// Auto-correction bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AutoCorrection(pub u8);

impl AutoCorrection {
    pub const ACCEL: u8 = 0x1;
    pub const GYRO: u8 = 0x2;
    pub const MAG: u8 = 0x4;
    pub const ALL: u8 = Self::ACCEL | Self::GYRO | Self::MAG;

    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    /// Build a mask from source names ("accel", "gyro", "mag")
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, SettingsError> {
        let mut mask = 0;
        for name in names {
            mask |= match name.as_ref() {
                "accel" => Self::ACCEL,
                "gyro" => Self::GYRO,
                "mag" => Self::MAG,
                other => return Err(SettingsError::UnknownCorrection(other.to_string())),
            };
        }
        Ok(Self(mask))
    }

    pub fn names(&self) -> Vec<&'static str> {
        [(Self::ACCEL, "accel"), (Self::GYRO, "gyro"), (Self::MAG, "mag")]
            .into_iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| name)
            .collect()
    }
}

/// Logical tracker configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerSettings {
    pub fps: FpsMode,
    pub sensor_mode: SensorMode,
    pub auto_correction: AutoCorrection,
    pub ankle_motion: AnkleMotion,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            fps: FpsMode::Fps50,
            sensor_mode: SensorMode::Mode2,
            auto_correction: AutoCorrection(AutoCorrection::ACCEL | AutoCorrection::GYRO),
            ankle_motion: AnkleMotion::Disabled,
        }
    }
}

impl TrackerSettings {
    /// Pack into the firmware configuration string
    pub fn encode(&self) -> Result<String, SettingsError> {
        let fps = match self.fps {
            FpsMode::Fps50 => b'0',
            FpsMode::Fps100 => b'1',
            FpsMode::Unknown(value) => {
                return Err(SettingsError::Unrepresentable {
                    field: "fps",
                    value,
                })
            }
        };
        let sensor_mode = match self.sensor_mode {
            SensorMode::Mode1 => b'1',
            SensorMode::Mode2 => b'0',
            SensorMode::Unknown(value) => {
                return Err(SettingsError::Unrepresentable {
                    field: "sensor mode",
                    value,
                })
            }
        };
        let ankle = match self.ankle_motion {
            AnkleMotion::Enabled => b'1',
            AnkleMotion::Disabled => b'0',
            AnkleMotion::Unknown(value) => {
                return Err(SettingsError::Unrepresentable {
                    field: "ankle motion",
                    value,
                })
            }
        };
        if self.auto_correction.0 > AutoCorrection::ALL {
            return Err(SettingsError::MaskOutOfRange(self.auto_correction.0));
        }

        let mut packed = [b'0'; SETTINGS_WIDTH];
        packed[FPS_INDEX] = fps;
        packed[SENSOR_MODE_INDEX] = sensor_mode;
        packed[AUTO_CORRECTION_INDEX] = b'0' + self.auto_correction.0;
        packed[ANKLE_INDEX] = ankle;

        Ok(packed.iter().map(|&b| b as char).collect())
    }

    /// Unpack a firmware configuration string.
    ///
    /// Unknown digits are kept as-is so the UI can show what the tracker
    /// actually reported.
    pub fn decode(raw: &str) -> Result<Self, SettingsError> {
        let bytes = raw.trim().as_bytes();
        if bytes.len() < SETTINGS_WIDTH || !bytes.is_ascii() {
            return Err(SettingsError::InvalidWidth(raw.to_string()));
        }

        let fps = match bytes[FPS_INDEX] {
            b'0' => FpsMode::Fps50,
            b'1' => FpsMode::Fps100,
            other => FpsMode::Unknown(other as char),
        };
        let sensor_mode = match bytes[SENSOR_MODE_INDEX] {
            b'1' => SensorMode::Mode1,
            b'0' => SensorMode::Mode2,
            other => SensorMode::Unknown(other as char),
        };
        let correction_digit = bytes[AUTO_CORRECTION_INDEX] as char;
        let mask = correction_digit
            .to_digit(16)
            .ok_or(SettingsError::InvalidCorrectionDigit(correction_digit))?;
        let ankle_motion = match bytes[ANKLE_INDEX] {
            b'1' => AnkleMotion::Enabled,
            b'0' => AnkleMotion::Disabled,
            other => AnkleMotion::Unknown(other as char),
        };

        Ok(Self {
            fps,
            sensor_mode,
            auto_correction: AutoCorrection(mask as u8),
            ankle_motion,
        })
    }
}

/// Build the combined serial settings write for one dongle port.
///
/// The firmware only accepts both sub-channels in one frame, so the
/// counterpart's last known string is passed through untouched.
pub fn paired_serial_write(
    sub_index: u8,
    new_settings: &str,
    counterpart: &str,
) -> Result<String, SettingsError> {
    let (first, second) = match sub_index {
        0 => (new_settings, counterpart),
        1 => (counterpart, new_settings),
        other => return Err(SettingsError::InvalidSubIndex(other)),
    };
    Ok(format!("o0:{first}\r\no1:{second}\r\n"))
}

fn default_fps_mode() -> u32 {
    50
}

/// Settings as received from the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsRequest {
    #[serde(default = "default_fps_mode")]
    pub fps_mode: u32,
    pub sensor_mode: u8,
    pub auto_correction: Vec<String>,
    pub ankle_enabled: bool,
}

impl TryFrom<SettingsRequest> for TrackerSettings {
    type Error = SettingsError;

    fn try_from(request: SettingsRequest) -> Result<Self, Self::Error> {
        Ok(Self {
            fps: FpsMode::from_rate(request.fps_mode)?,
            sensor_mode: SensorMode::from_number(request.sensor_mode)?,
            auto_correction: AutoCorrection::from_names(&request.auto_correction)?,
            ankle_motion: request.ankle_enabled.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_settings() -> Vec<TrackerSettings> {
        let mut combos = Vec::new();
        for fps in [FpsMode::Fps50, FpsMode::Fps100] {
            for sensor_mode in [SensorMode::Mode1, SensorMode::Mode2] {
                for mask in [
                    0,
                    AutoCorrection::ACCEL,
                    AutoCorrection::GYRO,
                    AutoCorrection::MAG,
                    AutoCorrection::ACCEL | AutoCorrection::GYRO,
                    AutoCorrection::ACCEL | AutoCorrection::MAG,
                    AutoCorrection::GYRO | AutoCorrection::MAG,
                    AutoCorrection::ALL,
                ] {
                    for ankle in [false, true] {
                        combos.push(TrackerSettings {
                            fps,
                            sensor_mode,
                            auto_correction: AutoCorrection(mask),
                            ankle_motion: ankle.into(),
                        });
                    }
                }
            }
        }
        combos
    }

    #[test]
    fn test_every_combination_round_trips() {
        let combos = all_settings();
        assert_eq!(combos.len(), 2 * 2 * 8 * 2);
        for settings in combos {
            let packed = settings.encode().unwrap();
            assert_eq!(packed.len(), SETTINGS_WIDTH);
            assert_eq!(TrackerSettings::decode(&packed).unwrap(), settings);
        }
    }

    #[test]
    fn test_encode_positions() {
        let settings = TrackerSettings {
            fps: FpsMode::Fps100,
            sensor_mode: SensorMode::Mode1,
            auto_correction: AutoCorrection(AutoCorrection::ACCEL | AutoCorrection::MAG),
            ankle_motion: AnkleMotion::Enabled,
        };
        assert_eq!(settings.encode().unwrap(), "00000110005001");
        assert_eq!(TrackerSettings::default().encode().unwrap(), "00000000003000");
    }

    #[test]
    fn test_decode_surfaces_unknown_digits() {
        let settings = TrackerSettings::decode("0000079000F009").unwrap();
        assert_eq!(settings.fps, FpsMode::Unknown('7'));
        assert_eq!(settings.sensor_mode, SensorMode::Unknown('9'));
        assert_eq!(settings.auto_correction, AutoCorrection(0xF));
        assert_eq!(settings.ankle_motion, AnkleMotion::Unknown('9'));
    }

    #[test]
    fn test_unrepresentable_values_are_rejected() {
        let mut settings = TrackerSettings::default();
        settings.auto_correction = AutoCorrection(0x8);
        assert_eq!(settings.encode(), Err(SettingsError::MaskOutOfRange(0x8)));

        let mut settings = TrackerSettings::default();
        settings.fps = FpsMode::Unknown('3');
        assert!(matches!(
            settings.encode(),
            Err(SettingsError::Unrepresentable { field: "fps", .. })
        ));
    }

    #[test]
    fn test_decode_rejects_short_input() {
        assert!(matches!(
            TrackerSettings::decode("000001"),
            Err(SettingsError::InvalidWidth(_))
        ));
    }

    #[test]
    fn test_paired_write_keeps_counterpart() {
        let write = paired_serial_write(0, "00000110003001", "00000101000000").unwrap();
        assert_eq!(write, "o0:00000110003001\r\no1:00000101000000\r\n");

        let write = paired_serial_write(1, "00000110003001", "00000101000000").unwrap();
        assert_eq!(write, "o0:00000101000000\r\no1:00000110003001\r\n");

        assert_eq!(
            paired_serial_write(2, "a", "b"),
            Err(SettingsError::InvalidSubIndex(2))
        );
    }

    #[test]
    fn test_request_validation() {
        let request: SettingsRequest = serde_json::from_str(
            r#"{"sensor_mode": 1, "auto_correction": ["accel", "mag"], "ankle_enabled": true}"#,
        )
        .unwrap();
        let settings = TrackerSettings::try_from(request).unwrap();
        assert_eq!(settings.fps, FpsMode::Fps50);
        assert_eq!(settings.sensor_mode, SensorMode::Mode1);
        assert_eq!(settings.auto_correction.names(), vec!["accel", "mag"]);

        let missing = serde_json::from_str::<SettingsRequest>(r#"{"fps_mode": 100}"#);
        assert!(missing.is_err());

        let bad = SettingsRequest {
            fps_mode: 60,
            sensor_mode: 1,
            auto_correction: vec![],
            ankle_enabled: false,
        };
        assert_eq!(
            TrackerSettings::try_from(bad),
            Err(SettingsError::UnsupportedFps(60))
        );
    }
}
