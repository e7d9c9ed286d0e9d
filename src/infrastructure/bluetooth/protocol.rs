//! Tracker BLE Protocol
//!
//! GATT layout of the wireless trackers: which characteristic carries which
//! frame kind, and how settings are written back.

use crate::domain::frame::BleCharacteristic;
use crate::domain::tracker_settings::{
    AnkleMotion, FpsMode, SensorMode, SettingsError, TrackerSettings,
};
use anyhow::Result;

/// Tracker data service
pub const TRACKER_SERVICE_UUID: &str = "00dbec3a-90aa-11ed-a1eb-0242ac120002";

/// Tracker settings service
pub const SETTINGS_SERVICE_UUID: &str = "ef84369a-90a9-11ed-a1eb-0242ac120002";

/// Standard battery service
pub const BATTERY_SERVICE_UUID: &str = "180f";

/// Bluetooth base UUID that 16-bit ids expand into
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Characteristic table
pub const CHARACTERISTICS: &[(&str, BleCharacteristic)] = &[
    ("00dbf1c6-90aa-11ed-a1eb-0242ac120002", BleCharacteristic::Sensor),
    ("00dbf306-90aa-11ed-a1eb-0242ac120002", BleCharacteristic::Magnetometer),
    ("00dbf450-90aa-11ed-a1eb-0242ac120002", BleCharacteristic::MainButton),
    ("00dbf586-90aa-11ed-a1eb-0242ac120002", BleCharacteristic::SecondaryButton),
    ("2a19", BleCharacteristic::BatteryLevel),
    ("00dbf07c-90aa-11ed-a1eb-0242ac120002", BleCharacteristic::BatteryVoltage),
    ("00dbf1ee-90aa-11ed-a1eb-0242ac120002", BleCharacteristic::ChargeStatus),
    ("ef84c300-90a9-11ed-a1eb-0242ac120002", BleCharacteristic::FpsSetting),
    ("ef8443f6-90a9-11ed-a1eb-0242ac120002", BleCharacteristic::SensorModeSetting),
    ("ef84c305-90a9-11ed-a1eb-0242ac120002", BleCharacteristic::AutoCorrectionSetting),
    ("ef84c301-90a9-11ed-a1eb-0242ac120002", BleCharacteristic::AnkleSetting),
];

/// Parse a full or 16-bit UUID string into its 128-bit value
pub fn parse_uuid(uuid_str: &str) -> Result<u128> {
    let uuid_str = uuid_str.replace('-', "");

    match uuid_str.len() {
        4 => {
            let short = u16::from_str_radix(&uuid_str, 16)?;
            Ok(BASE_UUID | (u128::from(short) << 96))
        }
        32 => Ok(u128::from_str_radix(&uuid_str, 16)?),
        _ => Err(anyhow::anyhow!("Invalid UUID format: {}", uuid_str)),
    }
}

/// Look up which characteristic a UUID belongs to
pub fn characteristic_for(uuid: u128) -> Option<BleCharacteristic> {
    CHARACTERISTICS
        .iter()
        .find(|(s, _)| parse_uuid(s).is_ok_and(|u| u == uuid))
        .map(|(_, c)| *c)
}

pub fn uuid_for(characteristic: BleCharacteristic) -> Option<u128> {
    CHARACTERISTICS
        .iter()
        .find(|(_, c)| *c == characteristic)
        .and_then(|(s, _)| parse_uuid(s).ok())
}

/// Characteristics that push frames; the rest are written only
pub fn is_notifying(characteristic: BleCharacteristic) -> bool {
    !matches!(
        characteristic,
        BleCharacteristic::FpsSetting
            | BleCharacteristic::SensorModeSetting
            | BleCharacteristic::AutoCorrectionSetting
            | BleCharacteristic::AnkleSetting
    )
}

/// Whether an advertised device name belongs to a supported tracker
pub fn is_tracker_name(name: &str, prefix: &str) -> bool {
    !name.is_empty() && name.starts_with(prefix)
}

/// Per-characteristic writes for a settings change, each one byte
pub fn encode_settings(
    settings: &TrackerSettings,
) -> Result<Vec<(BleCharacteristic, Vec<u8>)>, SettingsError> {
    let fps = match settings.fps {
        FpsMode::Fps50 => 1,
        FpsMode::Fps100 => 2,
        FpsMode::Unknown(value) => {
            return Err(SettingsError::Unrepresentable {
                field: "fps",
                value,
            })
        }
    };
    let sensor_mode = match settings.sensor_mode {
        SensorMode::Mode1 => 5,
        SensorMode::Mode2 => 8,
        SensorMode::Unknown(value) => {
            return Err(SettingsError::Unrepresentable {
                field: "sensor mode",
                value,
            })
        }
    };
    let ankle = match settings.ankle_motion {
        AnkleMotion::Enabled => 1,
        AnkleMotion::Disabled => 0,
        AnkleMotion::Unknown(value) => {
            return Err(SettingsError::Unrepresentable {
                field: "ankle motion",
                value,
            })
        }
    };
    let correction = settings.auto_correction.0;
    if correction > crate::domain::tracker_settings::AutoCorrection::ALL {
        return Err(SettingsError::MaskOutOfRange(correction));
    }

    Ok(vec![
        (BleCharacteristic::FpsSetting, vec![fps]),
        (BleCharacteristic::SensorModeSetting, vec![sensor_mode]),
        (BleCharacteristic::AutoCorrectionSetting, vec![correction]),
        (BleCharacteristic::AnkleSetting, vec![ankle]),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tracker_settings::AutoCorrection;

    #[test]
    fn test_parse_uuid() {
        let uuid = parse_uuid(TRACKER_SERVICE_UUID).unwrap();
        assert_eq!(uuid >> 96, 0x00dbec3a);
        assert_eq!(
            parse_uuid("2a19").unwrap(),
            0x0000_2a19_0000_1000_8000_0080_5f9b_34fb
        );
        assert!(parse_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn test_characteristic_table_round_trips() {
        for (_, characteristic) in CHARACTERISTICS {
            let uuid = uuid_for(*characteristic).unwrap();
            assert_eq!(characteristic_for(uuid), Some(*characteristic));
        }
        assert_eq!(characteristic_for(0), None);
        assert!(is_notifying(BleCharacteristic::Sensor));
        assert!(!is_notifying(BleCharacteristic::AnkleSetting));
    }

    #[test]
    fn test_encode_settings() {
        let settings = TrackerSettings {
            fps: FpsMode::Fps100,
            sensor_mode: SensorMode::Mode1,
            auto_correction: AutoCorrection(AutoCorrection::ALL),
            ankle_motion: AnkleMotion::Enabled,
        };
        let writes = encode_settings(&settings).unwrap();
        assert_eq!(
            writes,
            vec![
                (BleCharacteristic::FpsSetting, vec![2]),
                (BleCharacteristic::SensorModeSetting, vec![5]),
                (BleCharacteristic::AutoCorrectionSetting, vec![7]),
                (BleCharacteristic::AnkleSetting, vec![1]),
            ]
        );

        let unknown = TrackerSettings {
            fps: FpsMode::Unknown('7'),
            ..TrackerSettings::default()
        };
        assert!(encode_settings(&unknown).is_err());
    }

    #[test]
    fn test_tracker_name_filter() {
        assert!(is_tracker_name("HaritoraX-W1234", "HaritoraX"));
        assert!(!is_tracker_name("Keyboard", "HaritoraX"));
        assert!(!is_tracker_name("", ""));
    }
}
