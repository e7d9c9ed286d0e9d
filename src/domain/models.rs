use crate::domain::frame::{BleCharacteristic, ChargeStatus, FrameError, MagStatus};
use crate::domain::math::{EulerAngles, Quaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Transport a tracker is attached through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Bluetooth,
    Serial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonKind {
    Main,
    Sub,
}

/// Merged battery state of one tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatteryStatus {
    pub percent: Option<u8>,
    pub voltage_mv: Option<u32>,
    pub charge: Option<ChargeStatus>,
}

/// Events published to the UI layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum BridgeEvent {
    Connect {
        tracker_id: String,
        mode: ConnectionMode,
        slot: u32,
    },
    Disconnect {
        tracker_id: String,
    },
    Imu {
        tracker_id: String,
        rotation: Quaternion,
        acceleration: Vector3,
        /// Rotation in degrees, for display
        euler: EulerAngles,
        ankle: Option<u8>,
    },
    Battery {
        tracker_id: String,
        percent: u8,
        voltage_mv: Option<u32>,
        charge: Option<ChargeStatus>,
    },
    Mag {
        tracker_id: String,
        status: MagStatus,
    },
    Button {
        tracker_id: String,
        button: ButtonKind,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

impl BridgeEvent {
    pub fn log(message: impl Into<String>) -> Self {
        Self::Log {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Which transports to start
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub bluetooth: bool,
    #[serde(default)]
    pub serial: Option<SerialStart>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialStart {
    pub ports: Vec<String>,
}

/// Which transports to stop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub bluetooth: bool,
    #[serde(default)]
    pub serial: bool,
}

impl StopRequest {
    pub fn all() -> Self {
        Self {
            bluetooth: true,
            serial: true,
        }
    }
}

/// Raw input delivered by a transport to the bridge loop.
///
/// Serial events carry the generation of the serial session that produced
/// them, so input from a stopped session can be told apart.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One line from the dongle at `port_index`
    SerialLine {
        generation: u64,
        port_index: usize,
        line: String,
    },
    /// A line that was dropped before decoding
    SerialMalformed {
        generation: u64,
        port_index: usize,
        error: FrameError,
    },
    /// The port stopped delivering data
    SerialLost {
        generation: u64,
        port_index: usize,
        reason: String,
    },
    BleConnected { tracker_id: String },
    BleNotification {
        tracker_id: String,
        characteristic: BleCharacteristic,
        data: Vec<u8>,
    },
    BleDisconnected { tracker_id: String },
    /// A channel failed without taking the others down
    ChannelFailed { channel: String, reason: String },
}
