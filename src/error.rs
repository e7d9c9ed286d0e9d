//! Error types for the tracker bridge

use crate::domain::frame::FrameError;
use crate::domain::tracker_settings::SettingsError;

/// Result type alias
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Bridge error taxonomy
///
/// Every variant is recoverable: the bridge reports it as a log/error event
/// and keeps running with whatever channels are still healthy.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A frame could not be decoded and was dropped
    #[error("Malformed frame from {source_id}: {error}")]
    MalformedFrame {
        source_id: String,
        #[source]
        error: FrameError,
    },

    /// A serial port or BLE peripheral could not be opened
    #[error("Failed to open channel {channel}: {reason}")]
    ChannelOpenFailure { channel: String, reason: String },

    /// Handshake or sensor-info could not be sent; the tracker stays unregistered
    #[error("Registration of {tracker_id} failed: {reason}")]
    RegistrationFailure { tracker_id: String, reason: String },

    /// Outbound UDP send failed
    #[error("Send failed: {0}")]
    SendFailure(#[from] std::io::Error),

    /// No server has answered discovery yet
    #[error("Tracking server not discovered yet")]
    ServerUnavailable,

    /// A settings write to a physical channel failed
    #[error("Settings write to {target} failed: {reason}")]
    SettingsWriteFailure { target: String, reason: String },

    /// Settings value could not be encoded or decoded
    #[error("Invalid settings: {0}")]
    Settings(#[from] SettingsError),

    /// Tracker id is not known to the bridge
    #[error("Unknown tracker: {0}")]
    UnknownTracker(String),

    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Slot id does not fit the wire format
    #[error("Slot {0} exceeds the protocol sensor id range")]
    SlotOutOfRange(u32),

    /// Bridge task is gone
    #[error("Bridge is not running")]
    BridgeStopped,
}
