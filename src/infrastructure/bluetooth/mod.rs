//! Bluetooth Module
//!
//! BLE communication with wireless trackers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    BluetoothHandle                        │
//! │  (owned by the bridge; sends commands to the BLE thread)  │
//! └─────────────────────┬────────────────────────────────────┘
//!                       │ BleCommand
//!                       ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │           service (own thread, current-thread runtime)    │
//! └─────────────┬──────────────────────────┬─────────────────┘
//!               │                          │
//!               ▼                          ▼
//!        ┌────────────┐            ┌──────────────┐
//!        │  Scanner   │            │  Connection  │
//!        │ - adverts  │            │ - GATT       │
//!        │ - name     │            │ - notify     │
//!        │   filter   │            │ - writes     │
//!        └────────────┘            └──────────────┘
//! ```
//!
//! Notifications and disconnects reach the bridge as
//! [`TransportEvent`]s. The platform backend exists on Windows only; on
//! other targets [`start`] reports a channel failure.

pub mod protocol;

#[cfg(windows)]
mod connection;
#[cfg(windows)]
mod scanner;
#[cfg(windows)]
mod service;

use crate::domain::frame::BleCharacteristic;
use crate::domain::models::TransportEvent;
use crate::domain::settings::BluetoothSettings;
use crate::domain::tracker_settings::TrackerSettings;
use crate::error::{BridgeError, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Request handled on the BLE thread
#[derive(Debug)]
pub enum BleCommand {
    Write {
        tracker_id: String,
        characteristic: BleCharacteristic,
        value: Vec<u8>,
        reply: oneshot::Sender<std::result::Result<(), String>>,
    },
    Stop,
}

/// Bridge-side handle to the BLE backend
#[derive(Clone)]
pub struct BluetoothHandle {
    commands: mpsc::UnboundedSender<BleCommand>,
}

impl BluetoothHandle {
    /// Handle that talks to a caller-provided command channel
    pub fn from_sender(commands: mpsc::UnboundedSender<BleCommand>) -> Self {
        Self { commands }
    }

    async fn write(
        &self,
        tracker_id: &str,
        characteristic: BleCharacteristic,
        value: Vec<u8>,
    ) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(BleCommand::Write {
                tracker_id: tracker_id.to_string(),
                characteristic,
                value,
                reply,
            })
            .map_err(|_| BridgeError::SettingsWriteFailure {
                target: tracker_id.to_string(),
                reason: "bluetooth backend stopped".to_string(),
            })?;

        response
            .await
            .map_err(|_| "bluetooth backend stopped".to_string())
            .and_then(|r| r)
            .map_err(|reason| BridgeError::SettingsWriteFailure {
                target: tracker_id.to_string(),
                reason,
            })
    }

    /// Write every setting of one tracker to its characteristics
    pub async fn write_settings(&self, tracker_id: &str, settings: &TrackerSettings) -> Result<()> {
        for (characteristic, value) in protocol::encode_settings(settings)? {
            debug!(tracker_id, ?characteristic, ?value, "BLE settings write");
            self.write(tracker_id, characteristic, value).await?;
        }
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.commands.send(BleCommand::Stop);
    }
}

/// Start scanning and connecting to trackers
#[cfg(windows)]
pub fn start(
    settings: &BluetoothSettings,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> Result<BluetoothHandle> {
    let (commands, command_rx) = mpsc::unbounded_channel();
    service::spawn(settings.clone(), events, command_rx).map_err(|e| {
        BridgeError::ChannelOpenFailure {
            channel: "bluetooth".to_string(),
            reason: e.to_string(),
        }
    })?;
    Ok(BluetoothHandle { commands })
}

/// Start scanning and connecting to trackers
#[cfg(not(windows))]
pub fn start(
    _settings: &BluetoothSettings,
    _events: mpsc::UnboundedSender<TransportEvent>,
) -> Result<BluetoothHandle> {
    Err(BridgeError::ChannelOpenFailure {
        channel: "bluetooth".to_string(),
        reason: "BLE backend is only available on Windows".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_settings_sends_one_command_per_characteristic() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = BluetoothHandle::from_sender(tx);

        let backend = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(BleCommand::Write {
                tracker_id,
                characteristic,
                value,
                reply,
            }) = rx.recv().await
            {
                assert_eq!(tracker_id, "HaritoraX-W1");
                seen.push((characteristic, value));
                let _ = reply.send(Ok(()));
                if seen.len() == 4 {
                    break;
                }
            }
            seen
        });

        handle
            .write_settings("HaritoraX-W1", &TrackerSettings::default())
            .await
            .unwrap();
        let seen = backend.await.unwrap();
        assert_eq!(seen[0], (BleCharacteristic::FpsSetting, vec![1]));
        assert_eq!(seen[3], (BleCharacteristic::AnkleSetting, vec![0]));
    }

    #[tokio::test]
    async fn test_write_failure_names_the_tracker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = BluetoothHandle::from_sender(tx);
        tokio::spawn(async move {
            if let Some(BleCommand::Write { reply, .. }) = rx.recv().await {
                let _ = reply.send(Err("not connected".to_string()));
            }
        });

        let err = handle
            .write_settings("HaritoraX-W2", &TrackerSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::SettingsWriteFailure { ref target, .. } if target == "HaritoraX-W2"
        ));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_start_reports_channel_failure_off_windows() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = start(&BluetoothSettings::default(), tx).err().unwrap();
        assert!(matches!(err, BridgeError::ChannelOpenFailure { .. }));
    }
}
