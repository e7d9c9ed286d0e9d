//! Bluetooth Service Module
//!
//! Runs the scanner and every tracker connection on a dedicated thread.
//! WinRT callbacks only forward into channels; all state lives in [`run`].

use super::connection::{self, BleConnection, ConnectedTracker, ConnectionConfig};
use super::protocol;
use super::scanner::{BleScanner, ScannedTracker};
use super::BleCommand;
use crate::domain::frame::BleCharacteristic;
use crate::domain::models::TransportEvent;
use crate::domain::settings::BluetoothSettings;
use anyhow::Result;
use std::collections::HashMap;
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;

pub(super) fn spawn(
    settings: BluetoothSettings,
    events: mpsc::UnboundedSender<TransportEvent>,
    commands: mpsc::UnboundedReceiver<BleCommand>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name("bluetooth".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Failed to build BLE runtime: {}", e);
                    let _ = events.send(TransportEvent::ChannelFailed {
                        channel: "bluetooth".to_string(),
                        reason: e.to_string(),
                    });
                    return;
                }
            };
            rt.block_on(async move {
                if let Err(e) = run(settings, events.clone(), commands).await {
                    error!("Bluetooth service failed: {}", e);
                    let _ = events.send(TransportEvent::ChannelFailed {
                        channel: "bluetooth".to_string(),
                        reason: e.to_string(),
                    });
                }
            });
        })
        .map(|_| ())
}

async fn run(
    settings: BluetoothSettings,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut commands: mpsc::UnboundedReceiver<BleCommand>,
) -> Result<()> {
    let (found_tx, mut found_rx) = mpsc::unbounded_channel::<ScannedTracker>();
    let (lost_tx, mut lost_rx) = mpsc::unbounded_channel::<String>();

    let mut scanner = BleScanner::new(found_tx);
    scanner.start(&settings.name_prefix, settings.debug_show_all_devices)?;

    let connection = BleConnection::new(ConnectionConfig {
        max_retries: settings.connect_max_retries,
        retry_delay_ms: settings.connect_retry_delay_ms,
    });
    let mut trackers: HashMap<String, ConnectedTracker> = HashMap::new();

    loop {
        tokio::select! {
            Some(found) = found_rx.recv() => {
                if trackers.contains_key(&found.name) {
                    continue;
                }
                match connection.connect(&found.name, found.address).await {
                    Ok(tracker) => {
                        if let Err(e) = subscribe(&found.name, &tracker, &events, &lost_tx) {
                            warn!(tracker = %found.name, "Failed to subscribe: {}", e);
                            tracker.close();
                            continue;
                        }
                        info!(tracker = %found.name, "Tracker connected over BLE");
                        let _ = events.send(TransportEvent::BleConnected {
                            tracker_id: found.name.clone(),
                        });
                        trackers.insert(found.name, tracker);
                    }
                    Err(e) => {
                        let _ = events.send(TransportEvent::ChannelFailed {
                            channel: found.name,
                            reason: e.to_string(),
                        });
                    }
                }
            }
            Some(name) = lost_rx.recv() => {
                if let Some(tracker) = trackers.remove(&name) {
                    info!(tracker = %name, "Tracker disconnected");
                    tracker.close();
                    let _ = events.send(TransportEvent::BleDisconnected { tracker_id: name });
                }
            }
            command = commands.recv() => match command {
                Some(BleCommand::Write { tracker_id, characteristic, value, reply }) => {
                    let result = match trackers.get(&tracker_id) {
                        Some(tracker) => tracker
                            .write(characteristic, &value)
                            .await
                            .map_err(|e| e.to_string()),
                        None => Err("tracker not connected".to_string()),
                    };
                    let _ = reply.send(result);
                }
                Some(BleCommand::Stop) | None => break,
            },
        }
    }

    scanner.stop()?;
    for (name, tracker) in trackers.drain() {
        tracker.close();
        let _ = events.send(TransportEvent::BleDisconnected { tracker_id: name });
    }
    info!("Bluetooth service stopped");
    Ok(())
}

/// Forward notifications and connection loss of one tracker
fn subscribe(
    name: &str,
    tracker: &ConnectedTracker,
    events: &mpsc::UnboundedSender<TransportEvent>,
    lost: &mpsc::UnboundedSender<String>,
) -> Result<()> {
    for (&kind, characteristic) in &tracker.characteristics {
        if !protocol::is_notifying(kind) {
            continue;
        }
        let handler = notification_handler(name.to_string(), kind, events.clone());
        characteristic.ValueChanged(&handler)?;
    }

    let lost = lost.clone();
    let tracker_id = name.to_string();
    let status_handler =
        TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
            if let Some(dev) = dev.as_ref() {
                if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                    let _ = lost.send(tracker_id.clone());
                }
            }
            Ok(())
        });
    tracker.device.ConnectionStatusChanged(&status_handler)?;
    Ok(())
}

fn notification_handler(
    tracker_id: String,
    characteristic: BleCharacteristic,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> TypedEventHandler<GattCharacteristic, GattValueChangedEventArgs> {
    TypedEventHandler::new(
        move |_: windows::core::Ref<GattCharacteristic>,
              args: windows::core::Ref<GattValueChangedEventArgs>| {
            if let Some(args) = args.as_ref() {
                match connection::read_buffer(&args.CharacteristicValue()?) {
                    Ok(data) => {
                        let _ = events.send(TransportEvent::BleNotification {
                            tracker_id: tracker_id.clone(),
                            characteristic,
                            data,
                        });
                    }
                    Err(e) => debug!(tracker = %tracker_id, "Unreadable notification: {}", e),
                }
            }
            Ok(())
        },
    )
}
