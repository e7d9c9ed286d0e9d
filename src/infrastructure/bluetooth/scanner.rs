//! BLE Scanner Module
//!
//! Watches advertisements and reports trackers by name.

use crate::infrastructure::bluetooth::protocol;
use anyhow::Result;
use tokio::sync::mpsc;
use tracing::info;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Foundation::TypedEventHandler;

/// Advertisement of a tracker
#[derive(Debug, Clone)]
pub struct ScannedTracker {
    pub name: String,
    pub address: u64,
}

pub struct BleScanner {
    watcher: Option<BluetoothLEAdvertisementWatcher>,
    found: mpsc::UnboundedSender<ScannedTracker>,
}

impl BleScanner {
    pub fn new(found: mpsc::UnboundedSender<ScannedTracker>) -> Self {
        Self {
            watcher: None,
            found,
        }
    }

    /// Start scanning for trackers whose name starts with `name_prefix`
    pub fn start(&mut self, name_prefix: &str, show_all_devices: bool) -> Result<()> {
        self.stop()?;
        info!("Starting BLE scan for trackers named {}*", name_prefix);

        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let sender = self.found.clone();
        let prefix = name_prefix.to_string();

        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let name = args.Advertisement()?.LocalName()?.to_string();
                    if show_all_devices || protocol::is_tracker_name(&name, &prefix) {
                        let _ = sender.send(ScannedTracker {
                            name,
                            address: args.BluetoothAddress()?,
                        });
                    }
                }
                Ok(())
            },
        );

        watcher.Received(&handler)?;
        watcher.Start()?;
        self.watcher = Some(watcher);

        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if let Some(watcher) = self.watcher.take() {
            info!("Stopping BLE scan...");
            watcher.Stop()?;
        }
        Ok(())
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
