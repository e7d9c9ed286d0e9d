//! BLE Connection Module
//!
//! Connects to one tracker, collects its known characteristics and
//! subscribes to the ones that notify.

use crate::domain::frame::BleCharacteristic;
use crate::infrastructure::bluetooth::protocol;
use anyhow::Result;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattSession,
};
use windows::Devices::Bluetooth::{BluetoothCacheMode, BluetoothLEDevice};
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// A connected tracker and its characteristics
pub struct ConnectedTracker {
    pub device: BluetoothLEDevice,
    pub characteristics: HashMap<BleCharacteristic, GattCharacteristic>,
    // Dropping the session lets Windows release the link
    _session: Option<GattSession>,
}

pub struct BleConnection {
    config: ConnectionConfig,
}

impl BleConnection {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    /// Connect with retries
    pub async fn connect(&self, name: &str, address: u64) -> Result<ConnectedTracker> {
        let attempts = self.config.max_retries.max(1);
        let mut last_error = anyhow::anyhow!("no connection attempt made");
        for attempt in 1..=attempts {
            match self.try_connect(address).await {
                Ok(tracker) => return Ok(tracker),
                Err(e) => {
                    warn!(tracker = name, attempt, "BLE connection failed: {}", e);
                    last_error = e;
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms))
                            .await;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn try_connect(&self, address: u64) -> Result<ConnectedTracker> {
        info!("Connecting to Bluetooth device: {:#X}", address);
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?.await?;

        let session = match Self::create_gatt_session(&device).await {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Failed to create GattSession, continuing anyway: {}", e);
                None
            }
        };

        let characteristics = Self::get_characteristics(&device).await?;
        if !characteristics.contains_key(&BleCharacteristic::Sensor) {
            anyhow::bail!("Sensor characteristic not found");
        }

        for (kind, characteristic) in &characteristics {
            if protocol::is_notifying(*kind) {
                if let Err(e) = Self::enable_notifications(characteristic).await {
                    // Trackers without e.g. a secondary button stay usable
                    warn!(?kind, "Could not enable notifications: {}", e);
                }
            }
        }

        Ok(ConnectedTracker {
            device,
            characteristics,
            _session: session,
        })
    }

    async fn create_gatt_session(device: &BluetoothLEDevice) -> Result<GattSession> {
        let device_id = device.BluetoothDeviceId()?;
        let session = GattSession::FromDeviceIdAsync(&device_id)?.await?;
        session.SetMaintainConnection(true)?;
        Ok(session)
    }

    async fn get_characteristics(
        device: &BluetoothLEDevice,
    ) -> Result<HashMap<BleCharacteristic, GattCharacteristic>> {
        let services_result = device
            .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        if services_result.Status()? != GattCommunicationStatus::Success {
            anyhow::bail!(
                "Failed to get GATT services: {:?}",
                services_result.Status()?
            );
        }

        let mut found = HashMap::new();
        let services = services_result.Services()?;
        for i in 0..services.Size()? {
            let service = services.GetAt(i)?;
            let chars_result = service.GetCharacteristicsAsync()?.await?;
            if chars_result.Status()? != GattCommunicationStatus::Success {
                debug!("Skipping service {:?}", service.Uuid()?);
                continue;
            }
            let characteristics = chars_result.Characteristics()?;
            for j in 0..characteristics.Size()? {
                let c = characteristics.GetAt(j)?;
                if let Some(kind) = protocol::characteristic_for(c.Uuid()?.to_u128()) {
                    debug!(?kind, "Found characteristic");
                    found.insert(kind, c);
                }
            }
        }

        info!("Found {} tracker characteristics", found.len());
        Ok(found)
    }

    async fn enable_notifications(characteristic: &GattCharacteristic) -> Result<()> {
        for attempt in 1..=3 {
            let status = characteristic
                .WriteClientCharacteristicConfigurationDescriptorAsync(
                    GattClientCharacteristicConfigurationDescriptorValue::Notify,
                )?
                .await?;
            if status == GattCommunicationStatus::Success {
                return Ok(());
            }
            warn!(
                attempt,
                "Notification subscription returned status: {:?}", status
            );
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        anyhow::bail!("Failed to enable notifications")
    }
}

impl ConnectedTracker {
    pub async fn write(&self, kind: BleCharacteristic, value: &[u8]) -> Result<()> {
        let characteristic = self
            .characteristics
            .get(&kind)
            .ok_or_else(|| anyhow::anyhow!("{:?} characteristic not available", kind))?;

        let writer = DataWriter::new()?;
        writer.WriteBytes(value)?;
        let buffer = writer.DetachBuffer()?;
        let status = characteristic.WriteValueAsync(&buffer)?.await?;
        if status != GattCommunicationStatus::Success {
            anyhow::bail!("write returned {:?}", status);
        }
        Ok(())
    }

    pub fn close(&self) {
        let _ = self.device.Close();
    }
}

/// Copy a notification buffer out of WinRT
pub fn read_buffer(buffer: &IBuffer) -> Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let length = reader.UnconsumedBufferLength()? as usize;
    let mut bytes = vec![0u8; length];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}
