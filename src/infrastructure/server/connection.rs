//! Tracking server connection
//!
//! Owns the UDP socket, the discovered server address, the packet counter
//! and the battery minimum. Nothing is sent to the server before it answered
//! discovery.

use super::packet::{self, BoardInfo, PacketCounter, ServerMessage};
use crate::domain::math::{Quaternion, Vector3};
use crate::domain::models::BridgeEvent;
use crate::domain::settings::ServerSettings;
use crate::error::{BridgeError, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

const RECV_BUFFER_SIZE: usize = 512;

/// Battery values as forwarded to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryReading {
    pub percent: u8,
    pub voltage_mv: Option<u32>,
}

/// Process-wide battery minimum.
///
/// A reading is forwarded when it lowers either field; each field of the
/// minimum is then lowered on its own, so the forwarded pair can mix values
/// from different trackers.
#[derive(Debug, Default)]
pub struct MinimumBattery {
    current: Option<BatteryReading>,
}

impl MinimumBattery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in a reading; returns the minimum to send, if any
    pub fn update(&mut self, incoming: BatteryReading) -> Option<BatteryReading> {
        let Some(min) = self.current else {
            self.current = Some(incoming);
            return self.current;
        };

        let voltage_lower = match (incoming.voltage_mv, min.voltage_mv) {
            (Some(v), Some(m)) => v < m,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if incoming.percent >= min.percent && !voltage_lower {
            return None;
        }

        let lowered = BatteryReading {
            percent: min.percent.min(incoming.percent),
            voltage_mv: match (min.voltage_mv, incoming.voltage_mv) {
                (Some(m), Some(v)) => Some(m.min(v)),
                (m, v) => m.or(v),
            },
        };
        self.current = Some(lowered);
        Some(lowered)
    }

    pub fn current(&self) -> Option<BatteryReading> {
        self.current
    }
}

pub struct ServerConnection {
    socket: UdpSocket,
    server: RwLock<Option<SocketAddr>>,
    broadcast_target: SocketAddr,
    counter: PacketCounter,
    board: BoardInfo,
    battery: Mutex<MinimumBattery>,
}

impl ServerConnection {
    pub async fn bind(settings: &ServerSettings) -> Result<Self> {
        let socket = UdpSocket::bind(&settings.bind_address).await?;
        socket.set_broadcast(true)?;

        let broadcast_ip: IpAddr = settings.broadcast_address.parse().map_err(|_| {
            BridgeError::ChannelOpenFailure {
                channel: "udp".to_string(),
                reason: format!("invalid broadcast address {}", settings.broadcast_address),
            }
        })?;

        info!(
            local = %socket.local_addr()?,
            server_port = settings.server_port,
            "Tracking server socket bound"
        );

        Ok(Self {
            socket,
            server: RwLock::new(None),
            broadcast_target: SocketAddr::new(broadcast_ip, settings.server_port),
            counter: PacketCounter::new(),
            board: BoardInfo {
                board_type: settings.board_type,
                imu_type: settings.imu_type,
                mcu_type: settings.mcu_type,
                firmware_build: settings.firmware_build,
                firmware_name: settings.firmware_name.clone(),
                mac_address: settings.mac_address,
            },
            battery: Mutex::new(MinimumBattery::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        *self.server.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn counter(&self) -> &PacketCounter {
        &self.counter
    }

    fn set_server(&self, addr: SocketAddr) -> bool {
        let mut server = self.server.write().unwrap_or_else(|e| e.into_inner());
        let changed = *server != Some(addr);
        *server = Some(addr);
        changed
    }

    async fn send_to(&self, target: SocketAddr, build: impl FnOnce(u64) -> Vec<u8>) -> Result<()> {
        let buf = build(self.counter.next());
        self.socket.send_to(&buf, target).await?;
        Ok(())
    }

    async fn send(&self, build: impl FnOnce(u64) -> Vec<u8>) -> Result<()> {
        let target = self.server_addr().ok_or(BridgeError::ServerUnavailable)?;
        self.send_to(target, build).await
    }

    pub async fn send_handshake(&self) -> Result<()> {
        self.send(|n| packet::handshake(n, &self.board)).await?;
        debug!("Handshake sent");
        Ok(())
    }

    pub async fn send_sensor_info(&self, slot: u32) -> Result<()> {
        let id = sensor_id(slot)?;
        self.send(|n| packet::sensor_info(n, id, self.board.imu_type))
            .await?;
        debug!(slot, "Sensor info sent");
        Ok(())
    }

    /// Send rotation and acceleration for one slot. Both are attempted; the
    /// first failure is returned.
    pub async fn send_imu(&self, slot: u32, rotation: &Quaternion, accel: &Vector3) -> Result<()> {
        let id = sensor_id(slot)?;
        let rotation_result = self.send(|n| packet::rotation(n, id, rotation)).await;
        let accel_result = self.send(|n| packet::accel(n, id, accel)).await;
        rotation_result.and(accel_result)
    }

    /// Fold a battery reading into the minimum and forward it if it changed.
    pub async fn report_battery(&self, reading: BatteryReading) -> Result<Option<BatteryReading>> {
        let lowered = self
            .battery
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .update(reading);
        let Some(min) = lowered else {
            return Ok(None);
        };

        let voltage = min.voltage_mv.map_or(0.0, |mv| mv as f32 / 1000.0);
        let level = f32::from(min.percent) / 100.0;
        self.send(|n| packet::battery_level(n, voltage, level))
            .await?;
        trace!(percent = min.percent, voltage_mv = ?min.voltage_mv, "Battery minimum sent");
        Ok(Some(min))
    }

    /// React to one datagram from the network
    pub async fn handle_datagram(&self, data: &[u8], from: SocketAddr) -> Result<Option<BridgeEvent>> {
        match packet::parse_server_message(data) {
            Some(ServerMessage::Discovery) => {
                if self.set_server(from) {
                    info!(server = %from, "Tracking server discovered");
                    return Ok(Some(BridgeEvent::log(format!(
                        "Tracking server discovered at {from}"
                    ))));
                }
                Ok(None)
            }
            Some(ServerMessage::Ping(id)) => {
                self.send_to(from, |n| packet::ping_pong(n, id)).await?;
                trace!(id, "Ping answered");
                Ok(None)
            }
            Some(ServerMessage::Heartbeat) => {
                self.send_to(from, packet::heartbeat).await?;
                Ok(None)
            }
            Some(ServerMessage::Other(packet_type)) => {
                trace!(packet_type, %from, "Ignoring server packet");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Receive loop; runs until the task is aborted
    pub async fn run_receiver(self: Arc<Self>, events: broadcast::Sender<BridgeEvent>) {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, from)) => match self.handle_datagram(&buf[..len], from).await {
                    Ok(Some(event)) => {
                        let _ = events.send(event);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(%from, "Failed to answer server: {}", e),
                },
                Err(e) => {
                    // Windows reports ICMP port unreachable as a recv error
                    debug!("UDP receive error: {}", e);
                }
            }
        }
    }

    /// Broadcast handshakes until a server answers
    pub async fn run_discovery_broadcast(self: Arc<Self>, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if self.server_addr().is_some() {
                continue;
            }
            let target = self.broadcast_target;
            if let Err(e) = self
                .send_to(target, |n| packet::handshake(n, &self.board))
                .await
            {
                debug!(%target, "Discovery broadcast failed: {}", e);
            }
        }
    }
}

fn sensor_id(slot: u32) -> Result<u8> {
    u8::try_from(slot).map_err(|_| BridgeError::SlotOutOfRange(slot))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(percent: u8, voltage_mv: u32) -> BatteryReading {
        BatteryReading {
            percent,
            voltage_mv: Some(voltage_mv),
        }
    }

    fn loopback_settings() -> ServerSettings {
        ServerSettings {
            bind_address: "127.0.0.1:0".to_string(),
            broadcast_address: "127.0.0.1".to_string(),
            discovery_interval_ms: 0,
            ..ServerSettings::default()
        }
    }

    fn header(buf: &[u8]) -> (i32, u64) {
        (
            i32::from_be_bytes(buf[0..4].try_into().unwrap()),
            u64::from_be_bytes(buf[4..12].try_into().unwrap()),
        )
    }

    #[test]
    fn test_minimum_battery_sequence() {
        let mut min = MinimumBattery::new();
        let sent: Vec<_> = [reading(90, 4000), reading(85, 4200), reading(95, 3900)]
            .into_iter()
            .filter_map(|r| min.update(r))
            .collect();
        assert_eq!(
            sent,
            vec![reading(90, 4000), reading(85, 4000), reading(85, 3900)]
        );
    }

    #[test]
    fn test_minimum_battery_ignores_higher_readings() {
        let mut min = MinimumBattery::new();
        min.update(reading(50, 3700));
        assert_eq!(min.update(reading(60, 3800)), None);
        assert_eq!(min.update(reading(50, 3700)), None);
        assert_eq!(min.current(), Some(reading(50, 3700)));
    }

    #[test]
    fn test_minimum_battery_without_voltage() {
        let mut min = MinimumBattery::new();
        let level_only = BatteryReading {
            percent: 70,
            voltage_mv: None,
        };
        assert_eq!(min.update(level_only), Some(level_only));
        assert_eq!(min.update(reading(75, 3900)), Some(reading(70, 3900)));
    }

    #[tokio::test]
    async fn test_sends_fail_before_discovery() {
        let conn = ServerConnection::bind(&loopback_settings()).await.unwrap();
        let err = conn.send_handshake().await.unwrap_err();
        assert!(matches!(err, BridgeError::ServerUnavailable));
        assert_eq!(conn.counter().peek(), 0);
    }

    #[tokio::test]
    async fn test_discovery_then_battery_packets() {
        let conn = Arc::new(ServerConnection::bind(&loopback_settings()).await.unwrap());
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let event = conn
            .handle_datagram(b"Hey OVR =D 5", server_addr)
            .await
            .unwrap();
        assert!(matches!(event, Some(BridgeEvent::Log { .. })));
        assert_eq!(conn.server_addr(), Some(server_addr));

        let mut buf = [0u8; 64];
        let mut sent = Vec::new();
        for r in [reading(90, 4000), reading(85, 4200), reading(95, 3900)] {
            if conn.report_battery(r).await.unwrap().is_some() {
                let (len, _) = server.recv_from(&mut buf).await.unwrap();
                let (packet_type, _) = header(&buf[..len]);
                assert_eq!(packet_type, packet::PACKET_BATTERY_LEVEL);
                let voltage = f32::from_be_bytes(buf[12..16].try_into().unwrap());
                let level = f32::from_be_bytes(buf[16..20].try_into().unwrap());
                sent.push(((level * 100.0).round() as u8, (voltage * 1000.0).round() as u32));
            }
        }
        assert_eq!(sent, vec![(90, 4000), (85, 4000), (85, 3900)]);
    }

    #[tokio::test]
    async fn test_imu_sends_rotation_then_accel() {
        let conn = ServerConnection::bind(&loopback_settings()).await.unwrap();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        conn.handle_datagram(b"Hey OVR =D", server.local_addr().unwrap())
            .await
            .unwrap();

        conn.send_imu(2, &Quaternion::IDENTITY, &Vector3::new(0.0, 0.0, 1.0))
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(header(&buf[..len]), (packet::PACKET_ROTATION_DATA, 0));
        assert_eq!(buf[12], 2);
        let (len, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(header(&buf[..len]), (packet::PACKET_ACCEL, 1));
        assert_eq!(buf[24], 2);
    }

    #[tokio::test]
    async fn test_ping_is_echoed() {
        let conn = Arc::new(ServerConnection::bind(&loopback_settings()).await.unwrap());
        let local = conn.local_addr().unwrap();
        let (events, _) = broadcast::channel(8);
        let receiver = tokio::spawn(conn.clone().run_receiver(events));

        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        server
            .send_to(&packet::ping_pong(77, 4321), local)
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), server.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(header(&buf[..len]).0, packet::PACKET_PING_PONG);
        assert_eq!(&buf[12..16], &4321i32.to_be_bytes());
        // The ping does not make the sender the tracking server
        assert_eq!(conn.server_addr(), None);
        receiver.abort();
    }

    #[test]
    fn test_slot_out_of_range() {
        assert!(matches!(sensor_id(256), Err(BridgeError::SlotOutOfRange(256))));
        assert_eq!(sensor_id(255).unwrap(), 255);
    }
}
