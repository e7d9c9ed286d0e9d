//! Tracking server packet encoder
//!
//! Every packet is big-endian and starts with the same header:
//!
//! ```text
//! [0-3]  : packet type (i32)
//! [4-11] : packet counter (u64)
//! [12..] : body
//! ```

use crate::domain::math::{Quaternion, Vector3};
use std::sync::atomic::{AtomicU64, Ordering};

pub const PACKET_HEARTBEAT: i32 = 0;
pub const PACKET_RECEIVE_HEARTBEAT: i32 = 1;
pub const PACKET_HANDSHAKE: i32 = 3;
pub const PACKET_ACCEL: i32 = 4;
pub const PACKET_PING_PONG: i32 = 10;
pub const PACKET_BATTERY_LEVEL: i32 = 12;
pub const PACKET_SENSOR_INFO: i32 = 15;
pub const PACKET_ROTATION_DATA: i32 = 17;

/// Greeting the server answers discovery with
pub const DISCOVERY_REPLY: &[u8] = b"Hey OVR =D";

const HEADER_LEN: usize = 12;
const SENSOR_STATUS_OK: u8 = 1;
const ROTATION_DATA_NORMAL: u8 = 1;
const ROTATION_ACCURACY: u8 = 0;

/// Process-wide packet sequence.
///
/// A value is taken right before each send and is never reused, even if the
/// send fails.
#[derive(Debug, Default)]
pub struct PacketCounter(AtomicU64);

impl PacketCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Value the next send will use
    pub fn peek(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Board description sent with the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardInfo {
    pub board_type: i32,
    pub imu_type: i32,
    pub mcu_type: i32,
    pub firmware_build: i32,
    pub firmware_name: String,
    pub mac_address: [u8; 6],
}

fn header(packet_type: i32, counter: u64, body_len: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + body_len);
    buf.extend_from_slice(&packet_type.to_be_bytes());
    buf.extend_from_slice(&counter.to_be_bytes());
    buf
}

pub fn heartbeat(counter: u64) -> Vec<u8> {
    header(PACKET_HEARTBEAT, counter, 0)
}

pub fn handshake(counter: u64, board: &BoardInfo) -> Vec<u8> {
    // Firmware name is length-prefixed with a single byte
    let name = board.firmware_name.as_bytes();
    let name = &name[..name.len().min(u8::MAX as usize)];

    let mut buf = header(PACKET_HANDSHAKE, counter, 28 + 1 + name.len() + 6);
    buf.extend_from_slice(&board.board_type.to_be_bytes());
    buf.extend_from_slice(&board.imu_type.to_be_bytes());
    buf.extend_from_slice(&board.mcu_type.to_be_bytes());
    for _ in 0..3 {
        buf.extend_from_slice(&0i32.to_be_bytes());
    }
    buf.extend_from_slice(&board.firmware_build.to_be_bytes());
    buf.push(name.len() as u8);
    buf.extend_from_slice(name);
    buf.extend_from_slice(&board.mac_address);
    buf
}

pub fn sensor_info(counter: u64, sensor_id: u8, sensor_type: i32) -> Vec<u8> {
    let mut buf = header(PACKET_SENSOR_INFO, counter, 3);
    buf.push(sensor_id);
    buf.push(SENSOR_STATUS_OK);
    buf.push(sensor_type as u8);
    buf
}

pub fn rotation(counter: u64, sensor_id: u8, q: &Quaternion) -> Vec<u8> {
    let mut buf = header(PACKET_ROTATION_DATA, counter, 19);
    buf.push(sensor_id);
    buf.push(ROTATION_DATA_NORMAL);
    for v in [q.x, q.y, q.z, q.w] {
        buf.extend_from_slice(&v.to_be_bytes());
    }
    buf.push(ROTATION_ACCURACY);
    buf
}

pub fn accel(counter: u64, sensor_id: u8, a: &Vector3) -> Vec<u8> {
    let mut buf = header(PACKET_ACCEL, counter, 13);
    for v in [a.x, a.y, a.z] {
        buf.extend_from_slice(&v.to_be_bytes());
    }
    buf.push(sensor_id);
    buf
}

/// `voltage` in volts, `level` as a 0..1 fraction
pub fn battery_level(counter: u64, voltage: f32, level: f32) -> Vec<u8> {
    let mut buf = header(PACKET_BATTERY_LEVEL, counter, 8);
    buf.extend_from_slice(&voltage.to_be_bytes());
    buf.extend_from_slice(&level.to_be_bytes());
    buf
}

pub fn ping_pong(counter: u64, ping_id: i32) -> Vec<u8> {
    let mut buf = header(PACKET_PING_PONG, counter, 4);
    buf.extend_from_slice(&ping_id.to_be_bytes());
    buf
}

/// Inbound server datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMessage {
    Discovery,
    Heartbeat,
    Ping(i32),
    Other(i32),
}

/// Classify a datagram received from the server
pub fn parse_server_message(data: &[u8]) -> Option<ServerMessage> {
    if data
        .windows(DISCOVERY_REPLY.len())
        .any(|w| w == DISCOVERY_REPLY)
    {
        return Some(ServerMessage::Discovery);
    }

    let packet_type = i32::from_be_bytes(data.get(0..4)?.try_into().ok()?);
    match packet_type {
        PACKET_RECEIVE_HEARTBEAT => Some(ServerMessage::Heartbeat),
        PACKET_PING_PONG => {
            let id = data.get(HEADER_LEN..HEADER_LEN + 4)?;
            Some(ServerMessage::Ping(i32::from_be_bytes(id.try_into().ok()?)))
        }
        other => Some(ServerMessage::Other(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_header(buf: &[u8]) -> (i32, u64) {
        (
            i32::from_be_bytes(buf[0..4].try_into().unwrap()),
            u64::from_be_bytes(buf[4..12].try_into().unwrap()),
        )
    }

    #[test]
    fn test_counter_is_monotonic() {
        let counter = PacketCounter::new();
        assert_eq!(counter.next(), 0);
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.peek(), 2);
    }

    #[test]
    fn test_handshake_layout() {
        let board = BoardInfo {
            board_type: 18,
            imu_type: 0,
            mcu_type: 8,
            firmware_build: 7,
            firmware_name: "Bridge".to_string(),
            mac_address: [1, 2, 3, 4, 5, 6],
        };
        let buf = handshake(42, &board);
        assert_eq!(read_header(&buf), (PACKET_HANDSHAKE, 42));
        assert_eq!(&buf[12..16], &18i32.to_be_bytes());
        assert_eq!(&buf[20..24], &8i32.to_be_bytes());
        assert!(buf[24..36].iter().all(|&b| b == 0));
        assert_eq!(&buf[36..40], &7i32.to_be_bytes());
        assert_eq!(buf[40], 6);
        assert_eq!(&buf[41..47], b"Bridge");
        assert_eq!(&buf[47..], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_rotation_and_accel_layout() {
        let q = Quaternion::new(0.1, 0.2, 0.3, 0.9);
        let buf = rotation(5, 3, &q);
        assert_eq!(read_header(&buf), (PACKET_ROTATION_DATA, 5));
        assert_eq!(buf.len(), 12 + 19);
        assert_eq!(buf[12], 3);
        assert_eq!(buf[13], 1);
        assert_eq!(&buf[14..18], &0.1f32.to_be_bytes());
        assert_eq!(&buf[26..30], &0.9f32.to_be_bytes());

        let buf = accel(6, 3, &Vector3::new(1.0, -2.0, 9.5));
        assert_eq!(read_header(&buf), (PACKET_ACCEL, 6));
        assert_eq!(&buf[20..24], &9.5f32.to_be_bytes());
        assert_eq!(buf[24], 3);
    }

    #[test]
    fn test_sensor_info_and_battery() {
        let buf = sensor_info(1, 4, 0);
        assert_eq!(read_header(&buf), (PACKET_SENSOR_INFO, 1));
        assert_eq!(&buf[12..], &[4, 1, 0]);

        let buf = battery_level(2, 3.9, 0.85);
        assert_eq!(read_header(&buf), (PACKET_BATTERY_LEVEL, 2));
        assert_eq!(&buf[12..16], &3.9f32.to_be_bytes());
        assert_eq!(&buf[16..20], &0.85f32.to_be_bytes());
    }

    #[test]
    fn test_parse_server_messages() {
        assert_eq!(
            parse_server_message(b"\x00\x00\x00\x03Hey OVR =D 5"),
            Some(ServerMessage::Discovery)
        );
        assert_eq!(
            parse_server_message(&ping_pong(9, 1234)),
            Some(ServerMessage::Ping(1234))
        );
        assert_eq!(
            parse_server_message(&heartbeat(1)),
            Some(ServerMessage::Other(PACKET_HEARTBEAT))
        );
        assert_eq!(
            parse_server_message(&[0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0]),
            Some(ServerMessage::Heartbeat)
        );
        assert_eq!(parse_server_message(&[0, 0]), None);
    }
}
