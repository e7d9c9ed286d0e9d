//! Bridge between full-body trackers and a SlimeVR-compatible tracking server.
//!
//! Trackers reach the bridge through a GX dongle on serial ports or directly
//! over BLE. Decoded frames are forwarded to the server over UDP, and a local
//! socket exposes control and events to a UI.

pub mod bridge;
pub mod domain;
pub mod error;
pub mod infrastructure;
