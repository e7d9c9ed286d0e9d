//! Tracking Server Module
//!
//! UDP link to the downstream full-body tracking server.
//!
//! - [`packet`] - Wire encoders and the packet counter
//! - [`connection`] - Socket, discovery and send operations

pub mod connection;
pub mod packet;

pub use connection::{BatteryReading, ServerConnection};
