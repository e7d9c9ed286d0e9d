//! Serial Module
//!
//! GX dongle communication over serial ports.
//!
//! - [`transport`] - Byte stream abstraction and the serialport backend
//! - [`demux`] - Port/sub-index to tracker mapping and paired settings writes
//! - [`service`] - Reader threads and write handles

pub mod demux;
pub mod service;
pub mod transport;

pub use demux::SerialDemux;
pub use service::{list_ports, port_opener, PortOpener, SerialService};
