//! Serial transport abstraction

use crate::error::Result;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Byte stream to one dongle
pub trait Transport: Send {
    /// Read into `buffer`; returns 0 when the read timed out. A closed
    /// device is an error.
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Second handle to the same port, used for writes while a reader
    /// thread keeps the first handle
    fn try_clone(&self) -> Result<Box<dyn Transport>>;
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32, read_timeout: Duration) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(read_timeout)
            .open()?;

        tracing::info!("Opened serial port: {} at {} baud", path, baud_rate);
        Ok(Self { port })
    }
}

/// Map a port read onto the `Transport` contract: a timeout is an empty
/// read, end of stream means the device is gone.
fn read_outcome(result: std::io::Result<usize>) -> Result<usize> {
    match result {
        Ok(0) => Err(serialport::Error::new(
            serialport::ErrorKind::NoDevice,
            "serial port reached end of stream",
        )
        .into()),
        Ok(n) => Ok(n),
        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
        Err(e) => Err(serialport::Error::from(e).into()),
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        read_outcome(self.port.read(buffer))
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.port
            .write_all(data)
            .and_then(|_| self.port.flush())
            .map_err(serialport::Error::from)?;
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(Self {
            port: self.port.try_clone()?,
        }))
    }
}

/// In-memory transport for tests
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Default)]
struct MockTransportInner {
    read_buffer: VecDeque<u8>,
    write_buffer: Vec<u8>,
    disconnected: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for the reader
    pub fn inject_read(&self, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.read_buffer.extend(data);
    }

    pub fn get_written(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.write_buffer.clone()
    }

    /// Make the next read fail as if the device was unplugged
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.disconnected = true;
    }
}

impl Transport for MockTransport {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.read_buffer.is_empty() {
            if inner.disconnected {
                return Err(serialport::Error::new(
                    serialport::ErrorKind::NoDevice,
                    "mock device removed",
                )
                .into());
            }
            drop(inner);
            // Stand-in for the port read timeout
            std::thread::sleep(Duration::from_millis(2));
            return Ok(0);
        }

        let available = inner.read_buffer.len().min(buffer.len());
        for (slot, byte) in buffer.iter_mut().zip(inner.read_buffer.drain(..available)) {
            *slot = byte;
        }
        Ok(available)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.disconnected {
            return Err(
                serialport::Error::new(serialport::ErrorKind::NoDevice, "mock device removed")
                    .into(),
            );
        }
        inner.write_buffer.extend_from_slice(data);
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(self.clone()))
    }
}
