//! Serial port service
//!
//! One blocking reader thread per dongle port. Threads split the byte stream
//! into lines and forward them to the bridge loop; they exit within one read
//! timeout after the running flag is cleared.

use super::transport::{SerialTransport, Transport};
use crate::domain::frame::FrameError;
use crate::domain::models::TransportEvent;
use crate::domain::settings::SerialSettings;
use crate::error::{BridgeError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 256;
const MAX_LINE_LEN: usize = 1024;

/// Serial ports present on the system
pub fn list_ports() -> Result<Vec<String>> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|p| p.port_name)
        .collect())
}

/// Opens one port by name
pub type PortOpener = Arc<dyn Fn(&str) -> Result<Box<dyn Transport>> + Send + Sync>;

/// Opener for real serial ports with the configured line settings
pub fn port_opener(settings: &SerialSettings) -> PortOpener {
    let baud_rate = settings.baud_rate;
    let timeout = Duration::from_millis(settings.read_timeout_ms);
    Arc::new(move |path: &str| {
        SerialTransport::open(path, baud_rate, timeout).map(|t| Box::new(t) as Box<dyn Transport>)
    })
}

/// Write handle for one open port
#[derive(Clone)]
pub struct SerialWriter {
    port: String,
    inner: Arc<Mutex<Box<dyn Transport>>>,
}

impl SerialWriter {
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Write on the blocking pool so the bridge loop never stalls on I/O
    pub async fn write(&self, payload: String) -> Result<()> {
        let inner = self.inner.clone();
        let port = self.port.clone();
        tokio::task::spawn_blocking(move || {
            let mut transport = inner.lock().unwrap_or_else(|e| e.into_inner());
            transport.write_all(payload.as_bytes())
        })
        .await
        .map_err(|e| BridgeError::SettingsWriteFailure {
            target: port,
            reason: e.to_string(),
        })?
    }
}

pub struct SerialService {
    generation: u64,
    running: Arc<AtomicBool>,
    writers: Vec<Option<SerialWriter>>,
}

impl SerialService {
    /// Open every port; a port that fails to open is reported and skipped.
    /// Events of this session carry `generation`.
    pub fn start_with<F>(
        ports: &[String],
        generation: u64,
        events: mpsc::UnboundedSender<TransportEvent>,
        mut open: F,
    ) -> (Self, Vec<BridgeError>)
    where
        F: FnMut(&str) -> Result<Box<dyn Transport>>,
    {
        let running = Arc::new(AtomicBool::new(true));
        let mut writers = Vec::with_capacity(ports.len());
        let mut failures = Vec::new();

        for (port_index, port) in ports.iter().enumerate() {
            let opened = open(port).and_then(|reader| {
                let writer = reader.try_clone()?;
                Ok((reader, writer))
            });
            match opened {
                Ok((transport, writer)) => {
                    let reader = PortReader {
                        generation,
                        port_index,
                        port: port.clone(),
                        running: running.clone(),
                        events: events.clone(),
                    };
                    match reader.spawn(transport) {
                        Ok(()) => writers.push(Some(SerialWriter {
                            port: port.clone(),
                            inner: Arc::new(Mutex::new(writer)),
                        })),
                        Err(e) => {
                            writers.push(None);
                            failures.push(BridgeError::ChannelOpenFailure {
                                channel: port.clone(),
                                reason: e.to_string(),
                            });
                        }
                    }
                }
                Err(e) => {
                    error!(port = %port, "Failed to open serial port: {}", e);
                    writers.push(None);
                    failures.push(BridgeError::ChannelOpenFailure {
                        channel: port.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        (
            Self {
                generation,
                running,
                writers,
            },
            failures,
        )
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn writer(&self, port_index: usize) -> Option<SerialWriter> {
        self.writers.get(port_index).and_then(Clone::clone)
    }

    /// Forget a port whose reader died
    pub fn close_port(&mut self, port_index: usize) {
        if let Some(slot) = self.writers.get_mut(port_index) {
            *slot = None;
        }
    }

    pub fn open_ports(&self) -> usize {
        self.writers.iter().flatten().count()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        info!(generation = self.generation, "Serial readers stopping");
    }
}

impl Drop for SerialService {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

struct PortReader {
    generation: u64,
    port_index: usize,
    port: String,
    running: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl PortReader {
    fn spawn(self, transport: Box<dyn Transport>) -> std::io::Result<()> {
        thread::Builder::new()
            .name(format!("serial-{}", self.port))
            .spawn(move || self.run(transport))
            .map(|_| ())
    }

    /// Returns false once the bridge is gone
    fn send(&self, event: TransportEvent) -> bool {
        if self.events.send(event).is_err() {
            debug!(port = %self.port, "Bridge gone, reader exiting");
            return false;
        }
        true
    }

    fn run(self, mut transport: Box<dyn Transport>) {
        info!(port = %self.port, port_index = self.port_index, "Serial reader started");
        let mut chunk = [0u8; READ_CHUNK];
        let mut line = Vec::with_capacity(MAX_LINE_LEN);
        let mut overflow = 0usize;

        while self.running.load(Ordering::Relaxed) {
            let n = match transport.read(&mut chunk) {
                Ok(n) => n,
                Err(e) => {
                    if self.running.load(Ordering::Relaxed) {
                        warn!(port = %self.port, "Serial port lost: {}", e);
                        self.send(TransportEvent::SerialLost {
                            generation: self.generation,
                            port_index: self.port_index,
                            reason: e.to_string(),
                        });
                    }
                    return;
                }
            };

            for &byte in &chunk[..n] {
                if byte != b'\n' {
                    if line.len() < MAX_LINE_LEN {
                        line.push(byte);
                    } else {
                        overflow += 1;
                    }
                    continue;
                }

                let event = if overflow > 0 {
                    TransportEvent::SerialMalformed {
                        generation: self.generation,
                        port_index: self.port_index,
                        error: FrameError::LineTooLong(line.len() + overflow),
                    }
                } else {
                    let text = String::from_utf8_lossy(&line).trim_end().to_string();
                    if text.is_empty() {
                        line.clear();
                        continue;
                    }
                    TransportEvent::SerialLine {
                        generation: self.generation,
                        port_index: self.port_index,
                        line: text,
                    }
                };
                line.clear();
                overflow = 0;
                if !self.send(event) {
                    return;
                }
            }
        }
        debug!(port = %self.port, "Serial reader stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::serial::transport::MockTransport;

    async fn next(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn start_mock(
        ports: &[String],
        generation: u64,
        mock: &MockTransport,
    ) -> (
        SerialService,
        Vec<BridgeError>,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let opener_mock = mock.clone();
        let (service, failures) = SerialService::start_with(ports, generation, tx, move |path| {
            if path == "missing" {
                Err(BridgeError::Serial(serialport::Error::new(
                    serialport::ErrorKind::NoDevice,
                    "not found",
                )))
            } else {
                Ok(Box::new(opener_mock.clone()) as Box<dyn Transport>)
            }
        });
        (service, failures, rx)
    }

    #[tokio::test]
    async fn test_lines_are_split_and_tagged() {
        let mock = MockTransport::new();
        let (service, failures, mut rx) = start_mock(&["COM3".to_string()], 4, &mock);
        assert!(failures.is_empty());
        assert_eq!(service.generation(), 4);

        mock.inject_read(b"a0:7f7f7f7f7f7f\r\nr1:0000");
        mock.inject_read(b"00300a00\r\n");

        assert_eq!(
            next(&mut rx).await,
            TransportEvent::SerialLine {
                generation: 4,
                port_index: 0,
                line: "a0:7f7f7f7f7f7f".to_string()
            }
        );
        assert_eq!(
            next(&mut rx).await,
            TransportEvent::SerialLine {
                generation: 4,
                port_index: 0,
                line: "r1:000000300a00".to_string()
            }
        );

        service
            .writer(0)
            .unwrap()
            .write("o0:x\r\n".to_string())
            .await
            .unwrap();
        assert_eq!(mock.get_written(), b"o0:x\r\n");
        service.stop();
    }

    #[tokio::test]
    async fn test_overlong_line_is_dropped_and_reported() {
        let mock = MockTransport::new();
        let (service, _, mut rx) = start_mock(&["COM3".to_string()], 1, &mock);

        let mut long_line = vec![b'A'; MAX_LINE_LEN + 100];
        long_line.push(b'\n');
        mock.inject_read(&long_line);
        mock.inject_read(b"x0:AAAA\n");

        assert_eq!(
            next(&mut rx).await,
            TransportEvent::SerialMalformed {
                generation: 1,
                port_index: 0,
                error: FrameError::LineTooLong(MAX_LINE_LEN + 100),
            }
        );
        assert_eq!(
            next(&mut rx).await,
            TransportEvent::SerialLine {
                generation: 1,
                port_index: 0,
                line: "x0:AAAA".to_string()
            }
        );
        service.stop();
    }

    #[tokio::test]
    async fn test_failed_port_does_not_block_others() {
        let mock = MockTransport::new();
        let ports = ["missing".to_string(), "COM4".to_string()];
        let (service, failures, mut rx) = start_mock(&ports, 1, &mock);

        assert_eq!(failures.len(), 1);
        assert!(matches!(
            &failures[0],
            BridgeError::ChannelOpenFailure { channel, .. } if channel == "missing"
        ));
        assert!(service.writer(0).is_none());
        assert_eq!(service.open_ports(), 1);

        mock.inject_read(b"x0:AAAA\n");
        assert!(matches!(
            next(&mut rx).await,
            TransportEvent::SerialLine { port_index: 1, .. }
        ));

        mock.disconnect();
        assert!(matches!(
            next(&mut rx).await,
            TransportEvent::SerialLost {
                generation: 1,
                port_index: 1,
                ..
            }
        ));
    }
}
