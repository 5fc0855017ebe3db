//! ==============================================================================
//! session.rs - one open connection to the microcontroller
//! ==============================================================================
//!
//! purpose:
//!     owns the serial handle and the frame buffer. the bridge loop only sees
//!     `DeviceLink`: read a frame (bounded wait), write a frame, close.
//!
//! relationships:
//!     - used by: bridge.rs (reads/writes frames), controller.rs (opens sessions)
//!     - uses: codec.rs (FrameBuffer, encode), serialport (hardware access)
//!
//! ownership:
//!     a session is moved into exactly one bridge task. close() drops the
//!     transport, so the handle is released exactly once no matter how many
//!     times close() is called.
//!
//! ==============================================================================

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio::time::Instant;

use crate::codec::{self, FrameBuffer};
use crate::domain::ThresholdFrame;
use crate::error::{ConnectError, FrameError};

/// how often the port is re-checked while waiting for data
const POLL_STEP: Duration = Duration::from_millis(20);

/// largest single read from the port
const READ_CHUNK: usize = 256;

/// result of one `read_frame` call
#[derive(Debug)]
pub enum ReadOutcome {
    /// a complete line decoded as json
    Frame(Value),
    /// nothing complete arrived within the timeout
    Timeout,
    /// a complete line arrived but could not be decoded; it has been dropped
    Invalid(FrameError),
    /// the device went away or the session was closed
    Closed,
}

/// the session was closed before or during a write
#[derive(Debug, thiserror::Error)]
#[error("device session is closed")]
pub struct SessionClosed;

/// a write that left the session open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Sent,
    /// the port did not take the bytes in time; nothing was written
    Stalled,
}

/// what the bridge loop needs from a device
#[async_trait]
pub trait DeviceLink: Send {
    /// wait at most `timeout` for the next complete frame
    async fn read_frame(&mut self, timeout: Duration) -> ReadOutcome;

    /// write the threshold frame back to the device
    ///
    /// not cancel safe: dropping the future mid-write loses the session.
    async fn write_frame(&mut self, frame: &ThresholdFrame) -> Result<WriteOutcome, SessionClosed>;

    /// release the handle; idempotent
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// opens device sessions for the lifecycle controller
#[async_trait]
pub trait DeviceOpener: Send + Sync {
    async fn open(&self, port: &str) -> Result<Box<dyn DeviceLink>, ConnectError>;
}

// ==============================================================================
// transport - raw byte access under the session
// ==============================================================================

/// byte-level access the session needs; implemented for serial ports and for
/// in-memory fakes in tests
///
/// `write_all` may block (a serial write waits for the output to drain), so the
/// session runs it on the blocking pool.
pub trait Transport: Send + 'static {
    /// bytes waiting in the receive buffer
    fn bytes_available(&mut self) -> io::Result<usize>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
}

impl Transport for Box<dyn SerialPort> {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.bytes_to_read()? as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self, buf)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        io::Write::write_all(self, bytes)?;
        io::Write::flush(self)
    }
}

/// the port was busy, not gone
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

// ==============================================================================
// line session
// ==============================================================================

/// a device session speaking newline-delimited json over any transport
pub struct LineSession<T: Transport> {
    name: String,
    transport: Option<T>,
    buffer: FrameBuffer,
}

impl<T: Transport> LineSession<T> {
    pub fn new(name: impl Into<String>, transport: T) -> Self {
        Self {
            name: name.into(),
            transport: Some(transport),
            buffer: FrameBuffer::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// move whatever is waiting on the transport into the frame buffer
    ///
    /// Ok(true) if bytes were read, Ok(false) if nothing was waiting.
    fn fill(&mut self) -> io::Result<bool> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };

        let waiting = transport.bytes_available()?;
        if waiting == 0 {
            return Ok(false);
        }

        let mut chunk = [0u8; READ_CHUNK];
        let want = waiting.min(READ_CHUNK);
        match transport.read(&mut chunk[..want]) {
            Ok(0) => Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                self.buffer.extend(&chunk[..n]);
                Ok(true)
            }
            Err(e) if is_transient(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn write_bytes<S: Serialize>(&mut self, value: &S) -> Result<WriteOutcome, SessionClosed> {
        let bytes = match codec::encode(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                // a ThresholdFrame always serializes; keep the session alive regardless
                tracing::error!(device = %self.name, error = %e, "Failed to encode frame");
                return Ok(WriteOutcome::Stalled);
            }
        };

        // the transport rides along to the blocking pool and comes back with the result
        let mut transport = self.transport.take().ok_or(SessionClosed)?;
        let joined = tokio::task::spawn_blocking(move || {
            let result = transport.write_all(&bytes);
            (transport, result)
        })
        .await;

        let (transport, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(device = %self.name, error = %e, "Write task failed, session lost");
                self.buffer.clear();
                return Err(SessionClosed);
            }
        };
        self.transport = Some(transport);

        match result {
            Ok(()) => Ok(WriteOutcome::Sent),
            Err(e) if is_transient(&e) => {
                tracing::warn!(device = %self.name, error = %e, "Write stalled, frame skipped");
                Ok(WriteOutcome::Stalled)
            }
            Err(e) => {
                tracing::warn!(device = %self.name, error = %e, "Write failed, closing session");
                self.close_transport();
                Err(SessionClosed)
            }
        }
    }

    fn close_transport(&mut self) {
        if self.transport.take().is_some() {
            self.buffer.clear();
            tracing::info!(device = %self.name, "Device session closed");
        }
    }
}

#[async_trait]
impl<T: Transport> DeviceLink for LineSession<T> {
    async fn read_frame(&mut self, timeout: Duration) -> ReadOutcome {
        let deadline = Instant::now() + timeout;

        loop {
            match self.buffer.next_frame() {
                Some(Ok(value)) => return ReadOutcome::Frame(value),
                Some(Err(e)) => return ReadOutcome::Invalid(e),
                None => {}
            }

            if self.transport.is_none() {
                return ReadOutcome::Closed;
            }

            match self.fill() {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(device = %self.name, error = %e, "Read failed, closing session");
                    self.close_transport();
                    return ReadOutcome::Closed;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return ReadOutcome::Timeout;
            }
            tokio::time::sleep(POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn write_frame(&mut self, frame: &ThresholdFrame) -> Result<WriteOutcome, SessionClosed> {
        self.write_bytes(frame).await
    }

    fn close(&mut self) {
        self.close_transport();
    }

    fn is_open(&self) -> bool {
        self.transport.is_some()
    }
}

// ==============================================================================
// serial opener
// ==============================================================================

/// opens USB-serial ports at a fixed baud rate, 8N1
#[derive(Debug, Clone)]
pub struct SerialOpener {
    pub baud_rate: u32,
    /// firmware resets when the port opens; nothing is read or written before this elapses
    pub settle: Duration,
}

impl SerialOpener {
    pub fn new(baud_rate: u32, settle: Duration) -> Self {
        Self { baud_rate, settle }
    }
}

#[async_trait]
impl DeviceOpener for SerialOpener {
    async fn open(&self, port: &str) -> Result<Box<dyn DeviceLink>, ConnectError> {
        let path = port.to_string();
        let baud_rate = self.baud_rate;

        // serialport::open blocks; keep it off the runtime threads
        let opened = tokio::task::spawn_blocking(move || {
            serialport::new(&path, baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(Duration::from_millis(10))
                .open()
        })
        .await
        .map_err(|e| ConnectError::Open {
            port: port.to_string(),
            reason: format!("task join error: {}", e),
        })?;

        let mut serial = opened.map_err(|e| ConnectError::Open {
            port: port.to_string(),
            reason: e.to_string(),
        })?;

        tracing::info!(port, baud_rate, settle_ms = self.settle.as_millis() as u64, "Opened serial port, waiting for device to settle");
        tokio::time::sleep(self.settle).await;

        // drop boot chatter emitted during the reset; also proves the port is still there
        serial
            .clear(ClearBuffer::Input)
            .and_then(|_| serial.bytes_to_read())
            .map_err(|e| ConnectError::Unstable {
                port: port.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(LineSession::new(port, serial)))
    }
}

/// available serial ports as (name, description)
pub fn list_ports() -> Result<Vec<(String, String)>, ConnectError> {
    let ports = serialport::available_ports().map_err(|e| ConnectError::Open {
        port: "*".to_string(),
        reason: e.to_string(),
    })?;

    Ok(ports
        .into_iter()
        .map(|p| {
            let kind = match p.port_type {
                serialport::SerialPortType::UsbPort(usb) => format!(
                    "usb {:04x}:{:04x} {}",
                    usb.vid,
                    usb.pid,
                    usb.product.unwrap_or_default()
                ),
                serialport::SerialPortType::BluetoothPort => "bluetooth".to_string(),
                serialport::SerialPortType::PciPort => "pci".to_string(),
                serialport::SerialPortType::Unknown => "unknown".to_string(),
            };
            (p.port_name, kind.trim().to_string())
        })
        .collect())
}

// ==============================================================================
// tests
// ==============================================================================
