//! Byte transports carrying link-layer frames to and from the meter.
//!
//! The protocol engine only needs two things from a transport: send one
//! frame, and wait (bounded) for the next notification. Everything else,
//! including sequence numbers, lives above this layer.

use serialport::SerialPort;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame of {0} bytes is too long for the link")]
    FrameTooLong(usize),

    #[error("Connection lost")]
    Disconnected,
}

/// A connection that exchanges whole link-layer frames.
pub trait Transport {
    /// Send one frame (sequence byte included).
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next notification.
    ///
    /// `Ok(None)` means nothing arrived in time; a zero timeout only drains
    /// what is already available.
    fn read_notification(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        (**self).write_frame(frame)
    }

    fn read_notification(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        (**self).read_notification(timeout)
    }
}

/// Serial link settings for [`SerialBridge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialBridgeConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Timeout used for the individual byte reads inside one record.
    pub read_timeout: Duration,
}

impl SerialBridgeConfig {
    pub fn new(port: &str) -> Self {
        Self {
            port: port.to_string(),
            baud_rate: 115_200,
            read_timeout: Duration::from_millis(10),
        }
    }

    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

/// Frames tunnelled over a serial port, e.g. through a BLE bridge dongle.
///
/// Every frame travels as one record: a length byte followed by that many
/// frame bytes, in both directions.
#[derive(Debug)]
pub struct SerialBridge {
    serial: Box<dyn SerialPort>,
    config: SerialBridgeConfig,
}

impl SerialBridge {
    pub fn open(config: SerialBridgeConfig) -> Result<Self, TransportError> {
        let serial = serialport::new(&config.port, config.baud_rate)
            .timeout(config.read_timeout)
            .open()?;

        let mut bridge = Self { serial, config };
        bridge.flush()?;
        log::debug!("Opened serial bridge on {}", bridge.config.port);
        Ok(bridge)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.serial.clear(serialport::ClearBuffer::All)?;
        Ok(())
    }

    /// Read exactly `buf.len()` bytes, giving up at `deadline`.
    ///
    /// Returns `false` if the deadline passed before the first byte.
    fn read_until(&mut self, buf: &mut [u8], deadline: Instant) -> Result<bool, TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.serial.read(&mut buf[filled..]) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    if Instant::now() >= deadline {
                        if filled == 0 {
                            return Ok(false);
                        }
                        return Err(TransportError::Io(e));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

impl Transport for SerialBridge {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let length = u8::try_from(frame.len()).map_err(|_| TransportError::FrameTooLong(frame.len()))?;
        self.serial.write_all(&[length])?;
        self.serial.write_all(frame)?;
        self.serial.flush()?;
        Ok(())
    }

    fn read_notification(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut length = [0u8; 1];
        if !self.read_until(&mut length, deadline)? {
            return Ok(None);
        }

        // Once a record has started, give the rest of it a full read timeout.
        let mut frame = vec![0u8; usize::from(length[0])];
        let body_deadline = Instant::now().max(deadline) + self.config.read_timeout;
        if !self.read_until(&mut frame, body_deadline)? && !frame.is_empty() {
            return Err(TransportError::Disconnected);
        }
        Ok(Some(frame))
    }
}

/// In-memory transport: queued notifications in, recorded frames out.
///
/// Useful for replaying captured traffic and for exercising the protocol
/// engine without hardware.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    incoming: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    connected: bool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            connected: true,
            ..Self::default()
        }
    }

    pub fn push_notification(&mut self, frame: &[u8]) {
        self.incoming.push_back(frame.to_vec());
    }

    pub fn written(&self) -> &[Vec<u8>] {
        &self.written
    }

    pub fn take_written(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.written)
    }

    pub fn pending(&self) -> usize {
        self.incoming.len()
    }

    pub fn disconnect(&mut self) {
        self.connected = false;
    }
}

impl Transport for MemoryTransport {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        self.written.push(frame.to_vec());
        Ok(())
    }

    fn read_notification(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        Ok(self.incoming.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_transport_round_trip() {
        let mut transport = MemoryTransport::new();
        transport.push_notification(&[0, 1, 2]);
        transport.write_frame(&[0, 0x81]).unwrap();

        assert_eq!(
            transport.read_notification(Duration::ZERO).unwrap(),
            Some(vec![0, 1, 2])
        );
        assert_eq!(transport.read_notification(Duration::ZERO).unwrap(), None);
        assert_eq!(transport.written(), &[vec![0, 0x81]]);
        assert_eq!(transport.take_written().len(), 1);
        assert!(transport.written().is_empty());
    }

    #[test]
    fn test_disconnected_memory_transport_fails() {
        let mut transport = MemoryTransport::new();
        transport.disconnect();
        assert!(matches!(
            transport.write_frame(&[0]),
            Err(TransportError::Disconnected)
        ));
        assert!(matches!(
            transport.read_notification(Duration::ZERO),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn test_boxed_transport_delegates() {
        let mut boxed: Box<dyn Transport> = Box::new(MemoryTransport::new());
        boxed.write_frame(&[1, 2]).unwrap();
        assert_eq!(boxed.read_notification(Duration::ZERO).unwrap(), None);
    }

    #[test]
    fn test_serial_bridge_config_builder() {
        let config = SerialBridgeConfig::new("/dev/ttyACM0")
            .baud_rate(9600)
            .read_timeout(Duration::from_millis(25));
        assert_eq!(config.port, "/dev/ttyACM0");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.read_timeout, Duration::from_millis(25));
    }
}
