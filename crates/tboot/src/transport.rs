//! Byte Transport: the one external collaborator the protocol engine talks
//! to. Blocking, single-byte read/write with a per-call timeout, owned
//! exclusively by the engine for the life of a session.

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::{TbootError, TbootResult};

/// Synchronous byte-level transport. No concurrency, no buffering beyond
/// what the OS driver does — every read/write call is one byte.
pub trait ByteTransport {
    fn write_byte(&mut self, byte: u8) -> TbootResult<()>;

    /// Blocks for at most the transport's configured read timeout. A
    /// timeout surfaces as `TbootError::TransportIo` — the Rust expression
    /// of the design's `NO_BYTE` sentinel: the caller's `?` fails the
    /// current command exactly as a sentinel check would.
    fn read_byte(&mut self) -> TbootResult<u8>;

    fn flush(&mut self) -> TbootResult<()>;
}

/// A real serial port, backed by the `serialport` crate.
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    port_name: String,
}

impl SerialTransport {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> TbootResult<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(read_timeout)
            .open()
            .map_err(|e| TbootError::TransportOpen {
                port: port_name.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?;
        let mut port = port;
        let _ = port.set_timeout(write_timeout.max(read_timeout));
        Ok(Self {
            port,
            port_name: port_name.to_string(),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl ByteTransport for SerialTransport {
    fn write_byte(&mut self, byte: u8) -> TbootResult<()> {
        self.port
            .write_all(&[byte])
            .map_err(|e| TbootError::TransportIo(e.to_string()))
    }

    fn read_byte(&mut self) -> TbootResult<u8> {
        let mut buf = [0u8; 1];
        self.port
            .read_exact(&mut buf)
            .map_err(|e| TbootError::TransportIo(e.to_string()))?;
        Ok(buf[0])
    }

    fn flush(&mut self) -> TbootResult<()> {
        self.port
            .flush()
            .map_err(|e| TbootError::TransportIo(e.to_string()))
    }
}

/// Read-timeout policy from spec §5: default 1000us, x5 when baud <= 600.
pub fn default_read_timeout_us(configured: u64, baud_rate: u32) -> u64 {
    if baud_rate <= 600 {
        configured * 5
    } else {
        configured
    }
}
