//! Crate-wide error taxonomy.
//!
//! One enum covers every failure kind described in the design: config and
//! CLI parsing, transport I/O, wire framing, protocol state, the HEX codec,
//! file I/O and the two data-shape failures (`OverCapacity`, `VerifyMismatch`).
//! Nothing here is recovered internally — every variant propagates to the
//! orchestrator or to `main`, which maps it to a process exit code.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum TbootError {
    #[error("config error at {path}:{line}: {message}")]
    ConfigParse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("command line error: {0}")]
    CliParse(String),

    #[error("can't open serial port {port}: {source}")]
    TransportOpen {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport I/O error: {0}")]
    TransportIo(String),

    #[error("echo mismatch: sent {sent:#04x}, got {got:#04x}")]
    FramingEcho { sent: u8, got: u8 },

    #[error("invalid hex nibble on the wire: {0:#04x}")]
    FramingNibble(u8),

    #[error("confirmation mismatch: expected 0x0d, got {0:#04x}")]
    ConfirmationMismatch(u8),

    #[error("protocol state error: {0}")]
    ProtocolState(String),

    #[error("no bootloader found after {attempts} handshake attempts")]
    HandshakeFailed { attempts: u32 },

    #[error("{path}:{line}: {reason}")]
    HexParse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("{path}:{line}: checksum error")]
    HexChecksum { path: PathBuf, line: usize },

    #[error("{path}:{line}: unsupported record type {record_type:#04x}")]
    HexRecordType {
        path: PathBuf,
        line: usize,
        record_type: u8,
    },

    #[error("file I/O error on {path}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("image of {image_size} bytes does not fit in the {available}-byte writable region")]
    OverCapacity { image_size: usize, available: usize },

    #[error("EEPROM operations are not supported by this programmer")]
    UnsupportedMemory,

    #[error("verify failed: {mismatch_count} byte(s) differ")]
    VerifyMismatch { mismatch_count: usize },
}

pub type TbootResult<T> = Result<T, TbootError>;
