//! Host-side AVR bootloader programmer: avrdude `-U`-compatible client for
//! an in-circuit serial bootloader.
//!
//! The core — [`protocol`], [`handshake`], [`orchestrator`] — speaks a
//! five-command wire protocol over a [`transport::ByteTransport`], with
//! [`framing`] handling the hex/binary, echo/no-echo matrix in one place.
//! [`hexfile`] and [`image`] hold firmware off the wire; [`config`] and
//! [`cli`] are the two configuration sources `main` merges before opening
//! a connection.

pub mod cli;
pub mod config;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod hexfile;
pub mod image;
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
pub mod orchestrator;
pub mod protocol;
pub mod transport;
pub mod ui;

pub use error::{TbootError, TbootResult};
