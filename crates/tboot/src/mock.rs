//! Scripted transport double shared by this crate's unit tests and its
//! `tests/` integration suite. Kept behind the `test-support` feature
//! (always on for `cargo test`, via the dev-dependency on this crate
//! itself) rather than `#[cfg(test)]`, since integration tests link
//! against the library built without `cfg(test)`.

use std::collections::VecDeque;

use crate::error::{TbootError, TbootResult};
use crate::transport::ByteTransport;

/// Replays a scripted byte sequence and records every byte written.
///
/// A `None` entry models a transport timeout that `drain()`-style callers
/// treat as "nothing available right now" rather than "connection dead":
/// it produces exactly one `Err` from `read_byte`, after which the queue
/// resumes yielding whatever comes next. Plain `new` scripts never need
/// this; only handshake-style tests that drain before probing do.
pub struct ScriptedTransport {
    to_read: VecDeque<Option<u8>>,
    pub written: Vec<u8>,
}

impl ScriptedTransport {
    pub fn new(to_read: &[u8]) -> Self {
        Self {
            to_read: to_read.iter().copied().map(Some).collect(),
            written: Vec::new(),
        }
    }

    /// Builds a transport from a script that may include `None` timeout
    /// markers interleaved with real bytes.
    pub fn from_script(script: Vec<Option<u8>>) -> Self {
        Self {
            to_read: script.into(),
            written: Vec::new(),
        }
    }
}

impl ByteTransport for ScriptedTransport {
    fn write_byte(&mut self, byte: u8) -> TbootResult<()> {
        self.written.push(byte);
        Ok(())
    }

    fn read_byte(&mut self) -> TbootResult<u8> {
        match self.to_read.pop_front() {
            Some(Some(b)) => Ok(b),
            Some(None) => Err(TbootError::TransportIo("scripted timeout".into())),
            None => Err(TbootError::TransportIo("no more bytes".into())),
        }
    }

    fn flush(&mut self) -> TbootResult<()> {
        Ok(())
    }
}
