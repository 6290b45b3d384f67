//! Framing layer: turns logical bytes and words into wire bytes, honoring
//! echo and binary mode, and back again.
//!
//! Every byte the protocol engine puts on the wire — opcode, address
//! nibble or raw data — goes through [`write_raw_byte`], which is the one
//! place echo-checking happens. Data bytes additionally go through
//! [`write_data_byte`]/[`read_data_byte`], which pick hex-pair or raw
//! encoding based on `mode.binary_mode`.

use crate::error::{TbootError, TbootResult};
use crate::transport::ByteTransport;
use std::time::Duration;

/// The session's framing capabilities, threaded through every encode/decode
/// call instead of being re-read from scattered session fields.
#[derive(Debug, Clone, Copy)]
pub struct FramingMode {
    pub echo_mode: bool,
    pub binary_mode: bool,
    pub write_delay_us: u64,
}

fn hex_digit(nibble: u8) -> u8 {
    match nibble {
        0..=9 => b'0' + nibble,
        10..=15 => b'a' + (nibble - 10),
        _ => unreachable!("nibble out of range"),
    }
}

fn decode_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

/// Sends one byte on the wire. If `mode.echo_mode`, reads the echo back and
/// requires it to equal `byte`.
pub fn write_raw_byte(
    transport: &mut dyn ByteTransport,
    mode: FramingMode,
    byte: u8,
) -> TbootResult<()> {
    if mode.write_delay_us > 0 {
        std::thread::sleep(Duration::from_micros(mode.write_delay_us));
    }
    transport.write_byte(byte)?;
    if mode.echo_mode {
        let got = transport.read_byte()?;
        if got != byte {
            return Err(TbootError::FramingEcho { sent: byte, got });
        }
    }
    Ok(())
}

/// Reads one raw byte off the wire.
pub fn read_raw_byte(transport: &mut dyn ByteTransport) -> TbootResult<u8> {
    transport.read_byte()
}

/// Writes one logical data byte: raw in binary mode, two lowercase hex
/// digits (high nibble first) otherwise.
pub fn write_data_byte(
    transport: &mut dyn ByteTransport,
    mode: FramingMode,
    byte: u8,
) -> TbootResult<()> {
    if mode.binary_mode {
        write_raw_byte(transport, mode, byte)
    } else {
        write_raw_byte(transport, mode, hex_digit(byte >> 4))?;
        write_raw_byte(transport, mode, hex_digit(byte & 0x0f))
    }
}

/// Reads one logical data byte, undoing whatever [`write_data_byte`] did.
pub fn read_data_byte(transport: &mut dyn ByteTransport, mode: FramingMode) -> TbootResult<u8> {
    if mode.binary_mode {
        read_raw_byte(transport)
    } else {
        let hi = read_raw_byte(transport)?;
        let lo = read_raw_byte(transport)?;
        let hi = decode_nibble(hi).ok_or(TbootError::FramingNibble(hi))?;
        let lo = decode_nibble(lo).ok_or(TbootError::FramingNibble(lo))?;
        Ok((hi << 4) | lo)
    }
}

/// Writes a 16-bit word high byte first, each byte through [`write_data_byte`].
pub fn write_word(transport: &mut dyn ByteTransport, mode: FramingMode, word: u16) -> TbootResult<()> {
    write_data_byte(transport, mode, (word >> 8) as u8)?;
    write_data_byte(transport, mode, (word & 0xff) as u8)
}

/// Reads a 16-bit word high byte first.
pub fn read_word(transport: &mut dyn ByteTransport, mode: FramingMode) -> TbootResult<u16> {
    let hi = read_data_byte(transport, mode)?;
    let lo = read_data_byte(transport, mode)?;
    Ok(u16::from(hi) << 8 | u16::from(lo))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedTransport;

    fn mode(echo: bool, binary: bool) -> FramingMode {
        FramingMode {
            echo_mode: echo,
            binary_mode: binary,
            write_delay_us: 0,
        }
    }

    #[test]
    fn binary_data_byte_is_one_wire_byte() {
        let mut t = ScriptedTransport::new(&[]);
        write_data_byte(&mut t, mode(false, true), 0xab).unwrap();
        assert_eq!(t.written, vec![0xab]);
    }

    #[test]
    fn hex_data_byte_is_two_lowercase_nibbles() {
        let mut t = ScriptedTransport::new(&[]);
        write_data_byte(&mut t, mode(false, false), 0xab).unwrap();
        assert_eq!(t.written, vec![b'a', b'b']);
    }

    #[test]
    fn echo_mode_consumes_matching_echo() {
        let mut t = ScriptedTransport::new(&[0x42]);
        write_raw_byte(&mut t, mode(true, true), 0x42).unwrap();
        assert_eq!(t.written, vec![0x42]);
    }

    #[test]
    fn echo_mismatch_is_an_error() {
        let mut t = ScriptedTransport::new(&[0x99]);
        let err = write_raw_byte(&mut t, mode(true, true), 0x42).unwrap_err();
        assert!(matches!(err, TbootError::FramingEcho { sent: 0x42, got: 0x99 }));
    }

    #[test]
    fn invalid_hex_nibble_is_rejected() {
        let mut t = ScriptedTransport::new(&[b'z', b'f']);
        let err = read_data_byte(&mut t, mode(false, false)).unwrap_err();
        assert!(matches!(err, TbootError::FramingNibble(b'z')));
    }

    #[test]
    fn word_round_trips_high_byte_first() {
        let mut t = ScriptedTransport::new(&[]);
        write_word(&mut t, mode(false, true), 0x1234).unwrap();
        assert_eq!(t.written, vec![0x12, 0x34]);

        let mut t = ScriptedTransport::new(&[0x12, 0x34]);
        let w = read_word(&mut t, mode(false, true)).unwrap();
        assert_eq!(w, 0x1234);
    }
}
