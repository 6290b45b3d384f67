//! Mode auto-negotiation: establishes `echo_mode`, `binary_mode`, `flags`
//! and `bootloader_offset` on a freshly opened session, retrying the whole
//! sequence up to five times.

use std::time::Duration;

use crate::error::{TbootError, TbootResult};
use crate::protocol::{self, BootloaderFlags, Session};
use crate::transport::ByteTransport;

const MAX_ATTEMPTS: u32 = 5;

/// Unescapes `\n \r \t \\ \xNN` in a start/finish command string. Any other
/// escape is rejected — the config loader already validates this, but the
/// handshake re-checks defensively since the string crossed a process
/// boundary (file → config → here).
pub fn unescape_command(s: &str) -> TbootResult<Vec<u8>> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let next = bytes.get(i + 1).copied().ok_or_else(|| {
            TbootError::ConfigParse {
                path: "<start command>".into(),
                line: 0,
                message: "trailing backslash".to_string(),
            }
        })?;
        match next {
            b'n' => {
                out.push(b'\n');
                i += 2;
            }
            b'r' => {
                out.push(b'\r');
                i += 2;
            }
            b't' => {
                out.push(b'\t');
                i += 2;
            }
            b'\\' => {
                out.push(b'\\');
                i += 2;
            }
            b'x' => {
                let hi = bytes.get(i + 2).copied();
                let lo = bytes.get(i + 3).copied();
                let byte = match (hi.and_then(hex_val), lo.and_then(hex_val)) {
                    (Some(h), Some(l)) => (h << 4) | l,
                    _ => {
                        return Err(TbootError::ConfigParse {
                            path: "<start command>".into(),
                            line: 0,
                            message: format!("malformed \\x escape at byte {i}"),
                        })
                    }
                };
                out.push(byte);
                i += 4;
            }
            other => {
                return Err(TbootError::ConfigParse {
                    path: "<start command>".into(),
                    line: 0,
                    message: format!("unknown escape \\{}", other as char),
                })
            }
        }
    }
    Ok(out)
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn is_hex_char(c: u8) -> bool {
    c.is_ascii_digit() || (b'a'..=b'f').contains(&c) || (b'A'..=b'F').contains(&c)
}

fn hex_val_upper_or_lower(c: u8) -> u8 {
    hex_val(c).unwrap_or(0)
}

/// Sends `command` bytes one at a time, ignoring any echo (mode is not yet
/// known at this point in the handshake).
fn send_start_command(transport: &mut dyn ByteTransport, command: &[u8]) -> TbootResult<()> {
    for &b in command {
        transport.write_byte(b)?;
    }
    Ok(())
}

/// Reads bytes until the transport times out, discarding them.
fn drain(transport: &mut dyn ByteTransport) {
    loop {
        match transport.read_byte() {
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

/// Runs the echo probe (step 3 of the handshake). Returns the discovered
/// `echo_mode`, or an error if no bootloader responded at all.
fn probe_echo_mode(transport: &mut dyn ByteTransport) -> TbootResult<bool> {
    let mut echo_hits = 0u32;
    let mut no_echo_hits = 0u32;

    for i in (0..=9i32).rev() {
        let sent = b'0' + i as u8;
        if transport.write_byte(sent).is_err() {
            break;
        }
        let resp1 = match transport.read_byte() {
            Ok(b) => b,
            Err(_) => continue,
        };
        if resp1 == sent {
            if let Ok(b'!') = transport.read_byte() {
                echo_hits += 1;
            }
        } else if resp1 == b'!' {
            no_echo_hits += 1;
        }

        if echo_hits > 3 {
            return Ok(true);
        }
        if no_echo_hits > 4 {
            return Ok(false);
        }
        if i == 0 {
            if echo_hits == no_echo_hits {
                return Err(TbootError::HandshakeFailed { attempts: 0 });
            }
            return Ok(echo_hits > no_echo_hits);
        }
    }
    Err(TbootError::HandshakeFailed { attempts: 0 })
}

struct RawQueryResult {
    binary_mode: bool,
    bootloader_offset: u16,
    flags: BootloaderFlags,
}

/// Step 4: sends a raw `Q` and decodes the hex-or-binary response without
/// going through the Framing Layer (mode isn't established yet).
fn raw_query(transport: &mut dyn ByteTransport) -> TbootResult<RawQueryResult> {
    transport.write_byte(b'Q')?;
    let ch = [
        transport.read_byte()?,
        transport.read_byte()?,
        transport.read_byte()?,
        transport.read_byte()?,
        transport.read_byte()?,
    ];

    let result = if ch.iter().all(|&c| is_hex_char(c)) {
        let ch6 = transport.read_byte()?;
        let ch7 = transport.read_byte()?;
        let ch8 = transport.read_byte()?;
        let ch9 = transport.read_byte()?;
        let ch10 = transport.read_byte()?;
        if ![ch6, ch7, ch8, ch9, ch10].iter().all(|&c| is_hex_char(c)) {
            return Err(TbootError::ProtocolState(
                "handshake query: partial hex response".to_string(),
            ));
        }
        let hi = (hex_val_upper_or_lower(ch[4]) << 4) | hex_val_upper_or_lower(ch6);
        let lo = (hex_val_upper_or_lower(ch7) << 4) | hex_val_upper_or_lower(ch8);
        let flags = (hex_val_upper_or_lower(ch9) << 4) | hex_val_upper_or_lower(ch10);
        RawQueryResult {
            binary_mode: false,
            bootloader_offset: u16::from(hi) << 8 | u16::from(lo),
            flags: BootloaderFlags(flags),
        }
    } else {
        RawQueryResult {
            binary_mode: true,
            bootloader_offset: u16::from(ch[2]) << 8 | u16::from(ch[3]),
            flags: BootloaderFlags(ch[4]),
        }
    };

    let terminator = transport.read_byte()?;
    if terminator != 0x0d {
        return Err(TbootError::ProtocolState(format!(
            "handshake query: expected 0x0d terminator, got {terminator:#04x}"
        )));
    }
    Ok(result)
}

/// One handshake attempt. On success, mutates `session` in place (but does
/// not invalidate on failure — the caller starts a fresh attempt instead).
fn attempt(
    session: &mut Session,
    transport: &mut dyn ByteTransport,
    start_command: &[u8],
) -> TbootResult<()> {
    send_start_command(transport, start_command)?;
    drain(transport);

    let echo_mode = probe_echo_mode(transport)?;

    let raw = raw_query(transport)?;

    if raw.flags.has(BootloaderFlags::FULL_ECHO) != echo_mode {
        log::error!(
            "handshake: FULL_ECHO flag ({}) disagrees with probed echo mode ({echo_mode})",
            raw.flags.has(BootloaderFlags::FULL_ECHO)
        );
    }
    if raw.flags.has(BootloaderFlags::BINARY) != raw.binary_mode {
        log::error!(
            "handshake: BINARY flag ({}) disagrees with probed binary mode ({})",
            raw.flags.has(BootloaderFlags::BINARY),
            raw.binary_mode
        );
    }

    session.echo_mode = echo_mode;
    session.binary_mode = raw.binary_mode;
    session.flags = raw.flags;
    session.bootloader_offset = raw.bootloader_offset;

    let (offset, flags) = protocol::cmd_q(session, transport)?;
    session.bootloader_offset = offset;
    session.flags = flags;
    Ok(())
}

/// Runs the handshake, retrying the whole sequence up to `MAX_ATTEMPTS`
/// times. Each retry gets a fresh session (any partial state from a failed
/// attempt is discarded, not mutated further).
pub fn handshake(
    transport: &mut dyn ByteTransport,
    start_command: &str,
    page_size: u16,
) -> TbootResult<Session> {
    let command = unescape_command(start_command)?;
    let mut last_err = None;

    for _ in 0..MAX_ATTEMPTS {
        let mut session = Session::new(0, page_size);
        match attempt(&mut session, transport, &command) {
            Ok(()) => return Ok(session),
            Err(e) => {
                log::warn!("handshake attempt failed: {e}");
                last_err = Some(e);
            }
        }
    }

    let _ = last_err;
    Err(TbootError::HandshakeFailed {
        attempts: MAX_ATTEMPTS,
    })
}

/// Short sleep between retries to give the target time to settle. Kept
/// separate from `handshake` so tests can call it zero times.
pub fn retry_delay() -> Duration {
    Duration::from_millis(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedTransport;

    #[test]
    fn unescape_handles_all_documented_escapes() {
        assert_eq!(unescape_command("a\\nb\\r\\t\\\\\\x41").unwrap(), b"a\nb\r\t\\A");
    }

    #[test]
    fn unescape_rejects_unknown_escape() {
        assert!(unescape_command("\\q").is_err());
    }

    #[test]
    fn echo_probe_detects_echo_mode_after_four_hits() {
        // Each round: sent digit, echoed digit, then '!'
        let mut bytes = Vec::new();
        for i in (6..=9).rev() {
            bytes.push(b'0' + i);
            bytes.push(b'!');
        }
        let mut t = ScriptedTransport::new(&bytes);
        assert!(probe_echo_mode(&mut t).unwrap());
    }

    #[test]
    fn echo_probe_detects_no_echo_after_five_hits() {
        let bytes = vec![b'!'; 10];
        let mut t = ScriptedTransport::new(&bytes);
        assert!(!probe_echo_mode(&mut t).unwrap());
    }

    #[test]
    fn raw_query_decodes_hex_response_with_corrected_flags_bytes() {
        // ch1-4 arbitrary hex, ch5='1' + ch6='0' -> offset hi=0x10,
        // ch7='0' + ch8='0' -> offset lo=0x00, ch9='0' + ch10='4' -> flags=0x04
        let mut bytes = b"0000100004".to_vec();
        bytes.push(0x0d);
        let mut t = ScriptedTransport::new(&bytes);
        let r = raw_query(&mut t).unwrap();
        assert!(!r.binary_mode);
        assert_eq!(r.bootloader_offset, 0x1000);
        assert_eq!(r.flags.0, 0x04);
    }

    #[test]
    fn raw_query_decodes_binary_response() {
        let mut t = ScriptedTransport::new(&[0x00, 0x00, 0x10, 0x00, 0x04, 0x0d]);
        let r = raw_query(&mut t).unwrap();
        assert!(r.binary_mode);
        assert_eq!(r.bootloader_offset, 0x1000);
        assert_eq!(r.flags.0, 0x04);
    }
}
