//! Protocol engine: the five bootloader commands, layered on top of
//! [`framing`], plus the session state that makes `cmd_z` skippable when
//! the device's address pointer is already known to be where we want it.

use crate::error::{TbootError, TbootResult};
use crate::framing::{self, FramingMode};
use crate::transport::ByteTransport;

/// The device's Z-register address pointer, as tracked host-side.
///
/// The original client used a signed `-1` sentinel for "don't know"; here
/// that's an explicit variant instead of a magic value smuggled through a
/// type that can otherwise hold every real address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZCache {
    Unknown,
    Known(u16),
}

/// Capability bits reported by the bootloader in response to `Q`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootloaderFlags(pub u8);

impl BootloaderFlags {
    pub const SUPPORT_EEPROM: u8 = 1 << 0;
    pub const FULL_ECHO: u8 = 1 << 1;
    pub const BINARY: u8 = 1 << 2;
    pub const FAST_READ: u8 = 1 << 3;
    pub const FAST_WRITE: u8 = 1 << 4;
    pub const NO_CONFIRM: u8 = 1 << 5;

    pub fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

/// All per-connection protocol state. Owns no transport; every command
/// takes one as an argument so the session outlives any single connection
/// attempt.
#[derive(Debug, Clone)]
pub struct Session {
    pub z_cache: ZCache,
    pub echo_mode: bool,
    pub binary_mode: bool,
    pub flags: BootloaderFlags,
    pub bootloader_offset: u16,
    pub page_size: u16,
    pub write_disabled: bool,
    pub write_delay_us: u64,
}

impl Session {
    pub fn new(bootloader_offset: u16, page_size: u16) -> Self {
        Self {
            z_cache: ZCache::Unknown,
            echo_mode: false,
            binary_mode: false,
            flags: BootloaderFlags::default(),
            bootloader_offset,
            page_size,
            write_disabled: false,
            write_delay_us: 0,
        }
    }

    pub fn framing_mode(&self) -> FramingMode {
        FramingMode {
            echo_mode: self.echo_mode,
            binary_mode: self.binary_mode,
            write_delay_us: self.write_delay_us,
        }
    }

    fn confirm(&self, transport: &mut dyn ByteTransport) -> TbootResult<()> {
        if self.flags.has(BootloaderFlags::NO_CONFIRM) {
            return Ok(());
        }
        let got = framing::read_raw_byte(transport)?;
        if got != 0x0d {
            return Err(TbootError::ConfirmationMismatch(got));
        }
        Ok(())
    }

    /// Runs `body`, invalidating the Z-cache on any error — any framing or
    /// confirmation failure leaves the device's actual pointer unknown.
    fn guarded<T>(&mut self, body: impl FnOnce(&mut Self) -> TbootResult<T>) -> TbootResult<T> {
        match body(self) {
            Ok(v) => Ok(v),
            Err(e) => {
                self.z_cache = ZCache::Unknown;
                Err(e)
            }
        }
    }
}

/// `Z` — sets the device's address pointer. Skipped entirely when
/// `session.z_cache` already equals `z`.
pub fn cmd_z(session: &mut Session, transport: &mut dyn ByteTransport, z: u16) -> TbootResult<()> {
    if session.z_cache == ZCache::Known(z) {
        return Ok(());
    }
    let mode = session.framing_mode();
    session.guarded(|session| {
        framing::write_raw_byte(transport, mode, b'Z')?;
        framing::write_word(transport, mode, z)?;
        session.confirm(transport)?;
        session.z_cache = ZCache::Known(z);
        Ok(())
    })
}

/// `R` — reads `len` bytes starting at the device's current pointer.
/// Advances `z_cache` by `len` on success (no re-read of Z needed for the
/// next sequential block).
pub fn cmd_r(
    session: &mut Session,
    transport: &mut dyn ByteTransport,
    len: u16,
) -> TbootResult<Vec<u8>> {
    let mode = session.framing_mode();
    let fast = session.flags.has(BootloaderFlags::FAST_READ);
    session.guarded(|session| {
        framing::write_raw_byte(transport, mode, b'R')?;
        if fast {
            framing::write_word(transport, mode, len)?;
        } else {
            framing::write_data_byte(transport, mode, len as u8)?;
        }
        let mut out = Vec::with_capacity(len as usize);
        for _ in 0..len {
            out.push(framing::read_data_byte(transport, mode)?);
        }
        session.confirm(transport)?;
        if let ZCache::Known(z) = session.z_cache {
            session.z_cache = ZCache::Known(z.wrapping_add(len));
        }
        Ok(out)
    })
}

/// `W` — loads `data` into the device's page buffer starting at the
/// current pointer. `data.len()` must be even (the wire argument is half
/// that, per the device's word-count convention); an empty payload is a
/// local no-op. Advances `z_cache` by `data.len()` on success. Does not
/// itself trigger an SPM operation — see [`cmd_p`].
pub fn cmd_w(session: &mut Session, transport: &mut dyn ByteTransport, data: &[u8]) -> TbootResult<()> {
    if data.is_empty() {
        return Ok(());
    }
    debug_assert!(data.len() % 2 == 0, "page buffer write length must be even");
    let mode = session.framing_mode();
    let advance = data.len() as u16;
    session.guarded(|session| {
        framing::write_raw_byte(transport, mode, b'W')?;
        framing::write_data_byte(transport, mode, (data.len() / 2) as u8)?;
        for &b in data {
            framing::write_data_byte(transport, mode, b)?;
        }
        session.confirm(transport)?;
        if let ZCache::Known(z) = session.z_cache {
            session.z_cache = ZCache::Known(z.wrapping_add(advance));
        }
        Ok(())
    })
}

/// `P` — invokes SPM with `spmcr` loaded into the device's SPMCR register.
/// The orchestrator uses `0x03` (erase) and `0x05` (commit).
pub fn cmd_p(session: &mut Session, transport: &mut dyn ByteTransport, spmcr: u8) -> TbootResult<()> {
    let mode = session.framing_mode();
    session.guarded(|session| {
        framing::write_raw_byte(transport, mode, b'P')?;
        framing::write_data_byte(transport, mode, spmcr)?;
        session.confirm(transport)
    })
}

/// `@` — positions Z at `bootloader_offset` and jumps to the application.
/// Unlike every other command, the trailing confirmation byte is required
/// even when `NO_CONFIRM` is set.
pub fn cmd_jump(session: &mut Session, transport: &mut dyn ByteTransport) -> TbootResult<()> {
    let offset = session.bootloader_offset;
    cmd_z(session, transport, offset)?;
    let mode = session.framing_mode();
    session.guarded(|_session| {
        framing::write_raw_byte(transport, mode, b'@')?;
        let got = framing::read_raw_byte(transport)?;
        if got != 0x0d {
            return Err(TbootError::ConfirmationMismatch(got));
        }
        Ok(())
    })
}

/// `Q` — queries device identity: current Z, bootloader start offset and
/// capability flags. Returns `(bootloader_offset, flags)`. The returned Z
/// is cross-checked against `z_cache` (mismatch is logged, not fatal) and
/// then trusted: `z_cache` becomes `Known(z)` regardless.
pub fn cmd_q(
    session: &mut Session,
    transport: &mut dyn ByteTransport,
) -> TbootResult<(u16, BootloaderFlags)> {
    let mode = session.framing_mode();
    session.guarded(|session| {
        framing::write_raw_byte(transport, mode, b'Q')?;
        let z = framing::read_word(transport, mode)?;
        let offset = framing::read_word(transport, mode)?;
        let flags = framing::read_data_byte(transport, mode)?;
        session.confirm(transport)?;
        if let ZCache::Known(cached) = session.z_cache {
            if cached != z {
                log::error!(
                    "Q reported Z {:#06x}, cached value was {:#06x}; trusting device",
                    z,
                    cached
                );
            }
        }
        session.z_cache = ZCache::Known(z);
        Ok((offset, BootloaderFlags(flags)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedTransport;

    #[test]
    fn z_command_is_skipped_when_cache_matches() {
        let mut session = Session::new(0x1f00, 128);
        session.binary_mode = true;
        session.flags = BootloaderFlags(BootloaderFlags::NO_CONFIRM);
        session.z_cache = ZCache::Known(0x100);

        let mut t = ScriptedTransport::new(&[]);
        cmd_z(&mut session, &mut t, 0x100).unwrap();
        assert!(t.written.is_empty());
    }

    #[test]
    fn z_command_sends_opcode_and_word_when_cache_misses() {
        let mut session = Session::new(0x1f00, 128);
        session.binary_mode = true;
        session.flags = BootloaderFlags(BootloaderFlags::NO_CONFIRM);

        let mut t = ScriptedTransport::new(&[]);
        cmd_z(&mut session, &mut t, 0x1234).unwrap();
        assert_eq!(t.written, vec![b'Z', 0x12, 0x34]);
        assert_eq!(session.z_cache, ZCache::Known(0x1234));
    }

    #[test]
    fn failed_command_invalidates_z_cache() {
        let mut session = Session::new(0x1f00, 128);
        session.binary_mode = true;
        session.echo_mode = true;
        session.z_cache = ZCache::Known(0x10);

        // echo mismatch on the opcode byte
        let mut t = ScriptedTransport::new(&[0xff]);
        let err = cmd_z(&mut session, &mut t, 0x20).unwrap_err();
        assert!(matches!(err, TbootError::FramingEcho { .. }));
        assert_eq!(session.z_cache, ZCache::Unknown);
    }

    #[test]
    fn read_advances_known_cache_by_length() {
        let mut session = Session::new(0x1f00, 128);
        session.binary_mode = true;
        session.flags = BootloaderFlags(BootloaderFlags::NO_CONFIRM | BootloaderFlags::FAST_READ);
        session.z_cache = ZCache::Known(0x100);

        let mut t = ScriptedTransport::new(&[1, 2, 3, 4]);
        let data = cmd_r(&mut session, &mut t, 4).unwrap();
        assert_eq!(data, vec![1, 2, 3, 4]);
        assert_eq!(session.z_cache, ZCache::Known(0x104));
    }

    #[test]
    fn write_sends_half_length_then_full_payload() {
        let mut session = Session::new(0x1f00, 128);
        session.binary_mode = true;
        session.flags = BootloaderFlags(BootloaderFlags::NO_CONFIRM);
        session.z_cache = ZCache::Known(0);

        let mut t = ScriptedTransport::new(&[]);
        cmd_w(&mut session, &mut t, &[1, 2, 3, 4]).unwrap();
        assert_eq!(t.written, vec![b'W', 2, 1, 2, 3, 4]);
        assert_eq!(session.z_cache, ZCache::Known(4));
    }

    #[test]
    fn write_with_empty_payload_is_a_local_no_op() {
        let mut session = Session::new(0x1f00, 128);
        session.binary_mode = true;
        session.z_cache = ZCache::Known(5);

        let mut t = ScriptedTransport::new(&[]);
        cmd_w(&mut session, &mut t, &[]).unwrap();
        assert!(t.written.is_empty());
        assert_eq!(session.z_cache, ZCache::Known(5));
    }

    #[test]
    fn p_command_sends_opcode_and_spmcr_value() {
        let mut session = Session::new(0x1f00, 128);
        session.binary_mode = true;
        session.flags = BootloaderFlags(BootloaderFlags::NO_CONFIRM);

        let mut t = ScriptedTransport::new(&[]);
        cmd_p(&mut session, &mut t, 0x03).unwrap();
        assert_eq!(t.written, vec![b'P', 0x03]);
    }

    #[test]
    fn query_parses_offset_and_flags_and_trusts_device_z() {
        let mut session = Session::new(0x1f00, 128);
        session.binary_mode = true;
        session.flags = BootloaderFlags(BootloaderFlags::NO_CONFIRM);
        session.z_cache = ZCache::Known(0x0050);

        // z=0x0060 (mismatch vs cached 0x0050), offset=0x1f00, flags=0b0111
        let mut t = ScriptedTransport::new(&[0x00, 0x60, 0x1f, 0x00, 0b0000_0111]);
        let (offset, flags) = cmd_q(&mut session, &mut t).unwrap();
        assert_eq!(offset, 0x1f00);
        assert!(flags.has(BootloaderFlags::SUPPORT_EEPROM));
        assert!(flags.has(BootloaderFlags::FULL_ECHO));
        assert!(flags.has(BootloaderFlags::BINARY));
        assert!(!flags.has(BootloaderFlags::FAST_READ));
        assert_eq!(session.z_cache, ZCache::Known(0x0060));
    }

    #[test]
    fn jump_positions_z_before_sending_opcode() {
        let mut session = Session::new(0x1f00, 128);
        session.binary_mode = true;
        session.flags = BootloaderFlags(BootloaderFlags::NO_CONFIRM);
        // z_cache starts unknown, so cmd_jump's internal cmd_z must run.

        let mut t = ScriptedTransport::new(&[0x0d]);
        cmd_jump(&mut session, &mut t).unwrap();
        assert_eq!(t.written, vec![b'Z', 0x1f, 0x00, b'@']);
    }

    #[test]
    fn jump_confirmation_is_required_even_under_no_confirm() {
        let mut session = Session::new(0x1f00, 128);
        session.binary_mode = true;
        session.flags = BootloaderFlags(BootloaderFlags::NO_CONFIRM);
        session.z_cache = ZCache::Known(0x1f00);

        // cmd_z is a no-op (cache already matches); only '@' itself is sent,
        // and its trailing confirmation byte is still mandatory even though
        // NO_CONFIRM would have skipped it for every other command.
        let mut t = ScriptedTransport::new(&[0xff]);
        let err = cmd_jump(&mut session, &mut t).unwrap_err();
        assert_eq!(t.written, vec![b'@']);
        assert!(matches!(err, TbootError::ConfirmationMismatch(0xff)));
    }
}
