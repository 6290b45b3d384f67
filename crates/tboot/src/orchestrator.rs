//! Programmer orchestrator: drives the protocol engine page-by-page for
//! read, smart/plain write, and verify operations.

use crate::error::{TbootError, TbootResult};
use crate::image::Image;
use crate::protocol::{self, BootloaderFlags, Session};
use crate::transport::ByteTransport;
use crate::ui::ProgressSink;

/// One address where the chip's contents differ from the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub address: usize,
    pub chip: u8,
    pub file: u8,
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub mismatches: Vec<Mismatch>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.mismatches.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriteReport {
    pub pages_written: usize,
    pub page_count: usize,
}

fn read_block(
    session: &mut Session,
    transport: &mut dyn ByteTransport,
    offset: u16,
    len: u16,
) -> TbootResult<Vec<u8>> {
    protocol::cmd_z(session, transport, offset)?;
    protocol::cmd_r(session, transport, len)
}

/// Reads `n` bytes starting at address 0, in blocks sized per the
/// `FAST_READ` capability bit.
pub fn read_all(
    session: &mut Session,
    transport: &mut dyn ByteTransport,
    n: usize,
    progress: &mut dyn ProgressSink,
) -> TbootResult<Vec<u8>> {
    let max_read: usize = if session.flags.has(BootloaderFlags::FAST_READ) {
        0x1000
    } else {
        0xff
    };
    let mut out = Vec::with_capacity(n);
    progress.start(n as u64, "reading");
    let mut offset = 0usize;
    while offset < n {
        let block = max_read.min(n - offset);
        let data = read_block(session, transport, offset as u16, block as u16)?;
        out.extend_from_slice(&data);
        progress.advance(block as u64);
        offset += block;
    }
    progress.finish("read complete");
    Ok(out)
}

/// Writes one page: erase, load, (re-set Z), commit — each step gated by
/// `write_disabled` and `FAST_WRITE` as specified.
pub fn write_page(
    session: &mut Session,
    transport: &mut dyn ByteTransport,
    offset: u16,
    page_bytes: &[u8],
) -> TbootResult<()> {
    if page_bytes.len() != session.page_size as usize || page_bytes.len() % 2 != 0 {
        return Err(TbootError::ProtocolState(format!(
            "page buffer of {} bytes does not match page size {}",
            page_bytes.len(),
            session.page_size
        )));
    }

    protocol::cmd_z(session, transport, offset)?;
    if !session.write_disabled {
        protocol::cmd_p(session, transport, 0x03)?;
    }
    protocol::cmd_w(session, transport, page_bytes)?;
    let fast_write = session.flags.has(BootloaderFlags::FAST_WRITE);
    if !fast_write {
        protocol::cmd_z(session, transport, offset)?;
    }
    if !session.write_disabled && !fast_write {
        protocol::cmd_p(session, transport, 0x05)?;
    }
    Ok(())
}

/// Writes `image` page by page. In smart mode, the chip's current contents
/// are read first and pages whose target bytes already match are skipped
/// entirely.
pub fn write_all(
    session: &mut Session,
    transport: &mut dyn ByteTransport,
    image: &Image,
    smart: bool,
    progress: &mut dyn ProgressSink,
) -> TbootResult<WriteReport> {
    let page_size = session.page_size as usize;
    if page_size == 0 {
        return Err(TbootError::ProtocolState("page size is zero".to_string()));
    }
    let page_count = (image.size() + page_size - 1) / page_size;
    let writable = session.bootloader_offset as usize;
    if image.size() > writable {
        return Err(TbootError::OverCapacity {
            image_size: image.size(),
            available: writable,
        });
    }

    let mirror = if smart {
        Some(read_all(session, transport, page_count * page_size, progress)?)
    } else {
        None
    };

    let mut pages_written = 0usize;
    progress.start(page_count as u64, "writing");
    for page_idx in 0..page_count {
        let base = page_idx * page_size;
        let mut write_page_flag = false;
        let mut need_reading = false;

        for i in 0..page_size {
            let addr = base + i;
            if addr >= image.size() || !image.is_defined(addr) {
                need_reading = true;
                continue;
            }
            if smart {
                let mirror_byte = mirror.as_ref().expect("smart mirror present")[addr];
                if image.get(addr).expect("defined cell") != mirror_byte {
                    write_page_flag = true;
                }
            } else {
                write_page_flag = true;
            }
        }

        if write_page_flag {
            let mut buf = vec![0u8; page_size];
            if need_reading {
                if let Some(mirror) = &mirror {
                    buf.copy_from_slice(&mirror[base..base + page_size]);
                } else {
                    let chip_bytes = read_block(session, transport, base as u16, page_size as u16)?;
                    buf.copy_from_slice(&chip_bytes);
                }
            }
            for i in 0..page_size {
                let addr = base + i;
                if addr < image.size() && image.is_defined(addr) {
                    buf[i] = image.get(addr).expect("defined cell");
                }
            }
            write_page(session, transport, base as u16, &buf)?;
            pages_written += 1;
        }
        progress.advance(1);
    }
    progress.finish("write complete");

    Ok(WriteReport {
        pages_written,
        page_count,
    })
}

/// Reads the full chip and compares every defined image byte against it.
/// Scans to completion regardless of mismatches found.
pub fn verify(
    session: &mut Session,
    transport: &mut dyn ByteTransport,
    image: &Image,
    rom_size: usize,
    progress: &mut dyn ProgressSink,
) -> TbootResult<VerifyReport> {
    let chip = read_all(session, transport, rom_size, progress)?;

    if image.size() > rom_size {
        log::error!(
            "source too large: {} bytes against {} readable bytes",
            image.size(),
            rom_size
        );
    }

    let limit = image.size().min(rom_size);
    let mut mismatches = Vec::new();
    for addr in 0..limit {
        if let Some(file_byte) = image.get(addr) {
            let chip_byte = chip[addr];
            if chip_byte != file_byte {
                mismatches.push(Mismatch {
                    address: addr,
                    chip: chip_byte,
                    file: file_byte,
                });
            }
        }
    }
    Ok(VerifyReport { mismatches })
}
