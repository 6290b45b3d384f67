//! Intel HEX codec.
//!
//! Parses Intel HEX records into a sparse [`Image`](crate::image::Image) and
//! emits a dense byte slice back out as 16-byte-per-line HEX. Record type is
//! modeled as a closed, exhaustively-matched enum rather than raw integers
//! (record types 0/1/2 are the only ones this format defines for our
//! purposes; anything else is a hard parse error).

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

use crate::error::{TbootError, TbootResult};
use crate::image::Image;

enum RecordType {
    Data,
    EndOfFile,
    ExtendedSegmentAddress,
}

impl RecordType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Data),
            0x01 => Some(Self::EndOfFile),
            0x02 => Some(Self::ExtendedSegmentAddress),
            _ => None,
        }
    }
}

fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

fn hex_byte(bytes: &[u8]) -> Option<u8> {
    if bytes.len() != 2 {
        return None;
    }
    let hi = nibble(bytes[0])?;
    let lo = nibble(bytes[1])?;
    Some((hi << 4) | lo)
}

fn hex_word(bytes: &[u8]) -> Option<u16> {
    if bytes.len() != 4 {
        return None;
    }
    let hi = hex_byte(&bytes[0..2])?;
    let lo = hex_byte(&bytes[2..4])?;
    Some(u16::from(hi) << 8 | u16::from(lo))
}

/// Reads an Intel HEX stream into `image`, reporting line numbers against
/// `path` (used for error messages only).
pub fn parse_intel_hex<R: Read>(path: &Path, reader: R, image: &mut Image) -> TbootResult<()> {
    let reader = BufReader::new(reader);
    let mut base: u32 = 0;
    let mut segmented = false;

    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.map_err(|e| TbootError::FileIo {
            path: path.to_path_buf(),
            source: e,
        })?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let lower = line.to_ascii_lowercase();
        let bytes = lower.as_bytes();
        if bytes[0] != b':' {
            return Err(TbootError::HexParse {
                path: path.to_path_buf(),
                line: line_no,
                reason: "expected ':' at start of line".to_string(),
            });
        }
        let body = &bytes[1..];
        if body.len() < 10 {
            return Err(TbootError::HexParse {
                path: path.to_path_buf(),
                line: line_no,
                reason: "record too short".to_string(),
            });
        }

        // Checksum: sum of all decoded bytes (length..checksum inclusive) mod 256 == 0.
        let mut checksum: u8 = 0;
        let mut pos = 0;
        while pos + 2 <= body.len() {
            let b = hex_byte(&body[pos..pos + 2]).ok_or_else(|| TbootError::HexParse {
                path: path.to_path_buf(),
                line: line_no,
                reason: "bad hex digit".to_string(),
            })?;
            checksum = checksum.wrapping_add(b);
            pos += 2;
        }
        if checksum != 0 {
            return Err(TbootError::HexChecksum {
                path: path.to_path_buf(),
                line: line_no,
            });
        }

        let len = hex_byte(&body[0..2]).unwrap() as usize;
        let address = hex_word(&body[2..6]).unwrap();
        let rec_type = hex_byte(&body[6..8]).unwrap();
        let payload = &body[8..8 + len * 2];

        match RecordType::from_byte(rec_type) {
            Some(RecordType::Data) => {
                let base_addr = if segmented { base } else { 0 };
                for i in 0..len {
                    let b = hex_byte(&payload[i * 2..i * 2 + 2]).unwrap();
                    let addr = base_addr as usize + address as usize + i;
                    image.set_byte(addr, b);
                }
            }
            Some(RecordType::EndOfFile) => return Ok(()),
            Some(RecordType::ExtendedSegmentAddress) => {
                if address != 0 {
                    return Err(TbootError::HexParse {
                        path: path.to_path_buf(),
                        line: line_no,
                        reason: "extended segment address record with non-zero offset"
                            .to_string(),
                    });
                }
                let word = hex_word(payload).ok_or_else(|| TbootError::HexParse {
                    path: path.to_path_buf(),
                    line: line_no,
                    reason: "bad extended segment address payload".to_string(),
                })?;
                base = u32::from(word) << 4;
                segmented = true;
            }
            None => {
                return Err(TbootError::HexRecordType {
                    path: path.to_path_buf(),
                    line: line_no,
                    record_type: rec_type,
                });
            }
        }
    }
    Ok(())
}

/// Reads an Intel HEX file from disk into `image`.
pub fn read_intel_hex_file(path: &Path, image: &mut Image) -> TbootResult<()> {
    let file = File::open(path).map_err(|e| TbootError::FileIo {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_intel_hex(path, file, image)
}

/// Reads a raw binary file into `image` (address == file offset).
pub fn read_binary_file(path: &Path, image: &mut Image) -> TbootResult<()> {
    let bytes = std::fs::read(path).map_err(|e| TbootError::FileIo {
        path: path.to_path_buf(),
        source: e,
    })?;
    for (addr, b) in bytes.into_iter().enumerate() {
        image.set_byte(addr, b);
    }
    Ok(())
}

/// Emits `bytes` as 16-byte-record Intel HEX, `CR LF` terminated.
pub fn emit_intel_hex<W: Write>(mut writer: W, bytes: &[u8]) -> std::io::Result<()> {
    let mut offset = 0usize;
    while offset < bytes.len() {
        let len = (bytes.len() - offset).min(16);
        let chunk = &bytes[offset..offset + len];
        let mut checksum: u8 = len as u8;
        checksum = checksum.wrapping_add((offset >> 8) as u8);
        checksum = checksum.wrapping_add(offset as u8);
        for &b in chunk {
            checksum = checksum.wrapping_add(b);
        }
        let checksum = checksum.wrapping_neg();

        write!(writer, ":{:02X}{:04X}00", len, offset)?;
        for &b in chunk {
            write!(writer, "{:02X}", b)?;
        }
        write!(writer, "{:02X}\r\n", checksum)?;
        offset += len;
    }
    write!(writer, ":00000001FF\r\n")
}

/// Writes `bytes` to `path` as Intel HEX.
pub fn write_intel_hex_file(path: &Path, bytes: &[u8]) -> TbootResult<()> {
    let file = File::create(path).map_err(|e| TbootError::FileIo {
        path: path.to_path_buf(),
        source: e,
    })?;
    emit_intel_hex(file, bytes).map_err(|e| TbootError::FileIo {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Writes `bytes` to `path` as raw binary.
pub fn write_binary_file(path: &Path, bytes: &[u8]) -> TbootResult<()> {
    std::fs::write(path, bytes).map_err(|e| TbootError::FileIo {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse_str(s: &str, image: &mut Image) -> TbootResult<()> {
        parse_intel_hex(Path::new("test.hex"), Cursor::new(s.as_bytes()), image)
    }

    #[test]
    fn round_trip_dense_buffer() {
        let original: Vec<u8> = (0..=255u16).map(|i| (i % 256) as u8).collect();
        let mut out = Vec::new();
        emit_intel_hex(&mut out, &original).unwrap();

        let mut image = Image::with_capacity(original.len() + 1);
        parse_str(std::str::from_utf8(&out).unwrap(), &mut image).unwrap();

        assert_eq!(image.defined_count(), original.len());
        for (addr, &b) in original.iter().enumerate() {
            assert_eq!(image.get(addr), Some(b));
        }
    }

    #[test]
    fn checksum_law_holds_for_emitted_records() {
        let data = vec![1u8, 2, 3, 4, 5];
        let mut out = Vec::new();
        emit_intel_hex(&mut out, &data).unwrap();
        for line in std::str::from_utf8(&out).unwrap().lines() {
            if line.is_empty() {
                continue;
            }
            let lower = line.to_ascii_lowercase();
            let body = &lower.as_bytes()[1..];
            let mut sum: u8 = 0;
            let mut pos = 0;
            while pos + 2 <= body.len() {
                sum = sum.wrapping_add(hex_byte(&body[pos..pos + 2]).unwrap());
                pos += 2;
            }
            assert_eq!(sum, 0);
        }
    }

    #[test]
    fn segment_extension_lands_data_at_segmented_address() {
        let hex = ":020000021000EC\r\n:10000000000102030405060708090A0B0C0D0E0F78\r\n:00000001FF\r\n";
        let mut image = Image::with_capacity(0x20000);
        parse_str(hex, &mut image).unwrap();
        assert_eq!(image.get(0x0001_0000), Some(0x00));
        assert_eq!(image.get(0x0001_0005), Some(0x05));
    }

    #[test]
    fn bad_checksum_is_rejected_with_line_number() {
        let hex = ":03000000010203F8\r\n";
        let mut image = Image::with_capacity(16);
        let err = parse_str(hex, &mut image).unwrap_err();
        match err {
            TbootError::HexChecksum { line, .. } => assert_eq!(line, 1),
            other => panic!("expected HexChecksum, got {other:?}"),
        }
        assert_eq!(image.defined_count(), 0);
    }

    #[test]
    fn unknown_record_type_is_fatal() {
        let hex = ":00000003FD\r\n";
        let mut image = Image::with_capacity(16);
        let err = parse_str(hex, &mut image).unwrap_err();
        assert!(matches!(err, TbootError::HexRecordType { record_type: 3, .. }));
    }

    #[test]
    fn non_colon_line_is_fatal() {
        let hex = "not a hex record\r\n";
        let mut image = Image::with_capacity(16);
        assert!(parse_str(hex, &mut image).is_err());
    }

    #[test]
    fn blank_lines_are_skipped() {
        let hex = "\r\n:00000001FF\r\n\r\n";
        let mut image = Image::with_capacity(16);
        parse_str(hex, &mut image).unwrap();
        assert_eq!(image.defined_count(), 0);
    }
}
