//! Command-line surface, `clap`-derived. This module only parses and
//! validates argument *shape*; cross-checking `-U` targets against a
//! loaded device descriptor happens in `main`.

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;

use crate::error::TbootError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTarget {
    Flash,
    Eeprom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
    Verify,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryOp {
    pub target: MemoryTarget,
    pub kind: OperationKind,
    pub file: PathBuf,
}

impl FromStr for MemoryOp {
    type Err = TbootError;

    /// Parses `<mem>:<op>:<file>`, e.g. `flash:w:firmware.hex`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(mem), Some(op), Some(file)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(TbootError::CliParse(format!(
                "-U expects <mem>:<op>:<file>, got '{s}'"
            )));
        };

        let target = match mem {
            "flash" => MemoryTarget::Flash,
            "eeprom" => MemoryTarget::Eeprom,
            other => {
                return Err(TbootError::CliParse(format!(
                    "unknown memory target '{other}' (expected flash or eeprom)"
                )))
            }
        };
        let kind = match op {
            "r" => OperationKind::Read,
            "w" => OperationKind::Write,
            "v" => OperationKind::Verify,
            other => {
                return Err(TbootError::CliParse(format!(
                    "unknown operation '{other}' (expected r, w or v)"
                )))
            }
        };
        let file = PathBuf::from(file);
        match file.extension().and_then(|e| e.to_str()) {
            Some("hex") | Some("bin") => {}
            _ => {
                return Err(TbootError::CliParse(format!(
                    "file '{}' must have a .hex or .bin extension",
                    file.display()
                )))
            }
        }

        Ok(MemoryOp { target, kind, file })
    }
}

/// Host-side AVR bootloader programmer, `avrdude -U`-compatible.
#[derive(Debug, Parser)]
#[command(name = "tboot", version, about)]
pub struct Cli {
    /// Device id, matching a `DEVICE.id` in the config file
    #[arg(short = 'p', long = "partno")]
    pub partno: String,

    /// Serial baud rate
    #[arg(short = 'b', long = "baudrate")]
    pub baudrate: Option<u32>,

    /// Path to the config file
    #[arg(short = 'C', long = "config", default_value = "tboot.conf")]
    pub config: PathBuf,

    /// Serial device name
    #[arg(short = 'P', long = "port")]
    pub port: Option<String>,

    /// Memory operation, repeatable: <mem>:<op>:<file>
    #[arg(short = 'U', long = "memop")]
    pub memops: Vec<MemoryOp>,

    /// Disable actual flash writes (debug)
    #[arg(short = 'n', long = "no-write")]
    pub no_write: bool,

    /// Skip verify after write
    #[arg(short = 'V', long = "no-verify")]
    pub no_verify: bool,

    /// Verbose logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Quiet progress output
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_op_parses_well_formed_argument() {
        let op = MemoryOp::from_str("flash:w:firmware.hex").unwrap();
        assert_eq!(op.target, MemoryTarget::Flash);
        assert_eq!(op.kind, OperationKind::Write);
        assert_eq!(op.file, PathBuf::from("firmware.hex"));
    }

    #[test]
    fn memory_op_rejects_bad_extension() {
        assert!(MemoryOp::from_str("flash:w:firmware.txt").is_err());
    }

    #[test]
    fn memory_op_rejects_unknown_target() {
        assert!(MemoryOp::from_str("sram:w:x.bin").is_err());
    }

    #[test]
    fn memory_op_rejects_too_few_fields() {
        assert!(MemoryOp::from_str("flash:w").is_err());
    }
}
