//! Configuration file loader: flat `key = value` pairs plus `DEVICE … END`
//! blocks. Everything here is validated eagerly, with a line number on
//! every failure, so the core only ever sees an already-valid [`Config`].

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{TbootError, TbootResult};

/// An immutable target-part record, loaded from a `DEVICE … END` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: String,
    pub desc: String,
    pub rom_size: usize,
    pub page_size: u16,
    pub eeprom_size: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: Option<String>,
    pub baudrate: u32,
    pub verify: bool,
    pub verbose: bool,
    pub quellprogress: bool,
    pub smart: bool,
    pub device: Option<String>,
    pub read_timeout_us: u64,
    pub write_timeout_us: u64,
    pub logging_level: i32,
    pub start_command: String,
    pub finish_command: String,
    pub devices: Vec<DeviceDescriptor>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: None,
            baudrate: 115_200,
            verify: true,
            verbose: false,
            quellprogress: false,
            smart: true,
            device: None,
            read_timeout_us: 1000,
            write_timeout_us: 1000,
            logging_level: 0,
            start_command: String::new(),
            finish_command: String::new(),
            devices: Vec::new(),
        }
    }
}

impl Config {
    pub fn find_device(&self, id: &str) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| d.id == id)
    }
}

struct Parser<'a> {
    path: &'a Path,
}

impl<'a> Parser<'a> {
    fn err(&self, line: usize, message: impl Into<String>) -> TbootError {
        TbootError::ConfigParse {
            path: self.path.to_path_buf(),
            line,
            message: message.into(),
        }
    }

    fn parse_str(&self, line: usize, value: &str) -> TbootResult<String> {
        if value.len() < 2 || !value.starts_with('"') || !value.ends_with('"') {
            return Err(self.err(line, format!("expected quoted string, got '{value}'")));
        }
        Ok(value[1..value.len() - 1].to_string())
    }

    fn parse_bool(&self, line: usize, value: &str) -> TbootResult<bool> {
        match value {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(self.err(line, format!("expected true/false, got '{other}'"))),
        }
    }

    fn parse_uint(&self, line: usize, value: &str) -> TbootResult<u64> {
        value
            .parse::<u64>()
            .map_err(|_| self.err(line, format!("expected unsigned integer, got '{value}'")))
    }

    fn parse_int(&self, line: usize, value: &str) -> TbootResult<i64> {
        value
            .parse::<i64>()
            .map_err(|_| self.err(line, format!("expected integer, got '{value}'")))
    }

    /// Parses a quoted `startCommand`/`finishCommand` value and validates
    /// its escape sequences eagerly, so a malformed `\x` or unknown escape
    /// is a config-load-time error rather than surfacing later, mid-handshake.
    fn parse_command(&self, line: usize, value: &str) -> TbootResult<String> {
        let raw = self.parse_str(line, value)?;
        crate::handshake::unescape_command(&raw)
            .map_err(|_| self.err(line, format!("invalid escape sequence in '{raw}'")))?;
        Ok(raw)
    }
}

/// A line is a comment only when `#` is its first non-blank character;
/// `#` appearing inside real content (e.g. a quoted value) is left alone.
fn strip_comment(line: &str) -> &str {
    if line.trim_start().starts_with('#') {
        ""
    } else {
        line
    }
}

fn split_key_value<'a>(parser: &Parser<'_>, line_no: usize, line: &'a str) -> TbootResult<(&'a str, &'a str)> {
    let idx = line
        .find('=')
        .ok_or_else(|| parser.err(line_no, format!("expected 'key = value', got '{line}'")))?;
    Ok((line[..idx].trim(), line[idx + 1..].trim()))
}

#[derive(Default)]
struct PendingDevice {
    id: Option<String>,
    desc: Option<String>,
    rom_size: Option<usize>,
    page_size: Option<u16>,
    eeprom_size: Option<usize>,
}

impl PendingDevice {
    fn finish(self, parser: &Parser<'_>, line_no: usize) -> TbootResult<DeviceDescriptor> {
        Ok(DeviceDescriptor {
            id: self
                .id
                .ok_or_else(|| parser.err(line_no, "device block missing 'id'"))?,
            desc: self.desc.unwrap_or_default(),
            rom_size: self
                .rom_size
                .ok_or_else(|| parser.err(line_no, "device block missing 'rom_size'"))?,
            page_size: self
                .page_size
                .ok_or_else(|| parser.err(line_no, "device block missing 'page_size'"))?,
            eeprom_size: self.eeprom_size.unwrap_or(0),
        })
    }
}

/// Parses a config file's text. Separated from [`load_config`] so tests
/// don't need real files on disk.
pub fn parse_config(path: &Path, text: &str) -> TbootResult<Config> {
    let parser = Parser { path };
    let mut config = Config::default();
    let mut device: Option<PendingDevice> = None;

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        if line == "DEVICE" {
            if device.is_some() {
                return Err(parser.err(line_no, "nested DEVICE block ('END' expected first)"));
            }
            device = Some(PendingDevice::default());
            continue;
        }
        if line == "END" {
            let pending = device
                .take()
                .ok_or_else(|| parser.err(line_no, "'END' without matching 'DEVICE'"))?;
            config.devices.push(pending.finish(&parser, line_no)?);
            continue;
        }

        let (key, value) = split_key_value(&parser, line_no, line)?;

        if let Some(dev) = device.as_mut() {
            match key {
                "id" => dev.id = Some(parser.parse_str(line_no, value)?),
                "desc" => dev.desc = Some(parser.parse_str(line_no, value)?),
                "rom_size" => dev.rom_size = Some(parser.parse_uint(line_no, value)? as usize),
                "page_size" => dev.page_size = Some(parser.parse_uint(line_no, value)? as u16),
                "eeprom_size" => dev.eeprom_size = Some(parser.parse_uint(line_no, value)? as usize),
                other => return Err(parser.err(line_no, format!("unknown device param '{other}'"))),
            }
            continue;
        }

        match key {
            "port" => config.port = Some(parser.parse_str(line_no, value)?),
            "baudrate" => config.baudrate = parser.parse_uint(line_no, value)? as u32,
            "verify" => config.verify = parser.parse_bool(line_no, value)?,
            "verbose" => config.verbose = parser.parse_bool(line_no, value)?,
            "quellprogress" => config.quellprogress = parser.parse_bool(line_no, value)?,
            "smart" => config.smart = parser.parse_bool(line_no, value)?,
            "device" => config.device = Some(parser.parse_str(line_no, value)?),
            "readTimeout" => config.read_timeout_us = parser.parse_uint(line_no, value)?,
            "writeTimeout" => config.write_timeout_us = parser.parse_uint(line_no, value)?,
            "loggingLevel" => config.logging_level = parser.parse_int(line_no, value)? as i32,
            "startCommand" => config.start_command = parser.parse_command(line_no, value)?,
            "finishCommand" => config.finish_command = parser.parse_command(line_no, value)?,
            other => return Err(parser.err(line_no, format!("unknown config param '{other}'"))),
        }
    }

    if device.is_some() {
        return Err(parser.err(text.lines().count(), "unterminated DEVICE block ('END' expected)"));
    }

    Ok(config)
}

pub fn load_config(path: &Path) -> TbootResult<Config> {
    let text = fs::read_to_string(path).map_err(|e| TbootError::FileIo {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_config(path, &text)
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("tboot.conf")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_top_level_keys_and_device_block() {
        let text = r#"
# a comment
port = "/dev/ttyUSB0"
baudrate = 19200
verify = true
smart = false
startCommand = "r\n"

DEVICE
id = "m328p"
desc = "ATmega328P"
rom_size = 32768
page_size = 128
eeprom_size = 1024
END
"#;
        let config = parse_config(Path::new("t.conf"), text).unwrap();
        assert_eq!(config.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.baudrate, 19200);
        assert!(config.verify);
        assert!(!config.smart);
        assert_eq!(config.start_command, "r\\n");
        assert_eq!(config.devices.len(), 1);
        let dev = &config.devices[0];
        assert_eq!(dev.id, "m328p");
        assert_eq!(dev.rom_size, 32768);
        assert_eq!(dev.page_size, 128);
    }

    #[test]
    fn unknown_key_is_fatal_with_line_number() {
        let text = "bogus = 1\n";
        let err = parse_config(Path::new("t.conf"), text).unwrap_err();
        match err {
            TbootError::ConfigParse { line, .. } => assert_eq!(line, 1),
            other => panic!("expected ConfigParse, got {other:?}"),
        }
    }

    #[test]
    fn malformed_bool_is_fatal() {
        let text = "verify = yes\n";
        assert!(parse_config(Path::new("t.conf"), text).is_err());
    }

    #[test]
    fn unterminated_device_block_is_fatal() {
        let text = "DEVICE\nid = \"x\"\n";
        assert!(parse_config(Path::new("t.conf"), text).is_err());
    }

    #[test]
    fn device_block_requires_id_and_sizes() {
        let text = "DEVICE\ndesc = \"no id\"\nEND\n";
        assert!(parse_config(Path::new("t.conf"), text).is_err());
    }

    #[test]
    fn hash_inside_a_value_is_not_a_comment() {
        let text = "startCommand = \"re#set\"\n";
        let config = parse_config(Path::new("t.conf"), text).unwrap();
        assert_eq!(config.start_command, "re#set");
    }

    #[test]
    fn comment_line_is_skipped_entirely() {
        let text = "# port = \"/dev/ttyUSB0\"\nbaudrate = 9600\n";
        let config = parse_config(Path::new("t.conf"), text).unwrap();
        assert_eq!(config.port, None);
        assert_eq!(config.baudrate, 9600);
    }

    #[test]
    fn unknown_escape_in_start_command_is_fatal_at_load_time() {
        let text = "startCommand = \"\\q\"\n";
        let err = parse_config(Path::new("t.conf"), text).unwrap_err();
        match err {
            TbootError::ConfigParse { line, .. } => assert_eq!(line, 1),
            other => panic!("expected ConfigParse, got {other:?}"),
        }
    }
}
