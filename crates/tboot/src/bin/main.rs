use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use tboot::cli::{Cli, MemoryOp, MemoryTarget, OperationKind};
use tboot::config::{self, Config, DeviceDescriptor};
use tboot::error::TbootError;
use tboot::handshake;
use tboot::hexfile;
use tboot::image::Image;
use tboot::orchestrator;
use tboot::transport::{self, ByteTransport, SerialTransport};
use tboot::ui::{self, NullProgress, ProgressSink, TermProgress};

const EXIT_OK: u8 = 0;
const EXIT_BAD_CLI: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_PORT_OPEN: u8 = 3;
const EXIT_CHIP_IO: u8 = 4;
const EXIT_FILE_IO: u8 = 5;
const EXIT_OVER_CAPACITY: u8 = 6;
const EXIT_EEPROM_UNSUPPORTED: u8 = 10;
const EXIT_FINISH_COMMAND: u8 = 100;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // clap's own exit_code() is 0 for --help/--version, 2 for a
            // genuine usage error; remap the latter to our own EXIT_BAD_CLI
            // so it doesn't collide with this crate's EXIT_CONFIG (also 2).
            let code = if e.exit_code() == 0 { EXIT_OK } else { EXIT_BAD_CLI };
            return ExitCode::from(code);
        }
    };
    ui::setup_logging(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(code) => ExitCode::from(code),
    }
}

fn run(cli: &Cli) -> Result<(), u8> {
    let config = config::load_config(&cli.config).map_err(|e| {
        log::error!("config error: {e}");
        EXIT_CONFIG
    })?;

    let device = config.find_device(&cli.partno).cloned().ok_or_else(|| {
        log::error!("unknown device id '{}'", cli.partno);
        EXIT_BAD_CLI
    })?;

    if cli.memops.is_empty() {
        log::error!("no -U operations given");
        return Err(EXIT_BAD_CLI);
    }
    if cli.memops.iter().any(|op| op.target == MemoryTarget::Eeprom) {
        log::error!("EEPROM operations are not supported");
        return Err(EXIT_EEPROM_UNSUPPORTED);
    }

    let port = cli
        .port
        .clone()
        .or_else(|| config.port.clone())
        .ok_or_else(|| {
            log::error!("no serial port given (-P or config 'port')");
            EXIT_BAD_CLI
        })?;
    let baudrate = cli.baudrate.unwrap_or(config.baudrate);
    let read_timeout_us = transport::default_read_timeout_us(config.read_timeout_us, baudrate);

    let mut port_handle = SerialTransport::open(
        &port,
        baudrate,
        Duration::from_micros(read_timeout_us),
        Duration::from_micros(config.write_timeout_us),
    )
    .map_err(|e| {
        log::error!("{e}");
        EXIT_PORT_OPEN
    })?;

    let result = run_operations(cli, &config, &device, &mut port_handle);
    let _ = port_handle.flush();
    result
}

fn run_operations(
    cli: &Cli,
    config: &Config,
    device: &DeviceDescriptor,
    transport: &mut dyn ByteTransport,
) -> Result<(), u8> {
    let mut session = handshake::handshake(transport, &config.start_command, device.page_size)
        .map_err(|e| {
            log::error!("handshake failed: {e}");
            EXIT_CHIP_IO
        })?;
    session.write_disabled = cli.no_write;

    let mut progress: Box<dyn ProgressSink> = if cli.quiet || config.quellprogress {
        Box::new(NullProgress)
    } else {
        Box::new(TermProgress::new())
    };

    let verify_after_write = config.verify && !cli.no_verify;

    for op in &cli.memops {
        match op.kind {
            OperationKind::Read => do_read(&mut session, transport, op, device, progress.as_mut())?,
            OperationKind::Write => {
                do_write(&mut session, transport, op, device, config, progress.as_mut())?;
                if verify_after_write {
                    do_verify(&mut session, transport, op, device, progress.as_mut())?;
                }
            }
            OperationKind::Verify => do_verify(&mut session, transport, op, device, progress.as_mut())?,
        }
    }

    if !config.finish_command.is_empty() {
        let command = handshake::unescape_command(&config.finish_command).map_err(|e| {
            log::error!("finish command error: {e}");
            EXIT_FINISH_COMMAND
        })?;
        for &b in &command {
            transport.write_byte(b).map_err(|e| {
                log::error!("finish command send failed: {e}");
                EXIT_FINISH_COMMAND
            })?;
        }
    }

    Ok(())
}

fn do_read(
    session: &mut tboot::protocol::Session,
    transport: &mut dyn ByteTransport,
    op: &MemoryOp,
    device: &DeviceDescriptor,
    progress: &mut dyn ProgressSink,
) -> Result<(), u8> {
    let bytes = orchestrator::read_all(session, transport, device.rom_size, progress).map_err(|e| {
        log::error!("read failed: {e}");
        EXIT_CHIP_IO
    })?;

    let is_hex = op.file.extension().and_then(|e| e.to_str()) == Some("hex");
    let result = if is_hex {
        hexfile::write_intel_hex_file(&op.file, &bytes)
    } else {
        hexfile::write_binary_file(&op.file, &bytes)
    };
    result.map_err(|e| {
        log::error!("can't write {}: {e}", op.file.display());
        EXIT_FILE_IO
    })
}

fn load_image(op: &MemoryOp, capacity: usize) -> Result<Image, u8> {
    let mut image = Image::with_capacity(capacity);
    let is_hex = op.file.extension().and_then(|e| e.to_str()) == Some("hex");
    let result = if is_hex {
        hexfile::read_intel_hex_file(&op.file, &mut image)
    } else {
        hexfile::read_binary_file(&op.file, &mut image)
    };
    result.map_err(|e| {
        log::error!("can't read {}: {e}", op.file.display());
        EXIT_FILE_IO
    })?;
    Ok(image)
}

fn do_write(
    session: &mut tboot::protocol::Session,
    transport: &mut dyn ByteTransport,
    op: &MemoryOp,
    device: &DeviceDescriptor,
    config: &Config,
    progress: &mut dyn ProgressSink,
) -> Result<(), u8> {
    let image = load_image(op, device.rom_size)?;
    let report = orchestrator::write_all(session, transport, &image, config.smart, progress).map_err(|e| {
        match e {
            TbootError::OverCapacity { .. } => {
                log::error!("{e}");
                EXIT_OVER_CAPACITY
            }
            other => {
                log::error!("write failed: {other}");
                EXIT_CHIP_IO
            }
        }
    })?;
    log::info!(
        "wrote {}/{} pages for {}",
        report.pages_written,
        report.page_count,
        op.file.display()
    );
    Ok(())
}

fn do_verify(
    session: &mut tboot::protocol::Session,
    transport: &mut dyn ByteTransport,
    op: &MemoryOp,
    device: &DeviceDescriptor,
    progress: &mut dyn ProgressSink,
) -> Result<(), u8> {
    let image = load_image(op, device.rom_size)?;
    let report = orchestrator::verify(session, transport, &image, device.rom_size, progress).map_err(|e| {
        log::error!("verify failed: {e}");
        EXIT_CHIP_IO
    })?;

    for mismatch in &report.mismatches {
        log::error!(
            "verify mismatch at {:#06x}: chip={:#04x} file={:#04x}",
            mismatch.address,
            mismatch.chip,
            mismatch.file
        );
    }
    if !report.is_ok() {
        log::error!(
            "verify failed for {}: {} mismatch(es)",
            op.file.display(),
            report.mismatches.len()
        );
        return Err(EXIT_CHIP_IO);
    }
    Ok(())
}
