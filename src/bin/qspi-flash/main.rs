// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! qspi-flash - read, erase, and program the multiplexed QSPI flash chips
//!
//! The QSPI controller and chip multiplexer register windows are mapped
//! through `/dev/mem`, or replaced by simulations with `--simulate`.

mod cli;

use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::{bail, Context};
use clap::Parser;
use cli::{Cli, Commands};
use qspi_flash::sim::{SimulatedFlash, SimulatedRegisters};
use qspi_flash::{Chip, PollLimit, QspiFlash, RegisterPort, FLASH_SIZE, MAX_FLASH_ADDRESS};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let limit = match cli.max_polls {
        Some(polls) => PollLimit::Max(polls),
        None => PollLimit::Unbounded,
    };

    if cli.simulate {
        log::info!("Using simulated QSPI controller and multiplexer");
        let mut flash = QspiFlash::new(SimulatedFlash::new(), SimulatedRegisters::new());
        flash.set_poll_limit(limit);
        run(&mut flash, &cli.command)
    } else {
        run_hardware(&cli, limit)
    }
}

#[cfg(target_os = "linux")]
fn run_hardware(cli: &Cli, limit: PollLimit) -> anyhow::Result<()> {
    use qspi_flash::devmem::{MappedWindow, WINDOW_SIZE};

    let qspi_base = cli.qspi_base.unwrap_or(qspi_flash::QSPI_BASE);
    let mux_base = cli.mux_base.unwrap_or(qspi_flash::MUX_BASE);
    let qspi = MappedWindow::map(qspi_base, WINDOW_SIZE)
        .context("Failed to map QSPI controller registers")?;
    let mux = MappedWindow::map(mux_base, WINDOW_SIZE)
        .context("Failed to map flash multiplexer registers")?;

    let mut flash = QspiFlash::new(qspi, mux);
    flash.set_poll_limit(limit);
    let result = run(&mut flash, &cli.command);

    let (qspi, mux) = flash.into_parts();
    let unmapped = qspi.unmap().and(mux.unmap());
    result?;
    unmapped?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run_hardware(_cli: &Cli, _limit: PollLimit) -> anyhow::Result<()> {
    bail!("Hardware access needs Linux /dev/mem; use --simulate instead")
}

/// Select the requested chip, run the command, then deselect every chip.
fn run<Q: RegisterPort, M: RegisterPort>(flash: &mut QspiFlash<Q, M>, command: &Commands)
    -> anyhow::Result<()>
{
    let chip = Chip::from_number(command.flash())?;
    flash.select_chip(chip)?;
    let result = execute(flash, chip, command);
    let deselected = flash.deselect_chip();
    result?;
    deselected?;
    Ok(())
}

fn execute<Q: RegisterPort, M: RegisterPort>(flash: &mut QspiFlash<Q, M>, chip: Chip,
                                             command: &Commands)
    -> anyhow::Result<()>
{
    match command {
        Commands::Read { address, size, output, .. } => {
            let size = clip_size(*address, size.unwrap_or(FLASH_SIZE))?;
            let file = File::create(output)
                .with_context(|| format!("Failed to create {}", output.display()))?;
            let mut writer = BufWriter::new(file);
            let transfer = flash.read_progress(*address, size, &mut writer)?;
            writer.flush()?;
            println!("Read {} bytes from chip {} at 0x{:08X} to {} (CRC-8 0x{:02X})",
                     transfer.bytes, chip, address, output.display(), transfer.crc);
        },
        Commands::Erase { .. } => {
            flash.erase_progress(chip)?;
            println!("Erased chip {}", chip);
        },
        Commands::Program { address, size, input, verify, .. } => {
            let mut file = File::open(input)
                .with_context(|| format!("Failed to open {}", input.display()))?;
            let file_len = file.metadata()?.len() as usize;
            let size = clip_size(*address, size.unwrap_or(file_len))?;
            let transfer = flash.program_progress(chip, *address, size, &mut file, *verify)?;
            println!("Programmed {} bytes to chip {} at 0x{:08X} (CRC-8 0x{:02X})",
                     transfer.bytes, chip, address, transfer.crc);
        },
        Commands::Id { .. } => {
            let id = flash.read_id()?;
            println!("Chip {}: {}", chip, id);
        },
    }
    Ok(())
}

/// Clip `size` so the operation ends at or before `MAX_FLASH_ADDRESS`.
fn clip_size(address: u32, size: usize) -> anyhow::Result<usize> {
    let available = MAX_FLASH_ADDRESS.saturating_sub(address as usize);
    let clipped = usize::min(size, available);
    if clipped < size {
        log::warn!("Clipping size from {} to {} bytes to stay within flash", size, clipped);
    }
    if clipped == 0 {
        bail!("Nothing to transfer at address 0x{:08X}", address);
    }
    Ok(clipped)
}

#[test]
fn test_clip_size() {
    assert_eq!(clip_size(0, FLASH_SIZE).unwrap(), MAX_FLASH_ADDRESS);
    assert_eq!(clip_size(0x1000, 512).unwrap(), 512);
    assert_eq!(clip_size(MAX_FLASH_ADDRESS as u32 - 10, 100).unwrap(), 10);
    assert!(clip_size(MAX_FLASH_ADDRESS as u32, 1).is_err());
    assert!(clip_size(0, 0).is_err());
}

#[test]
fn test_run_deselects_after_failure() {
    use qspi_flash::sim::Access;
    let mut flash = QspiFlash::new(SimulatedFlash::new(), SimulatedRegisters::new());
    let command = Commands::Erase { chip: cli::ChipArgs { flash: 1 } };
    assert!(run(&mut flash, &command).is_err());
    assert_eq!(flash.mux_port().accesses().last(),
               Some(&Access::Write {
                   offset: qspi_flash::mux::MUX_SELECT_OFFSET,
                   value: qspi_flash::mux::MUX_DESELECT,
                   width: qspi_flash::RegisterWidth::Bits32,
               }));
    assert!(flash.qspi_port().accesses().is_empty());
}
