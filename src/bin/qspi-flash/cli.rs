// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Command line argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Parse a string as a hex or decimal u64
pub fn parse_hex_u64(s: &str) -> Result<u64, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        u64::from_str_radix(s, 16).map_err(|e| format!("Invalid hex value: {}", e))
    }
}

/// Parse a flash address, given in hex with or without a `0x` prefix
pub fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let value = parse_hex_u64(s)?;
    if value > u32::MAX as u64 {
        return Err(format!("Address 0x{:X} does not fit in 32 bits", value));
    }
    Ok(value as u32)
}

#[derive(Parser)]
#[command(name = "qspi-flash")]
#[command(author, version, about = "Read, erase, and program multiplexed QSPI flash", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Physical base address of the QSPI controller (hex)
    #[arg(long, value_parser = parse_hex_u64, global = true)]
    pub qspi_base: Option<u64>,

    /// Physical base address of the chip multiplexer (hex)
    #[arg(long, value_parser = parse_hex_u64, global = true)]
    pub mux_base: Option<u64>,

    /// Give up waiting on the hardware after this many status polls
    #[arg(long, global = true)]
    pub max_polls: Option<u64>,

    /// Run against an in-memory simulated chip instead of /dev/mem
    #[arg(long, global = true)]
    pub simulate: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flash chip selection shared by every command
#[derive(clap::Args, Debug, Clone)]
pub struct ChipArgs {
    /// Flash chip to operate on (1-4)
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(1..=4))]
    pub flash: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Read flash contents to a file
    Read {
        #[command(flatten)]
        chip: ChipArgs,

        /// Start address (hex)
        #[arg(short, long, value_parser = parse_hex_u32, default_value = "0")]
        address: u32,

        /// Number of bytes to read
        #[arg(short, long)]
        size: Option<usize>,

        /// Output file path
        #[arg(short, long, default_value = "flash_dump.bin")]
        output: PathBuf,
    },

    /// Erase an entire flash chip
    Erase {
        #[command(flatten)]
        chip: ChipArgs,
    },

    /// Erase a flash chip and program it from a file
    Program {
        #[command(flatten)]
        chip: ChipArgs,

        /// Start address (hex)
        #[arg(short, long, value_parser = parse_hex_u32, default_value = "0")]
        address: u32,

        /// Number of bytes to program, defaults to the input file length
        #[arg(short, long)]
        size: Option<usize>,

        /// Input file path
        #[arg(short, long)]
        input: PathBuf,

        /// Read back and compare CRC-8 after programming
        #[arg(long)]
        verify: bool,
    },

    /// Read the manufacturer and device IDs
    Id {
        #[command(flatten)]
        chip: ChipArgs,
    },
}

impl Commands {
    /// Number of the flash chip this command operates on
    pub fn flash(&self) -> u8 {
        match self {
            Commands::Read { chip, .. }
            | Commands::Erase { chip }
            | Commands::Program { chip, .. }
            | Commands::Id { chip } => chip.flash,
        }
    }
}

#[test]
fn test_parse_hex() {
    assert_eq!(parse_hex_u64("0xA0030000"), Ok(0xA003_0000));
    assert_eq!(parse_hex_u64("41210000"), Ok(0x4121_0000));
    assert_eq!(parse_hex_u32("1b66ff0"), Ok(0x01B6_6FF0));
    assert!(parse_hex_u32("0x1_0000_0000").is_err());
    assert!(parse_hex_u32("zz").is_err());
}

#[test]
fn test_cli_parses_program() {
    let cli = Cli::try_parse_from(&[
        "qspi-flash", "--simulate", "program", "-f", "2", "-a", "0x200", "-i", "image.bin", "--verify",
    ]).unwrap();
    assert!(cli.simulate);
    assert_eq!(cli.command.flash(), 2);
    match cli.command {
        Commands::Program { address, size, verify, .. } => {
            assert_eq!(address, 0x200);
            assert_eq!(size, None);
            assert!(verify);
        },
        _ => panic!("expected program command"),
    }
}

#[test]
fn test_cli_rejects_bad_chip() {
    assert!(Cli::try_parse_from(&["qspi-flash", "erase", "-f", "5"]).is_err());
    assert!(Cli::try_parse_from(&["qspi-flash", "read"]).is_err());
}
