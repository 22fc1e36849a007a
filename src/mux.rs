// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Flash chip multiplexer.
//!
//! Four flash chips share one QSPI bus; a 32-bit register in the multiplexer
//! window selects which chip is connected.

use core::convert::TryFrom;

use crate::{Error, RegisterPort, RegisterWidth, Result};

/// Physical base address of the multiplexer window.
pub const MUX_BASE: u64 = 0x4121_0000;

/// Offset of the chip select register inside the multiplexer window.
pub const MUX_SELECT_OFFSET: u32 = 0x08;

/// Code written to the select register to disconnect every chip.
pub const MUX_DESELECT: u64 = 0x100;

const MUX_SELECT_BASE: u64 = 0x104;

/// One of the four flash chips behind the multiplexer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum Chip {
    One = 1,
    Two = 2,
    Three = 3,
    Four = 4,
}

impl Chip {
    /// Look up a chip by its number, 1 to 4.
    pub fn from_number(chip: u8) -> Result<Self> {
        Chip::try_from(chip).map_err(|_| Error::InvalidChip { chip })
    }

    pub fn number(self) -> u8 {
        self.into()
    }

    /// Chip 1 holds the instrument's boot configuration and must never be erased.
    pub fn is_erase_protected(self) -> bool {
        self == Chip::One
    }

    /// Multiplexer code which connects this chip to the bus.
    pub fn select_code(self) -> u64 {
        MUX_SELECT_BASE + (self.number() as u64 - 1)
    }
}

impl core::fmt::Display for Chip {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Multiplexer driving the chip select lines of the four flash chips.
pub struct ChipSelectMux<P: RegisterPort> {
    port: P,
}

impl<P: RegisterPort> ChipSelectMux<P> {
    pub fn new(port: P) -> Self {
        ChipSelectMux { port }
    }

    /// Connect `chip` to the QSPI bus.
    pub fn select(&mut self, chip: Chip) -> Result<()> {
        log::debug!("Selecting flash chip {} (mux code 0x{:03X})", chip, chip.select_code());
        self.port.write(MUX_SELECT_OFFSET, chip.select_code(), RegisterWidth::Bits32)
    }

    /// Disconnect every chip from the QSPI bus.
    pub fn deselect(&mut self) -> Result<()> {
        log::debug!("Deselecting all flash chips");
        self.port.write(MUX_SELECT_OFFSET, MUX_DESELECT, RegisterWidth::Bits32)
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn into_inner(self) -> P {
        self.port
    }
}

#[test]
fn test_chip_numbers() {
    assert_eq!(Chip::from_number(1).unwrap(), Chip::One);
    assert_eq!(Chip::from_number(4).unwrap(), Chip::Four);
    assert!(matches!(Chip::from_number(0), Err(Error::InvalidChip { chip: 0 })));
    assert!(matches!(Chip::from_number(5), Err(Error::InvalidChip { chip: 5 })));
    assert!(Chip::One.is_erase_protected());
    assert!(!Chip::Two.is_erase_protected());
}

#[test]
fn test_select_codes() {
    let codes: alloc::vec::Vec<u64> =
        [Chip::One, Chip::Two, Chip::Three, Chip::Four].iter().map(|c| c.select_code()).collect();
    assert_eq!(codes, alloc::vec![0x104, 0x105, 0x106, 0x107]);
}

#[test]
fn test_mux_writes() {
    use crate::sim::{Access, SimulatedRegisters};
    let mut mux = ChipSelectMux::new(SimulatedRegisters::new());
    mux.select(Chip::Three).unwrap();
    mux.deselect().unwrap();
    assert_eq!(mux.port().accesses(), &[
        Access::Write { offset: 0x08, value: 0x106, width: RegisterWidth::Bits32 },
        Access::Write { offset: 0x08, value: 0x100, width: RegisterWidth::Bits32 },
    ]);
}
