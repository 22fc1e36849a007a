// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! In-memory stand-ins for the hardware register windows.
//!
//! `SimulatedFlash` models the QSPI controller with one flash chip behind
//! it, closely enough to run every `QspiFlash` operation end to end.
//! `SimulatedRegisters` is a plain register file, suitable for the
//! multiplexer. Both record every register access.

use alloc::vec::Vec;
use core::convert::TryFrom;
use std::collections::{HashMap, VecDeque};

use crate::qspi::{reg, sr};
use crate::{Command, Error, RegisterPort, RegisterWidth, Result, READ_PREAMBLE};

/// One register access made through a simulated port.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    Read { offset: u32, value: u64, width: RegisterWidth },
    Write { offset: u32, value: u64, width: RegisterWidth },
}

/// One chip select bracket as seen by the simulated flash chip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bracket {
    pub opcode: u8,
    /// Address sent after the opcode, for commands which take one.
    pub address: Option<u32>,
    /// Total number of bytes clocked while chip select was asserted.
    pub clocked: usize,
}

const CR_TX_FIFO_RESET: u64 = 1 << 5;
const CR_RX_FIFO_RESET: u64 = 1 << 6;
const CR_MASTER_INHIBIT: u64 = 1 << 8;

const SR_WIP: u8 = 0b0000_0001;
const SR_WEL: u8 = 0b0000_0010;
const SR_E_ERR: u8 = 0b0010_0000;
const SR_P_ERR: u8 = 0b0100_0000;
const CR_QUAD: u8 = 0b0000_0010;

/// Simulated QSPI controller window with a single flash chip attached.
///
/// Unwritten memory reads as 0xFF. Programming ANDs new data into memory,
/// as NOR flash does, so data must be erased before it is rewritten.
pub struct SimulatedFlash {
    memory: HashMap<u32, u8>,
    stuck: HashMap<u32, u8>,
    status: u8,
    config: u8,
    manufacturer_id: u8,
    device_id: u8,

    tx: VecDeque<u8>,
    rx: VecDeque<u8>,
    control: u64,
    slave_select: u64,
    master_enabled: bool,
    asserted: bool,
    command: Vec<u8>,

    busy_polls: u32,
    busy_remaining: u32,
    stuck_busy: bool,
    stall_tx: bool,
    fail_write_enable: bool,
    fail_quad_enable: bool,
    erase_error: bool,
    program_error: bool,

    accesses: Vec<Access>,
    brackets: Vec<Bracket>,
}

impl SimulatedFlash {
    /// Create an erased chip with quad mode disabled.
    pub fn new() -> Self {
        SimulatedFlash {
            memory: HashMap::new(),
            stuck: HashMap::new(),
            status: 0x00,
            config: 0x00,
            manufacturer_id: 0x01,
            device_id: 0x19,
            tx: VecDeque::new(),
            rx: VecDeque::new(),
            control: 0,
            slave_select: 0x01,
            master_enabled: false,
            asserted: false,
            command: Vec::new(),
            busy_polls: 2,
            busy_remaining: 0,
            stuck_busy: false,
            stall_tx: false,
            fail_write_enable: false,
            fail_quad_enable: false,
            erase_error: false,
            program_error: false,
            accesses: Vec::new(),
            brackets: Vec::new(),
        }
    }

    /// Store `data` at `address` directly, bypassing the controller.
    pub fn load(&mut self, address: u32, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            self.memory.insert(address + i as u32, byte);
        }
    }

    /// Read `length` bytes at `address` directly, bypassing the controller.
    pub fn contents(&self, address: u32, length: usize) -> Vec<u8> {
        (0..length as u32).map(|i| self.mem(address + i)).collect()
    }

    /// Raw status register, including WIP.
    pub fn status(&self) -> u8 {
        self.status_value()
    }

    pub fn config(&self) -> u8 {
        self.config
    }

    pub fn set_config(&mut self, config: u8) {
        self.config = config;
    }

    pub fn set_id(&mut self, manufacturer_id: u8, device_id: u8) {
        self.manufacturer_id = manufacturer_id;
        self.device_id = device_id;
    }

    /// Number of status register reads which report WIP after each write.
    pub fn set_busy_polls(&mut self, polls: u32) {
        self.busy_polls = polls;
    }

    /// Report WIP forever once the next write has started.
    pub fn set_stuck_busy(&mut self, stuck: bool) {
        self.stuck_busy = stuck;
    }

    /// Never clock the transmit FIFO out.
    pub fn set_stall_tx(&mut self, stall: bool) {
        self.stall_tx = stall;
    }

    /// Ignore the write enable command.
    pub fn set_fail_write_enable(&mut self, fail: bool) {
        self.fail_write_enable = fail;
    }

    /// Ignore the quad bit when the registers are written.
    pub fn set_fail_quad_enable(&mut self, fail: bool) {
        self.fail_quad_enable = fail;
    }

    /// Make the cell at `address` always read as `value`, whatever is programmed.
    pub fn set_stuck_cell(&mut self, address: u32, value: u8) {
        self.stuck.insert(address, value);
    }

    /// Flag an erase error after the next bulk erase.
    pub fn inject_erase_error(&mut self, error: bool) {
        self.erase_error = error;
    }

    /// Flag a program error after the next page program.
    pub fn inject_program_error(&mut self, error: bool) {
        self.program_error = error;
    }

    /// Every register access made so far, oldest first.
    pub fn accesses(&self) -> &[Access] {
        &self.accesses
    }

    pub fn clear_accesses(&mut self) {
        self.accesses.clear();
    }

    /// Every completed chip select bracket so far, oldest first.
    pub fn brackets(&self) -> &[Bracket] {
        &self.brackets
    }

    /// Completed brackets for `opcode` only.
    pub fn brackets_for(&self, opcode: u8) -> Vec<Bracket> {
        self.brackets.iter().filter(|b| b.opcode == opcode).cloned().collect()
    }

    pub fn clear_brackets(&mut self) {
        self.brackets.clear();
    }

    fn mem(&self, address: u32) -> u8 {
        match self.stuck.get(&address) {
            Some(&value) => value,
            None => *self.memory.get(&address).unwrap_or(&0xFF),
        }
    }

    fn status_value(&self) -> u8 {
        if self.busy_remaining > 0 {
            self.status | SR_WIP
        } else {
            self.status & !SR_WIP
        }
    }

    fn start_write(&mut self) {
        self.status &= !SR_WEL;
        self.busy_remaining = if self.stuck_busy { u32::MAX } else { self.busy_polls };
    }

    /// Clock every queued transmit byte through the chip.
    fn clock(&mut self) {
        if self.stall_tx || !self.master_enabled || !self.asserted {
            return;
        }
        while let Some(byte) = self.tx.pop_front() {
            let response = self.exchange(byte);
            self.rx.push_back(response);
        }
    }

    /// Shift one byte into the chip, returning the byte shifted out.
    fn exchange(&mut self, byte: u8) -> u8 {
        let pos = self.command.len();
        self.command.push(byte);
        match Command::try_from(self.command[0]) {
            Ok(Command::ReadStatus) if pos >= 1 => self.status_value(),
            Ok(Command::ReadConfig) if pos >= 1 => self.config,
            Ok(Command::ReadID) if pos >= 4 => {
                if (pos - 4) % 2 == 0 { self.manufacturer_id } else { self.device_id }
            },
            Ok(Command::ReadQuadOut) if pos >= READ_PREAMBLE => {
                let address = self.command_address().unwrap_or(0);
                self.mem(address.wrapping_add((pos - READ_PREAMBLE) as u32))
            },
            _ => 0xFF,
        }
    }

    fn command_address(&self) -> Option<u32> {
        if self.command.len() >= 5 {
            Some(u32::from_be_bytes([self.command[1], self.command[2],
                                     self.command[3], self.command[4]]))
        } else {
            None
        }
    }

    /// Act on the command clocked in since chip select was asserted.
    fn end_bracket(&mut self) {
        if self.command.is_empty() {
            return;
        }
        let opcode = self.command[0];
        let command = Command::try_from(opcode);
        let address = match command {
            Ok(Command::ReadQuadOut) | Ok(Command::QuadPageProgram) => self.command_address(),
            _ => None,
        };
        self.brackets.push(Bracket { opcode, address, clocked: self.command.len() });
        let wel = self.status & SR_WEL != 0;

        match command {
            Ok(Command::WriteEnable) if !self.fail_write_enable => self.status |= SR_WEL,
            Ok(Command::WriteRegisters) if wel && self.command.len() >= 3 => {
                let (status, mut config) = (self.command[1], self.command[2]);
                if self.fail_quad_enable {
                    config &= !CR_QUAD;
                }
                // WIP, WEL and the error bits are read-only.
                let read_only = SR_WIP | SR_WEL | SR_E_ERR | SR_P_ERR;
                self.status = (self.status & read_only) | (status & !read_only);
                self.config = config;
                self.start_write();
            },
            Ok(Command::BulkErase) if wel => {
                self.memory.clear();
                if self.erase_error {
                    self.status |= SR_E_ERR;
                }
                self.start_write();
            },
            Ok(Command::QuadPageProgram) if wel => {
                if let Some(address) = address {
                    for (i, &byte) in self.command[5..].iter().enumerate() {
                        let target = address.wrapping_add(i as u32);
                        let value = self.mem(target) & byte;
                        self.memory.insert(target, value);
                    }
                    if self.program_error {
                        self.status |= SR_P_ERR;
                    }
                }
                self.start_write();
            },
            Ok(Command::ReadStatus) if !self.stuck_busy => {
                self.busy_remaining = self.busy_remaining.saturating_sub(1);
            },
            _ => (),
        }
        self.command.clear();
    }

    fn check_width(offset: u32, width: RegisterWidth, expected: RegisterWidth) -> Result<()> {
        if width == expected {
            Ok(())
        } else {
            Err(Error::Access(anyhow::anyhow!(
                "register 0x{:02X} accessed as {:?}, expected {:?}", offset, width, expected)))
        }
    }
}

impl Default for SimulatedFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterPort for SimulatedFlash {
    fn read(&mut self, offset: u32, width: RegisterWidth) -> Result<u64> {
        let value = match offset {
            reg::CONFIG => {
                Self::check_width(offset, width, RegisterWidth::Bits32)?;
                self.control
            },
            reg::STATUS => {
                Self::check_width(offset, width, RegisterWidth::Bits8)?;
                let mut value = 0;
                if self.rx.is_empty() {
                    value |= sr::RX_EMPTY;
                }
                if self.tx.is_empty() {
                    value |= sr::TX_EMPTY;
                }
                value
            },
            reg::DRR => {
                Self::check_width(offset, width, RegisterWidth::Bits8)?;
                match self.rx.pop_front() {
                    Some(byte) => byte as u64,
                    None => return Err(Error::Access(anyhow::anyhow!("receive FIFO underflow"))),
                }
            },
            reg::SSR => {
                Self::check_width(offset, width, RegisterWidth::Bits8)?;
                self.slave_select
            },
            _ => return Err(Error::RegisterRange { offset }),
        };
        self.accesses.push(Access::Read { offset, value, width });
        Ok(value)
    }

    fn write(&mut self, offset: u32, value: u64, width: RegisterWidth) -> Result<()> {
        let value = value & width.mask();
        match offset {
            reg::CONFIG => {
                Self::check_width(offset, width, RegisterWidth::Bits32)?;
                if value & CR_TX_FIFO_RESET != 0 {
                    self.tx.clear();
                }
                if value & CR_RX_FIFO_RESET != 0 {
                    self.rx.clear();
                }
                self.control = value;
                self.master_enabled = value & CR_MASTER_INHIBIT == 0;
            },
            reg::DTR => {
                Self::check_width(offset, width, RegisterWidth::Bits8)?;
                self.tx.push_back(value as u8);
            },
            reg::SSR => {
                Self::check_width(offset, width, RegisterWidth::Bits8)?;
                let asserted = value & 1 == 0;
                if self.asserted && !asserted {
                    self.end_bracket();
                } else if !self.asserted && asserted {
                    self.command.clear();
                }
                self.asserted = asserted;
                self.slave_select = value;
            },
            _ => return Err(Error::RegisterRange { offset }),
        }
        self.accesses.push(Access::Write { offset, value, width });
        self.clock();
        Ok(())
    }
}

/// Plain register file which stores whatever is written to it.
#[derive(Default)]
pub struct SimulatedRegisters {
    values: HashMap<u32, u64>,
    accesses: Vec<Access>,
}

impl SimulatedRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of the register at `offset`, zero if never written.
    pub fn value(&self, offset: u32) -> u64 {
        *self.values.get(&offset).unwrap_or(&0)
    }

    pub fn accesses(&self) -> &[Access] {
        &self.accesses
    }

    pub fn clear_accesses(&mut self) {
        self.accesses.clear();
    }
}

impl RegisterPort for SimulatedRegisters {
    fn read(&mut self, offset: u32, width: RegisterWidth) -> Result<u64> {
        let value = self.value(offset) & width.mask();
        self.accesses.push(Access::Read { offset, value, width });
        Ok(value)
    }

    fn write(&mut self, offset: u32, value: u64, width: RegisterWidth) -> Result<()> {
        let value = value & width.mask();
        self.values.insert(offset, value);
        self.accesses.push(Access::Write { offset, value, width });
        Ok(())
    }
}

#[test]
fn test_registers_mask_to_width() {
    let mut regs = SimulatedRegisters::new();
    regs.write(0x10, 0x1234_5678, RegisterWidth::Bits16).unwrap();
    assert_eq!(regs.value(0x10), 0x5678);
    regs.write(0x10, 0x1_FFFF_FFFF, RegisterWidth::Bits32).unwrap();
    assert_eq!(regs.read(0x10, RegisterWidth::Bits32).unwrap(), 0xFFFF_FFFF);
    assert_eq!(regs.read(0x10, RegisterWidth::Bits8).unwrap(), 0xFF);
}

#[test]
fn test_flash_rejects_wrong_width() {
    let mut flash = SimulatedFlash::new();
    assert!(flash.write(reg::CONFIG, 0x1E6, RegisterWidth::Bits16).is_err());
    assert!(flash.read(reg::STATUS, RegisterWidth::Bits32).is_err());
    assert!(matches!(flash.read(0x40, RegisterWidth::Bits8), Err(Error::RegisterRange { .. })));
}
