// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! QSPI controller framing.
//!
//! The controller is an AXI Quad SPI core in standard master mode. Every
//! flash command is one bracket: configure, load the transmit FIFO, assert
//! chip select and start the clock, wait for the FIFO to empty, stop, then
//! drain any response bytes from the receive FIFO.

use alloc::vec::Vec;

use crate::{Error, PollLimit, RegisterPort, RegisterWidth, Result};

/// Physical base address of the QSPI controller window.
pub const QSPI_BASE: u64 = 0xA003_0000;

/// Depth of the transmit and receive FIFOs in bytes.
pub const FIFO_DEPTH: usize = 128;

/// Filler byte clocked out when only the response matters.
pub const DUMMY_BYTE: u8 = 0xDD;

/// Controller register offsets.
pub mod reg {
    /// Control register, always accessed as 32 bits.
    pub const CONFIG: u32 = 0x60;
    pub const STATUS: u32 = 0x64;
    /// Data transmit register.
    pub const DTR: u32 = 0x68;
    /// Data receive register.
    pub const DRR: u32 = 0x6C;
    /// Slave select register.
    pub const SSR: u32 = 0x70;
}

/// Control register values.
pub mod cr {
    /// Reset both FIFOs and configure as an inhibited master.
    pub const RESET_FIFO_MASTER_CONFIG: u64 = 0x0000_01E6;
    pub const ENABLE_MASTER_TRANSACTION: u64 = 0x0000_0086;
    pub const DISABLE_MASTER_TRANSACTION: u64 = 0x0000_0186;
}

/// Slave select register values.
pub mod ssr {
    pub const ASSERT: u64 = 0x00;
    pub const DEASSERT: u64 = 0x01;
}

/// Status register bits.
pub mod sr {
    pub const RX_EMPTY: u64 = 1 << 0;
    pub const TX_EMPTY: u64 = 1 << 2;
}

/// Description of one bracketed SPI exchange.
#[derive(Copy, Clone, Debug)]
pub struct Transaction<'a> {
    opcode: u8,
    address: Option<u32>,
    data: &'a [u8],
    dummy: usize,
    discard: usize,
    read: usize,
}

impl<'a> Transaction<'a> {
    pub fn new<C: Into<u8>>(opcode: C) -> Self {
        Transaction { opcode: opcode.into(), address: None, data: &[], dummy: 0, discard: 0, read: 0 }
    }

    /// Send a 4-byte big-endian address after the opcode.
    pub fn address(mut self, address: u32) -> Self {
        self.address = Some(address);
        self
    }

    /// Send `data` after the opcode and address.
    pub fn data(mut self, data: &'a [u8]) -> Self {
        self.data = data;
        self
    }

    /// Pad the transmit FIFO with `n` dummy bytes after any data.
    pub fn dummy(mut self, n: usize) -> Self {
        self.dummy = n;
        self
    }

    /// Throw away the first `n` received bytes.
    pub fn discard(mut self, n: usize) -> Self {
        self.discard = n;
        self
    }

    /// Return `n` received bytes after those discarded.
    pub fn read(mut self, n: usize) -> Self {
        self.read = n;
        self
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }
}

/// QSPI controller behind a register window.
///
/// Only one bracket may be open at a time; every method that opens one
/// is paired with `stop()` by its caller before anything else touches
/// the controller.
pub struct Qspi<P: RegisterPort> {
    port: P,
    poll_limit: PollLimit,
}

impl<P: RegisterPort> Qspi<P> {
    pub fn new(port: P) -> Self {
        Qspi { port, poll_limit: PollLimit::Unbounded }
    }

    pub fn poll_limit(&self) -> PollLimit {
        self.poll_limit
    }

    pub fn set_poll_limit(&mut self, limit: PollLimit) {
        self.poll_limit = limit;
    }

    /// Run one complete bracketed transaction, returning the requested response bytes.
    pub fn execute(&mut self, txn: &Transaction) -> Result<Vec<u8>> {
        log::trace!("QSPI transaction: opcode 0x{:02X} address {:08X?} data {} dummy {} \
                     discard {} read {}", txn.opcode, txn.address, txn.data.len(),
                    txn.dummy, txn.discard, txn.read);
        self.begin(txn.opcode, txn.address)?;
        self.push_all(txn.data)?;
        self.push_dummy(txn.dummy)?;
        self.start()?;
        let waited = self.wait_tx_empty();
        self.stop()?;
        waited?;
        self.discard(txn.discard)?;
        let rx = (0..txn.read).map(|_| self.pop()).collect::<Result<Vec<u8>>>()?;
        log::trace!("QSPI transaction: read {:02X?}", rx);
        Ok(rx)
    }

    /// Reset the FIFOs and load `opcode` followed by the optional address.
    pub fn begin(&mut self, opcode: u8, address: Option<u32>) -> Result<()> {
        self.configure()?;
        self.push(opcode)?;
        if let Some(address) = address {
            self.push_address(address)?;
        }
        Ok(())
    }

    /// Reset both FIFOs and configure the controller as an inhibited master.
    pub fn configure(&mut self) -> Result<()> {
        self.write_config(cr::RESET_FIFO_MASTER_CONFIG)
    }

    /// Load one byte into the transmit FIFO.
    pub fn push(&mut self, byte: u8) -> Result<()> {
        self.port.write(reg::DTR, byte as u64, RegisterWidth::Bits8)
    }

    pub fn push_all(&mut self, data: &[u8]) -> Result<()> {
        data.iter().try_for_each(|&byte| self.push(byte))
    }

    /// Load `address` as four bytes, most significant first.
    pub fn push_address(&mut self, address: u32) -> Result<()> {
        for shift in [24u32, 16, 8, 0].iter() {
            self.push(((address >> *shift) & 0xFF) as u8)?;
        }
        Ok(())
    }

    pub fn push_dummy(&mut self, n: usize) -> Result<()> {
        (0..n).try_for_each(|_| self.push(DUMMY_BYTE))
    }

    /// Assert chip select and enable the master transaction, starting the clock.
    pub fn start(&mut self) -> Result<()> {
        self.port.write(reg::SSR, ssr::ASSERT, RegisterWidth::Bits8)?;
        self.write_config(cr::ENABLE_MASTER_TRANSACTION)
    }

    /// Deassert chip select and disable the master transaction.
    pub fn stop(&mut self) -> Result<()> {
        self.port.write(reg::SSR, ssr::DEASSERT, RegisterWidth::Bits8)?;
        self.write_config(cr::DISABLE_MASTER_TRANSACTION)
    }

    /// Read one byte from the receive FIFO.
    pub fn pop(&mut self) -> Result<u8> {
        Ok(self.port.read(reg::DRR, RegisterWidth::Bits8)? as u8)
    }

    /// Read and throw away `n` bytes from the receive FIFO.
    pub fn discard(&mut self, n: usize) -> Result<()> {
        (0..n).try_for_each(|_| self.pop().map(|_| ()))
    }

    pub fn tx_empty(&mut self) -> Result<bool> {
        Ok(self.read_status()? & sr::TX_EMPTY != 0)
    }

    pub fn rx_empty(&mut self) -> Result<bool> {
        Ok(self.read_status()? & sr::RX_EMPTY != 0)
    }

    /// Poll until the transmit FIFO has been clocked out.
    pub fn wait_tx_empty(&mut self) -> Result<()> {
        let mut polls = 0;
        while !self.tx_empty()? {
            polls += 1;
            if self.poll_limit.exceeded(polls) {
                log::error!("TX FIFO did not empty after {} polls", polls);
                return Err(Error::Timeout { condition: "TX FIFO empty", polls });
            }
        }
        Ok(())
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

    fn read_status(&mut self) -> Result<u64> {
        self.port.read(reg::STATUS, RegisterWidth::Bits8)
    }

    fn write_config(&mut self, value: u64) -> Result<()> {
        self.port.write(reg::CONFIG, value, RegisterWidth::Bits32)
    }
}

#[test]
fn test_execute_register_sequence() {
    use crate::sim::{Access, SimulatedFlash};
    let mut qspi = Qspi::new(SimulatedFlash::new());
    let txn = Transaction::new(0x05u8).dummy(1).discard(1).read(1);
    let rx = qspi.execute(&txn).unwrap();
    assert_eq!(rx, alloc::vec![0x00]);

    let w8 = RegisterWidth::Bits8;
    let w32 = RegisterWidth::Bits32;
    let writes: Vec<Access> = qspi.port().accesses().iter()
        .filter(|a| matches!(a, Access::Write { .. }))
        .cloned()
        .collect();
    assert_eq!(writes, alloc::vec![
        Access::Write { offset: reg::CONFIG, value: 0x1E6, width: w32 },
        Access::Write { offset: reg::DTR, value: 0x05, width: w8 },
        Access::Write { offset: reg::DTR, value: DUMMY_BYTE as u64, width: w8 },
        Access::Write { offset: reg::SSR, value: 0x00, width: w8 },
        Access::Write { offset: reg::CONFIG, value: 0x86, width: w32 },
        Access::Write { offset: reg::SSR, value: 0x01, width: w8 },
        Access::Write { offset: reg::CONFIG, value: 0x186, width: w32 },
    ]);
}

#[test]
fn test_address_big_endian() {
    use crate::sim::{Access, SimulatedFlash};
    let mut qspi = Qspi::new(SimulatedFlash::new());
    qspi.push_address(0x01B6_6FF0).unwrap();
    let bytes: Vec<u64> = qspi.port().accesses().iter().filter_map(|a| match a {
        Access::Write { offset: reg::DTR, value, .. } => Some(*value),
        _ => None,
    }).collect();
    assert_eq!(bytes, alloc::vec![0x01, 0xB6, 0x6F, 0xF0]);
}

#[test]
fn test_wait_tx_empty_timeout() {
    use crate::sim::{Access, SimulatedFlash};
    let mut flash = SimulatedFlash::new();
    flash.set_stall_tx(true);
    let mut qspi = Qspi::new(flash);
    qspi.set_poll_limit(PollLimit::Max(50));
    let result = qspi.execute(&Transaction::new(0x05u8).dummy(1));
    assert!(matches!(result, Err(Error::Timeout { polls: 50, .. })));
    // Chip select is released even though the transaction failed.
    let last_ssr = qspi.port().accesses().iter().rev().find_map(|a| match a {
        Access::Write { offset: reg::SSR, value, .. } => Some(*value),
        _ => None,
    });
    assert_eq!(last_ssr, Some(ssr::DEASSERT));
}
