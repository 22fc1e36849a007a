// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! qspi-flash
//!
//! This crate drives a memory-mapped AXI Quad SPI controller to read, erase,
//! and program four multiplexed 64MB NOR flash chips, with CRC-8 verification
//! of programmed data.
//!
//! Hardware access goes through the [`RegisterPort`] trait, implemented once
//! per physical register window: [`devmem::MappedWindow`] on Linux, and
//! [`sim::SimulatedFlash`] / [`sim::SimulatedRegisters`] for testing.

extern crate alloc;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Instant;
#[cfg(feature = "progress")]
use indicatif::{ProgressBar, ProgressStyle};

pub mod crc8;
pub mod sreg;
pub mod id;
pub mod transfer_plan;
pub mod mux;
pub mod qspi;
pub mod sim;
#[cfg(target_os = "linux")]
pub mod devmem;

#[cfg(test)]
mod tests;

pub use crc8::Crc8;
pub use sreg::{StatusRegister, ConfigRegister};
pub use id::FlashID;
pub use transfer_plan::TransferPlan;
pub use mux::{Chip, ChipSelectMux, MUX_BASE};
pub use qspi::{Qspi, Transaction, FIFO_DEPTH, QSPI_BASE};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to map physical memory at 0x{address:08X}: {source}")]
    HardwareMap { address: u64, source: std::io::Error },
    #[error("Illegal data width: {width} bits.")]
    IllegalWidth { width: u8 },
    #[error("Register offset 0x{offset:X} is outside or misaligned for the mapped window.")]
    RegisterRange { offset: u32 },
    #[error("Invalid flash chip {chip}, must be 1 to 4.")]
    InvalidChip { chip: u8 },
    #[error("Write failed to enable.")]
    WriteEnableFailure,
    #[error("Refusing to erase flash chip 1.")]
    EraseProtectedChip,
    #[error("Erase error has occurred; clear the status register to reset the device.")]
    EraseError,
    #[error("Program error: write operation failed at 0x{address:08X}.")]
    ProgramError { address: u32 },
    #[error("Quad mode did not enable.")]
    QuadModeEnableFailure,
    #[error("Address out of range for memory: 0x{address:08X} + {length} bytes.")]
    InvalidAddress { address: u32, length: usize },
    #[error("Timed out waiting for {condition} after {polls} polls.")]
    Timeout { condition: &'static str, polls: u64 },
    #[error("CRC-8 verification failed: wrote 0x{wrote:02X}, read 0x{read:02X}.")]
    VerificationMismatch { wrote: u8, read: u8 },

    #[error(transparent)]
    FileIO(#[from] std::io::Error),
    #[error(transparent)]
    Access(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Total capacity of each flash chip in bytes.
pub const FLASH_SIZE: usize = 64_000_000;

/// Highest permitted end of any read or program operation.
///
/// The last 16 bytes of each chip are reserved by the manufacturer.
pub const MAX_FLASH_ADDRESS: usize = FLASH_SIZE - 16;

/// Page program size in bytes.
pub const PAGE_SIZE: usize = 512;

/// Number of junk bytes received before data in a quad output read.
pub const READ_PREAMBLE: usize = 9;

/// Width of a single register access.
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum RegisterWidth {
    Bits8 = 8,
    Bits16 = 16,
    Bits32 = 32,
}

impl RegisterWidth {
    /// Look up a width from its size in bits, which must be 8, 16, or 32.
    pub fn from_bits(width: u8) -> Result<Self> {
        use core::convert::TryFrom;
        RegisterWidth::try_from(width).map_err(|_| Error::IllegalWidth { width })
    }

    /// Size of the access in bytes.
    pub fn bytes(self) -> usize {
        u8::from(self) as usize / 8
    }

    /// Mask covering all bits of the access.
    pub fn mask(self) -> u64 {
        match self {
            RegisterWidth::Bits8 => 0xFF,
            RegisterWidth::Bits16 => 0xFFFF,
            RegisterWidth::Bits32 => 0xFFFF_FFFF,
        }
    }
}

/// Trait for objects which provide access to one window of hardware registers.
///
/// Implementors map the window before first use and unmap it after last use;
/// this crate never opens or closes a mapping itself.
pub trait RegisterPort {
    /// Read a `width`-bit register at `offset` bytes into the window.
    fn read(&mut self, offset: u32, width: RegisterWidth) -> Result<u64>;

    /// Write the low `width` bits of `value` to the register at `offset`.
    fn write(&mut self, offset: u32, value: u64, width: RegisterWidth) -> Result<()>;
}

impl<P: RegisterPort + ?Sized> RegisterPort for &mut P {
    fn read(&mut self, offset: u32, width: RegisterWidth) -> Result<u64> {
        (**self).read(offset, width)
    }

    fn write(&mut self, offset: u32, value: u64, width: RegisterWidth) -> Result<()> {
        (**self).write(offset, value, width)
    }
}

/// Maximum number of polls while waiting on a hardware status bit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PollLimit {
    /// Poll forever; a device which never responds hangs the caller.
    Unbounded,
    /// Fail with `Error::Timeout` after this many unsuccessful polls.
    Max(u64),
}

impl PollLimit {
    pub fn exceeded(self, polls: u64) -> bool {
        match self {
            PollLimit::Unbounded => false,
            PollLimit::Max(max) => polls >= max,
        }
    }
}

impl Default for PollLimit {
    fn default() -> Self {
        PollLimit::Unbounded
    }
}

/// Outcome of a read or program operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Transfer {
    /// Number of bytes transferred.
    pub bytes: usize,
    /// CRC-8 of every byte transferred.
    pub crc: u8,
}

/// QSPI Flash.
///
/// This struct drives the flash chips behind the QSPI controller in `qspi`,
/// using the multiplexer in `mux` to choose which chip is connected.
pub struct QspiFlash<Q: RegisterPort, M: RegisterPort> {
    qspi: Qspi<Q>,
    mux: ChipSelectMux<M>,

    /// CRC-8 engine, with its table computed once on construction.
    crc: Crc8,

    /// Chip most recently connected through the multiplexer.
    selected: Option<Chip>,
}

impl<Q: RegisterPort, M: RegisterPort> QspiFlash<Q, M> {
    #[cfg(feature = "progress")]
    const DATA_PROGRESS_TPL: &'static str =
        " {msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}; {eta_precise})";
    #[cfg(feature = "progress")]
    const DATA_PROGRESS_CHARS: &'static str = "=> ";

    /// Create a new QspiFlash from the controller and multiplexer register windows.
    pub fn new(qspi: Q, mux: M) -> Self {
        QspiFlash {
            qspi: Qspi::new(qspi),
            mux: ChipSelectMux::new(mux),
            crc: Crc8::new(),
            selected: None,
        }
    }

    /// Get the limit applied to every hardware polling loop.
    pub fn poll_limit(&self) -> PollLimit {
        self.qspi.poll_limit()
    }

    /// Set the limit applied to every hardware polling loop.
    ///
    /// By default polling is unbounded, so a controller which never
    /// reports completion will hang the caller.
    pub fn set_poll_limit(&mut self, limit: PollLimit) {
        self.qspi.set_poll_limit(limit);
    }

    /// Get the chip most recently selected with `select_chip()`, if any.
    pub fn selected_chip(&self) -> Option<Chip> {
        self.selected
    }

    pub fn qspi_port(&self) -> &Q {
        self.qspi.port()
    }

    pub fn qspi_port_mut(&mut self) -> &mut Q {
        self.qspi.port_mut()
    }

    pub fn mux_port(&self) -> &M {
        self.mux.port()
    }

    pub fn mux_port_mut(&mut self) -> &mut M {
        self.mux.port_mut()
    }

    /// Release the controller and multiplexer register windows.
    pub fn into_parts(self) -> (Q, M) {
        (self.qspi.into_inner(), self.mux.into_inner())
    }

    /// Connect `chip` to the QSPI bus.
    pub fn select_chip(&mut self, chip: Chip) -> Result<()> {
        self.mux.select(chip)?;
        self.selected = Some(chip);
        Ok(())
    }

    /// Disconnect every chip from the QSPI bus.
    pub fn deselect_chip(&mut self) -> Result<()> {
        self.mux.deselect()?;
        self.selected = None;
        Ok(())
    }

    /// Read the manufacturer and device IDs of the selected chip.
    pub fn read_id(&mut self) -> Result<FlashID> {
        log::debug!("Reading flash ID");
        let data = self.qspi.execute(&Transaction::new(Command::ReadID)
            .data(&[0, 0, 0]).dummy(2).discard(4).read(2))?;
        let id = FlashID { manufacturer_id: data[0], device_id: data[1] };
        log::debug!("Read ID: {:?}", id);
        if id.is_blank() {
            log::warn!("No valid manufacturer ID found");
        }
        Ok(id)
    }

    /// Read the flash status register.
    pub fn read_status(&mut self) -> Result<StatusRegister> {
        self.read_register(Command::ReadStatus).map(StatusRegister)
    }

    /// Read the flash configuration register.
    pub fn read_config(&mut self) -> Result<ConfigRegister> {
        self.read_register(Command::ReadConfig).map(ConfigRegister)
    }

    /// Check the write enable latch, with a fresh status register read.
    pub fn is_write_enabled(&mut self) -> Result<bool> {
        self.read_status().map(|sr| sr.get_wel())
    }

    /// Check the quad I/O bit, with a fresh configuration register read.
    pub fn is_quad_enabled(&mut self) -> Result<bool> {
        self.read_config().map(|cr| cr.get_quad())
    }

    /// Check if a program or erase is in progress, with a fresh status register read.
    pub fn write_in_progress(&mut self) -> Result<bool> {
        self.read_status().map(|sr| sr.get_wip())
    }

    /// Check the erase error bit, with a fresh status register read.
    pub fn erase_error(&mut self) -> Result<bool> {
        self.read_status().map(|sr| sr.get_erase_error())
    }

    /// Check the program error bit, with a fresh status register read.
    pub fn program_error(&mut self) -> Result<bool> {
        self.read_status().map(|sr| sr.get_program_error())
    }

    /// Set the write enable latch, if it is not already set.
    ///
    /// Returns `Error::WriteEnableFailure` if the latch is still clear afterwards.
    pub fn write_enable(&mut self) -> Result<()> {
        if self.is_write_enabled()? {
            return Ok(());
        }
        self.qspi.execute(&Transaction::new(Command::WriteEnable))?;
        if self.is_write_enabled()? {
            Ok(())
        } else {
            log::error!("Write failed to enable");
            Err(Error::WriteEnableFailure)
        }
    }

    /// Write `status` and `config` to the status and configuration registers.
    ///
    /// Writing a configuration value with bit 1 set turns quad mode on; the
    /// usual values are `status = 0x00, config = 0x02`.
    ///
    /// Returns once the register write has completed.
    pub fn enable_quad_mode(&mut self, status: u8, config: u8) -> Result<()> {
        self.write_enable()?;
        log::debug!("Writing status 0x{:02X}, config 0x{:02X}", status, config);
        self.qspi.execute(&Transaction::new(Command::WriteRegisters).data(&[status, config]))?;
        self.wait_while_busy()
    }

    /// Wait until the flash stops reporting a write in progress.
    pub fn wait_while_busy(&mut self) -> Result<()> {
        self.wait_while_busy_cb(|_| {})
    }

    /// Erase the entire selected chip.
    ///
    /// Chip 1 is never erased; `Error::EraseProtectedChip` is returned
    /// before any register is touched.
    ///
    /// Returns only after erase operation is complete.
    pub fn erase(&mut self, chip: Chip) -> Result<()> {
        self.erase_cb(chip, |_| {})
    }

    /// Erase the entire selected chip.
    ///
    /// This method is identical to `erase()`, except it draws a spinner
    /// to the terminal during the erase operation.
    #[cfg(feature = "progress")]
    pub fn erase_progress(&mut self, chip: Chip) -> Result<()> {
        let pb = ProgressBar::new_spinner();
        pb.set_message("Erasing");
        let result = self.erase_cb(chip, |_| pb.tick());
        pb.finish();
        result
    }

    /// Read `length` bytes starting at `address` into `sink`.
    ///
    /// Quad mode is enabled first if required. Returns the number of bytes
    /// read and their CRC-8.
    pub fn read_into<W: Write>(&mut self, address: u32, length: usize, sink: &mut W)
        -> Result<Transfer>
    {
        self.read_into_cb(address, length, sink, |_| {})
    }

    /// Compute the CRC-8 of `length` bytes starting at `address`, discarding the data.
    pub fn checksum(&mut self, address: u32, length: usize) -> Result<Transfer> {
        self.read_into(address, length, &mut std::io::sink())
    }

    /// Read `length` bytes starting at `address` into `sink`.
    ///
    /// This method is similar to `read_into()`, except it calls the provided
    /// callback function with the number of bytes read so far after every
    /// FIFO-sized chunk.
    ///
    /// The FIFO-aligned part of the read is performed inside a single
    /// chip select bracket, refilling the transmit FIFO with dummy bytes,
    /// and any remainder is read in a second bracket.
    pub fn read_into_cb<W: Write, F: FnMut(usize)>(&mut self, address: u32, length: usize,
                                                  sink: &mut W, mut cb: F)
        -> Result<Transfer>
    {
        self.check_address_length(address, length)?;
        let t0 = Instant::now();
        let plan = TransferPlan::new(length, FIFO_DEPTH);
        self.ensure_quad_mode()?;

        let mut crc = crc8::INITIAL;
        let mut bytes = 0;
        cb(bytes);
        if plan.chunks > 0 {
            let result = self.read_bracket(
                address, plan.aligned_len(), plan.chunk_size, &mut crc, sink, bytes, &mut cb);
            bytes += self.finish_bracket(result)?;
        }
        let result = self.read_bracket(
            address + bytes as u32, plan.overflow, plan.overflow, &mut crc, sink, bytes, &mut cb);
        bytes += self.finish_bracket(result)?;

        log::info!("CRC code for read: 0x{:02X}", crc);
        log::info!("{} ms to read {} bytes", t0.elapsed().as_millis(), bytes);
        Ok(Transfer { bytes, crc })
    }

    /// Read `length` bytes starting at `address` into `sink`.
    ///
    /// This method is similar to `read_into()`, except it renders a progress
    /// bar to the terminal during the read.
    #[cfg(feature = "progress")]
    pub fn read_progress<W: Write>(&mut self, address: u32, length: usize, sink: &mut W)
        -> Result<Transfer>
    {
        let pb = ProgressBar::new(length as u64).with_style(ProgressStyle::default_bar()
            .template(Self::DATA_PROGRESS_TPL).progress_chars(Self::DATA_PROGRESS_CHARS));
        pb.set_message("Reading");
        let result = self.read_into_cb(address, length, sink, |n| pb.set_position(n as u64));
        pb.finish();
        result
    }

    /// Program `length` bytes from `source` to `chip`, starting at `address`.
    ///
    /// Offset 0 of `source` is written to `address`. The whole chip is
    /// erased first, so chip 1 is refused with `Error::EraseProtectedChip`.
    ///
    /// If `verify` is true, the programmed range is read back and its CRC-8
    /// compared with the CRC-8 of the written data, returning a
    /// `VerificationMismatch` error if they differ.
    pub fn program<R: Read + Seek>(&mut self, chip: Chip, address: u32, length: usize,
                                   source: &mut R, verify: bool)
        -> Result<Transfer>
    {
        self.program_cb(chip, address, length, source, verify, |_| {})
    }

    /// Program `length` bytes from the file at `path`, as for `program()`.
    ///
    /// Returns `Error::FileIO` if the file cannot be opened.
    pub fn program_file<P: AsRef<Path>>(&mut self, chip: Chip, address: u32, length: usize,
                                        path: P, verify: bool)
        -> Result<Transfer>
    {
        let mut file = File::open(path.as_ref()).map_err(|err| {
            log::error!("Failed to open {}: {}", path.as_ref().display(), err);
            err
        })?;
        self.program(chip, address, length, &mut file, verify)
    }

    /// Program `length` bytes from `source` to `chip`, starting at `address`.
    ///
    /// This method is similar to `program()`, except it calls the provided
    /// callback function with the number of bytes written so far after
    /// every FIFO-sized chunk.
    ///
    /// Data is sent in FIFO-sized chunks. Every `PAGE_SIZE` bytes the program
    /// bracket is closed, the write completes, and a new page program
    /// command is opened at the next address.
    pub fn program_cb<R: Read + Seek, F: FnMut(usize)>(&mut self, chip: Chip, address: u32,
                                                      length: usize, source: &mut R,
                                                      verify: bool, mut cb: F)
        -> Result<Transfer>
    {
        self.check_address_length(address, length)?;
        if address as usize % PAGE_SIZE != 0 {
            log::warn!("Program start 0x{:08X} is not aligned to the {} byte page size",
                       address, PAGE_SIZE);
        }

        self.erase(chip)?;
        let t0 = Instant::now();
        self.write_enable()?;
        self.ensure_quad_mode()?;

        let plan = TransferPlan::new(length, FIFO_DEPTH);
        let mut crc = crc8::INITIAL;
        cb(0);
        let written = self.program_aligned(address, plan.aligned_len(), source, &mut crc, &mut cb)?;
        self.program_overflow(address, written, plan.overflow, source, &mut crc)?;
        cb(length);

        if self.program_error()? {
            log::error!("Program error flagged after write");
            return Err(Error::ProgramError { address: address + written as u32 });
        }
        log::info!("CRC code for write: 0x{:02X}", crc);
        log::info!("{} ms to write {} bytes", t0.elapsed().as_millis(), length);
        log::info!("Write successful");

        if verify {
            let readback = self.checksum(address, length)?;
            if readback.crc != crc {
                log::error!("Flash program verification failed: wrote CRC 0x{:02X}, read 0x{:02X}",
                            crc, readback.crc);
                return Err(Error::VerificationMismatch { wrote: crc, read: readback.crc });
            }
            log::info!("Flash program verified successfully");
        }

        Ok(Transfer { bytes: length, crc })
    }

    /// Program `length` bytes from `source` to `chip`, starting at `address`.
    ///
    /// This is identical to `program()`, except it also draws a progress bar to the terminal.
    #[cfg(feature = "progress")]
    pub fn program_progress<R: Read + Seek>(&mut self, chip: Chip, address: u32, length: usize,
                                            source: &mut R, verify: bool)
        -> Result<Transfer>
    {
        let pb = ProgressBar::new(length as u64).with_style(ProgressStyle::default_bar()
            .template(Self::DATA_PROGRESS_TPL).progress_chars(Self::DATA_PROGRESS_CHARS));
        pb.set_message("Writing");
        let result = self.program_cb(chip, address, length, source, verify,
                                     |n| pb.set_position(n as u64));
        pb.finish();
        result
    }

    /// Erase the entire selected chip, calling `cb` with the poll count while busy.
    fn erase_cb<F: FnMut(u64)>(&mut self, chip: Chip, cb: F) -> Result<()> {
        if chip.is_erase_protected() {
            log::error!("Command set to erase flash memory chip {}, refusing", chip);
            return Err(Error::EraseProtectedChip);
        }
        if self.selected != Some(chip) {
            log::warn!("Erasing chip {} but the multiplexer selection is {:?}", chip, self.selected);
        }

        let t0 = Instant::now();
        self.write_enable()?;
        self.qspi.execute(&Transaction::new(Command::BulkErase))?;
        self.wait_while_busy_cb(cb)?;

        if self.erase_error()? {
            log::error!("Erase error flagged by chip {}", chip);
            return Err(Error::EraseError);
        }
        log::info!("{} ms to erase", t0.elapsed().as_millis());
        log::info!("Erase operation complete");
        Ok(())
    }

    /// Poll the status register until WIP clears, calling `cb` with the poll count.
    fn wait_while_busy_cb<F: FnMut(u64)>(&mut self, mut cb: F) -> Result<()> {
        let limit = self.qspi.poll_limit();
        let mut polls = 0;
        while self.write_in_progress()? {
            polls += 1;
            cb(polls);
            if limit.exceeded(polls) {
                log::error!("Write still in progress after {} polls", polls);
                return Err(Error::Timeout { condition: "write in progress to clear", polls });
            }
        }
        Ok(())
    }

    /// Enable quad mode if it is not already enabled.
    fn ensure_quad_mode(&mut self) -> Result<()> {
        if self.is_quad_enabled()? {
            return Ok(());
        }
        log::debug!("Quad mode not enabled, enabling");
        self.enable_quad_mode(0x00, 0x02)?;
        if self.is_quad_enabled()? {
            Ok(())
        } else {
            log::error!("Quad mode did not enable");
            Err(Error::QuadModeEnableFailure)
        }
    }

    /// Read `total` bytes from `address` in one bracket, `chunk` bytes at a time.
    ///
    /// The caller must close the bracket with `finish_bracket()`, even on error.
    /// At least one chunk is always read, so a zero `total` still
    /// issues the command.
    #[allow(clippy::too_many_arguments)]
    fn read_bracket<W: Write, F: FnMut(usize)>(&mut self, address: u32, total: usize,
                                              chunk: usize, crc: &mut u8, sink: &mut W,
                                              base: usize, cb: &mut F)
        -> Result<usize>
    {
        log::trace!("Reading {} bytes from 0x{:08X} in chunks of {}", total, address, chunk);
        let mut buf = alloc::vec![0u8; chunk];
        self.qspi.begin(Command::ReadQuadOut.into(), Some(address))?;
        self.qspi.push_dummy(chunk + READ_PREAMBLE)?;
        self.qspi.start()?;
        self.qspi.wait_tx_empty()?;
        self.qspi.discard(READ_PREAMBLE)?;

        let mut done = 0;
        loop {
            for byte in buf.iter_mut() {
                *byte = self.qspi.pop()?;
            }
            *crc = self.crc.update_slice(*crc, &buf);
            sink.write_all(&buf)?;
            done += chunk;
            cb(base + done);
            if done >= total {
                break;
            }
            // Keep chip select asserted and clock out another FIFO of dummy bytes.
            self.qspi.push_dummy(chunk)?;
            self.qspi.wait_tx_empty()?;
        }
        Ok(done)
    }

    /// Program the FIFO-aligned `total` bytes from the start of `source` to `address`.
    ///
    /// Returns the number of bytes written.
    fn program_aligned<R: Read + Seek, F: FnMut(usize)>(&mut self, address: u32, total: usize,
                                                       source: &mut R, crc: &mut u8, cb: &mut F)
        -> Result<usize>
    {
        if total == 0 {
            return Ok(0);
        }
        source.seek(SeekFrom::Start(0))?;
        let mut written = 0;
        while written < total {
            let len = usize::min(PAGE_SIZE, total - written);
            self.write_enable()?;
            let result = self.program_page(address + written as u32, len, source, crc, written, cb);
            self.finish_bracket(result)?;
            self.finish_program(address + written as u32)?;
            written += len;
        }
        Ok(written)
    }

    /// Send one page program command of `len` bytes, a FIFO at a time.
    ///
    /// `len` must be a multiple of `FIFO_DEPTH`. The caller must close the bracket.
    fn program_page<R: Read, F: FnMut(usize)>(&mut self, address: u32, len: usize,
                                             source: &mut R, crc: &mut u8, base: usize,
                                             cb: &mut F)
        -> Result<()>
    {
        log::trace!("Programming {} bytes at 0x{:08X}", len, address);
        let mut buf = [0u8; FIFO_DEPTH];
        self.qspi.begin(Command::QuadPageProgram.into(), Some(address))?;
        for offset in (0..len).step_by(FIFO_DEPTH) {
            source.read_exact(&mut buf)?;
            self.qspi.push_all(&buf)?;
            *crc = self.crc.update_slice(*crc, &buf);
            if offset == 0 {
                self.qspi.start()?;
            }
            self.qspi.wait_tx_empty()?;
            cb(base + offset + FIFO_DEPTH);
        }
        Ok(())
    }

    /// Program the `len` overflow bytes at `offset` into `source` to `address + offset`.
    ///
    /// Always issues a page program command, even for zero bytes.
    fn program_overflow<R: Read + Seek>(&mut self, address: u32, offset: usize, len: usize,
                                        source: &mut R, crc: &mut u8)
        -> Result<()>
    {
        let mut buf = alloc::vec![0u8; len];
        source.seek(SeekFrom::Start(offset as u64))?;
        source.read_exact(&mut buf)?;
        *crc = self.crc.update_slice(*crc, &buf);

        let address = address + offset as u32;
        log::trace!("Programming {} overflow bytes at 0x{:08X}", len, address);
        self.write_enable()?;
        self.qspi.begin(Command::QuadPageProgram.into(), Some(address))?;
        self.qspi.push_all(&buf)?;
        self.qspi.start()?;
        let result = self.qspi.wait_tx_empty();
        self.finish_bracket(result)?;
        self.finish_program(address)
    }

    /// Wait for a page program to complete and check it succeeded.
    fn finish_program(&mut self, address: u32) -> Result<()> {
        self.wait_while_busy()?;
        if self.program_error()? {
            log::error!("Program error flagged for page at 0x{:08X}", address);
            Err(Error::ProgramError { address })
        } else {
            Ok(())
        }
    }

    /// Close the open bracket, then return `result`.
    ///
    /// The bracket is closed even when `result` is an error, so the
    /// controller is never left with chip select asserted.
    fn finish_bracket<T>(&mut self, result: Result<T>) -> Result<T> {
        let stopped = self.qspi.stop();
        let value = result?;
        stopped?;
        Ok(value)
    }

    /// Read a single-byte flash register with `command`.
    fn read_register(&mut self, command: Command) -> Result<u8> {
        let data = self.qspi.execute(&Transaction::new(command).dummy(1).discard(1).read(1))?;
        log::trace!("Read register {:?}: 0x{:02X}", command, data[0]);
        Ok(data[0])
    }

    /// Checks `address + length` does not exceed `MAX_FLASH_ADDRESS`.
    ///
    /// Returns either Err(Error::InvalidAddress) or Ok(()).
    fn check_address_length(&self, address: u32, length: usize) -> Result<()> {
        log::trace!("Checking address={:08X} length={}", address, length);
        match (address as usize).checked_add(length) {
            Some(end) if end <= MAX_FLASH_ADDRESS => Ok(()),
            _ => {
                log::error!("Operation would exceed maximum flash address 0x{:08X}",
                            MAX_FLASH_ADDRESS);
                Err(Error::InvalidAddress { address, length })
            }
        }
    }
}

/// Flash command opcodes.
///
/// These are taken from the Spansion S25FL512S datasheet.
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[allow(unused)]
#[repr(u8)]
pub(crate) enum Command {
    ReadID = 0x90,
    WriteEnable = 0x06,
    WriteRegisters = 0x01,
    ReadStatus = 0x05,
    ReadConfig = 0x35,
    ReadBankAddress = 0x16,
    ReadQuadOut = 0x6C,
    ReadQuadIO = 0xEB,
    QuadPageProgram = 0x34,
    BulkErase = 0x60,
}
