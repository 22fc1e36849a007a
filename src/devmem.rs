// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Register windows mapped from physical memory through `/dev/mem`.
//!
//! Mapping requires root privileges. Accesses are volatile and must be
//! naturally aligned for their width.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;

use crate::{Error, RegisterPort, RegisterWidth, Result};

/// Size of the register windows mapped by the command line tool.
pub const WINDOW_SIZE: usize = 4096;

/// A physical register window mapped into this process.
pub struct MappedWindow {
    /// Pointer to the first register of the window.
    ptr: *mut u8,
    /// Start of the page-aligned mapping, as returned by mmap.
    map_ptr: *mut libc::c_void,
    map_len: usize,
    base: u64,
    size: usize,
}

impl MappedWindow {
    /// Map `size` bytes of physical memory starting at `base`.
    ///
    /// Returns `Error::HardwareMap` if `/dev/mem` cannot be opened or mapped.
    pub fn map(base: u64, size: usize) -> Result<Self> {
        log::debug!("Mapping {} bytes of physical memory at 0x{:08X}", size, base);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open("/dev/mem")
            .map_err(|source| {
                log::error!("Failed to open /dev/mem: {}", source);
                Error::HardwareMap { address: base, source }
            })?;

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let page_mask = page_size - 1;
        let offset = (base as usize) & page_mask;
        let aligned_base = base & !(page_mask as u64);
        let map_len = (size + offset + page_mask) & !page_mask;

        let map_ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                aligned_base as libc::off_t,
            )
        };
        if map_ptr == libc::MAP_FAILED {
            let source = std::io::Error::last_os_error();
            log::error!("Failed to map 0x{:08X}: {}", base, source);
            return Err(Error::HardwareMap { address: base, source });
        }

        // The file descriptor may be closed once the mapping exists.
        drop(file);
        let ptr = unsafe { (map_ptr as *mut u8).add(offset) };
        Ok(MappedWindow { ptr, map_ptr, map_len, base, size })
    }

    /// Physical address of the first register in the window.
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Release the mapping, reporting any failure.
    pub fn unmap(mut self) -> Result<()> {
        let result = self.release();
        core::mem::forget(self);
        result
    }

    fn release(&mut self) -> Result<()> {
        if self.map_ptr.is_null() {
            return Ok(());
        }
        log::debug!("Unmapping physical memory at 0x{:08X}", self.base);
        let rc = unsafe { libc::munmap(self.map_ptr, self.map_len) };
        self.map_ptr = std::ptr::null_mut();
        if rc == 0 {
            Ok(())
        } else {
            Err(Error::HardwareMap { address: self.base, source: std::io::Error::last_os_error() })
        }
    }

    /// Check `offset` is inside the window and aligned for `width`.
    fn check(&self, offset: u32, width: RegisterWidth) -> Result<usize> {
        let offset_usize = offset as usize;
        let bytes = width.bytes();
        if offset_usize % bytes != 0 || offset_usize + bytes > self.size {
            log::error!("Register offset 0x{:X} invalid for {:?} access", offset, width);
            Err(Error::RegisterRange { offset })
        } else {
            Ok(offset_usize)
        }
    }
}

impl RegisterPort for MappedWindow {
    fn read(&mut self, offset: u32, width: RegisterWidth) -> Result<u64> {
        let offset = self.check(offset, width)?;
        let value = unsafe {
            let ptr = self.ptr.add(offset);
            match width {
                RegisterWidth::Bits8 => core::ptr::read_volatile(ptr) as u64,
                RegisterWidth::Bits16 => core::ptr::read_volatile(ptr as *const u16) as u64,
                RegisterWidth::Bits32 => core::ptr::read_volatile(ptr as *const u32) as u64,
            }
        };
        Ok(value)
    }

    fn write(&mut self, offset: u32, value: u64, width: RegisterWidth) -> Result<()> {
        let offset = self.check(offset, width)?;
        unsafe {
            let ptr = self.ptr.add(offset);
            match width {
                RegisterWidth::Bits8 => core::ptr::write_volatile(ptr, value as u8),
                RegisterWidth::Bits16 => core::ptr::write_volatile(ptr as *mut u16, value as u16),
                RegisterWidth::Bits32 => core::ptr::write_volatile(ptr as *mut u32, value as u32),
            }
        }
        Ok(())
    }
}

impl Drop for MappedWindow {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("{}", e);
        }
    }
}

unsafe impl Send for MappedWindow {}
