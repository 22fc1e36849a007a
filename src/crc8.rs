// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Table-driven CRC-8 with polynomial 0x1D.
//!
//! The checksum is unreflected with a zero initial value and no output XOR,
//! so it is folded byte by byte over data as it crosses the QSPI bus.

/// CRC-8 generator polynomial (x^8 + x^4 + x^3 + x^2 + 1, high bit implied).
pub const POLYNOMIAL: u8 = 0x1D;

/// Initial CRC value for each read or program operation.
pub const INITIAL: u8 = 0x00;

/// Compute the 256-entry lookup table for `POLYNOMIAL`, MSB first.
pub fn build_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    for (div, entry) in table.iter_mut().enumerate() {
        let mut byte = div as u8;
        for _ in 0..8 {
            if byte & 0x80 != 0 {
                byte = (byte << 1) ^ POLYNOMIAL;
            } else {
                byte <<= 1;
            }
        }
        *entry = byte;
    }
    table
}

/// Fold one byte into a running CRC.
#[inline]
pub fn update(table: &[u8; 256], crc: u8, byte: u8) -> u8 {
    table[(byte ^ crc) as usize]
}

/// CRC-8 engine owning its lookup table.
///
/// The table is computed once on construction and never modified.
#[derive(Clone)]
pub struct Crc8 {
    table: [u8; 256],
}

impl Crc8 {
    pub fn new() -> Self {
        Crc8 { table: build_table() }
    }

    /// Fold `byte` into `crc`, returning the new CRC.
    #[inline]
    pub fn update(&self, crc: u8, byte: u8) -> u8 {
        update(&self.table, crc, byte)
    }

    /// Fold every byte of `data` into `crc`.
    pub fn update_slice(&self, crc: u8, data: &[u8]) -> u8 {
        data.iter().fold(crc, |crc, &byte| self.update(crc, byte))
    }

    /// Compute the CRC of `data` from the initial value.
    pub fn checksum(&self, data: &[u8]) -> u8 {
        self.update_slice(INITIAL, data)
    }

    pub fn table(&self) -> &[u8; 256] {
        &self.table
    }
}

impl Default for Crc8 {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Crc8 {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "Crc8 {{ polynomial: 0x{:02X} }}", POLYNOMIAL)
    }
}

#[test]
fn test_table() {
    let table = build_table();
    assert_eq!(table[0x00], 0x00);
    assert_eq!(table[0x01], POLYNOMIAL);
    assert_eq!(table[0x80], 0x26);
    assert_eq!(table[0xFF], 0xC4);
    // Construction is deterministic.
    assert_eq!(table[..], build_table()[..]);
}

#[test]
fn test_known_checksums() {
    let crc = Crc8::new();
    assert_eq!(crc.checksum(b""), 0x00);
    assert_eq!(crc.checksum(b"123456789"), 0x37);
    let counting: alloc::vec::Vec<u8> = (0..=255).collect();
    assert_eq!(crc.checksum(&counting), 0x3E);
    assert_eq!(crc.checksum(&[0xFF; 128]), 0xBB);
}

#[test]
fn test_streaming_matches_whole() {
    let crc = Crc8::new();
    let data = b"The quick brown fox jumps over the lazy dog";
    let (head, tail) = data.split_at(17);
    let streamed = crc.update_slice(crc.update_slice(INITIAL, head), tail);
    assert_eq!(streamed, crc.checksum(data));
    let folded = data.iter().fold(INITIAL, |c, &b| update(crc.table(), c, b));
    assert_eq!(folded, streamed);
}
