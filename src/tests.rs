// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

use std::io::{Cursor, Write};

use crate::sim::{Bracket, SimulatedFlash, SimulatedRegisters};
use crate::*;

type SimFlash = QspiFlash<SimulatedFlash, SimulatedRegisters>;

fn sim_flash() -> SimFlash {
    let mut flash = QspiFlash::new(SimulatedFlash::new(), SimulatedRegisters::new());
    flash.set_poll_limit(PollLimit::Max(1000));
    flash
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + (i >> 8)) as u8).collect()
}

fn addresses(brackets: &[Bracket]) -> Vec<Option<u32>> {
    brackets.iter().map(|b| b.address).collect()
}

fn clocked(brackets: &[Bracket]) -> Vec<usize> {
    brackets.iter().map(|b| b.clocked).collect()
}

#[test]
fn test_default_poll_limit() {
    let flash = QspiFlash::new(SimulatedFlash::new(), SimulatedRegisters::new());
    assert_eq!(flash.poll_limit(), PollLimit::Unbounded);
    assert!(!PollLimit::Unbounded.exceeded(u64::MAX));
    assert!(PollLimit::Max(3).exceeded(3));
    assert!(!PollLimit::Max(3).exceeded(2));
}

#[test]
fn test_illegal_width() {
    assert!(matches!(RegisterWidth::from_bits(12), Err(Error::IllegalWidth { width: 12 })));
    assert_eq!(RegisterWidth::from_bits(32).unwrap(), RegisterWidth::Bits32);
    assert_eq!(RegisterWidth::Bits16.bytes(), 2);
}

#[test]
fn test_select_and_deselect() {
    let mut flash = sim_flash();
    assert_eq!(flash.selected_chip(), None);
    flash.select_chip(Chip::Three).unwrap();
    assert_eq!(flash.selected_chip(), Some(Chip::Three));
    assert_eq!(flash.mux_port().value(mux::MUX_SELECT_OFFSET), 0x106);
    flash.deselect_chip().unwrap();
    assert_eq!(flash.selected_chip(), None);
    assert_eq!(flash.mux_port().value(mux::MUX_SELECT_OFFSET), 0x100);
}

#[test]
fn test_read_id() {
    let mut flash = sim_flash();
    let id = flash.read_id().unwrap();
    assert_eq!(id, FlashID { manufacturer_id: 0x01, device_id: 0x19 });
    let brackets = flash.qspi_port().brackets_for(0x90);
    assert_eq!(clocked(&brackets), vec![6]);
}

#[test]
fn test_status_bits() {
    let mut flash = sim_flash();
    assert!(!flash.write_in_progress().unwrap());
    assert!(!flash.is_write_enabled().unwrap());
    flash.write_enable().unwrap();
    assert!(flash.is_write_enabled().unwrap());
    assert!(!flash.erase_error().unwrap());
    assert!(!flash.program_error().unwrap());
}

#[test]
fn test_erase_chip_one_refused() {
    let mut flash = sim_flash();
    assert!(matches!(flash.erase(Chip::One), Err(Error::EraseProtectedChip)));
    let data = pattern(64);
    let result = flash.program(Chip::One, 0, data.len(), &mut Cursor::new(data), false);
    assert!(matches!(result, Err(Error::EraseProtectedChip)));
    assert!(flash.qspi_port().accesses().is_empty());
    assert!(flash.mux_port().accesses().is_empty());
}

#[test]
fn test_erase_clears_chip() {
    let mut flash = sim_flash();
    flash.qspi_port_mut().load(0x1000, &[0x00; 32]);
    flash.select_chip(Chip::Two).unwrap();
    flash.erase(Chip::Two).unwrap();
    assert!(!flash.write_in_progress().unwrap());
    assert_eq!(flash.qspi_port().contents(0x1000, 32), vec![0xFF; 32]);
    assert_eq!(flash.qspi_port().brackets_for(0x60).len(), 1);
}

#[test]
fn test_erase_does_not_touch_mux() {
    let mut flash = sim_flash();
    flash.erase(Chip::Four).unwrap();
    assert!(flash.mux_port().accesses().is_empty());
}

#[test]
fn test_program_verify_round_trip() {
    let mut flash = sim_flash();
    let data = pattern(1388);
    let transfer = flash.program(Chip::Two, 0, data.len(), &mut Cursor::new(&data), true).unwrap();
    assert_eq!(transfer, Transfer { bytes: 1388, crc: Crc8::new().checksum(&data) });
    assert_eq!(flash.qspi_port().contents(0, data.len()), data);
    assert_eq!(flash.checksum(0, data.len()).unwrap().crc, transfer.crc);
}

#[test]
fn test_program_page_brackets() {
    let mut flash = sim_flash();
    let data = pattern(1024);
    flash.program(Chip::Two, 0, data.len(), &mut Cursor::new(&data), false).unwrap();
    let brackets = flash.qspi_port().brackets_for(0x34);
    // Two full pages, then the zero-length overflow.
    assert_eq!(addresses(&brackets), vec![Some(0), Some(512), Some(1024)]);
    assert_eq!(clocked(&brackets), vec![5 + 512, 5 + 512, 5]);
}

#[test]
fn test_program_partial_page_and_overflow() {
    let mut flash = sim_flash();
    let data = pattern(1388);
    flash.program(Chip::Three, 0x2000, data.len(), &mut Cursor::new(&data), false).unwrap();
    let brackets = flash.qspi_port().brackets_for(0x34);
    assert_eq!(addresses(&brackets),
               vec![Some(0x2000), Some(0x2200), Some(0x2400), Some(0x2500)]);
    assert_eq!(clocked(&brackets), vec![5 + 512, 5 + 512, 5 + 256, 5 + 108]);
    assert_eq!(flash.qspi_port().contents(0x2000, data.len()), data);
}

#[test]
fn test_program_unaligned_start() {
    let mut flash = sim_flash();
    let data = pattern(600);
    flash.program(Chip::Two, 0x100, data.len(), &mut Cursor::new(&data), true).unwrap();
    let brackets = flash.qspi_port().brackets_for(0x34);
    assert_eq!(addresses(&brackets), vec![Some(0x100), Some(0x300)]);
    assert_eq!(flash.qspi_port().contents(0x100, data.len()), data);
}

#[test]
fn test_program_callback() {
    let mut flash = sim_flash();
    let data = pattern(300);
    let mut seen = Vec::new();
    flash.program_cb(Chip::Two, 0, data.len(), &mut Cursor::new(&data), false,
                     |n| seen.push(n)).unwrap();
    assert_eq!(seen, vec![0, 128, 256, 300]);
}

#[test]
fn test_bound_rejected_before_access() {
    let mut flash = sim_flash();
    let address = (MAX_FLASH_ADDRESS - 10) as u32;
    let result = flash.read_into(address, 11, &mut Vec::<u8>::new());
    assert!(matches!(result, Err(Error::InvalidAddress { length: 11, .. })));
    let result = flash.program(Chip::Two, address, 11, &mut Cursor::new(vec![0; 11]), false);
    assert!(matches!(result, Err(Error::InvalidAddress { .. })));
    let result = flash.checksum(u32::MAX, 1);
    assert!(matches!(result, Err(Error::InvalidAddress { .. })));
    assert!(flash.qspi_port().accesses().is_empty());
}

#[test]
fn test_read_up_to_bound() {
    let mut flash = sim_flash();
    let address = (MAX_FLASH_ADDRESS - 10) as u32;
    let mut data = Vec::<u8>::new();
    let transfer = flash.read_into(address, 10, &mut data).unwrap();
    assert_eq!(transfer.bytes, 10);
    assert_eq!(data, vec![0xFF; 10]);
}

#[test]
fn test_read_1388_at_offset() {
    let mut flash = sim_flash();
    let address = 0x01B6_6FF0;
    let expected = pattern(1388);
    flash.qspi_port_mut().load(address, &expected);

    let mut data = Vec::<u8>::new();
    let transfer = flash.read_into(address, expected.len(), &mut data).unwrap();
    assert_eq!(data, expected);
    assert_eq!(transfer, Transfer { bytes: 1388, crc: Crc8::new().checksum(&expected) });

    // Ten FIFO chunks in one bracket, then the 108-byte overflow in another.
    assert_eq!(flash.qspi_port().brackets_for(0x6C), vec![
        Bracket { opcode: 0x6C, address: Some(address), clocked: 5 + READ_PREAMBLE + 1280 },
        Bracket { opcode: 0x6C, address: Some(address + 1280), clocked: 5 + READ_PREAMBLE + 108 },
    ]);
}

#[test]
fn test_read_short_and_empty() {
    let mut flash = sim_flash();
    flash.qspi_port_mut().load(0, &[1, 2, 3]);
    let mut data = Vec::<u8>::new();
    flash.read_into(0, 3, &mut data).unwrap();
    assert_eq!(data, vec![1, 2, 3]);

    flash.qspi_port_mut().clear_brackets();
    let transfer = flash.read_into(0, 0, &mut Vec::<u8>::new()).unwrap();
    assert_eq!(transfer, Transfer { bytes: 0, crc: 0 });
    // Only the empty overflow bracket is issued.
    assert_eq!(clocked(&flash.qspi_port().brackets_for(0x6C)), vec![5 + READ_PREAMBLE]);
}

#[test]
fn test_read_callback() {
    let mut flash = sim_flash();
    let mut seen = Vec::new();
    flash.read_into_cb(0, 300, &mut Vec::<u8>::new(), |n| seen.push(n)).unwrap();
    assert_eq!(seen, vec![0, 128, 256, 300]);
}

#[test]
fn test_read_enables_quad_mode_once() {
    let mut flash = sim_flash();
    assert!(!flash.is_quad_enabled().unwrap());
    flash.checksum(0, 16).unwrap();
    assert!(flash.is_quad_enabled().unwrap());
    flash.checksum(0, 16).unwrap();
    assert_eq!(flash.qspi_port().brackets_for(0x01).len(), 1);
    assert_eq!(flash.qspi_port().config() & 0x02, 0x02);
}

#[test]
fn test_write_enable_failure() {
    let mut flash = sim_flash();
    flash.qspi_port_mut().set_fail_write_enable(true);
    assert!(matches!(flash.erase(Chip::Two), Err(Error::WriteEnableFailure)));
}

#[test]
fn test_quad_mode_failure() {
    let mut flash = sim_flash();
    flash.qspi_port_mut().set_fail_quad_enable(true);
    assert!(matches!(flash.checksum(0, 16), Err(Error::QuadModeEnableFailure)));
}

#[test]
fn test_erase_error() {
    let mut flash = sim_flash();
    flash.qspi_port_mut().inject_erase_error(true);
    assert!(matches!(flash.erase(Chip::Two), Err(Error::EraseError)));
}

#[test]
fn test_program_error() {
    let mut flash = sim_flash();
    flash.qspi_port_mut().inject_program_error(true);
    let data = pattern(1024);
    let result = flash.program(Chip::Two, 0x800, data.len(), &mut Cursor::new(&data), false);
    assert!(matches!(result, Err(Error::ProgramError { address: 0x800 })));
    // No further pages are attempted.
    assert_eq!(flash.qspi_port().brackets_for(0x34).len(), 1);
}

#[test]
fn test_verification_mismatch() {
    let mut flash = sim_flash();
    flash.qspi_port_mut().set_stuck_cell(10, 0x00);
    let data = vec![0xA5; 64];
    let result = flash.program(Chip::Two, 0, data.len(), &mut Cursor::new(&data), true);
    let wrote = Crc8::new().checksum(&data);
    match result {
        Err(Error::VerificationMismatch { wrote: w, read }) => {
            assert_eq!(w, wrote);
            assert_ne!(read, wrote);
        },
        other => panic!("expected verification mismatch, got {:?}", other),
    }
}

#[test]
fn test_busy_timeout() {
    let mut flash = sim_flash();
    flash.set_poll_limit(PollLimit::Max(10));
    flash.qspi_port_mut().set_stuck_busy(true);
    assert!(matches!(flash.erase(Chip::Two), Err(Error::Timeout { polls: 10, .. })));
}

#[test]
fn test_busy_polls_complete() {
    let mut flash = sim_flash();
    flash.qspi_port_mut().set_busy_polls(25);
    flash.erase(Chip::Two).unwrap();
    assert!(!flash.write_in_progress().unwrap());
}

#[test]
fn test_program_file() {
    let data = pattern(700);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&data).unwrap();
    file.flush().unwrap();

    let mut flash = sim_flash();
    let transfer = flash.program_file(Chip::Two, 0, data.len(), file.path(), true).unwrap();
    assert_eq!(transfer.bytes, 700);
    assert_eq!(flash.qspi_port().contents(0, data.len()), data);
}

#[test]
fn test_program_file_missing() {
    let dir = tempfile::tempdir().unwrap();
    let mut flash = sim_flash();
    let result = flash.program_file(Chip::Two, 0, 16, dir.path().join("missing.bin"), false);
    assert!(matches!(result, Err(Error::FileIO(_))));
    assert!(flash.qspi_port().accesses().is_empty());
}

#[test]
fn test_program_short_source() {
    let mut flash = sim_flash();
    let result = flash.program(Chip::Two, 0, 256, &mut Cursor::new(vec![0u8; 100]), false);
    assert!(matches!(result, Err(Error::FileIO(_))));
}
