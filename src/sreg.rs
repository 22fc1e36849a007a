// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

/// Flash Status Register
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusRegister(pub u8);

impl StatusRegister {
    /// Get WIP (write in progress) bit.
    pub fn get_wip(&self) -> bool {
        self.0 & 0b0000_0001 != 0
    }

    /// Get WEL (write enable latch) bit.
    pub fn get_wel(&self) -> bool {
        self.0 & 0b0000_0010 != 0
    }

    /// Get E_ERR (erase error) bit.
    pub fn get_erase_error(&self) -> bool {
        self.0 & 0b0010_0000 != 0
    }

    /// Get P_ERR (program error) bit.
    pub fn get_program_error(&self) -> bool {
        self.0 & 0b0100_0000 != 0
    }
}

/// Flash Configuration Register
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConfigRegister(pub u8);

impl ConfigRegister {
    /// Get QUAD (quad I/O enabled) bit.
    pub fn get_quad(&self) -> bool {
        self.0 & 0b0000_0010 != 0
    }

    /// Set QUAD (quad I/O enabled) bit.
    pub fn set_quad(&mut self, quad: bool) {
        self.0 &= 0b1111_1101;
        self.0 |= (quad as u8) << 1;
    }
}

#[test]
fn test_status_bits() {
    let sr = StatusRegister(0b0110_0011);
    assert!(sr.get_wip());
    assert!(sr.get_wel());
    assert!(sr.get_erase_error());
    assert!(sr.get_program_error());
    let sr = StatusRegister(0b1001_1100);
    assert!(!sr.get_wip());
    assert!(!sr.get_wel());
    assert!(!sr.get_erase_error());
    assert!(!sr.get_program_error());
}

#[test]
fn test_config_quad() {
    let mut cr = ConfigRegister(0x00);
    assert!(!cr.get_quad());
    cr.set_quad(true);
    assert_eq!(cr.0, 0x02);
    let mut cr = ConfigRegister(0xFF);
    cr.set_quad(false);
    assert_eq!(cr.0, 0xFD);
}
