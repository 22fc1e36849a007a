// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

/// Store the ID read off a flash chip.
///
/// The manufacturer and device IDs are read using the 0x90 command with
/// a zero address, so the manufacturer ID comes first.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlashID {
    pub manufacturer_id: u8,
    pub device_id: u8,
}

impl FlashID {
    /// Look up a manufacturer name from the JEDEC ID.
    pub fn manufacturer_name(&self) -> Option<&'static str> {
        match jep106::JEP106Code::new(0, self.manufacturer_id & 0x7F).get() {
            // Spansion flash (now Cypress/Infineon) still reports the AMD bank 0 ID.
            Some(mfn) if mfn == "AMD" => Some("AMD/Spansion"),
            Some(mfn) => Some(mfn),
            None => None,
        }
    }

    /// Check whether the ID looks like an absent or unresponsive chip.
    pub fn is_blank(&self) -> bool {
        matches!(self.manufacturer_id, 0x00 | 0xFF)
    }
}

impl std::fmt::Display for FlashID {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mfn = match self.manufacturer_name() {
            Some(mfn) => format!(" ({})", mfn),
            None => "".to_string(),
        };
        write!(f, "Manufacturer 0x{:02X}{}, Device 0x{:02X}",
               self.manufacturer_id, mfn, self.device_id)
    }
}

#[test]
fn test_blank_id() {
    assert!(FlashID { manufacturer_id: 0xFF, device_id: 0xFF }.is_blank());
    assert!(FlashID { manufacturer_id: 0x00, device_id: 0x19 }.is_blank());
    assert!(!FlashID { manufacturer_id: 0x01, device_id: 0x19 }.is_blank());
}

#[test]
fn test_display_device() {
    let id = FlashID { manufacturer_id: 0x01, device_id: 0x19 };
    let text = id.to_string();
    assert!(text.starts_with("Manufacturer 0x01"));
    assert!(text.ends_with("Device 0x19"));
}
