//! Raw trouble-code extraction from diagnostic frames
//!
//! - J1939 DM1 (PGN 0xFECA), single-frame form: two lamp bytes followed by
//!   4-byte SPN/FMI/OC groups.
//! - OBD-II services 03/07/0A positive responses (0x43/0x47/0x4A) in a single
//!   ISO-TP frame: PCI, service, DTC count, then 2-byte codes.
//!
//! Multi-frame responses (J1939 BAM, ISO-TP consecutive frames) are not
//! reassembled here.

use crate::config::Protocol;
use crate::signals::database::{j1939_pgn, PGN_DM1};
use crate::types::RawFrame;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::fmt;

/// 11-bit OBD-II ECU response identifiers
const OBD_RESPONSE_IDS: std::ops::RangeInclusive<u32> = 0x7E8..=0x7EF;

/// 29-bit OBD-II physical responses to the tester (0x18DAF1xx)
const OBD_EXTENDED_RESPONSE_BASE: u32 = 0x18DA_F100;

/// Positive responses carrying stored, pending and permanent DTCs
const OBD_DTC_RESPONSES: [u8; 3] = [0x43, 0x47, 0x4A];

/// One J1939 diagnostic trouble code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct J1939Dtc {
    /// Suspect parameter number (19 bits)
    pub spn: u32,
    /// Failure mode identifier (5 bits)
    pub fmi: u8,
    /// Occurrence count (7 bits)
    pub occurrence: u8,
}

impl J1939Dtc {
    /// Decode a 4-byte DTC group
    pub fn from_bytes(group: &[u8]) -> Option<Self> {
        if group.len() < 4 {
            return None;
        }
        let spn_low = LittleEndian::read_u16(&group[0..2]) as u32;
        let spn = spn_low | (((group[2] & 0xE0) as u32) << 11);
        Some(Self {
            spn,
            fmi: group[2] & 0x1F,
            occurrence: group[3] & 0x7F,
        })
    }

    /// Parse the `SPN<n>-FMI<m>` form produced by `Display`
    pub fn parse_code(code: &str) -> Option<(u32, u8)> {
        let code = code.trim().to_ascii_uppercase();
        let rest = code.strip_prefix("SPN")?;
        let (spn, fmi) = rest.split_once("-FMI")?;
        Some((spn.parse().ok()?, fmi.parse().ok()?))
    }

    /// Standard SAE J1939-73 failure mode text
    pub fn fmi_description(fmi: u8) -> &'static str {
        match fmi {
            0 => "Data valid but above normal operational range - most severe level",
            1 => "Data valid but below normal operational range - most severe level",
            2 => "Data erratic, intermittent or incorrect",
            3 => "Voltage above normal, or shorted to high source",
            4 => "Voltage below normal, or shorted to low source",
            5 => "Current below normal or open circuit",
            6 => "Current above normal or grounded circuit",
            7 => "Mechanical system not responding or out of adjustment",
            8 => "Abnormal frequency or pulse width or period",
            9 => "Abnormal update rate",
            10 => "Abnormal rate of change",
            11 => "Root cause not known",
            12 => "Bad intelligent device or component",
            13 => "Out of calibration",
            14 => "Special instructions",
            15 => "Data valid but above normal operating range - least severe level",
            16 => "Data valid but above normal operating range - moderately severe level",
            17 => "Data valid but below normal operating range - least severe level",
            18 => "Data valid but below normal operating range - moderately severe level",
            19 => "Received network data in error",
            20 => "Data drifted high",
            21 => "Data drifted low",
            31 => "Condition exists",
            _ => "Reserved failure mode",
        }
    }
}

impl fmt::Display for J1939Dtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SPN{}-FMI{}", self.spn, self.fmi)
    }
}

/// Active DTCs of a single-frame DM1 payload
pub fn j1939_dm1_codes(data: &[u8]) -> Vec<J1939Dtc> {
    if data.len() < 6 {
        return Vec::new();
    }

    data[2..]
        .chunks_exact(4)
        // all-zero means "no active DTC", all-ones is padding
        .filter(|group| !group.iter().all(|&b| b == 0x00) && !group.iter().all(|&b| b == 0xFF))
        .filter_map(J1939Dtc::from_bytes)
        .collect()
}

/// Format a 2-byte OBD-II DTC (`0x03 0x01` -> `P0301`)
pub fn obd_dtc_string(high: u8, low: u8) -> String {
    let letter = match high >> 6 {
        0 => 'P',
        1 => 'C',
        2 => 'B',
        _ => 'U',
    };
    format!(
        "{}{:X}{:X}{:X}{:X}",
        letter,
        (high >> 4) & 0x3,
        high & 0xF,
        low >> 4,
        low & 0xF
    )
}

/// DTCs of a single-frame service 03/07/0A positive response
pub fn obd_stored_codes(data: &[u8]) -> Vec<String> {
    if data.len() < 3 || !OBD_DTC_RESPONSES.contains(&data[1]) {
        return Vec::new();
    }

    // Single-frame PCI: high nibble 0, low nibble = payload length
    let pci = data[0];
    if pci >> 4 != 0 {
        return Vec::new();
    }
    let end = (pci as usize + 1).min(data.len());
    let count = data[2] as usize;

    data.get(3..end)
        .unwrap_or_default()
        .chunks_exact(2)
        .take(count)
        .filter(|pair| BigEndian::read_u16(pair) != 0)
        .map(|pair| obd_dtc_string(pair[0], pair[1]))
        .collect()
}

fn is_obd_response(frame: &RawFrame) -> bool {
    if frame.is_extended {
        frame.can_id & 0xFFFF_FF00 == OBD_EXTENDED_RESPONSE_BASE
    } else {
        OBD_RESPONSE_IDS.contains(&frame.can_id)
    }
}

/// Raw DTC code strings carried by a frame, empty for ordinary data frames
pub fn extract_codes(frame: &RawFrame, protocol: Protocol) -> Vec<String> {
    match protocol {
        Protocol::J1939 if frame.is_extended && j1939_pgn(frame.can_id) == PGN_DM1 => {
            j1939_dm1_codes(&frame.data)
                .iter()
                .map(|dtc| dtc.to_string())
                .collect()
        }
        Protocol::Obd if is_obd_response(frame) => obd_stored_codes(&frame.data),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dm1_single_dtc() {
        // Lamps, SPN 190 (0x0BE) FMI 2, OC 1, padding
        let data = [0x04, 0xFF, 0xBE, 0x00, 0x02, 0x01, 0xFF, 0xFF];
        let dtcs = j1939_dm1_codes(&data);
        assert_eq!(
            dtcs,
            vec![J1939Dtc {
                spn: 190,
                fmi: 2,
                occurrence: 1
            }]
        );
        assert_eq!(dtcs[0].to_string(), "SPN190-FMI2");
    }

    #[test]
    fn test_dm1_high_spn_bits() {
        // SPN 0x7FFFE uses the top three bits of byte 4
        let group = [0xFE, 0xFF, 0xE0 | 0x03, 0x05];
        let dtc = J1939Dtc::from_bytes(&group).unwrap();
        assert_eq!(dtc.spn, 0x7FFFE);
        assert_eq!(dtc.fmi, 3);
        assert_eq!(dtc.occurrence, 5);
    }

    #[test]
    fn test_dm1_no_active_dtc() {
        let data = [0x00, 0xFF, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF];
        assert!(j1939_dm1_codes(&data).is_empty());
        assert!(j1939_dm1_codes(&[0x00, 0xFF]).is_empty());
    }

    #[test]
    fn test_parse_code() {
        assert_eq!(J1939Dtc::parse_code("SPN190-FMI2"), Some((190, 2)));
        assert_eq!(J1939Dtc::parse_code("spn110-fmi0"), Some((110, 0)));
        assert_eq!(J1939Dtc::parse_code("P0301"), None);
    }

    #[test]
    fn test_obd_dtc_strings() {
        assert_eq!(obd_dtc_string(0x03, 0x01), "P0301");
        assert_eq!(obd_dtc_string(0x41, 0x23), "C0123");
        assert_eq!(obd_dtc_string(0x90, 0x01), "B1001");
        assert_eq!(obd_dtc_string(0xC1, 0x00), "U0100");
    }

    #[test]
    fn test_obd_service_03_response() {
        // 6 bytes: 43, count 2, P0301, P0420, then padding
        let data = [0x06, 0x43, 0x02, 0x03, 0x01, 0x04, 0x20, 0xAA];
        assert_eq!(obd_stored_codes(&data), vec!["P0301", "P0420"]);

        // No stored codes
        let data = [0x02, 0x43, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert!(obd_stored_codes(&data).is_empty());

        // Other services are ignored
        let data = [0x04, 0x41, 0x0C, 0x1A, 0xF8, 0x00, 0x00, 0x00];
        assert!(obd_stored_codes(&data).is_empty());
    }

    #[test]
    fn test_extract_codes_by_protocol() {
        let dm1 = RawFrame::new(0x18FE_CA00, vec![0x04, 0xFF, 0xBE, 0x00, 0x02, 0x01, 0xFF, 0xFF]);
        assert_eq!(extract_codes(&dm1, Protocol::J1939), vec!["SPN190-FMI2"]);
        assert!(extract_codes(&dm1, Protocol::Obd).is_empty());

        let obd = RawFrame::new(0x7E8, vec![0x04, 0x43, 0x01, 0x03, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(extract_codes(&obd, Protocol::Obd), vec!["P0301"]);

        let obd_ext = RawFrame::new(0x18DA_F110, vec![0x04, 0x43, 0x01, 0x01, 0x71, 0x00, 0x00, 0x00]);
        assert_eq!(extract_codes(&obd_ext, Protocol::Obd), vec!["P0171"]);

        let plain = RawFrame::new(0x0C1, vec![0x03, 0xE8]);
        assert!(extract_codes(&plain, Protocol::J1939).is_empty());
        assert!(extract_codes(&plain, Protocol::Obd).is_empty());
    }
}
