//! candump log replay
//!
//! Reads the `candump -l` / `candump -L` log format:
//!
//! ```text
//! (1436509052.249713) vcan0 044#2A366C2BBA
//! (1436509052.449847) vcan0 18FECA00#04FF6E000001FFFF
//! (1436509052.650004) can1 123##1DEADBEEF
//! (1436509052.850251) can0 7DF#R
//! ```
//!
//! Three hex digits mean an 11-bit identifier, eight mean a 29-bit one.
//! `##` introduces a CAN FD payload preceded by one flags nibble.

use crate::types::{BusError, RawFrame};
use std::path::Path;

/// Error-frame flag in candump's 8-digit identifiers
const CAN_ERR_FLAG: u32 = 0x2000_0000;

/// Read every frame of a candump log file
///
/// Lines that do not parse are skipped with a warning.
pub fn load_candump(path: &Path) -> Result<Vec<RawFrame>, BusError> {
    let content = std::fs::read_to_string(path).map_err(|e| BusError::DeviceUnavailable {
        interface: path.display().to_string(),
        reason: format!("cannot read replay log: {}", e),
    })?;

    let mut frames = Vec::new();
    let mut channels: Vec<String> = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_candump_line(line) {
            Some((iface, frame)) => {
                // Channel numbers follow first appearance in the log
                let channel = match channels.iter().position(|c| c == iface) {
                    Some(index) => index,
                    None => {
                        channels.push(iface.to_string());
                        channels.len() - 1
                    }
                };
                frames.push(frame.with_channel(channel.min(u8::MAX as usize) as u8));
            }
            None => log::warn!("{:?}:{}: unparseable candump line: {}", path, line_no + 1, line),
        }
    }

    log::info!("Loaded {} frames from {:?}", frames.len(), path);
    Ok(frames)
}

/// Parse one candump log line into its interface name and frame
pub fn parse_candump_line(line: &str) -> Option<(&str, RawFrame)> {
    let mut parts = line.split_whitespace();
    let timestamp = parts.next()?;
    let iface = parts.next()?;
    let body = parts.next()?;

    let timestamp_ns = parse_timestamp(timestamp)?;
    let (id_text, payload) = body.split_once('#')?;

    let raw_id = u32::from_str_radix(id_text, 16).ok()?;
    let is_extended = match id_text.len() {
        3 => false,
        8 => true,
        _ => return None,
    };
    let is_error_frame = is_extended && raw_id & CAN_ERR_FLAG != 0;
    let can_id = if is_extended { raw_id & 0x1FFF_FFFF } else { raw_id };

    let mut frame = RawFrame::new(can_id, Vec::new())
        .with_timestamp_ns(timestamp_ns)
        .with_extended(is_extended);
    frame.is_error_frame = is_error_frame;

    if let Some(fd_payload) = payload.strip_prefix('#') {
        // One flags nibble, then data
        let data = fd_payload.get(1..)?;
        frame.data = parse_hex_bytes(data)?;
        frame.is_fd = true;
    } else if let Some(dlc) = payload.strip_prefix('R') {
        frame.is_remote_frame = true;
        if !dlc.is_empty() {
            dlc.parse::<u8>().ok()?;
        }
    } else {
        frame.data = parse_hex_bytes(payload)?;
    }

    Some((iface, frame))
}

fn parse_timestamp(text: &str) -> Option<u64> {
    let inner = text.strip_prefix('(')?.strip_suffix(')')?;
    let (secs, frac) = inner.split_once('.').unwrap_or((inner, ""));
    let secs: u64 = secs.parse().ok()?;

    // Right-pad the fraction to nanoseconds
    let mut nanos: u64 = 0;
    let mut digits: u32 = 0;
    for c in frac.chars().take(9) {
        nanos = nanos * 10 + c.to_digit(10)? as u64;
        digits += 1;
    }
    nanos *= 10u64.pow(9 - digits);

    secs.checked_mul(1_000_000_000)?.checked_add(nanos)
}

fn parse_hex_bytes(text: &str) -> Option<Vec<u8>> {
    // candump -L may separate bytes with dots
    let compact: String = text.chars().filter(|&c| c != '.').collect();
    if compact.len() % 2 != 0 {
        return None;
    }
    (0..compact.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(compact.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_standard_frame() {
        let (iface, frame) = parse_candump_line("(1436509052.249713) vcan0 044#2A366C2BBA").unwrap();
        assert_eq!(iface, "vcan0");
        assert_eq!(frame.can_id, 0x044);
        assert!(!frame.is_extended);
        assert_eq!(frame.data, vec![0x2A, 0x36, 0x6C, 0x2B, 0xBA]);
        assert_eq!(frame.timestamp_ns, 1_436_509_052_249_713_000);
    }

    #[test]
    fn test_extended_and_special_frames() {
        let (_, frame) = parse_candump_line("(1.5) can0 18FECA00#04FF6E000001FFFF").unwrap();
        assert_eq!(frame.can_id, 0x18FE_CA00);
        assert!(frame.is_extended);
        assert_eq!(frame.timestamp_ns, 1_500_000_000);

        let (_, frame) = parse_candump_line("(2.0) can0 7DF#R").unwrap();
        assert!(frame.is_remote_frame);
        assert!(!frame.is_data_frame());

        let (_, frame) = parse_candump_line("(2.0) can0 123##1DEADBEEF").unwrap();
        assert!(frame.is_fd);
        assert_eq!(frame.data, vec![0xDE, 0xAD, 0xBE, 0xEF]);

        let (_, frame) = parse_candump_line("(2.0) can0 20000004#0000000000000000").unwrap();
        assert!(frame.is_error_frame);

        let (_, frame) = parse_candump_line("(2.0) can0 0C1#").unwrap();
        assert!(frame.data.is_empty());
    }

    #[test]
    fn test_malformed_lines() {
        assert!(parse_candump_line("").is_none());
        assert!(parse_candump_line("(1.0) can0").is_none());
        assert!(parse_candump_line("1.0 can0 123#00").is_none());
        assert!(parse_candump_line("(1.0) can0 12345#00").is_none());
        assert!(parse_candump_line("(1.0) can0 123#0").is_none());
        assert!(parse_candump_line("(1.0) can0 123#ZZ").is_none());
    }

    #[test]
    fn test_load_file_assigns_channels() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "(1.000000) can0 0C1#03E8").unwrap();
        writeln!(file, "garbage").unwrap();
        writeln!(file, "(1.100000) can1 0C2#50").unwrap();
        writeln!(file, "(1.200000) can0 0C3#78").unwrap();
        file.flush().unwrap();

        let frames = load_candump(file.path()).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames.iter().map(|f| f.channel).collect::<Vec<_>>(),
            vec![0, 1, 0]
        );
    }
}
