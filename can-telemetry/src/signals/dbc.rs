//! DBC file parser
//!
//! Parses Vector DBC files with `can-dbc` and converts them into message layouts.

use crate::signals::database::{ByteOrder, MessageLayout, SignalDescriptor, ValueType};
use crate::types::{DatabaseLoadError, LoadFailure};
use std::collections::BTreeMap;
use std::path::Path;

/// Flag can-dbc leaves in the raw message ID of extended frames
const EXTENDED_ID_FLAG: u32 = 0x8000_0000;

/// Pseudo-message that collects signals not assigned to any frame
const INDEPENDENT_SIGNALS_MESSAGE: &str = "VECTOR__INDEPENDENT_SIG_MSG";

/// Parse a DBC file and return message layouts
pub fn parse_dbc_file(path: &Path) -> Result<Vec<MessageLayout>, DatabaseLoadError> {
    log::info!("Parsing DBC file: {:?}", path);

    let bytes = std::fs::read(path).map_err(|e| {
        let reason = if e.kind() == std::io::ErrorKind::NotFound {
            LoadFailure::NotFound
        } else {
            LoadFailure::ParseError
        };
        DatabaseLoadError::new(reason, path, format!("failed to read file: {}", e))
    })?;

    // Try UTF-8 first, then fall back to Latin-1 (compatible with Windows-1252)
    let content = match String::from_utf8(bytes) {
        Ok(content) => content,
        Err(e) => {
            log::warn!("DBC file is not UTF-8, trying Latin-1 encoding");
            e.into_bytes().iter().map(|&b| b as char).collect()
        }
    };

    parse_dbc_str(&content, path)
}

/// Parse DBC text; `source` is only used for error reporting
pub fn parse_dbc_str(content: &str, source: &Path) -> Result<Vec<MessageLayout>, DatabaseLoadError> {
    let dbc = can_dbc::DBC::from_slice(content.as_bytes()).map_err(|e| {
        DatabaseLoadError::new(LoadFailure::ParseError, source, format!("{:?}", e))
    })?;

    let mut messages = Vec::new();
    for dbc_msg in dbc.messages() {
        if dbc_msg.message_name() == INDEPENDENT_SIGNALS_MESSAGE {
            continue;
        }
        messages.push(convert_message(&dbc, dbc_msg));
    }

    log::info!("Parsed {} messages from {:?}", messages.len(), source);
    Ok(messages)
}

/// Convert a can-dbc message to our MessageLayout
fn convert_message(dbc: &can_dbc::DBC, dbc_msg: &can_dbc::Message) -> MessageLayout {
    let raw_id = dbc_msg.message_id().0;

    let signals = dbc_msg
        .signals()
        .iter()
        .map(|dbc_sig| {
            let value_table = dbc
                .value_descriptions_for_signal(dbc_msg.message_id().clone(), dbc_sig.name())
                .map(|descriptions| {
                    descriptions
                        .iter()
                        .map(|d| (*d.a() as i64, d.b().clone()))
                        .collect::<BTreeMap<i64, String>>()
                })
                .filter(|table| !table.is_empty());
            convert_signal(dbc_sig, value_table)
        })
        .collect();

    MessageLayout {
        id: raw_id & !EXTENDED_ID_FLAG,
        extended: raw_id & EXTENDED_ID_FLAG != 0,
        name: dbc_msg.message_name().to_string(),
        size: *dbc_msg.message_size() as usize,
        sender: match dbc_msg.transmitter() {
            can_dbc::Transmitter::NodeName(name) => Some(name.to_string()),
            _ => None,
        },
        signals,
    }
}

/// Convert a can-dbc signal to our SignalDescriptor
fn convert_signal(dbc_sig: &can_dbc::Signal, value_table: Option<BTreeMap<i64, String>>) -> SignalDescriptor {
    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    let value_type = match *dbc_sig.value_type() {
        can_dbc::ValueType::Signed => ValueType::Signed,
        can_dbc::ValueType::Unsigned => ValueType::Unsigned,
    };

    let (is_multiplexor, multiplexer_value) = match *dbc_sig.multiplexer_indicator() {
        can_dbc::MultiplexIndicator::Multiplexor => (true, None),
        can_dbc::MultiplexIndicator::MultiplexedSignal(value) => (false, Some(value)),
        can_dbc::MultiplexIndicator::MultiplexorAndMultiplexedSignal(_) => {
            log::warn!(
                "Extended multiplexing on '{}' is not supported, treating it as a plain multiplexor",
                dbc_sig.name()
            );
            (true, None)
        }
        can_dbc::MultiplexIndicator::Plain => (false, None),
    };

    SignalDescriptor {
        name: dbc_sig.name().to_string(),
        start_bit: *dbc_sig.start_bit() as u16,
        length: *dbc_sig.signal_size() as u16,
        byte_order,
        value_type,
        factor: *dbc_sig.factor(),
        offset: *dbc_sig.offset(),
        min: *dbc_sig.min(),
        max: *dbc_sig.max(),
        unit: if dbc_sig.unit().is_empty() {
            None
        } else {
            Some(dbc_sig.unit().to_string())
        },
        value_table,
        is_multiplexor,
        multiplexer_value,
    }
}
