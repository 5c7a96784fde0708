//! Signal database
//!
//! Immutable identifier → message layout index built once per protocol. Layouts
//! are validated at construction: every signal must fit the declared payload and
//! signals that can be active at the same time must not share bits. Switching
//! protocol means building a new database, never mutating an existing one.

use crate::config::Protocol;
use crate::message_decoder::BitLayout;
use crate::types::{DatabaseLoadError, LoadFailure, MAX_FD_PAYLOAD};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// J1939 DM1 (active diagnostic trouble codes) parameter group number
pub const PGN_DM1: u32 = 0xFECA;

/// A complete CAN message layout
#[derive(Debug, Clone, PartialEq)]
pub struct MessageLayout {
    /// CAN identifier (extended-frame flag stripped)
    pub id: u32,
    /// True if the message uses a 29-bit identifier
    pub extended: bool,
    /// Message name
    pub name: String,
    /// Message size in bytes
    pub size: usize,
    /// Sender ECU name (optional)
    pub sender: Option<String>,
    /// Signals in declaration order
    pub signals: Vec<SignalDescriptor>,
}

impl MessageLayout {
    /// Create an empty layout
    pub fn new(id: u32, name: impl Into<String>, size: usize) -> Self {
        Self {
            id,
            extended: id > 0x7FF,
            name: name.into(),
            size,
            sender: None,
            signals: Vec::new(),
        }
    }

    /// Builder method: append a signal
    pub fn with_signal(mut self, signal: SignalDescriptor) -> Self {
        self.signals.push(signal);
        self
    }

    /// Builder method: set the sender ECU
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// The multiplexor signal, if this message is multiplexed
    pub fn multiplexor(&self) -> Option<&SignalDescriptor> {
        self.signals.iter().find(|s| s.is_multiplexor)
    }

    /// True if this message has multiplexed signals
    pub fn is_multiplexed(&self) -> bool {
        self.signals.iter().any(|s| s.multiplexer_value.is_some())
    }

    /// Find a signal by name
    pub fn signal(&self, name: &str) -> Option<&SignalDescriptor> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// Check the layout invariants: bounds and non-overlap
    pub fn validate(&self) -> Result<(), String> {
        if self.size > MAX_FD_PAYLOAD {
            return Err(format!(
                "message '{}' declares {} bytes (max {})",
                self.name, self.size, MAX_FD_PAYLOAD
            ));
        }

        for signal in &self.signals {
            if signal.length == 0 || signal.length > 64 {
                return Err(format!(
                    "signal '{}' has unsupported length {}",
                    signal.name, signal.length
                ));
            }
            let layout = BitLayout::for_signal(signal);
            if layout.required_bytes() > self.size {
                return Err(format!(
                    "signal '{}' needs {} bytes but message '{}' has {}",
                    signal.name,
                    layout.required_bytes(),
                    self.name,
                    self.size
                ));
            }
            if signal.multiplexer_value.is_some() && self.multiplexor().is_none() {
                return Err(format!(
                    "multiplexed signal '{}' but no multiplexor in '{}'",
                    signal.name, self.name
                ));
            }
        }

        // Always-present signals must be disjoint, and each multiplexed group
        // must be disjoint from them and from itself.
        let base: Vec<&SignalDescriptor> = self
            .signals
            .iter()
            .filter(|s| s.multiplexer_value.is_none())
            .collect();
        let base_mask = occupancy(&self.name, &base, BitMask::default())?;

        let mut groups: BTreeMap<u64, Vec<&SignalDescriptor>> = BTreeMap::new();
        for signal in &self.signals {
            if let Some(value) = signal.multiplexer_value {
                groups.entry(value).or_default().push(signal);
            }
        }
        for group in groups.values() {
            occupancy(&self.name, group, base_mask)?;
        }

        Ok(())
    }
}

/// Bit occupancy of a payload up to 64 bytes
#[derive(Debug, Clone, Copy, Default)]
struct BitMask([u64; MAX_FD_PAYLOAD / 8]);

impl BitMask {
    /// Set a bit; false if it was already set
    fn insert(&mut self, bit: usize) -> bool {
        let (word, offset) = (bit / 64, bit % 64);
        let was_set = self.0[word] & (1 << offset) != 0;
        self.0[word] |= 1 << offset;
        !was_set
    }
}

fn occupancy(message: &str, signals: &[&SignalDescriptor], mut mask: BitMask) -> Result<BitMask, String> {
    for signal in signals {
        for bit in BitLayout::for_signal(signal).occupied_bits() {
            if bit >= MAX_FD_PAYLOAD * 8 || !mask.insert(bit) {
                return Err(format!(
                    "signal '{}' overlaps another signal in '{}' at bit {}",
                    signal.name, message, bit
                ));
            }
        }
    }
    Ok(mask)
}

/// A CAN signal definition
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDescriptor {
    /// Signal name
    pub name: String,
    /// Start bit in DBC numbering (LSB for Intel, MSB for Motorola)
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    /// Byte order
    pub byte_order: ByteOrder,
    /// Value type (signed/unsigned)
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub factor: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Minimum physical value
    pub min: f64,
    /// Maximum physical value
    pub max: f64,
    /// Engineering unit (e.g., "km/h", "degC", "V")
    pub unit: Option<String>,
    /// Value table for enum-like values (raw_value -> label)
    pub value_table: Option<BTreeMap<i64, String>>,
    /// True if this signal selects the active multiplexed group
    pub is_multiplexor: bool,
    /// Multiplexor value for which this signal is present
    pub multiplexer_value: Option<u64>,
}

impl SignalDescriptor {
    /// Unsigned, unscaled signal
    pub fn new(name: impl Into<String>, start_bit: u16, length: u16, byte_order: ByteOrder) -> Self {
        Self {
            name: name.into(),
            start_bit,
            length,
            byte_order,
            value_type: ValueType::Unsigned,
            factor: 1.0,
            offset: 0.0,
            min: 0.0,
            max: 0.0,
            unit: None,
            value_table: None,
            is_multiplexor: false,
            multiplexer_value: None,
        }
    }

    /// Builder method: interpret the raw value as two's complement
    pub fn signed(mut self) -> Self {
        self.value_type = ValueType::Signed;
        self
    }

    /// Builder method: set scale factor and offset
    pub fn with_scaling(mut self, factor: f64, offset: f64) -> Self {
        self.factor = factor;
        self.offset = offset;
        self
    }

    /// Builder method: set the engineering unit
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Builder method: attach a value table
    pub fn with_value_table(mut self, table: BTreeMap<i64, String>) -> Self {
        self.value_table = Some(table);
        self
    }

    /// Builder method: mark this signal as the multiplexor
    pub fn as_multiplexor(mut self) -> Self {
        self.is_multiplexor = true;
        self
    }

    /// Builder method: only present when the multiplexor equals `value`
    pub fn multiplexed_on(mut self, value: u64) -> Self {
        self.multiplexer_value = Some(value);
        self
    }

    /// `physical = raw * factor + offset`, in f64
    pub fn to_physical(&self, raw: i64) -> f64 {
        (raw as f64) * self.factor + self.offset
    }

    /// Inverse of [`to_physical`](Self::to_physical), rounded to the nearest raw step
    pub fn to_raw(&self, physical: f64) -> i64 {
        if self.factor == 0.0 {
            return 0;
        }
        ((physical - self.offset) / self.factor).round() as i64
    }
}

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Signed integer
    Signed,
    /// Unsigned integer
    Unsigned,
}

/// Parameter group number of a 29-bit J1939 identifier.
///
/// PDU1 groups (PF < 240) are addressed, so the destination byte is not part
/// of the PGN.
pub fn j1939_pgn(can_id: u32) -> u32 {
    let pgn = (can_id >> 8) & 0x3_FFFF;
    let pdu_format = (pgn >> 8) & 0xFF;
    if pdu_format < 240 {
        pgn & 0x3_FF00
    } else {
        pgn
    }
}

/// The signal database
#[derive(Debug)]
pub struct SignalDatabase {
    protocol: Protocol,
    /// Artifact the database was built from
    source: PathBuf,
    /// Message layouts by CAN ID
    messages: HashMap<u32, MessageLayout>,
    /// J1939 only: PGN -> CAN ID of the defining message
    pgn_index: HashMap<u32, u32>,
    /// Signal name -> CAN IDs of messages carrying it
    signal_lookup: HashMap<String, Vec<u32>>,
}

impl SignalDatabase {
    /// Load `<db_dir>/<protocol>.dbc`
    pub fn load(protocol: Protocol, db_dir: &Path) -> Result<Self, DatabaseLoadError> {
        let path = protocol.database_path(db_dir);
        log::info!("Loading {} signal database: {:?}", protocol, path);

        let layouts = crate::signals::dbc::parse_dbc_file(&path)?;
        let db = Self::build(protocol, path, layouts)?;

        let stats = db.stats();
        log::info!(
            "Signal database loaded: {} messages, {} signals",
            stats.num_messages,
            stats.num_signals
        );
        Ok(db)
    }

    /// Build from an explicit DBC file
    pub fn from_dbc_file(protocol: Protocol, path: &Path) -> Result<Self, DatabaseLoadError> {
        let layouts = crate::signals::dbc::parse_dbc_file(path)?;
        Self::build(protocol, path.to_path_buf(), layouts)
    }

    /// Build from DBC text already in memory
    pub fn from_dbc_str(protocol: Protocol, content: &str) -> Result<Self, DatabaseLoadError> {
        let source = PathBuf::from("<memory>");
        let layouts = crate::signals::dbc::parse_dbc_str(content, &source)?;
        Self::build(protocol, source, layouts)
    }

    /// Build from layouts assembled in code
    pub fn from_layouts(protocol: Protocol, layouts: Vec<MessageLayout>) -> Result<Self, DatabaseLoadError> {
        Self::build(protocol, PathBuf::from("<memory>"), layouts)
    }

    fn build(protocol: Protocol, source: PathBuf, layouts: Vec<MessageLayout>) -> Result<Self, DatabaseLoadError> {
        let mut messages = HashMap::new();
        let mut pgn_index = HashMap::new();
        let mut signal_lookup: HashMap<String, Vec<u32>> = HashMap::new();

        for layout in layouts {
            layout
                .validate()
                .map_err(|detail| DatabaseLoadError::new(LoadFailure::Invalid, &source, detail))?;

            if messages.contains_key(&layout.id) {
                log::warn!(
                    "Duplicate definition for CAN ID 0x{:X} ('{}'), keeping the first",
                    layout.id,
                    layout.name
                );
                continue;
            }

            if protocol == Protocol::J1939 && layout.extended {
                pgn_index.entry(j1939_pgn(layout.id)).or_insert(layout.id);
            }

            for signal in &layout.signals {
                signal_lookup
                    .entry(signal.name.clone())
                    .or_default()
                    .push(layout.id);
            }

            messages.insert(layout.id, layout);
        }

        Ok(Self {
            protocol,
            source,
            messages,
            pgn_index,
            signal_lookup,
        })
    }

    /// Layout for a CAN ID.
    ///
    /// J1939 databases fall back to a PGN match so that the same parameter group
    /// sent by a different source address still decodes.
    pub fn lookup(&self, can_id: u32) -> Option<&MessageLayout> {
        if let Some(layout) = self.messages.get(&can_id) {
            return Some(layout);
        }
        if self.protocol == Protocol::J1939 && can_id > 0x7FF {
            return self
                .pgn_index
                .get(&j1939_pgn(can_id))
                .and_then(|id| self.messages.get(id));
        }
        None
    }

    /// Find all messages containing a specific signal name
    pub fn find_signal(&self, signal_name: &str) -> Vec<(u32, &SignalDescriptor)> {
        self.signal_lookup
            .get(signal_name)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| {
                        self.messages
                            .get(id)
                            .and_then(|msg| msg.signal(signal_name))
                            .map(|sig| (*id, sig))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Protocol the database was built for
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Artifact the database was built from
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Get database statistics
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            num_messages: self.messages.len(),
            num_signals: self.messages.values().map(|msg| msg.signals.len()).sum(),
        }
    }

    /// Get all CAN IDs in the database, sorted
    pub fn identifiers(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.messages.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Database statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Total number of message layouts
    pub num_messages: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_layout() -> MessageLayout {
        MessageLayout::new(0x123, "EngineData", 8)
            .with_sender("ECU1")
            .with_signal(
                SignalDescriptor::new("EngineSpeed", 0, 16, ByteOrder::LittleEndian)
                    .with_unit("rpm"),
            )
            .with_signal(
                SignalDescriptor::new("EngineTemp", 16, 8, ByteOrder::LittleEndian)
                    .with_scaling(1.0, -40.0)
                    .with_unit("degC"),
            )
    }

    #[test]
    fn test_empty_database() {
        let db = SignalDatabase::from_layouts(Protocol::Obd, vec![]).unwrap();
        let stats = db.stats();
        assert_eq!(stats.num_messages, 0);
        assert_eq!(stats.num_signals, 0);
        assert!(db.lookup(0x123).is_none());
    }

    #[test]
    fn test_lookup_and_find_signal() {
        let db = SignalDatabase::from_layouts(Protocol::Obd, vec![engine_layout()]).unwrap();

        let stats = db.stats();
        assert_eq!(stats.num_messages, 1);
        assert_eq!(stats.num_signals, 2);

        let msg = db.lookup(0x123).unwrap();
        assert_eq!(msg.name, "EngineData");
        assert_eq!(msg.signals[0].name, "EngineSpeed");

        let found = db.find_signal("EngineTemp");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, 0x123);
        assert!(db.find_signal("Missing").is_empty());
    }

    #[test]
    fn test_overlapping_signals_rejected() {
        let layout = MessageLayout::new(0x100, "Clash", 8)
            .with_signal(SignalDescriptor::new("A", 0, 12, ByteOrder::LittleEndian))
            .with_signal(SignalDescriptor::new("B", 8, 8, ByteOrder::LittleEndian));

        let err = SignalDatabase::from_layouts(Protocol::Obd, vec![layout]).unwrap_err();
        assert_eq!(err.reason, LoadFailure::Invalid);
        assert!(err.detail.contains("overlaps"));
    }

    #[test]
    fn test_signal_past_payload_rejected() {
        let layout = MessageLayout::new(0x100, "Short", 2)
            .with_signal(SignalDescriptor::new("Wide", 8, 16, ByteOrder::LittleEndian));

        let err = SignalDatabase::from_layouts(Protocol::Obd, vec![layout]).unwrap_err();
        assert_eq!(err.reason, LoadFailure::Invalid);
    }

    #[test]
    fn test_multiplexed_groups_may_share_bits() {
        let layout = MessageLayout::new(0x200, "Muxed", 8)
            .with_signal(SignalDescriptor::new("Mode", 0, 8, ByteOrder::LittleEndian).as_multiplexor())
            .with_signal(SignalDescriptor::new("A", 8, 16, ByteOrder::LittleEndian).multiplexed_on(0))
            .with_signal(SignalDescriptor::new("B", 8, 16, ByteOrder::LittleEndian).multiplexed_on(1));

        assert!(SignalDatabase::from_layouts(Protocol::Obd, vec![layout]).is_ok());

        let clash = MessageLayout::new(0x201, "MuxClash", 8)
            .with_signal(SignalDescriptor::new("Mode", 0, 8, ByteOrder::LittleEndian).as_multiplexor())
            .with_signal(SignalDescriptor::new("A", 4, 8, ByteOrder::LittleEndian).multiplexed_on(0));
        assert!(SignalDatabase::from_layouts(Protocol::Obd, vec![clash]).is_err());
    }

    #[test]
    fn test_j1939_pgn() {
        // EEC1 from source 0x00: PDU2, PGN 0xF004
        assert_eq!(j1939_pgn(0x0CF0_0400), 0xF004);
        // DM1 from source 0x3D
        assert_eq!(j1939_pgn(0x18FE_CA3D), PGN_DM1);
        // PDU1 request to 0x00 from 0xF9: destination dropped
        assert_eq!(j1939_pgn(0x18EA_00F9), 0xEA00);
        assert_eq!(j1939_pgn(0x18EA_17F9), 0xEA00);
    }

    #[test]
    fn test_j1939_lookup_ignores_source_address() {
        let layout = MessageLayout::new(0x0CF0_0400, "EEC1", 8).with_signal(
            SignalDescriptor::new("EngineSpeed", 24, 16, ByteOrder::LittleEndian)
                .with_scaling(0.125, 0.0),
        );
        let db = SignalDatabase::from_layouts(Protocol::J1939, vec![layout.clone()]).unwrap();
        assert_eq!(db.lookup(0x0CF0_0400).map(|m| m.name.as_str()), Some("EEC1"));
        assert_eq!(db.lookup(0x0CF0_0417).map(|m| m.name.as_str()), Some("EEC1"));

        // Other protocols require an exact match
        let db = SignalDatabase::from_layouts(Protocol::Obd, vec![layout]).unwrap();
        assert!(db.lookup(0x0CF0_0417).is_none());
    }

    #[test]
    fn test_physical_conversion() {
        let signal = SignalDescriptor::new("Temp", 0, 8, ByteOrder::LittleEndian).with_scaling(0.5, -40.0);
        assert_eq!(signal.to_physical(100), 10.0);
        assert_eq!(signal.to_raw(10.0), 100);
        assert_eq!(signal.to_raw(10.2), 100);
    }
}
