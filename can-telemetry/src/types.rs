//! Core types for the CAN telemetry library
//!
//! This module defines the frames the bus layer produces, the samples the decoder
//! emits, and the error taxonomy shared by every component. Samples are immutable
//! once produced; nothing here holds on to them beyond the current cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Timestamp type used throughout the library
pub type Timestamp = DateTime<Utc>;

/// Largest payload a CAN FD frame can carry
pub const MAX_FD_PAYLOAD: usize = 64;

/// Largest payload a classic CAN frame can carry
pub const MAX_CLASSIC_PAYLOAD: usize = 8;

/// Raw CAN frame as delivered by a bus backend
///
/// This represents a single CAN frame before any signal decoding or
/// message interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrame {
    /// Wall-clock timestamp in nanoseconds since the Unix epoch
    pub timestamp_ns: u64,
    /// CAN channel number (e.g., 0, 1, 2...)
    pub channel: u8,
    /// CAN identifier (11-bit or 29-bit)
    pub can_id: u32,
    /// Frame data bytes (0-8 bytes for classic CAN, up to 64 for CAN-FD)
    pub data: Vec<u8>,
    /// True if this is an extended (29-bit) CAN ID
    pub is_extended: bool,
    /// True if this is a CAN-FD frame
    pub is_fd: bool,
    /// True if this is an error frame
    pub is_error_frame: bool,
    /// True if this is a remote frame
    pub is_remote_frame: bool,
}

impl RawFrame {
    /// Create a classic data frame stamped with the current wall-clock time.
    ///
    /// Identifiers above the 11-bit range are flagged as extended.
    pub fn new(can_id: u32, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        Self {
            timestamp_ns: now_ns(),
            channel: 0,
            can_id,
            is_extended: can_id > 0x7FF,
            is_fd: data.len() > MAX_CLASSIC_PAYLOAD,
            data,
            is_error_frame: false,
            is_remote_frame: false,
        }
    }

    /// Builder method: override the timestamp
    pub fn with_timestamp_ns(mut self, timestamp_ns: u64) -> Self {
        self.timestamp_ns = timestamp_ns;
        self
    }

    /// Builder method: set the channel number
    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    /// Builder method: force the extended-identifier flag
    pub fn with_extended(mut self, extended: bool) -> Self {
        self.is_extended = extended;
        self
    }

    /// Convert timestamp from nanoseconds to DateTime<Utc>
    pub fn timestamp(&self) -> Timestamp {
        let secs = (self.timestamp_ns / 1_000_000_000) as i64;
        let nsecs = (self.timestamp_ns % 1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nsecs).unwrap_or_else(Utc::now)
    }

    /// Get the data length code (DLC) - number of data bytes
    pub fn dlc(&self) -> usize {
        self.data.len()
    }

    /// True for frames that carry a payload worth decoding
    pub fn is_data_frame(&self) -> bool {
        !self.is_error_frame && !self.is_remote_frame
    }
}

impl fmt::Display for RawFrame {
    /// candump-style rendering: `123#DEADBEEF`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_extended {
            write!(f, "{:08X}#", self.can_id)?;
        } else {
            write!(f, "{:03X}#", self.can_id)?;
        }
        for byte in &self.data {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// Current wall-clock time in nanoseconds since the Unix epoch
pub fn now_ns() -> u64 {
    Utc::now()
        .timestamp_nanos_opt()
        .map(|ns| ns.max(0) as u64)
        .unwrap_or(0)
}

/// A decoded sample - the primary output of the decoder
///
/// Produced from exactly one [`RawFrame`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedSample {
    /// CAN identifier of the source frame
    pub can_id: u32,
    /// Timestamp of the source frame
    pub timestamp: Timestamp,
    /// Message name from the signal database (if available)
    pub message_name: Option<String>,
    /// Decoded signals in layout order
    pub signals: Vec<DecodedSignal>,
    /// Raw diagnostic trouble codes carried by the frame
    pub dtc_codes: Vec<String>,
}

impl DecodedSample {
    /// Find a decoded signal by name
    pub fn signal(&self, name: &str) -> Option<&DecodedSignal> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// Physical value of a signal, if present
    pub fn value(&self, name: &str) -> Option<f64> {
        self.signal(name).map(|s| s.value.as_f64(s.raw_value))
    }

    /// True if the frame carried any fault codes
    pub fn has_dtcs(&self) -> bool {
        !self.dtc_codes.is_empty()
    }
}

/// A decoded signal with its current value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedSignal {
    /// Signal name from the database
    pub name: String,
    /// Physical value or enumeration label
    pub value: SignalValue,
    /// Engineering unit (e.g., "rpm", "km/h", "degC")
    pub unit: Option<String>,
    /// Raw integer value before scaling
    pub raw_value: i64,
}

/// Signal value types produced by the decoder
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SignalValue {
    /// Physical value after scale and offset
    Float(f64),
    /// Label from the signal's value table
    Label(String),
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Float(v) if v.fract() == 0.0 && v.abs() < 1e15 => write!(f, "{}", *v as i64),
            SignalValue::Float(v) => write!(f, "{:.3}", v),
            SignalValue::Label(label) => write!(f, "{}", label),
        }
    }
}

impl SignalValue {
    /// Numeric view of the value; labels fall back to the raw integer
    pub fn as_f64(&self, raw_value: i64) -> f64 {
        match self {
            SignalValue::Float(v) => *v,
            SignalValue::Label(_) => raw_value as f64,
        }
    }

    /// Label of an enumerated value
    pub fn as_label(&self) -> Option<&str> {
        match self {
            SignalValue::Label(label) => Some(label),
            SignalValue::Float(_) => None,
        }
    }
}

/// Why a signal database could not be loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadFailure {
    /// The backing artifact does not exist
    NotFound,
    /// The artifact exists but could not be parsed
    ParseError,
    /// The artifact parsed but describes an impossible layout
    Invalid,
}

impl fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadFailure::NotFound => write!(f, "not found"),
            LoadFailure::ParseError => write!(f, "parse error"),
            LoadFailure::Invalid => write!(f, "invalid layout"),
        }
    }
}

/// Errors loading a signal database or DTC table
#[derive(Debug, thiserror::Error)]
#[error("Failed to load {}: {reason}: {detail}", .path.display())]
pub struct DatabaseLoadError {
    /// Failure category
    pub reason: LoadFailure,
    /// Artifact that failed to load
    pub path: PathBuf,
    /// Human-readable detail
    pub detail: String,
}

impl DatabaseLoadError {
    pub(crate) fn new(reason: LoadFailure, path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self {
            reason,
            path: path.into(),
            detail: detail.into(),
        }
    }
}

/// Per-frame decoding errors; never fatal to a session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Unknown CAN ID 0x{id:X}")]
    UnknownIdentifier { id: u32 },

    #[error("Signal '{signal}' of CAN ID 0x{id:X} needs {required_bytes} bytes but frame has {available_bytes}")]
    Truncated {
        id: u32,
        signal: String,
        required_bytes: usize,
        available_bytes: usize,
    },

    #[error("CAN ID 0x{id:X} is an error or remote frame")]
    NotADataFrame { id: u32 },
}

/// Errors raised by the bus layer
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("CAN interface '{interface}' unavailable: {reason}")]
    DeviceUnavailable { interface: String, reason: String },

    #[error("Bus is not open")]
    NotOpen,

    #[error("Bus is already open on '{0}'")]
    AlreadyOpen(String),

    #[error("Bus I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the telemetry logger
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("Log I/O failure on {}: {source}", .path.display())]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Record fields {found:?} do not match header {expected:?} of {}", .path.display())]
    SchemaMismatch {
        path: PathBuf,
        expected: Vec<String>,
        found: Vec<String>,
    },
}

/// Errors starting a monitoring session
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Database(#[from] DatabaseLoadError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error("A monitoring session is already running")]
    AlreadyRunning,

    #[error("Failed to spawn polling worker: {0}")]
    Spawn(#[source] std::io::Error),
}
