//! CAN Telemetry Library
//!
//! Live CAN bus monitoring: frames are acquired from a bus backend, decoded into
//! physical signal values with a DBC signal database, checked for diagnostic
//! trouble codes and appended to a day-partitioned CSV log.
//!
//! # Architecture
//!
//! - `bus` - frame acquisition (SocketCAN, simulated, candump replay)
//! - `signals` - DBC signal database, one per protocol (J1939 or OBD-II)
//! - `decoder` - raw frame to decoded sample
//! - `dtc` - trouble code extraction and description lookup
//! - `logger` - append-only CSV units, one per UTC day
//! - `session` - the `Monitor` that ties everything together on a worker thread
//!
//! The library does NOT:
//! - Render anything (the presentation layer reads from `Monitor`)
//! - Transmit frames or actively request diagnostics
//! - Retry failed operations
//!
//! # Example Usage
//!
//! ```no_run
//! use can_telemetry::{InterfaceConfig, Monitor, MonitorConfig, Protocol};
//! use std::time::Duration;
//!
//! let config = MonitorConfig::new()
//!     .with_protocol(Protocol::J1939)
//!     .with_interface(InterfaceConfig::socketcan("can0"))
//!     .with_db_dir("db")
//!     .with_log_dir("logs");
//!
//! let monitor = Monitor::new();
//! let samples = monitor.subscribe();
//! monitor.start_session(config).unwrap();
//!
//! while let Ok(sample) = samples.recv_timeout(Duration::from_secs(1)) {
//!     for signal in &sample.signals {
//!         println!("{}: {}", signal.name, signal.value);
//!     }
//! }
//!
//! monitor.stop_session();
//! ```

// Public modules
pub mod bus;
pub mod config;
pub mod decoder;
pub mod dtc;
pub mod logger;
pub mod session;
pub mod signals;
pub mod types;

// Re-export main types for convenience
pub use bus::{BusBackend, BusReader, DemoGenerator, FrameGenerator, ScriptedGenerator, SimulatedBus};
pub use config::{InterfaceConfig, MonitorConfig, Protocol};
pub use decoder::{DecodingIterator, FrameDecoder};
pub use dtc::{DtcInfo, DtcResolver, DtcTable};
pub use logger::{LogRecord, TelemetryLogger};
pub use message_decoder::BitLayout;
pub use session::{Monitor, SessionStats, SessionStatus};
pub use signals::{ByteOrder, DatabaseStats, MessageLayout, SignalDatabase, SignalDescriptor, ValueType};
pub use types::{
    BusError, DatabaseLoadError, DecodeError, DecodedSample, DecodedSignal, LoadFailure, LogError,
    RawFrame, SessionError, SignalValue, Timestamp,
};

// Internal modules (not exposed in public API)
mod message_decoder;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_basics() {
        // Smoke test: an empty database decodes nothing
        let db = SignalDatabase::from_layouts(Protocol::J1939, Vec::new()).unwrap();
        assert_eq!(db.stats().num_messages, 0);
        assert!(matches!(
            FrameDecoder::decode(&RawFrame::new(0x0C1, vec![0x03, 0xE8]), &db),
            Err(DecodeError::UnknownIdentifier { id: 0x0C1 })
        ));
    }
}
