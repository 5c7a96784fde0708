//! Signal database and DBC parser
//!
//! This module contains the DBC importer and the immutable signal database
//! built from it.

pub mod dbc;
pub mod database;

// Re-export key types for convenience
pub use database::{
    j1939_pgn, ByteOrder, DatabaseStats, MessageLayout, SignalDatabase, SignalDescriptor,
    ValueType, PGN_DM1,
};
