//! Diagnostic trouble code resolution
//!
//! A `DtcTable` is an immutable code → description mapping loaded once per
//! protocol from `<protocol>_codes.json`. `DtcResolver` never fails: codes the
//! table does not know resolve to the "Unknown code" sentinel, because code
//! tables are never complete across protocol revisions.

mod extract;

pub use extract::{extract_codes, j1939_dm1_codes, obd_dtc_string, obd_stored_codes, J1939Dtc};

use crate::config::Protocol;
use crate::types::{DatabaseLoadError, LoadFailure};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Description of codes missing from the table
pub const UNKNOWN_CODE: &str = "Unknown code";

/// Resolved trouble code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtcInfo {
    pub code: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

impl DtcInfo {
    /// Sentinel for a code the table does not know
    pub fn unknown(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: UNKNOWN_CODE.to_string(),
            severity: None,
            system: None,
        }
    }

    /// True if this is the "Unknown code" sentinel
    pub fn is_unknown(&self) -> bool {
        self.description == UNKNOWN_CODE
    }
}

/// Table entries may be a bare description or a full record
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TableEntry {
    Text(String),
    Detailed {
        description: String,
        #[serde(default)]
        severity: Option<String>,
        #[serde(default)]
        system: Option<String>,
    },
}

/// Immutable code → description table
#[derive(Debug, Default)]
pub struct DtcTable {
    /// Keyed by upper-cased code
    entries: HashMap<String, DtcInfo>,
    source: PathBuf,
}

impl DtcTable {
    /// Load `<db_dir>/<protocol>_codes.json`
    pub fn load(protocol: Protocol, db_dir: &Path) -> Result<Self, DatabaseLoadError> {
        let path = protocol.dtc_table_path(db_dir);
        log::info!("Loading {} DTC table: {:?}", protocol, path);
        Self::from_file(&path)
    }

    /// Load a JSON table from an explicit path
    pub fn from_file(path: &Path) -> Result<Self, DatabaseLoadError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            let reason = if e.kind() == std::io::ErrorKind::NotFound {
                LoadFailure::NotFound
            } else {
                LoadFailure::ParseError
            };
            DatabaseLoadError::new(reason, path, format!("failed to read file: {}", e))
        })?;

        let mut table = Self::from_json(&content)
            .map_err(|e| DatabaseLoadError::new(LoadFailure::ParseError, path, e.to_string()))?;
        table.source = path.to_path_buf();

        log::info!("DTC table loaded: {} codes", table.len());
        Ok(table)
    }

    /// Parse a JSON object of `code -> description | { description, severity?, system? }`
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        let raw: HashMap<String, TableEntry> = serde_json::from_str(content)?;
        let entries = raw
            .into_iter()
            .map(|(code, entry)| {
                let info = match entry {
                    TableEntry::Text(description) => DtcInfo {
                        code: code.clone(),
                        description,
                        severity: None,
                        system: None,
                    },
                    TableEntry::Detailed {
                        description,
                        severity,
                        system,
                    } => DtcInfo {
                        code: code.clone(),
                        description,
                        severity,
                        system,
                    },
                };
                (normalize(&code), info)
            })
            .collect();

        Ok(Self {
            entries,
            source: PathBuf::new(),
        })
    }

    /// Exact (case-insensitive) lookup
    pub fn get(&self, code: &str) -> Option<&DtcInfo> {
        self.entries.get(&normalize(code))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Artifact the table was loaded from
    pub fn source(&self) -> &Path {
        &self.source
    }
}

fn normalize(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Resolves trouble codes to descriptions
#[derive(Debug, Default)]
pub struct DtcResolver {
    table: DtcTable,
}

impl DtcResolver {
    pub fn new(table: DtcTable) -> Self {
        Self { table }
    }

    /// Load the protocol's table and wrap it
    pub fn load(protocol: Protocol, db_dir: &Path) -> Result<Self, DatabaseLoadError> {
        DtcTable::load(protocol, db_dir).map(Self::new)
    }

    /// Resolve a code; unknown codes yield the sentinel instead of an error.
    ///
    /// J1939 `SPN<n>-FMI<m>` codes that are not listed verbatim fall back to the
    /// table's `SPN<n>` entry combined with the standard FMI text.
    pub fn resolve(&self, code: &str) -> DtcInfo {
        if let Some(info) = self.table.get(code) {
            return info.clone();
        }

        if let Some((spn, fmi)) = J1939Dtc::parse_code(code) {
            if let Some(base) = self.table.get(&format!("SPN{}", spn)) {
                return DtcInfo {
                    code: code.trim().to_string(),
                    description: format!("{}: {}", base.description, J1939Dtc::fmi_description(fmi)),
                    severity: base.severity.clone(),
                    system: base.system.clone(),
                };
            }
        }

        log::debug!("No description for DTC '{}'", code);
        DtcInfo::unknown(code.trim())
    }

    /// Resolve every code of a sample
    pub fn resolve_all<S: AsRef<str>>(&self, codes: &[S]) -> Vec<DtcInfo> {
        codes.iter().map(|code| self.resolve(code.as_ref())).collect()
    }

    pub fn table(&self) -> &DtcTable {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TABLE: &str = r#"{
        "P0301": { "description": "Cylinder 1 misfire detected", "severity": "high", "system": "engine" },
        "p0420": "Catalyst system efficiency below threshold",
        "SPN190": { "description": "Engine speed", "system": "engine" },
        "SPN110-FMI0": "Engine coolant temperature above normal"
    }"#;

    #[test]
    fn test_resolve_known_codes() {
        let resolver = DtcResolver::new(DtcTable::from_json(TABLE).unwrap());

        let info = resolver.resolve("P0301");
        assert_eq!(info.description, "Cylinder 1 misfire detected");
        assert_eq!(info.severity.as_deref(), Some("high"));

        // Lookup ignores case and surrounding whitespace
        let info = resolver.resolve(" P0420 ");
        assert_eq!(info.description, "Catalyst system efficiency below threshold");
        assert!(!info.is_unknown());
    }

    #[test]
    fn test_unknown_code_is_sentinel() {
        let resolver = DtcResolver::new(DtcTable::from_json(TABLE).unwrap());
        let info = resolver.resolve("U0100");
        assert_eq!(info.description, "Unknown code");
        assert_eq!(info.code, "U0100");
        assert!(info.is_unknown());

        // An empty resolver never fails either
        assert!(DtcResolver::default().resolve("P0000").is_unknown());
    }

    #[test]
    fn test_spn_fallback_with_fmi_text() {
        let resolver = DtcResolver::new(DtcTable::from_json(TABLE).unwrap());

        let exact = resolver.resolve("SPN110-FMI0");
        assert_eq!(exact.description, "Engine coolant temperature above normal");

        let fallback = resolver.resolve("SPN190-FMI2");
        assert_eq!(fallback.description, "Engine speed: Data erratic, intermittent or incorrect");
        assert_eq!(fallback.system.as_deref(), Some("engine"));

        assert!(resolver.resolve("SPN9999-FMI2").is_unknown());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(TABLE.as_bytes()).unwrap();
        file.flush().unwrap();

        let table = DtcTable::from_file(file.path()).unwrap();
        assert_eq!(table.len(), 4);
        assert_eq!(table.source(), file.path());
    }

    #[test]
    fn test_load_errors() {
        let err = DtcTable::load(Protocol::Obd, Path::new("/nonexistent")).unwrap_err();
        assert_eq!(err.reason, LoadFailure::NotFound);

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[1, 2, 3]").unwrap();
        file.flush().unwrap();
        let err = DtcTable::from_file(file.path()).unwrap_err();
        assert_eq!(err.reason, LoadFailure::ParseError);
    }
}
