//! Day-partitioned telemetry log
//!
//! Decoded samples are appended as CSV rows to one unit per UTC calendar day,
//! `<prefix>_<YYYY-MM-DD>.csv`. The first write to a unit emits a header row of
//! the record's field names; later writes never repeat it, including after a
//! restart (the header is read back from disk). Records are never rewritten.
//!
//! `append` takes `&self` and may be called from any number of threads. Each row
//! is formatted before the lock is taken and written with a single `write_all`
//! while it is held, so rows never interleave.

use crate::types::{DecodedSample, LogError, Timestamp};
use chrono::{NaiveDate, SecondsFormat, Utc};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Field names of records built from decoded samples
pub const SAMPLE_FIELDS: [&str; 5] = ["timestamp", "id", "message", "signals", "dtc_codes"];

/// On-disk form of one decoded sample: ordered `(field, value)` pairs
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    timestamp: Timestamp,
    fields: Vec<(String, String)>,
}

impl LogRecord {
    /// Empty record partitioned by `timestamp`
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            fields: Vec::new(),
        }
    }

    /// Builder method: append a field; insertion order is column order
    pub fn with_field(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.fields.push((name.into(), value.to_string()));
        self
    }

    /// Standard record of a decoded sample
    pub fn from_sample(sample: &DecodedSample) -> Self {
        let id = if sample.can_id > 0x7FF {
            format!("0x{:08X}", sample.can_id)
        } else {
            format!("0x{:03X}", sample.can_id)
        };
        let signals = sample
            .signals
            .iter()
            .map(|s| match &s.unit {
                Some(unit) => format!("{}={} {}", s.name, s.value, unit),
                None => format!("{}={}", s.name, s.value),
            })
            .collect::<Vec<_>>()
            .join(";");

        let [ts, id_field, message, signals_field, dtc_field] = SAMPLE_FIELDS;
        Self::new(sample.timestamp)
            .with_field(ts, sample.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true))
            .with_field(id_field, id)
            .with_field(message, sample.message_name.as_deref().unwrap_or(""))
            .with_field(signals_field, signals)
            .with_field(dtc_field, sample.dtc_codes.join(";"))
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// UTC day the record belongs to
    pub fn day(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }

    fn header_line(&self) -> String {
        csv_line(self.fields.iter().map(|(name, _)| name.as_str()))
    }

    fn data_line(&self) -> String {
        csv_line(self.fields.iter().map(|(_, value)| value.as_str()))
    }
}

/// Join fields into one CSV row terminated by `\n`
fn csv_line<'a>(fields: impl Iterator<Item = &'a str>) -> String {
    let mut line = fields.map(escape_field).collect::<Vec<_>>().join(",");
    line.push('\n');
    line
}

fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Split a header row back into field names
fn parse_header(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.trim_end_matches(['\r', '\n']).chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// The unit currently open for appending
struct OpenUnit {
    day: NaiveDate,
    path: PathBuf,
    file: File,
    /// Field names of the unit's header row, `None` until written
    header: Option<Vec<String>>,
    /// The file ends in an unterminated row left by a failed write
    torn: bool,
}

/// Append-only, day-partitioned CSV logger
pub struct TelemetryLogger {
    dir: PathBuf,
    prefix: String,
    retention_days: Option<u32>,
    current: Mutex<Option<OpenUnit>>,
}

impl TelemetryLogger {
    /// Create a logger writing into `dir`, creating it if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, LogError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| LogError::IoFailure {
            path: dir.clone(),
            source,
        })?;

        Ok(Self {
            dir,
            prefix: "telemetry".to_string(),
            retention_days: None,
            current: Mutex::new(None),
        })
    }

    /// Builder method: set the unit file prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Builder method: delete units older than `days` on rotation
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = Some(days);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the unit for a given day
    pub fn unit_path(&self, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}_{}.csv", self.prefix, day.format("%Y-%m-%d")))
    }

    /// Path of the unit currently open, if any
    pub fn current_unit(&self) -> Option<PathBuf> {
        self.current.lock().as_ref().map(|unit| unit.path.clone())
    }

    /// Append a decoded sample
    pub fn append_sample(&self, sample: &DecodedSample) -> Result<(), LogError> {
        self.append(&LogRecord::from_sample(sample))
    }

    /// Append one record to its day's unit.
    ///
    /// Storage errors are returned as-is; the logger does not retry.
    pub fn append(&self, record: &LogRecord) -> Result<(), LogError> {
        let day = record.day();
        let names = record.field_names();
        let header_line = record.header_line();
        let data_line = record.data_line();

        let mut current = self.current.lock();
        let unit = match current.take() {
            Some(unit) if unit.day == day => current.insert(unit),
            previous => {
                if let Some(previous) = previous {
                    log::info!("Rotating telemetry log: {:?} -> {}", previous.path, day);
                }
                let unit = self.open_unit(day)?;
                self.enforce_retention(&unit.path);
                current.insert(unit)
            }
        };

        let mut buffer = String::with_capacity(header_line.len() + data_line.len() + 1);
        if unit.torn {
            buffer.push('\n');
        }
        match &unit.header {
            Some(expected) if *expected != names => {
                return Err(LogError::SchemaMismatch {
                    path: unit.path.clone(),
                    expected: expected.clone(),
                    found: names,
                });
            }
            Some(_) => {}
            None => buffer.push_str(&header_line),
        }
        buffer.push_str(&data_line);

        if let Err(source) = unit.file.write_all(buffer.as_bytes()).and_then(|_| unit.file.flush()) {
            let path = unit.path.clone();
            // Part of the row may have reached the file; reopen to re-read its state
            *current = None;
            return Err(LogError::IoFailure { path, source });
        }

        unit.torn = false;
        if unit.header.is_none() {
            log::debug!("Started telemetry unit {:?}", unit.path);
            unit.header = Some(names);
        }
        Ok(())
    }

    /// Flush the open unit to stable storage
    pub fn sync(&self) -> Result<(), LogError> {
        if let Some(unit) = self.current.lock().as_ref() {
            unit.file.sync_data().map_err(|source| LogError::IoFailure {
                path: unit.path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn open_unit(&self, day: NaiveDate) -> Result<OpenUnit, LogError> {
        let path = self.unit_path(day);
        let io_err = |source| LogError::IoFailure {
            path: path.clone(),
            source,
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;

        let (header, torn) = if file.metadata().map_err(io_err)?.len() == 0 {
            (None, false)
        } else {
            let mut reader = File::open(&path).map_err(io_err)?;
            let mut last = [0u8; 1];
            reader
                .seek(SeekFrom::End(-1))
                .and_then(|_| reader.read_exact(&mut last))
                .map_err(io_err)?;

            let mut first = String::new();
            reader.rewind().map_err(io_err)?;
            BufReader::new(reader).read_line(&mut first).map_err(io_err)?;
            (Some(parse_header(&first)), last[0] != b'\n')
        };
        if torn {
            log::warn!("Telemetry unit {:?} ends in an incomplete row", path);
        }

        Ok(OpenUnit {
            day,
            path,
            file,
            header,
            torn,
        })
    }

    /// Remove units older than the retention window, never the unit in use.
    /// Failures are only logged.
    fn enforce_retention(&self, in_use: &Path) {
        let Some(days) = self.retention_days else {
            return;
        };
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(days as i64);

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Failed to scan {:?} for old telemetry: {}", self.dir, e);
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path == in_use {
                continue;
            }
            let Some(day) = self.unit_day(&path) else {
                continue;
            };
            if day < cutoff {
                match fs::remove_file(&path) {
                    Ok(()) => log::info!("Removed expired telemetry unit {:?}", path),
                    Err(e) => log::warn!("Failed to remove old telemetry unit {:?}: {}", path, e),
                }
            }
        }
    }

    /// Day encoded in a unit file name of this logger
    fn unit_day(&self, path: &Path) -> Option<NaiveDate> {
        let name = path.file_name()?.to_str()?;
        let date = name
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('_')?
            .strip_suffix(".csv")?;
        NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
    }
}
