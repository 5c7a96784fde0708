//! Monitoring configuration types
//!
//! This module defines the configuration surface of a monitoring session:
//! protocol selection, bus interface selection, poll interval and storage
//! locations. Everything is serde-friendly so the application layer can load
//! it from a file and override individual fields.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Supported bus protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// SAE J1939 heavy-duty vehicle network
    #[default]
    J1939,
    /// OBD-II (ISO 15765-4) passenger vehicle diagnostics
    Obd,
}

impl Protocol {
    /// All supported protocols
    pub const ALL: [Protocol; 2] = [Protocol::J1939, Protocol::Obd];

    /// Short lowercase name, used for artifact file names
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::J1939 => "j1939",
            Protocol::Obd => "obd",
        }
    }

    /// Nominal bus bitrate in bit/s
    pub fn bitrate(&self) -> u32 {
        match self {
            Protocol::J1939 => 250_000,
            Protocol::Obd => 500_000,
        }
    }

    /// Path of the signal database artifact inside `db_dir`
    pub fn database_path(&self, db_dir: &Path) -> PathBuf {
        db_dir.join(format!("{}.dbc", self.name()))
    }

    /// Path of the DTC table artifact inside `db_dir`
    pub fn dtc_table_path(&self, db_dir: &Path) -> PathBuf {
        db_dir.join(format!("{}_codes.json", self.name()))
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "j1939" => Ok(Protocol::J1939),
            "obd" | "obd2" | "obd-ii" => Ok(Protocol::Obd),
            other => Err(format!("unsupported protocol '{}' (expected j1939 or obd)", other)),
        }
    }
}

/// Which frame source a session reads from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InterfaceConfig {
    /// Real SocketCAN network device (e.g. `can0`)
    SocketCan {
        #[serde(default = "default_channel")]
        channel: String,
    },
    /// Simulated bus running the built-in demo generator
    Virtual {
        /// Emission period of the generator in milliseconds (0 = as fast as polled)
        #[serde(default = "default_virtual_period")]
        period_ms: u64,
    },
    /// Replay of a candump log file
    Replay {
        path: PathBuf,
        /// Restart from the beginning when the file is exhausted
        #[serde(default)]
        looped: bool,
    },
}

impl InterfaceConfig {
    /// SocketCAN interface on the given channel
    pub fn socketcan(channel: impl Into<String>) -> Self {
        InterfaceConfig::SocketCan {
            channel: channel.into(),
        }
    }

    /// Simulated interface emitting one demo frame per period
    pub fn simulated(period: Duration) -> Self {
        InterfaceConfig::Virtual {
            period_ms: period.as_millis() as u64,
        }
    }

    /// Replay interface reading a candump log
    pub fn replay(path: impl Into<PathBuf>) -> Self {
        InterfaceConfig::Replay {
            path: path.into(),
            looped: false,
        }
    }

    /// Human-readable name of the underlying connection
    pub fn describe(&self) -> String {
        match self {
            InterfaceConfig::SocketCan { channel } => format!("socketcan:{}", channel),
            InterfaceConfig::Virtual { .. } => "virtual".to_string(),
            InterfaceConfig::Replay { path, .. } => format!("replay:{}", path.display()),
        }
    }
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        InterfaceConfig::SocketCan {
            channel: default_channel(),
        }
    }
}

/// Configuration for one monitoring session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Protocol selecting the signal database and DTC table
    #[serde(default)]
    pub protocol: Protocol,

    /// Frame source
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Poll interval of the worker in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Directory holding `<protocol>.dbc` and `<protocol>_codes.json`
    #[serde(default = "default_db_dir")]
    pub db_dir: PathBuf,

    /// Directory receiving the daily CSV units
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// File name prefix of the daily CSV units
    #[serde(default = "default_log_prefix")]
    pub log_prefix: String,

    /// Optional: delete units older than this many days
    #[serde(default)]
    pub retention_days: Option<u32>,

    /// Capacity of each subscriber channel
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,

    /// Optional: only decode these CAN identifiers
    #[serde(default)]
    pub message_filter: Option<Vec<u32>>,

    /// Also write rows for frames the database does not describe
    #[serde(default)]
    pub log_unknown_frames: bool,
}

fn default_channel() -> String {
    "can0".to_string()
}

fn default_virtual_period() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    100
}

fn default_db_dir() -> PathBuf {
    PathBuf::from("db")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_prefix() -> String {
    "telemetry".to_string()
}

fn default_subscriber_capacity() -> usize {
    256
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            interface: InterfaceConfig::default(),
            poll_interval_ms: default_poll_interval(),
            db_dir: default_db_dir(),
            log_dir: default_log_dir(),
            log_prefix: default_log_prefix(),
            retention_days: None,
            subscriber_capacity: default_subscriber_capacity(),
            message_filter: None,
            log_unknown_frames: false,
        }
    }
}

impl MonitorConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: select the protocol
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Builder method: select the frame source
    pub fn with_interface(mut self, interface: InterfaceConfig) -> Self {
        self.interface = interface;
        self
    }

    /// Builder method: set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Builder method: set the database directory
    pub fn with_db_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.db_dir = dir.into();
        self
    }

    /// Builder method: set the log directory
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Builder method: set the log file prefix
    pub fn with_log_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.log_prefix = prefix.into();
        self
    }

    /// Builder method: enable retention cleanup
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = Some(days);
        self
    }

    /// Builder method: set subscriber channel capacity
    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }

    /// Builder method: set message filter
    pub fn with_message_filter(mut self, messages: Vec<u32>) -> Self {
        self.message_filter = Some(messages);
        self
    }

    /// Builder method: log frames with unknown identifiers
    pub fn with_unknown_frames_logged(mut self, enabled: bool) -> Self {
        self.log_unknown_frames = enabled;
        self
    }

    /// Poll interval as a `Duration` (never zero)
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Check if a message ID should be processed
    pub fn should_process_message(&self, can_id: u32) -> bool {
        match &self.message_filter {
            Some(messages) => messages.contains(&can_id),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_config_builder() {
        let config = MonitorConfig::new()
            .with_protocol(Protocol::Obd)
            .with_interface(InterfaceConfig::socketcan("vcan0"))
            .with_poll_interval(Duration::from_millis(50))
            .with_log_dir("/tmp/telemetry")
            .with_retention_days(7);

        assert_eq!(config.protocol, Protocol::Obd);
        assert_eq!(config.interface.describe(), "socketcan:vcan0");
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.retention_days, Some(7));
    }

    #[test]
    fn test_protocol_artifacts() {
        let dir = Path::new("db");
        assert_eq!(Protocol::J1939.database_path(dir), PathBuf::from("db/j1939.dbc"));
        assert_eq!(Protocol::Obd.dtc_table_path(dir), PathBuf::from("db/obd_codes.json"));
        assert_eq!(Protocol::J1939.bitrate(), 250_000);
        assert_eq!(Protocol::Obd.bitrate(), 500_000);
        assert_eq!("OBD".parse::<Protocol>(), Ok(Protocol::Obd));
        assert!("canopen".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_filter_logic() {
        let config = MonitorConfig::new().with_message_filter(vec![0x0C1, 0x0C2]);
        assert!(config.should_process_message(0x0C1));
        assert!(!config.should_process_message(0x0C3));
        assert!(MonitorConfig::new().should_process_message(0xFFFF));
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let mut config = MonitorConfig::new();
        config.poll_interval_ms = 0;
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_interface_deserialization() {
        let json = r#"{ "kind": "virtual", "period_ms": 5 }"#;
        let iface: InterfaceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(iface, InterfaceConfig::Virtual { period_ms: 5 });

        let json = r#"{ "kind": "socketcan" }"#;
        let iface: InterfaceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(iface, InterfaceConfig::socketcan("can0"));
    }
}
