//! Configuration loading and parsing

use anyhow::{bail, Context, Result};
use can_telemetry::{InterfaceConfig, MonitorConfig, Protocol};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,
    /// Print decoded samples as they arrive
    #[serde(default = "default_true")]
    pub print_samples: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Command line overrides applied on top of the file configuration
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub protocol: Option<Protocol>,
    pub interface: Option<InterfaceConfig>,
    pub db_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub poll_interval_ms: Option<u64>,
    pub json: bool,
}

impl AppConfig {
    /// Apply command line overrides
    pub fn apply(&mut self, overrides: &Overrides) {
        let monitor = &mut self.monitor;
        if let Some(protocol) = overrides.protocol {
            monitor.protocol = protocol;
        }
        if let Some(interface) = &overrides.interface {
            monitor.interface = interface.clone();
        }
        if let Some(dir) = &overrides.db_dir {
            monitor.db_dir = dir.clone();
        }
        if let Some(dir) = &overrides.log_dir {
            monitor.log_dir = dir.clone();
        }
        if let Some(ms) = overrides.poll_interval_ms {
            monitor.poll_interval_ms = ms;
        }
        if overrides.json {
            self.output.format = OutputFormat::Json;
        }
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    Ok(config)
}

/// Parse an interface argument:
/// `socketcan:<channel>`, `<channel>`, `virtual[:<period_ms>]`, `replay:<file>`
/// or `replay-loop:<file>`
pub fn parse_interface(text: &str) -> Result<InterfaceConfig> {
    let (kind, rest) = match text.split_once(':') {
        Some((kind, rest)) => (kind, Some(rest)),
        None => (text, None),
    };

    let interface = match (kind, rest) {
        ("virtual", None) => InterfaceConfig::simulated(Duration::from_millis(10)),
        ("virtual", Some(ms)) => {
            let ms: u64 = ms
                .parse()
                .with_context(|| format!("Invalid virtual period: {:?}", ms))?;
            InterfaceConfig::simulated(Duration::from_millis(ms))
        }
        ("socketcan", Some(channel)) if !channel.is_empty() => InterfaceConfig::socketcan(channel),
        ("replay", Some(path)) if !path.is_empty() => InterfaceConfig::replay(path),
        ("replay-loop", Some(path)) if !path.is_empty() => InterfaceConfig::Replay {
            path: PathBuf::from(path),
            looped: true,
        },
        (channel, None) if !channel.is_empty() => InterfaceConfig::socketcan(channel),
        _ => bail!("Invalid interface: {:?}", text),
    };
    Ok(interface)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_deserialization() {
        let toml_content = r#"
            [monitor]
            protocol = "obd"
            poll_interval_ms = 50
            log_dir = "/var/log/telemetry"
            retention_days = 30

            [monitor.interface]
            kind = "socketcan"
            channel = "vcan0"

            [output]
            format = "json"
        "#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.monitor.protocol, Protocol::Obd);
        assert_eq!(config.monitor.interface, InterfaceConfig::socketcan("vcan0"));
        assert_eq!(config.monitor.poll_interval_ms, 50);
        assert_eq!(config.monitor.retention_days, Some(30));
        assert_eq!(config.output.format, OutputFormat::Json);
        assert!(config.output.print_samples);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.monitor.protocol, Protocol::J1939);
        assert_eq!(config.monitor.poll_interval_ms, 100);
        assert_eq!(config.output.format, OutputFormat::Text);
    }

    #[test]
    fn test_load_config_errors() {
        assert!(load_config(Path::new("/nonexistent/config.toml")).is_err());

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[monitor\nprotocol = ").unwrap();
        file.flush().unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_overrides() {
        let mut config = AppConfig::default();
        config.apply(&Overrides {
            protocol: Some(Protocol::Obd),
            interface: Some(InterfaceConfig::simulated(Duration::from_millis(5))),
            poll_interval_ms: Some(20),
            json: true,
            ..Overrides::default()
        });

        assert_eq!(config.monitor.protocol, Protocol::Obd);
        assert_eq!(config.monitor.interface, InterfaceConfig::Virtual { period_ms: 5 });
        assert_eq!(config.monitor.poll_interval_ms, 20);
        assert_eq!(config.output.format, OutputFormat::Json);
    }

    #[test]
    fn test_parse_interface() {
        assert_eq!(parse_interface("can1").unwrap(), InterfaceConfig::socketcan("can1"));
        assert_eq!(parse_interface("socketcan:vcan0").unwrap(), InterfaceConfig::socketcan("vcan0"));
        assert_eq!(parse_interface("virtual").unwrap(), InterfaceConfig::Virtual { period_ms: 10 });
        assert_eq!(parse_interface("virtual:25").unwrap(), InterfaceConfig::Virtual { period_ms: 25 });
        assert_eq!(
            parse_interface("replay:trace.log").unwrap(),
            InterfaceConfig::Replay {
                path: PathBuf::from("trace.log"),
                looped: false
            }
        );
        assert!(parse_interface("virtual:fast").is_err());
        assert!(parse_interface("replay:").is_err());
        assert!(parse_interface("").is_err());
    }
}
