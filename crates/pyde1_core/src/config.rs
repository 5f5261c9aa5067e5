//! Typed configuration record with defaults, loaded from the YAML surface
//! by explicit field extraction. Unknown keys are warned, not errored, per
//! the dynamic-configuration design note.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PyDe1Error, PyDe1Result, ValidationError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    pub scan_time: u64,
    pub connect_timeout: u64,
    pub disconnect_timeout: u64,
    pub reconnect_retry_count: u32,
    pub reconnect_gap: u64,
    pub id_file_directory: String,
    pub id_file_suffix: String,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        BluetoothConfig {
            scan_time: 5,
            connect_timeout: 10,
            disconnect_timeout: 5,
            reconnect_retry_count: 10,
            reconnect_gap: 5,
            id_file_directory: "/var/lib/pyde1".to_string(),
            id_file_suffix: "btid".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub filename: String,
    pub backup_timeout: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            filename: "/var/lib/pyde1/pyde1.sqlite3".to_string(),
            backup_timeout: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct De1Config {
    pub line_frequency: u32,
    pub default_auto_off_time: u64,
    pub stop_at_weight_adjust: f64,
    pub max_wait_for_ready_events: u64,
    pub sequence_watchdog_timeout: u64,
}

impl Default for De1Config {
    fn default() -> Self {
        De1Config {
            line_frequency: 60,
            default_auto_off_time: 300,
            stop_at_weight_adjust: -0.07,
            max_wait_for_ready_events: 3,
            sequence_watchdog_timeout: 270,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub server_host: String,
    pub server_port: u16,
    pub patch_size_limit: usize,
    pub async_timeout: u64,
    pub profile_timeout: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            server_host: "0.0.0.0".to_string(),
            server_port: 1234,
            patch_size_limit: 8192,
            async_timeout: 30,
            profile_timeout: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            directory: "/var/log/pyde1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub topic_root: String,
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        MqttConfig {
            enabled: true,
            host: "localhost".to_string(),
            port: 1883,
            topic_root: "pyde1".to_string(),
            client_id: "pyde1".to_string(),
        }
    }
}

/// Top-level configuration record, matching the YAML surface's recognised
/// sections (`bluetooth`, `database`, `de1`, `http`, `logging`, `mqtt`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PyDe1Config {
    pub bluetooth: BluetoothConfig,
    pub database: DatabaseConfig,
    pub de1: De1Config,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
    pub mqtt: MqttConfig,
}

const KNOWN_SECTIONS: &[&str] = &["bluetooth", "database", "de1", "http", "logging", "mqtt"];

impl PyDe1Config {
    /// Parses `text` as YAML, warning (not failing) on unrecognised
    /// top-level sections or keys within a recognised section.
    pub fn from_yaml_str(text: &str) -> PyDe1Result<PyDe1Config> {
        let raw: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| {
            PyDe1Error::Validation(ValidationError::ValueError(
                "config".to_string(),
                e.to_string(),
            ))
        })?;
        warn_unknown_top_level(&raw);
        let config: PyDe1Config = serde_yaml::from_value(raw).map_err(|e| {
            PyDe1Error::Validation(ValidationError::TypeError(
                "config".to_string(),
                e.to_string(),
            ))
        })?;
        Ok(config)
    }

    pub fn load(path: &Path) -> PyDe1Result<PyDe1Config> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PyDe1Error::Validation(ValidationError::ValueError(
                path.display().to_string(),
                e.to_string(),
            ))
        })?;
        Self::from_yaml_str(&text)
    }
}

fn warn_unknown_top_level(raw: &serde_yaml::Value) {
    let Some(mapping) = raw.as_mapping() else {
        return;
    };
    for key in mapping.keys() {
        let Some(key) = key.as_str() else { continue };
        if !KNOWN_SECTIONS.contains(&key) {
            warn!(section = key, "ignoring unrecognised configuration section");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PyDe1Config::default();
        assert_eq!(config.de1.sequence_watchdog_timeout, 270);
        assert_eq!(config.de1.stop_at_weight_adjust, -0.07);
        assert_eq!(config.http.server_port, 1234);
    }

    #[test]
    fn partial_yaml_fills_remaining_defaults() {
        let yaml = "de1:\n  sequence_watchdog_timeout: 120\n";
        let config = PyDe1Config::from_yaml_str(yaml).expect("parse");
        assert_eq!(config.de1.sequence_watchdog_timeout, 120);
        assert_eq!(config.bluetooth.scan_time, 5);
    }

    #[test]
    fn unknown_section_does_not_error() {
        let yaml = "visualizer:\n  upload: true\nde1:\n  line_frequency: 50\n";
        let config = PyDe1Config::from_yaml_str(yaml).expect("unknown sections are warned, not rejected");
        assert_eq!(config.de1.line_frequency, 50);
    }
}
