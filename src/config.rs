//! Configuration loading and validation.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration document (see SPEC_FULL.md §6 for the schema).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub mqtt: MqttLogConfig,
    pub wirenboard: WirenboardConfig,
    pub homeassistant: HomeAssistantConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_loglevel")]
    pub loglevel: LogLevel,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            loglevel: default_loglevel(),
        }
    }
}

/// Separate logging knob for the MQTT transport (`rumqttc`), matching the
/// original implementation's independent `mqtt.loglevel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttLogConfig {
    #[serde(default = "default_mqtt_loglevel")]
    pub loglevel: LogLevel,
}

impl Default for MqttLogConfig {
    fn default() -> Self {
        Self {
            loglevel: default_mqtt_loglevel(),
        }
    }
}

fn default_loglevel() -> LogLevel {
    LogLevel::Info
}

fn default_mqtt_loglevel() -> LogLevel {
    LogLevel::Warning
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warning | LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error | LogLevel::Fatal => log::LevelFilter::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirenboardConfig {
    pub broker_host: String,
    pub broker_port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_wb_client_id")]
    pub mqtt_client_id: String,
    #[serde(default = "default_qos")]
    pub subscribe_qos: u8,
    #[serde(default = "default_qos")]
    pub publish_qos: u8,
    #[serde(default)]
    pub publish_retain: bool,
}

fn default_wb_client_id() -> String {
    "wb-bridge-wb".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeAssistantConfig {
    pub broker_host: String,
    pub broker_port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_ha_client_id")]
    pub mqtt_client_id: String,

    #[serde(default = "default_qos")]
    pub subscribe_qos: u8,
    #[serde(default = "default_qos")]
    pub availability_qos: u8,
    #[serde(default = "default_qos")]
    pub config_qos: u8,
    #[serde(default = "default_qos")]
    pub state_qos: u8,

    #[serde(default = "default_true")]
    pub availability_retain: bool,
    #[serde(default = "default_true")]
    pub config_retain: bool,
    #[serde(default = "default_true")]
    pub state_retain: bool,

    #[serde(default = "default_first_publish_delay")]
    pub config_first_publish_delay: u64,
    #[serde(default)]
    pub config_publish_delay: u64,

    #[serde(default)]
    pub ignored_device_ids: Vec<String>,
    #[serde(default)]
    pub ignored_device_control_ids: Vec<String>,
    #[serde(default)]
    pub splitted_device_ids: Vec<String>,
    #[serde(default)]
    pub combined_devices: Vec<CombinedDeviceConfig>,
    #[serde(default = "default_true")]
    pub enable_default_combined_devices: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedDeviceConfig {
    pub device_id: String,
    pub new_device_id: String,
    pub new_name: String,
}

fn default_ha_client_id() -> String {
    "wb-bridge-ha".to_string()
}

fn default_qos() -> u8 {
    1
}

fn default_true() -> bool {
    true
}

fn default_first_publish_delay() -> u64 {
    1
}

/// Converts a validated QoS level (0, 1 or 2) to `rumqttc`'s enum.
pub fn qos_from_u8(value: u8) -> rumqttc::QoS {
    match value {
        0 => rumqttc::QoS::AtMostOnce,
        2 => rumqttc::QoS::ExactlyOnce,
        _ => rumqttc::QoS::AtLeastOnce,
    }
}

impl Config {
    /// Load and validate configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.wirenboard.broker_host.is_empty() {
            bail!("wirenboard.broker_host is required");
        }
        if self.wirenboard.broker_port == 0 {
            bail!("wirenboard.broker_port must be non-zero");
        }
        if self.homeassistant.broker_host.is_empty() {
            bail!("homeassistant.broker_host is required");
        }
        if self.homeassistant.broker_port == 0 {
            bail!("homeassistant.broker_port must be non-zero");
        }
        for qos in [
            self.wirenboard.subscribe_qos,
            self.wirenboard.publish_qos,
            self.homeassistant.subscribe_qos,
            self.homeassistant.availability_qos,
            self.homeassistant.config_qos,
            self.homeassistant.state_qos,
        ] {
            if qos > 2 {
                bail!("QoS values must be 0, 1 or 2, got {qos}");
            }
        }
        for combined in &self.homeassistant.combined_devices {
            if combined.device_id.is_empty() {
                bail!("homeassistant.combined_devices entries require a device_id");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "wirenboard": { "broker_host": "localhost", "broker_port": 1883 },
            "homeassistant": { "broker_host": "localhost", "broker_port": 1883 }
        }"#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: Config = serde_json::from_str(minimal_json()).unwrap();
        assert_eq!(config.wirenboard.subscribe_qos, 1);
        assert_eq!(config.homeassistant.config_first_publish_delay, 1);
        assert!(config.homeassistant.enable_default_combined_devices);
        assert_eq!(config.general.loglevel, LogLevel::Info);
    }

    #[test]
    fn rejects_missing_broker_host() {
        let mut config: Config = serde_json::from_str(minimal_json()).unwrap();
        config.wirenboard.broker_host = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_invalid_qos() {
        let mut config: Config = serde_json::from_str(minimal_json()).unwrap();
        config.homeassistant.config_qos = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_combined_device_without_id() {
        let mut config: Config = serde_json::from_str(minimal_json()).unwrap();
        config.homeassistant.combined_devices.push(CombinedDeviceConfig {
            device_id: String::new(),
            new_device_id: "x".to_string(),
            new_name: "X".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, minimal_json()).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.wirenboard.broker_host, "localhost");
    }
}
