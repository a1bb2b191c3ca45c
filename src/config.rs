use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

use crate::pins::A_CHAN_COUNT;

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DeviceInfo {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub identifiers: Vec<String>,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            name: "arduino_bridge".to_string(),
            manufacturer: "Generic".to_string(),
            model: "IOBoard01".to_string(),
            identifiers: vec!["ioboard01-bridge".to_string()],
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub base_topic: String,
    pub discovery_prefix: String,
    pub retain_discovery: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            base_topic: "home/arduino_bridge".to_string(),
            discovery_prefix: "homeassistant".to_string(),
            retain_discovery: true,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SerialPorts {
    pub arduino_port: String,
    pub arduino_baud: u32,
    pub watchdog_port: String,
    pub watchdog_baud: u32,
}

impl Default for SerialPorts {
    fn default() -> Self {
        Self {
            arduino_port: "/dev/ttyACM1".to_string(),
            arduino_baud: 57600,
            watchdog_port: "/dev/ttyACM0".to_string(),
            watchdog_baud: 9600,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Polling {
    pub digital_hz: u32,
    pub analog_interval_ms: u64,
    pub analog_threshold: u16,
}

impl Default for Polling {
    fn default() -> Self {
        Self {
            digital_hz: 50,
            analog_interval_ms: 1000,
            analog_threshold: 5,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Inputs {
    pub analog_enabled: Vec<bool>,
}

impl Default for Inputs {
    fn default() -> Self {
        Self {
            analog_enabled: vec![true; A_CHAN_COUNT],
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Paths {
    pub state_path: PathBuf,
    pub failsafe_path: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("/data/state.json"),
            failsafe_path: PathBuf::from("/data/failsafe.json"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceInfo,
    pub mqtt: MqttConfig,
    pub serial: SerialPorts,
    pub polling: Polling,
    pub inputs: Inputs,
    pub paths: Paths,
}

impl AppConfig {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::home_dir()
            .context("No home directory")?
            .join(".arduino_bridge");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Loads the config at `path`. If missing, writes out the default and
    /// returns it (defaulting and write-back, matching the bridge this was
    /// modeled on).
    pub fn load(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            let default = Self::default();
            default.save(path)?;
            return Ok(default);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let cfg: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        Ok(cfg)
    }

    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("failed to write config at {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.mqtt.host, "localhost");
        assert_eq!(config.serial.arduino_baud, 57600);
        assert_eq!(config.polling.digital_hz, 50);
        assert_eq!(config.inputs.analog_enabled.len(), A_CHAN_COUNT);
    }

    #[test]
    fn test_config_round_trip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let deserialized: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.mqtt.host, deserialized.mqtt.host);
        assert_eq!(
            config.inputs.analog_enabled,
            deserialized.inputs.analog_enabled
        );
    }

    #[test]
    fn test_load_writes_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        assert!(!path.exists());

        let loaded = AppConfig::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(loaded.mqtt.host, "localhost");
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[mqtt]\nhost = \"broker.local\"\n").unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.mqtt.host, "broker.local");
        assert_eq!(loaded.mqtt.port, 1883);
        assert_eq!(loaded.serial.arduino_baud, 57600);
    }
}
