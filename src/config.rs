//! # Configuration
//!
//! The bridge reads one TOML file at startup. It names the broker, the
//! Bluetooth timing and every plug that should be bridged:
//!
//! ```toml
//! [mqtt]
//! url = "tcp://localhost:1883"
//! root_topic = "home/sem"
//!
//! [bluetooth]
//! reconnect_delay_secs = 10
//!
//! [[sem]]
//! mac = "18:62:E4:11:9A:C1"
//! pin = "0000"
//! name = "plug1"
//! refresh_secs = 60
//! ```
//!
//! Everything is validated once in [`Config::load`]; an invalid file aborts
//! startup. Device configurations are immutable afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::mqtt::mqtt_handler::parse_broker_url;

const LOCAL_CONFIG_FILE: &str = "sem2mqtt.toml";
const CONFIG_DIR: &str = "sem2mqtt";
const CONFIG_FILE: &str = "config.toml";
const MIN_KEEP_ALIVE_SECS: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Could not parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("No config file found, looked at {0:?}")]
    NotFound(Vec<PathBuf>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub bluetooth: BluetoothConfig,
    #[serde(default, rename = "sem")]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct MqttConfig {
    pub url: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_root_topic")]
    pub root_topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

impl MqttConfig {
    /// Username and password, only if both are set
    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some((username.clone(), password.clone())),
            _ => None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct BluetoothConfig {
    /// Discovery window before the first connection attempts
    #[serde(default = "default_scan_secs")]
    pub scan_secs: u64,
    /// Fixed pause between reconnect attempts
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            scan_secs: default_scan_secs(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

impl BluetoothConfig {
    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// One plug. Fields are private so a loaded configuration cannot change.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    mac: String,
    pin: String,
    name: String,
    #[serde(default = "default_refresh_secs")]
    refresh_secs: u64,
}

impl DeviceConfig {
    pub fn new(
        mac: impl Into<String>,
        pin: impl Into<String>,
        name: impl Into<String>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            mac: mac.into(),
            pin: pin.into(),
            name: name.into(),
            refresh_secs: refresh_interval.as_secs(),
        }
    }

    pub fn address(&self) -> &str {
        &self.mac
    }

    pub fn pin(&self) -> &str {
        &self.pin
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mac.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "device '{}' has no address",
                self.name
            )));
        }
        if self.pin.len() != 4 || !self.pin.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::Invalid(format!(
                "pin of device '{}' must be exactly 4 digits",
                self.name
            )));
        }
        if self.name.is_empty() || self.name.contains(['/', '+', '#']) {
            return Err(ConfigError::Invalid(format!(
                "device name '{}' is not usable as topic segment",
                self.name
            )));
        }
        if self.refresh_secs == 0 {
            return Err(ConfigError::Invalid(format!(
                "refresh interval of device '{}' must not be zero",
                self.name
            )));
        }
        Ok(())
    }
}

fn default_client_id() -> String {
    "sem2mqtt".to_string()
}

fn default_root_topic() -> String {
    "home/sem".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_scan_secs() -> u64 {
    10
}

fn default_reconnect_delay() -> u64 {
    10
}

fn default_refresh_secs() -> u64 {
    60
}

impl Config {
    /// Loads the config from `path`, or from the first default location that exists
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::find_default()?,
        };
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading config from {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        debug!("Loaded {} device(s)", config.devices.len());
        Ok(config)
    }

    fn find_default() -> Result<PathBuf, ConfigError> {
        let mut candidates = vec![PathBuf::from(LOCAL_CONFIG_FILE)];
        if let Some(mut dir) = dirs::config_dir() {
            dir.push(CONFIG_DIR);
            dir.push(CONFIG_FILE);
            candidates.push(dir);
        }

        candidates
            .iter()
            .find(|candidate| candidate.is_file())
            .cloned()
            .ok_or(ConfigError::NotFound(candidates))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_broker_url(&self.mqtt.url)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.mqtt.root_topic.is_empty() || self.mqtt.root_topic.contains(['+', '#']) {
            return Err(ConfigError::Invalid(format!(
                "root topic '{}' must be a plain topic",
                self.mqtt.root_topic
            )));
        }
        if self.mqtt.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(ConfigError::Invalid(format!(
                "keep alive must be at least {} seconds",
                MIN_KEEP_ALIVE_SECS
            )));
        }
        if self.bluetooth.reconnect_delay_secs == 0 {
            return Err(ConfigError::Invalid(
                "reconnect delay must not be zero".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !names.insert(device.name()) {
                return Err(ConfigError::Invalid(format!(
                    "device name '{}' is used twice",
                    device.name()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    const FULL: &str = r#"
        [mqtt]
        url = "tcp://broker:1884"
        client_id = "bridge"
        root_topic = "home/plugs"
        username = "user"
        password = "secret"
        keep_alive_secs = 20

        [bluetooth]
        scan_secs = 5
        reconnect_delay_secs = 3

        [[sem]]
        mac = "18:62:E4:11:9A:C1"
        pin = "1234"
        name = "plug1"
        refresh_secs = 30

        [[sem]]
        mac = "18:62:E4:11:9A:C2"
        pin = "0000"
        name = "plug2"
    "#;

    #[test]
    fn loads_full_config() {
        let file = write_config(FULL);
        let config = Config::load(Some(file.path())).unwrap();

        assert_eq!(config.mqtt.client_id, "bridge");
        assert_eq!(config.mqtt.root_topic, "home/plugs");
        assert_eq!(
            config.mqtt.credentials(),
            Some(("user".to_string(), "secret".to_string()))
        );
        assert_eq!(config.bluetooth.reconnect_delay(), Duration::from_secs(3));
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].address(), "18:62:E4:11:9A:C1");
        assert_eq!(config.devices[0].refresh_interval(), Duration::from_secs(30));
        assert_eq!(config.devices[1].refresh_interval(), Duration::from_secs(60));
    }

    #[test]
    fn applies_defaults() {
        let file = write_config("[mqtt]\nurl = \"localhost\"\n");
        let config = Config::load(Some(file.path())).unwrap();

        assert_eq!(config.mqtt.client_id, "sem2mqtt");
        assert_eq!(config.mqtt.root_topic, "home/sem");
        assert_eq!(config.mqtt.keep_alive_secs, 30);
        assert_eq!(config.mqtt.credentials(), None);
        assert_eq!(config.bluetooth, BluetoothConfig::default());
        assert!(config.devices.is_empty());
    }

    #[test]
    fn password_without_username_is_no_credential() {
        let file = write_config("[mqtt]\nurl = \"localhost\"\npassword = \"secret\"\n");
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.mqtt.credentials(), None);
    }

    #[test]
    fn rejects_bad_pin() {
        let file = write_config(
            "[mqtt]\nurl = \"localhost\"\n[[sem]]\nmac = \"aa\"\npin = \"12a4\"\nname = \"plug1\"\n",
        );
        assert!(matches!(
            Config::load(Some(file.path())),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_duplicate_and_wildcard_names() {
        let duplicate = write_config(
            "[mqtt]\nurl = \"localhost\"\n\
             [[sem]]\nmac = \"aa\"\npin = \"1234\"\nname = \"plug\"\n\
             [[sem]]\nmac = \"bb\"\npin = \"1234\"\nname = \"plug\"\n",
        );
        assert!(matches!(
            Config::load(Some(duplicate.path())),
            Err(ConfigError::Invalid(_))
        ));

        let wildcard = write_config(
            "[mqtt]\nurl = \"localhost\"\n[[sem]]\nmac = \"aa\"\npin = \"1234\"\nname = \"plug/+\"\n",
        );
        assert!(matches!(
            Config::load(Some(wildcard.path())),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_zero_refresh_and_bad_url() {
        let zero = write_config(
            "[mqtt]\nurl = \"localhost\"\n[[sem]]\nmac = \"aa\"\npin = \"1234\"\nname = \"plug\"\nrefresh_secs = 0\n",
        );
        assert!(Config::load(Some(zero.path())).is_err());

        let url = write_config("[mqtt]\nurl = \"tcp://broker:port\"\n");
        assert!(Config::load(Some(url.path())).is_err());
    }

    #[test]
    fn reports_parse_and_read_errors() {
        let broken = write_config("[mqtt\nurl = ");
        assert!(matches!(
            Config::load(Some(broken.path())),
            Err(ConfigError::Parse { .. })
        ));

        assert!(matches!(
            Config::load(Some(Path::new("/nonexistent/sem2mqtt.toml"))),
            Err(ConfigError::Read { .. })
        ));
    }
}
