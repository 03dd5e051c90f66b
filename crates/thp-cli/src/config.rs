//! Configuration system for the THP CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thp_core::{ChannelConfig, Credential};

/// THP CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Device link configuration
    #[serde(default)]
    pub device: DeviceConfig,
    /// Host identity configuration
    #[serde(default)]
    pub host: HostConfig,
    /// Channel reliability tunables
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// UDP address of the device (emulator)
    #[serde(default = "default_device_addr")]
    pub addr: String,
}

/// Host identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Host name shown on the device during pairing
    #[serde(default = "default_host_name")]
    pub host_name: String,
    /// Application name shown on the device during pairing
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Credential store path
    #[serde(default = "default_credential_file")]
    pub credential_file: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_device_addr() -> String {
    thp_transport::DEFAULT_EMULATOR_ADDR.to_string()
}

fn default_host_name() -> String {
    "localhost".to_string()
}

fn default_app_name() -> String {
    "thp".to_string()
}

fn default_credential_file() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("thp/credentials.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            addr: default_device_addr(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_name: default_host_name(),
            app_name: default_app_name(),
            credential_file: default_credential_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("thp/config.toml")
    }

    /// Load config from `path`, falling back to defaults when the default
    /// path does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed, or an
    /// explicitly given file is missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else if path == Self::default_path() {
            Ok(Self::default())
        } else {
            anyhow::bail!("Config file not found: {}", path.display())
        }
    }

    /// Parse device address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn device_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.device.addr.parse()?)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.device_addr()?;

        if self.host.host_name.is_empty() {
            anyhow::bail!("Host name must not be empty");
        }

        self.channel
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid channel config: {e}"))?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}

/// Load stored credentials. A missing store holds no credentials.
///
/// # Errors
///
/// Returns an error if the store exists but cannot be read or parsed.
pub fn load_credentials(path: &Path) -> anyhow::Result<Vec<Credential>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Append `credential` to the store at `path`.
///
/// # Errors
///
/// Returns an error if the store cannot be read or written.
pub fn store_credential(path: &Path, credential: Credential) -> anyhow::Result<()> {
    let mut credentials = load_credentials(path)?;
    credentials.push(credential);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(&credentials)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.device.addr, "127.0.0.1:21324");
        assert_eq!(config.host.app_name, "thp");
        assert_eq!(config.channel, ChannelConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.device.addr = "not an address".to_string();
        assert!(config.validate().is_err());

        config.device.addr = default_device_addr();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "DEBUG".to_string();
        config.channel.ack_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_serialization() {
        let mut config = Config::default();
        config.channel.response_timeout = Some(Duration::from_secs(30));
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.device.addr, deserialized.device.addr);
        assert_eq!(config.channel, deserialized.channel);
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [device]
            addr = "127.0.0.1:30000"

            [channel]
            ack_timeout = 0.25
            "#,
        )
        .unwrap();
        assert_eq!(config.device.addr, "127.0.0.1:30000");
        assert_eq!(config.channel.ack_timeout, Duration::from_millis(250));
        assert_eq!(config.channel.busy_retries, 20);
        assert_eq!(config.host.host_name, "localhost");
    }

    #[test]
    fn test_load_or_default_missing_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load_or_default(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.host.host_name = "workstation".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load_or_default(&path).unwrap();
        assert_eq!(loaded.host.host_name, "workstation");
    }

    #[test]
    fn test_credential_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        assert!(load_credentials(&path).unwrap().is_empty());

        store_credential(&path, Credential::new(vec![1; 32], [2; 32], vec![3; 8])).unwrap();
        store_credential(&path, Credential::new(vec![4; 32], [5; 32], vec![6; 8])).unwrap();

        let credentials = load_credentials(&path).unwrap();
        assert_eq!(credentials.len(), 2);
        assert_eq!(credentials[1].credential, vec![6; 8]);
    }
}
