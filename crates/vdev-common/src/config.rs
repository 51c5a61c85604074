//! ---
//! vdev_section: "01-core-functionality"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Shared configuration and runtime setup."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::logging::LogFormat;
pub use vdev_security::CipherScheme;

fn default_attribute_types() -> Value {
    Value::Null
}

fn default_keep_alive() -> u16 {
    60
}

fn default_port() -> u16 {
    1883
}

/// Device description file.
///
/// `attributeTypes` is kept as raw JSON; the attribute schema compiler owns its
/// validation so that every structural problem gets a precise message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(rename = "attributeTypes", default = "default_attribute_types")]
    pub attribute_types: Value,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub enc_key: Option<String>,
    #[serde(default)]
    pub enc_enable: bool,
    #[serde(default)]
    pub enc_scheme: CipherScheme,
}

impl DeviceConfig {
    pub const ENV_PATH: &'static str = "VDEV_DEVICE_CONFIG";
    pub const DEFAULT_PATH: &'static str = "device.json";

    /// Load from `path`, unless `VDEV_DEVICE_CONFIG` points elsewhere.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = resolve_path(Self::ENV_PATH, path, Self::DEFAULT_PATH);
        read_json(&path)
    }
}

/// Broker endpoint section of the platform file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u16,
    #[serde(default)]
    pub client_id: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: default_port(),
            user: None,
            pass: None,
            keep_alive_secs: default_keep_alive(),
            client_id: None,
        }
    }
}

/// Platform description file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub mqtt: MqttConfig,
}

impl PlatformConfig {
    pub const ENV_PATH: &'static str = "VDEV_PLATFORM_CONFIG";
    pub const DEFAULT_PATH: &'static str = "plat.json";

    /// Load from `path`, unless `VDEV_PLATFORM_CONFIG` points elsewhere.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = resolve_path(Self::ENV_PATH, path, Self::DEFAULT_PATH);
        let config: Self = read_json(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mqtt.host.trim().is_empty() {
            return Err(anyhow!("mqtt.host must not be empty"));
        }
        if self.mqtt.port == 0 {
            return Err(anyhow!("mqtt.port must be non-zero"));
        }
        Ok(())
    }
}

/// Effective identity and encryption settings after command-line overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSettings {
    pub device_id: String,
    pub enc_key: String,
    pub enc_enable: bool,
    pub enc_scheme: CipherScheme,
}

impl DeviceSettings {
    /// Overrides win over file values. Encryption is only enabled by the file.
    pub fn resolve(
        config: &DeviceConfig,
        device_id: Option<String>,
        enc_key: Option<String>,
    ) -> Result<Self> {
        let device_id = device_id
            .or_else(|| config.device_id.clone())
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| anyhow!("device_id is neither configured nor overridden"))?;
        let enc_key = enc_key
            .or_else(|| config.enc_key.clone())
            .unwrap_or_default();
        if config.enc_enable && enc_key.is_empty() {
            return Err(anyhow!("enc_enable is set but no enc_key is available"));
        }
        Ok(Self {
            device_id,
            enc_key,
            enc_enable: config.enc_enable,
            enc_scheme: config.enc_scheme,
        })
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

fn resolve_path(env_var: &str, explicit: Option<&Path>, fallback: &str) -> PathBuf {
    if let Ok(env_path) = std::env::var(env_var) {
        if !env_path.trim().is_empty() {
            return PathBuf::from(env_path);
        }
    }
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(fallback))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    debug!(config_path = %path.display(), "loading configuration");
    let contents = fs::read_to_string(path)
        .with_context(|| format!("unable to read config file {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn device_config_parses_documented_shape() {
        let file = write_temp(
            r#"{
                "attributeTypes": [
                    {"name": "f_bool", "type": "Boolean"},
                    {"name": "f_enum", "type": ["low", "high"]}
                ],
                "device_id": "dev-1",
                "enc_key": "secret",
                "enc_enable": true
            }"#,
        );
        let config = DeviceConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.device_id.as_deref(), Some("dev-1"));
        assert!(config.enc_enable);
        assert_eq!(config.enc_scheme, CipherScheme::DesEcb);
        assert_eq!(config.attribute_types.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn missing_attribute_types_is_left_to_schema_validation() {
        let file = write_temp(r#"{"device_id": "dev-1"}"#);
        let config = DeviceConfig::load(Some(file.path())).unwrap();
        assert!(config.attribute_types.is_null());
    }

    #[test]
    fn platform_config_accepts_null_credentials() {
        let file = write_temp(
            r#"{"mqtt": {"host": "broker.local", "port": 1883, "user": null, "pass": null}}"#,
        );
        let config = PlatformConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.keep_alive_secs, 60);
        assert!(config.mqtt.user.is_none());
    }

    #[test]
    fn platform_config_rejects_empty_host() {
        let file = write_temp(r#"{"mqtt": {"host": " ", "port": 1883}}"#);
        let err = PlatformConfig::load(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("mqtt.host"));
    }

    #[test]
    fn unreadable_file_reports_path() {
        let err = DeviceConfig::load(Some(Path::new("/nonexistent/vdev/device.json")))
            .unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/vdev/device.json"));
    }

    #[test]
    fn settings_prefer_overrides() {
        let config = DeviceConfig {
            attribute_types: Value::Null,
            device_id: Some("from-file".into()),
            enc_key: Some("file-key".into()),
            enc_enable: true,
            enc_scheme: CipherScheme::AesCcm,
        };
        let settings =
            DeviceSettings::resolve(&config, Some("cli-id".into()), Some("cli-key".into()))
                .unwrap();
        assert_eq!(settings.device_id, "cli-id");
        assert_eq!(settings.enc_key, "cli-key");
        assert!(settings.enc_enable);

        let settings = DeviceSettings::resolve(&config, None, None).unwrap();
        assert_eq!(settings.device_id, "from-file");
        assert_eq!(settings.enc_key, "file-key");
    }

    #[test]
    fn settings_require_device_id_and_key_when_encrypted() {
        let mut config = DeviceConfig {
            attribute_types: Value::Null,
            device_id: None,
            enc_key: None,
            enc_enable: false,
            enc_scheme: CipherScheme::DesEcb,
        };
        assert!(DeviceSettings::resolve(&config, None, None).is_err());

        config.device_id = Some("dev".into());
        config.enc_enable = true;
        let err = DeviceSettings::resolve(&config, None, None).unwrap_err();
        assert!(err.to_string().contains("enc_key"));
    }
}
