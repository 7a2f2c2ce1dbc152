//! Configuration management: a TOML file with validated sections and
//! sensible defaults for every field.
//!
//! ```toml
//! [node]
//! name = "Bulletin Server"
//!
//! [auth]
//! admin_password = "password"
//! guest_password = "hello"
//! allow_read_only = false
//!
//! [storage]
//! data_dir = "./data"
//! # mirror_dir = "/mnt/sd"
//!
//! [transport]
//! bind = "0.0.0.0:4938"
//!
//! [logging]
//! level = "info"
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::server::MAX_POST_TEXT_LEN;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Operator-facing node name, used as the sender label on channel
    /// broadcasts.
    #[serde(default = "default_node_name")]
    pub name: String,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lon: f64,
    /// Extra redundant ACK transmissions on direct paths (0 = off).
    #[serde(default)]
    pub multi_acks: u8,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            lat: 0.0,
            lon: 0.0,
            multi_acks: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSection {
    /// Password granting the admin role.
    #[serde(default = "default_admin_password")]
    pub admin_password: String,
    /// Room password granting the read-write role.
    #[serde(default = "default_guest_password")]
    pub guest_password: String,
    /// When true, any other password yields a guest login instead of a
    /// silent drop.
    #[serde(default)]
    pub allow_read_only: bool,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            admin_password: default_admin_password(),
            guest_password: default_guest_password(),
            allow_read_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Secondary-media mirror for config blobs; optional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_dir: Option<String>,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            mirror_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSection {
    /// UDP bind address for the demo mesh transport.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Static peer addresses to flood to (in addition to learned ones).
    #[serde(default)]
    pub peers: Vec<String>,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingSection {
    /// Log level filter: error, warn, info, debug, trace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    /// Optional log file (console remains primary).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

fn default_node_name() -> String {
    "Bulletin Server".to_string()
}

fn default_admin_password() -> String {
    "password".to_string()
}

fn default_guest_password() -> String {
    "hello".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_bind() -> String {
    "0.0.0.0:4938".to_string()
}

impl Config {
    /// Load and validate a configuration file.
    pub async fn load(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config file {path}"))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing config file {path}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Write a default configuration file; refuses to overwrite.
    pub async fn create_default(path: &str) -> Result<()> {
        if fs::try_exists(path).await.unwrap_or(false) {
            bail!("config file {path} already exists");
        }
        let rendered = toml::to_string_pretty(&Config::default())?;
        fs::write(path, rendered)
            .await
            .with_context(|| format!("writing config file {path}"))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.name.is_empty() || self.node.name.len() > 40 {
            bail!("node.name must be 1-40 characters");
        }
        if self.auth.admin_password.is_empty() {
            bail!("auth.admin_password must not be empty");
        }
        if self.auth.admin_password.len() > MAX_POST_TEXT_LEN
            || self.auth.guest_password.len() > MAX_POST_TEXT_LEN
        {
            bail!("passwords must be at most {MAX_POST_TEXT_LEN} characters");
        }
        if self.auth.admin_password == self.auth.guest_password {
            bail!("auth.admin_password and auth.guest_password must differ");
        }
        if self.storage.data_dir.is_empty() {
            bail!("storage.data_dir must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn missing_sections_take_defaults() {
        let config: Config = toml::from_str("[node]\nname = \"Test Node\"\n").unwrap();
        assert_eq!(config.node.name, "Test Node");
        assert_eq!(config.auth.admin_password, "password");
        assert!(!config.auth.allow_read_only);
        config.validate().unwrap();
    }

    #[test]
    fn equal_passwords_rejected() {
        let mut config = Config::default();
        config.auth.guest_password = config.auth.admin_password.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Config::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let reparsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(reparsed.node.name, config.node.name);
        assert_eq!(reparsed.transport.bind, config.transport.bind);
    }
}
