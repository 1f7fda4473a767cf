//! Configuration loading

use anyhow::Result;
use indilink_client::ClientConfig;
use indilink_core::parser::DEFAULT_MAX_ELEMENT_LEN;
use indilink_core::{BlobMode, INDI_PORT, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Device name to display label
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    INDI_PORT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Version announced in getProperties
    #[serde(default = "default_version")]
    pub version: String,
    /// BLOB policy requested at connect
    #[serde(default)]
    pub blob_mode: BlobMode,
    /// Largest inbound element kept in memory
    #[serde(default = "default_max_element_bytes")]
    pub max_element_bytes: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            blob_mode: BlobMode::default(),
            max_element_bytes: default_max_element_bytes(),
        }
    }
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

fn default_max_element_bytes() -> usize {
    DEFAULT_MAX_ELEMENT_LEN
}

impl Config {
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            protocol_version: self.protocol.version.clone(),
            blob_mode: self.protocol.blob_mode,
            max_element_bytes: self.protocol.max_element_bytes,
            labels: self.labels.clone(),
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(&Config::default())?;
    std::fs::write(path, content)?;
    Ok(())
}
