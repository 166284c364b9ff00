//! TOML configuration for the node driver and the client core.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::network::Network;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Credentials and endpoint for the chain node's RPC server.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub rpc_listen: String,
    pub rpc_user: String,
    pub rpc_pass: String,
    /// Path to the node's TLS certificate.
    #[serde(default)]
    pub rpc_cert: String,
    #[serde(default)]
    pub network: Network,
}

/// Settings for the client core.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    /// Filepath for the client database; created if absent.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// DEX URL → TLS certificate filepath, for self-signed servers.
    #[serde(default)]
    pub certs: HashMap<String, String>,
}

fn default_db_path() -> String {
    "driftdex.db".to_string()
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            certs: HashMap::new(),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub client: ClientSettings,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.node.rpc_listen.is_empty() {
            return Err(ConfigError::Invalid("node.rpc_listen is required".into()));
        }
        if self.node.rpc_user.is_empty() || self.node.rpc_pass.is_empty() {
            return Err(ConfigError::Invalid(
                "node.rpc_user and node.rpc_pass are required".into(),
            ));
        }
        Ok(())
    }
}
