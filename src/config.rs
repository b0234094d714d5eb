//! Configuration of the devices to control.
//! JSON document listing devices by address, with optional tokens and a token file.

use crate::error::{MiioError, Result};
use crate::protocol::Token;
use crate::tokens::TokenStore;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Kind of device behind an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    CtMoonLight,
    ColorLight,
    AirPurifier,
    VacuumCleaner,
}

/// One configured device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub name: String,
    /// `ip` or `ip:port`
    pub ip_address: String,
    /// Hex token; looked up in the token file when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
}

impl DeviceConfig {
    pub fn token(&self) -> Result<Option<Token>> {
        self.token.as_deref().map(Token::from_str).transpose()
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Where discovered and stored tokens are kept
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    /// Load and validate configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            MiioError::Config(format!("Failed to read {}: {}", path.as_ref().display(), e))
        })?;
        content.parse()
    }

    /// Check addresses and tokens of every device.
    pub fn validate(&self) -> Result<()> {
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(MiioError::Config(format!(
                    "device at {} has no name",
                    device.ip_address
                )));
            }
            let addr = device.ip_address.as_str();
            if addr.parse::<IpAddr>().is_err() && addr.parse::<SocketAddr>().is_err() {
                return Err(MiioError::Config(format!(
                    "device '{}' has invalid address '{}'",
                    device.name, addr
                )));
            }
            device.token().map_err(|e| {
                MiioError::Config(format!("device '{}': {}", device.name, e))
            })?;
        }
        Ok(())
    }

    /// Token store over the configured token file, if any.
    pub fn token_store(&self) -> Option<TokenStore> {
        self.token_file.as_ref().map(TokenStore::new)
    }
}

impl FromStr for Config {
    type Err = MiioError;

    fn from_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)
            .map_err(|e| MiioError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }
}
