use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::auth::MessageConvention;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("cannot encode config: {0}")]
    Encode(#[from] toml::ser::Error),
}

fn default_name() -> String {
    "tokencheck".to_string()
}

/// Deployment settings of one ledger.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Label used in logs ("checking-account", "drop", ...).
    #[serde(default = "default_name")]
    pub name: String,
    /// The ledger's own identity. Bound into every check digest.
    pub identity: Address,
    #[serde(default)]
    pub convention: MessageConvention,
}

impl LedgerConfig {
    pub fn new(identity: Address) -> Self {
        Self {
            name: default_name(),
            identity,
            convention: MessageConvention::default(),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
