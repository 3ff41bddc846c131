//! Relay configuration file.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    /// Registered peers allowed at once.
    pub max_peers: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: ([127, 0, 0, 1], 9300).into(),
            max_peers: 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid relay config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("max_peers must be at least 2")]
    TooFewPeers,
}

impl RelayConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, RelayConfigError> {
        let config: Self = toml::from_str(s)?;
        if config.max_peers < 2 {
            return Err(RelayConfigError::TooFewPeers);
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, RelayConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| RelayConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}
