//! Match configuration.
//!
//! Every knob has a default; a TOML file only needs the keys it overrides.

use pokechess_core::{BPS_DENOMINATOR, MAX_STAKE_SOL, MIN_STAKE_SOL, PLATFORM_FEE_BPS, StakeLimits};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Prepended to room codes to form the host peer id.
    pub peer_prefix: String,
    pub turn_seconds: u32,
    pub max_strikes: u32,
    pub reconnect_delay_ms: u64,
    pub open_poll_interval_ms: u64,
    pub open_poll_attempts: u32,
    pub join_timeout_ms: u64,
    pub host_wait_timeout_ms: u64,
    pub stake_info_grace_ms: u64,
    pub send_retry_attempts: u32,
    pub send_retry_backoff_ms: u64,
    /// Joiner must prove its deposit with `stake_confirmed`. When off the
    /// legacy `stake_accepted` message is enough.
    pub require_deposit_proof: bool,
    pub min_stake_sol: f64,
    pub max_stake_sol: f64,
    pub platform_fee_bps: u64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            peer_prefix: "pkchess".to_string(),
            turn_seconds: 60,
            max_strikes: 3,
            reconnect_delay_ms: 2_000,
            open_poll_interval_ms: 250,
            open_poll_attempts: 40,
            join_timeout_ms: 15_000,
            host_wait_timeout_ms: 20_000,
            stake_info_grace_ms: 1_500,
            send_retry_attempts: 10,
            send_retry_backoff_ms: 300,
            require_deposit_proof: true,
            min_stake_sol: MIN_STAKE_SOL,
            max_stake_sol: MAX_STAKE_SOL,
            platform_fee_bps: PLATFORM_FEE_BPS,
        }
    }
}

impl MatchConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peer_prefix.is_empty() {
            return Err(ConfigError::Invalid("peer_prefix cannot be empty".into()));
        }
        if self.turn_seconds == 0 {
            return Err(ConfigError::Invalid("turn_seconds must be positive".into()));
        }
        if self.max_strikes == 0 {
            return Err(ConfigError::Invalid("max_strikes must be positive".into()));
        }
        if !(self.min_stake_sol > 0.0 && self.min_stake_sol <= self.max_stake_sol) {
            return Err(ConfigError::Invalid(format!(
                "stake range {}..{} is empty",
                self.min_stake_sol, self.max_stake_sol
            )));
        }
        if self.platform_fee_bps > BPS_DENOMINATOR {
            return Err(ConfigError::Invalid(format!(
                "platform_fee_bps {} exceeds {}",
                self.platform_fee_bps, BPS_DENOMINATOR
            )));
        }
        Ok(())
    }

    pub fn stake_limits(&self) -> StakeLimits {
        StakeLimits {
            min_sol: self.min_stake_sol,
            max_sol: self.max_stake_sol,
        }
    }

    pub fn turn_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.turn_seconds))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn open_poll_interval(&self) -> Duration {
        Duration::from_millis(self.open_poll_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn host_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.host_wait_timeout_ms)
    }

    pub fn stake_info_grace(&self) -> Duration {
        Duration::from_millis(self.stake_info_grace_ms)
    }

    pub fn send_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.send_retry_backoff_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = MatchConfig::from_toml_str("").unwrap();
        assert_eq!(config, MatchConfig::default());
        assert_eq!(config.turn_duration(), Duration::from_secs(60));
        assert_eq!(config.reconnect_delay(), Duration::from_secs(2));
    }

    #[test]
    fn partial_override() {
        let config = MatchConfig::from_toml_str(
            r#"
            turn_seconds = 30
            require_deposit_proof = false
            peer_prefix = "localchess"
            "#,
        )
        .unwrap();
        assert_eq!(config.turn_seconds, 30);
        assert!(!config.require_deposit_proof);
        assert_eq!(config.peer_prefix, "localchess");
        assert_eq!(config.max_strikes, 3);
    }

    #[test]
    fn rejects_nonsense() {
        assert!(MatchConfig::from_toml_str("max_strikes = 0").is_err());
        assert!(MatchConfig::from_toml_str("min_stake_sol = 5.0\nmax_stake_sol = 1.0").is_err());
        assert!(MatchConfig::from_toml_str("turn_seconds = \"soon\"").is_err());
    }

    #[test]
    fn fee_cannot_exceed_the_pot() {
        assert!(MatchConfig::from_toml_str("platform_fee_bps = 10000").is_ok());
        let config = MatchConfig {
            platform_fee_bps: 20_000,
            ..MatchConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("platform_fee_bps")));
        assert!(MatchConfig::from_toml_str("platform_fee_bps = 10001").is_err());
    }
}
