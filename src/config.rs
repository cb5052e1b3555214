//! Chain parameters loaded from TOML

use serde::Deserialize;
use thiserror::Error;

use std::fs;
use std::path::Path;
use std::time::Duration;

/// Hex symbols in a SHA-256 digest
const MAX_DIFFICULTY: usize = 64;

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_difficulty")]
    difficulty: usize,
    #[serde(default = "default_mining_reward")]
    mining_reward: u64,
    #[serde(default)]
    mining_timeout_secs: Option<u64>,
}

/// Parameters every participant of a chain must agree on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    /// Leading zero hex symbols a mined block hash must have
    pub difficulty: usize,

    /// Amount credited to the miner by the reward transaction
    pub mining_reward: u64,

    /// Upper bound on a single mining run, unbounded when `None`
    pub mining_timeout: Option<Duration>,
}

fn default_difficulty() -> usize {
    2
}

fn default_mining_reward() -> u64 {
    100
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            difficulty: default_difficulty(),
            mining_reward: default_mining_reward(),
            mining_timeout: None,
        }
    }
}

impl ChainConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        let config = ChainConfig {
            difficulty: raw.difficulty,
            mining_reward: raw.mining_reward,
            mining_timeout: raw.mining_timeout_secs.map(Duration::from_secs),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.difficulty > MAX_DIFFICULTY {
            return Err(ConfigError::Invalid(format!(
                "difficulty {} exceeds the {} symbols of a block hash",
                self.difficulty, MAX_DIFFICULTY
            )));
        }
        Ok(())
    }
}
