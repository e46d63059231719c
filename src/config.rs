//! Chain state configuration

use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::constants::*;

/// Tunables of the chain state owner and the compact-block codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Blocks a coinbase output must wait before it can be spent.
    pub coinbase_maturity: u32,
    /// Largest serialized block accepted, also bounds compact-block payloads.
    pub max_block_size: u64,
    /// Protocol version of the compact-block messages exchanged with peers.
    pub protocol_version: u32,
    /// A tip older than this keeps the node in initial download.
    pub max_tip_age_secs: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            coinbase_maturity: COINBASE_MATURITY,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            protocol_version: PROTOCOL_VERSION,
            max_tip_age_secs: DEFAULT_MAX_TIP_AGE,
        }
    }
}

impl ChainConfig {
    /// Regression-test settings: coinbases spendable immediately, tip age ignored.
    pub fn regtest() -> Self {
        Self {
            coinbase_maturity: 0,
            max_tip_age_secs: u64::MAX,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse chain config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read chain config {}", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("Invalid chain config {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_block_size == 0 {
            bail!("max_block_size cannot be 0");
        }
        if self.max_block_size > MAX_SIZE * 16 {
            bail!("max_block_size {} exceeds {}", self.max_block_size, MAX_SIZE * 16);
        }
        Ok(())
    }

    /// Whether compact blocks may be exchanged at the configured version.
    pub fn supports_compact_blocks(&self) -> bool {
        self.protocol_version >= SHORT_IDS_BLOCKS_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChainConfig::default();
        assert_eq!(config.coinbase_maturity, 100);
        assert_eq!(config.max_block_size, 32_000_000);
        assert!(config.supports_compact_blocks());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ChainConfig::from_json_str(r#"{"coinbase_maturity": 5}"#).unwrap();
        assert_eq!(config.coinbase_maturity, 5);
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_zero_block_size_rejected() {
        assert!(ChainConfig::from_json_str(r#"{"max_block_size": 0}"#).is_err());
    }

    #[test]
    fn test_old_protocol_version() {
        let config = ChainConfig::from_json_str(r#"{"protocol_version": 70001}"#).unwrap();
        assert!(!config.supports_compact_blocks());
    }

    #[test]
    fn test_malformed_json_has_context() {
        let err = ChainConfig::from_json_str("{").unwrap_err();
        assert!(err.to_string().contains("Failed to parse chain config"));
    }

    #[test]
    fn test_missing_file() {
        let err = ChainConfig::from_file("/nonexistent/chain.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/chain.json"));
    }
}
