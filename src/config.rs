//! Configuration Module
//!
//! This module defines all configuration structures for the selector.
//! Configuration is loaded from TOML files and parsed using serde.

use crate::types::{CoordinatorAccount, PublicKey};
use ethers::types::{Address, Bytes};
use serde::{Deserialize, Serialize};
use std::fs;

/// Main configuration structure
///
/// # Example TOML
/// ```toml
/// [selection]
/// max_tx = 512
/// max_l1_tx = 256
/// max_fee_tx = 64
/// tree_depth = 32
/// chain_id = 1
///
/// [coordinator]
/// address = "0x00000000000000000000000000000000000000c0"
/// public_key = "0x00000000000000000000000000000000000000000000000000000000000000c1"
/// creation_auth = "0xcccc"
///
/// [pipeline]
/// channel_capacity = 64
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub selection: SelectionConfig,
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Capacity limits of one batch
///
/// # Fields
/// - `max_tx`: Maximum transactions per batch, on-chain and pool together
/// - `max_l1_tx`: Maximum on-chain transactions per batch
/// - `max_fee_tx`: Maximum distinct fee-collecting accounts per batch
/// - `tree_depth`: Depth of the account tree, bounds the number of accounts
/// - `chain_id`: Chain the batch is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionConfig {
    pub max_tx: usize,
    pub max_l1_tx: usize,
    pub max_fee_tx: usize,
    pub tree_depth: u32,
    pub chain_id: u64,
}

impl SelectionConfig {
    /// Room for one more pool transaction
    pub fn can_add_pool_tx(&self, l1: usize, l2: usize) -> bool {
        l1 + l2 < self.max_tx
    }

    /// Room for one more pool transaction plus the on-chain creation it needs
    pub fn can_add_pool_tx_needing_creation(&self, l1: usize, l2: usize) -> bool {
        l1 < self.max_l1_tx && l1 + l2 + 1 < self.max_tx
    }
}

/// Identity the coordinator collects fees with, hex encoded
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    pub address: Address,
    #[serde(default)]
    pub public_key: PublicKey,
    #[serde(default)]
    pub creation_auth: Bytes,
}

impl CoordinatorConfig {
    pub fn account(&self) -> CoordinatorAccount {
        CoordinatorAccount {
            address: self.address,
            public_key: self.public_key,
            creation_auth: self.creation_auth.clone(),
        }
    }
}

/// Streaming pipeline settings
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Bound of every inter-stage queue
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    /// * `path` - Path to the TOML configuration file
    ///
    /// # Returns
    /// * `Ok(Config)` if the file was successfully loaded and parsed
    /// * `Err` if the file couldn't be read or the TOML is invalid
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.selection.max_l1_tx > config.selection.max_tx {
            anyhow::bail!(
                "max_l1_tx ({}) cannot exceed max_tx ({})",
                config.selection.max_l1_tx,
                config.selection.max_tx
            );
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [selection]
        max_tx = 10
        max_l1_tx = 4
        max_fee_tx = 2
        tree_depth = 32
        chain_id = 5

        [coordinator]
        address = "0x00000000000000000000000000000000000000c0"
        public_key = "0x00000000000000000000000000000000000000000000000000000000000000c1"
        creation_auth = "0xcccc"
    "#;

    #[test]
    fn test_parse_config() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.selection.max_tx, 10);
        assert_eq!(config.pipeline.channel_capacity, 64);

        let coordinator = config.coordinator.account();
        assert_eq!(coordinator.address, Address::from_low_u64_be(0xc0));
        assert_eq!(coordinator.creation_auth.to_vec(), vec![0xccu8, 0xcc]);
    }

    #[test]
    fn test_rejects_l1_limit_above_total() {
        let content = SAMPLE.replace("max_l1_tx = 4", "max_l1_tx = 11");
        assert!(Config::parse(&content).is_err());
    }

    #[test]
    fn test_capacity_predicates() {
        let config = Config::parse(SAMPLE).unwrap().selection;
        assert!(config.can_add_pool_tx(4, 5));
        assert!(!config.can_add_pool_tx(4, 6));
        assert!(config.can_add_pool_tx_needing_creation(3, 5));
        assert!(!config.can_add_pool_tx_needing_creation(4, 0));
        assert!(!config.can_add_pool_tx_needing_creation(3, 6));
    }
}
