//! Chain Providers
//!
//! Pluggable interface to an external chain that can timestamp a Merkle
//! root. The wire protocol of each chain lives behind this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChainError;

/// Static description of a supported chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    /// Block explorer URL with a `{tx}` placeholder
    pub explorer_url_template: String,
    pub avg_confirmation_secs: u64,
    pub estimated_cost_usd: f64,
    /// Relative assurance, higher is harder to rewrite
    pub assurance_level: u8,
}

impl ChainInfo {
    pub fn transaction_url(&self, tx_hash: &str) -> String {
        self.explorer_url_template.replace("{tx}", tx_hash)
    }

    /// Look up a chain from the built-in catalog
    pub fn lookup(id: &str) -> Option<ChainInfo> {
        known_chains().into_iter().find(|chain| chain.id == id)
    }
}

/// Chains with a known public explorer
pub fn known_chains() -> Vec<ChainInfo> {
    vec![
        ChainInfo {
            id: "ethereum".to_string(),
            name: "Ethereum Mainnet".to_string(),
            endpoint: "https://ethereum-rpc.publicnode.com".to_string(),
            explorer_url_template: "https://etherscan.io/tx/{tx}".to_string(),
            avg_confirmation_secs: 180,
            estimated_cost_usd: 2.50,
            assurance_level: 10,
        },
        ChainInfo {
            id: "polygon".to_string(),
            name: "Polygon PoS".to_string(),
            endpoint: "https://polygon-rpc.com".to_string(),
            explorer_url_template: "https://polygonscan.com/tx/{tx}".to_string(),
            avg_confirmation_secs: 5,
            estimated_cost_usd: 0.01,
            assurance_level: 7,
        },
        ChainInfo {
            id: "arbitrum".to_string(),
            name: "Arbitrum One".to_string(),
            endpoint: "https://arb1.arbitrum.io/rpc".to_string(),
            explorer_url_template: "https://arbiscan.io/tx/{tx}".to_string(),
            avg_confirmation_secs: 2,
            estimated_cost_usd: 0.05,
            assurance_level: 8,
        },
    ]
}

/// Successful chain write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorReceipt {
    pub tx_hash: String,
    pub block_number: Option<u64>,
    pub cost: Option<f64>,
}

#[async_trait]
pub trait ChainProvider: Send + Sync {
    fn info(&self) -> &ChainInfo;

    fn id(&self) -> &str {
        &self.info().id
    }

    fn name(&self) -> &str {
        &self.info().name
    }

    /// Write `root` to the chain
    async fn anchor(&self, root: &str) -> Result<AnchorReceipt, ChainError>;

    /// Whether `tx_hash` carries `expected_root`. `Err(ChainError::NotFound)`
    /// when the chain does not know the transaction, other errors when the
    /// chain cannot be asked. Only `Ok(false)` means conflicting content.
    async fn verify_anchor(&self, tx_hash: &str, expected_root: &str) -> Result<bool, ChainError>;

    /// An earlier transaction already carrying `root`, if the chain can tell
    async fn find_anchor(&self, _root: &str) -> Result<Option<AnchorReceipt>, ChainError> {
        Ok(None)
    }

    fn get_transaction_url(&self, tx_hash: &str) -> String {
        self.info().transaction_url(tx_hash)
    }

    async fn is_healthy(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_lookup() {
        let polygon = ChainInfo::lookup("polygon").unwrap();
        assert_eq!(polygon.name, "Polygon PoS");
        assert_eq!(
            polygon.transaction_url("0xabc"),
            "https://polygonscan.com/tx/0xabc"
        );
        assert!(ChainInfo::lookup("dogecoin").is_none());
    }

    #[test]
    fn test_catalog_ids_unique() {
        let chains = known_chains();
        let mut ids: Vec<&str> = chains.iter().map(|c| c.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), chains.len());
    }
}
