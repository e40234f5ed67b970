//! Simulated Chain
//!
//! Deterministic in-process chain used for tests and local runs. Transaction
//! hashes derive from the chain id, the root and a per-provider nonce, so a
//! given sequence of calls always yields the same transactions.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::anchor::provider::{AnchorReceipt, ChainInfo, ChainProvider};
use crate::error::ChainError;
use crate::hashing::digest;

#[derive(Debug, Clone)]
struct SimulatedTx {
    root: String,
    block_number: u64,
}

#[derive(Debug)]
struct SimulatedState {
    block_height: u64,
    nonce: u64,
    transactions: HashMap<String, SimulatedTx>,
    healthy: bool,
    verification_down: bool,
    transient_failures: u32,
    reject_submissions: bool,
    latency: Duration,
}

pub struct SimulatedChainProvider {
    info: ChainInfo,
    state: Mutex<SimulatedState>,
}

impl SimulatedChainProvider {
    pub fn new(info: ChainInfo) -> Self {
        Self {
            info,
            state: Mutex::new(SimulatedState {
                block_height: 1_000_000,
                nonce: 0,
                transactions: HashMap::new(),
                healthy: true,
                verification_down: false,
                transient_failures: 0,
                reject_submissions: false,
                latency: Duration::ZERO,
            }),
        }
    }

    /// Simulate a catalog chain, or a generic one for unknown ids
    pub fn for_chain(id: &str) -> Self {
        let info = ChainInfo::lookup(id).unwrap_or_else(|| ChainInfo {
            id: id.to_string(),
            name: format!("Simulated {}", id),
            endpoint: format!("sim://{}", id),
            explorer_url_template: format!("https://explorer.invalid/{}/tx/{{tx}}", id),
            avg_confirmation_secs: 1,
            estimated_cost_usd: 0.0,
            assurance_level: 1,
        });
        Self::new(info)
    }

    /// Like `for_chain`, with explorer links that point nowhere public
    pub fn for_local_run(id: &str) -> Self {
        let mut chain = Self::for_chain(id);
        chain.info.explorer_url_template = format!("sim://{}/tx/{{tx}}", id);
        chain
    }

    fn state(&self) -> MutexGuard<'_, SimulatedState> {
        // state stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state().healthy = healthy;
    }

    /// Accept submissions but leave lookups unanswered
    pub fn fail_verifications(&self, down: bool) {
        self.state().verification_down = down;
    }

    /// The next `count` submissions fail as unavailable
    pub fn fail_next(&self, count: u32) {
        self.state().transient_failures = count;
    }

    pub fn reject_submissions(&self, reject: bool) {
        self.state().reject_submissions = reject;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Make the chain report different content for an existing transaction
    pub fn overwrite_transaction(&self, tx_hash: &str, root: &str) {
        if let Some(tx) = self.state().transactions.get_mut(tx_hash) {
            tx.root = root.to_string();
        }
    }

    pub fn transaction_count(&self) -> usize {
        self.state().transactions.len()
    }

    pub fn anchored_root(&self, tx_hash: &str) -> Option<String> {
        self.state().transactions.get(tx_hash).map(|tx| tx.root.clone())
    }
}

#[async_trait]
impl ChainProvider for SimulatedChainProvider {
    fn info(&self) -> &ChainInfo {
        &self.info
    }

    async fn anchor(&self, root: &str) -> Result<AnchorReceipt, ChainError> {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if !state.healthy {
            return Err(ChainError::Unavailable(format!("{} is down", self.info.id)));
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(ChainError::Unavailable(format!(
                "{} dropped the request",
                self.info.id
            )));
        }
        if state.reject_submissions {
            return Err(ChainError::Rejected(format!(
                "{} refused root {}",
                self.info.id, root
            )));
        }

        state.nonce += 1;
        state.block_height += 1;
        let tx_hash = format!(
            "0x{}",
            digest(format!("{}:{}:{}", self.info.id, root, state.nonce).as_bytes())
        );
        let block_number = state.block_height;
        state.transactions.insert(
            tx_hash.clone(),
            SimulatedTx {
                root: root.to_string(),
                block_number,
            },
        );

        info!(
            "Simulated {} anchored root {} in block {}",
            self.info.id, root, block_number
        );
        Ok(AnchorReceipt {
            tx_hash,
            block_number: Some(block_number),
            cost: Some(self.info.estimated_cost_usd),
        })
    }

    async fn verify_anchor(&self, tx_hash: &str, expected_root: &str) -> Result<bool, ChainError> {
        let state = self.state();
        if !state.healthy {
            return Err(ChainError::Unavailable(format!("{} is down", self.info.id)));
        }
        if state.verification_down {
            return Err(ChainError::Unavailable(format!(
                "{} lookup service unreachable",
                self.info.id
            )));
        }

        match state.transactions.get(tx_hash) {
            Some(tx) => {
                debug!(
                    "Simulated {} tx {} in block {} carries {}",
                    self.info.id, tx_hash, tx.block_number, tx.root
                );
                Ok(tx.root == expected_root)
            }
            None => Err(ChainError::NotFound(tx_hash.to_string())),
        }
    }

    async fn find_anchor(&self, root: &str) -> Result<Option<AnchorReceipt>, ChainError> {
        let state = self.state();
        if !state.healthy || state.verification_down {
            return Err(ChainError::Unavailable(format!(
                "{} lookup service unreachable",
                self.info.id
            )));
        }

        Ok(state
            .transactions
            .iter()
            .filter(|(_, tx)| tx.root == root)
            .max_by_key(|(_, tx)| tx.block_number)
            .map(|(tx_hash, tx)| AnchorReceipt {
                tx_hash: tx_hash.clone(),
                block_number: Some(tx.block_number),
                cost: Some(self.info.estimated_cost_usd),
            }))
    }

    async fn is_healthy(&self) -> bool {
        self.state().healthy
    }
}
