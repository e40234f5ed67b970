//! Anchor Service
//!
//! Routes Merkle roots to registered chain providers. Each submission runs
//! under a timeout with bounded exponential backoff; transient failures are
//! retried, a rejection is returned immediately.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::anchor::provider::{AnchorReceipt, ChainInfo, ChainProvider};
use crate::config::AnchorConfig;
use crate::error::{ChainError, LedgerError, Result};

/// What to optimise for when picking a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorPriority {
    Security,
    Speed,
    Balanced,
}

impl FromStr for AnchorPriority {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "security" => Ok(AnchorPriority::Security),
            "speed" => Ok(AnchorPriority::Speed),
            "balanced" => Ok(AnchorPriority::Balanced),
            other => Err(LedgerError::ConfigError(format!(
                "Unknown anchor priority: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for AnchorPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnchorPriority::Security => "security",
            AnchorPriority::Speed => "speed",
            AnchorPriority::Balanced => "balanced",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl From<&AnchorConfig> for RetryPolicy {
    fn from(config: &AnchorConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Outcome of submitting one root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorResult {
    pub success: bool,
    pub chain: String,
    pub tx_hash: Option<String>,
    pub block_number: Option<u64>,
    pub cost: Option<f64>,
    pub attempts: u32,
    #[serde(skip)]
    pub error: Option<ChainError>,
}

impl AnchorResult {
    /// Whether a failed submission may be retried by a later run
    pub fn is_retryable(&self) -> bool {
        self.error.as_ref().map_or(false, ChainError::is_retryable)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainHealth {
    pub chain: String,
    pub name: String,
    pub healthy: bool,
}

pub struct AnchorService {
    providers: Vec<Arc<dyn ChainProvider>>,
    default_chain: String,
    retry: RetryPolicy,
}

impl AnchorService {
    pub fn new(default_chain: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            providers: Vec::new(),
            default_chain: default_chain.into(),
            retry,
        }
    }

    /// Register a provider, replacing any previous one with the same id
    pub fn register(&mut self, provider: Arc<dyn ChainProvider>) {
        self.providers.retain(|p| p.id() != provider.id());
        info!("Registered chain provider {}", provider.id());
        self.providers.push(provider);
    }

    pub fn with_provider(mut self, provider: Arc<dyn ChainProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn chains(&self) -> Vec<&ChainInfo> {
        self.providers.iter().map(|p| p.info()).collect()
    }

    pub fn provider(&self, chain_id: &str) -> Result<&Arc<dyn ChainProvider>> {
        self.providers
            .iter()
            .find(|p| p.id() == chain_id)
            .ok_or_else(|| LedgerError::NotFound(format!("chain provider {}", chain_id)))
    }

    /// Pick a registered chain for the given priority
    pub fn select_chain(&self, priority: AnchorPriority) -> Result<&Arc<dyn ChainProvider>> {
        let selected = match priority {
            AnchorPriority::Security => self
                .providers
                .iter()
                .max_by_key(|p| p.info().assurance_level),
            AnchorPriority::Speed => self
                .providers
                .iter()
                .min_by_key(|p| p.info().avg_confirmation_secs),
            AnchorPriority::Balanced => self
                .providers
                .iter()
                .find(|p| p.id() == self.default_chain)
                .or_else(|| self.providers.first()),
        };

        selected.ok_or_else(|| {
            LedgerError::ConfigError("No chain providers registered".to_string())
        })
    }

    /// Submit `root` to `chain_id`, retrying transient failures
    pub async fn anchor(&self, chain_id: &str, root: &str) -> Result<AnchorResult> {
        let provider = self.provider(chain_id)?;
        let mut attempts = 0;
        let mut last_error = None;

        for retry in 0..=self.retry.max_retries {
            if retry > 0 {
                let delay = self.retry.backoff(retry - 1);
                debug!("Retrying anchor on {} in {:?}", chain_id, delay);
                tokio::time::sleep(delay).await;
            }
            attempts += 1;

            let outcome = match tokio::time::timeout(self.retry.timeout, provider.anchor(root)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(ChainError::Timeout(self.retry.timeout)),
            };

            match outcome {
                Ok(receipt) => {
                    info!(
                        "Anchored root {} on {} (tx {}, attempt {})",
                        root, chain_id, receipt.tx_hash, attempts
                    );
                    return Ok(AnchorResult {
                        success: true,
                        chain: chain_id.to_string(),
                        tx_hash: Some(receipt.tx_hash),
                        block_number: receipt.block_number,
                        cost: receipt.cost,
                        attempts,
                        error: None,
                    });
                }
                Err(err) if err.is_retryable() => {
                    warn!(
                        "Anchor attempt {} on {} failed: {}",
                        attempts, chain_id, err
                    );
                    last_error = Some(err);
                }
                Err(err) => {
                    warn!("Anchor on {} rejected: {}", chain_id, err);
                    last_error = Some(err);
                    break;
                }
            }
        }

        Ok(AnchorResult {
            success: false,
            chain: chain_id.to_string(),
            tx_hash: None,
            block_number: None,
            cost: None,
            attempts,
            error: last_error,
        })
    }

    /// `None` when the chain cannot currently be asked
    pub async fn verify_anchor(
        &self,
        chain_id: &str,
        tx_hash: &str,
        expected_root: &str,
    ) -> Option<bool> {
        let provider = match self.provider(chain_id) {
            Ok(provider) => provider,
            Err(e) => {
                warn!("Cannot verify anchor {}: {}", tx_hash, e);
                return None;
            }
        };

        match tokio::time::timeout(
            self.retry.timeout,
            provider.verify_anchor(tx_hash, expected_root),
        )
        .await
        {
            Ok(Ok(matches)) => Some(matches),
            Ok(Err(ChainError::Rejected(reason))) => {
                warn!("Chain {} rejected tx {}: {}", chain_id, tx_hash, reason);
                Some(false)
            }
            Ok(Err(ChainError::NotFound(_))) => {
                info!("Tx {} not yet known to {}", tx_hash, chain_id);
                None
            }
            Ok(Err(err)) => {
                warn!("Anchor verification on {} indeterminate: {}", chain_id, err);
                None
            }
            Err(_) => {
                warn!(
                    "Anchor verification on {} timed out after {:?}",
                    chain_id, self.retry.timeout
                );
                None
            }
        }
    }

    /// Ask the chain for an earlier transaction carrying `root`. Single
    /// attempt; an error means the chain could not answer.
    pub async fn find_anchor(&self, chain_id: &str, root: &str) -> Result<Option<AnchorReceipt>> {
        let provider = self.provider(chain_id)?;
        match tokio::time::timeout(self.retry.timeout, provider.find_anchor(root)).await {
            Ok(found) => Ok(found?),
            Err(_) => Err(ChainError::Timeout(self.retry.timeout).into()),
        }
    }

    /// Upper bound on how long one batch can spend talking to a chain
    pub fn worst_case_duration(&self) -> Duration {
        // submission attempts plus one lookup and one verification
        let calls = self.retry.max_retries.saturating_add(3);
        self.retry
            .timeout
            .saturating_mul(calls)
            .saturating_add(self.retry.max_backoff.saturating_mul(self.retry.max_retries))
    }

    pub fn get_transaction_url(&self, chain_id: &str, tx_hash: &str) -> Option<String> {
        match self.provider(chain_id) {
            Ok(provider) => Some(provider.get_transaction_url(tx_hash)),
            Err(_) => ChainInfo::lookup(chain_id).map(|info| info.transaction_url(tx_hash)),
        }
    }

    pub async fn health(&self) -> Vec<ChainHealth> {
        let mut report = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            report.push(ChainHealth {
                chain: provider.id().to_string(),
                name: provider.name().to_string(),
                healthy: provider.is_healthy().await,
            });
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::simulated::SimulatedChainProvider;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(200),
            max_retries: 2,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    fn service_with(chains: &[&str]) -> (AnchorService, Vec<Arc<SimulatedChainProvider>>) {
        let mut service = AnchorService::new("polygon", fast_retry());
        let mut providers = Vec::new();
        for id in chains {
            let provider = Arc::new(SimulatedChainProvider::for_chain(id));
            service.register(provider.clone());
            providers.push(provider);
        }
        (service, providers)
    }

    #[test]
    fn test_backoff_is_bounded_exponential() {
        let policy = RetryPolicy {
            timeout: Duration::from_secs(1),
            max_retries: 10,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1_000),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_chain_selection_policy() {
        let (service, _) = service_with(&["ethereum", "polygon", "arbitrum"]);

        assert_eq!(service.select_chain(AnchorPriority::Security).unwrap().id(), "ethereum");
        assert_eq!(service.select_chain(AnchorPriority::Speed).unwrap().id(), "arbitrum");
        assert_eq!(service.select_chain(AnchorPriority::Balanced).unwrap().id(), "polygon");

        let empty = AnchorService::new("polygon", fast_retry());
        assert!(empty.select_chain(AnchorPriority::Balanced).is_err());
    }

    #[test]
    fn test_balanced_falls_back_to_first_registered() {
        let (service, _) = service_with(&["ethereum"]);
        assert_eq!(service.select_chain(AnchorPriority::Balanced).unwrap().id(), "ethereum");
    }

    #[test]
    fn test_priority_parsing() {
        assert_eq!("Speed".parse::<AnchorPriority>().unwrap(), AnchorPriority::Speed);
        assert!("cheapest".parse::<AnchorPriority>().is_err());
    }

    #[tokio::test]
    async fn test_anchor_retries_transient_failures() {
        let (service, providers) = service_with(&["polygon"]);
        providers[0].fail_next(2);

        let result = service.anchor("polygon", "root").await.unwrap();
        assert!(result.success);
        assert_eq!(result.attempts, 3);
        assert!(result.tx_hash.is_some());
    }

    #[tokio::test]
    async fn test_anchor_gives_up_after_max_retries() {
        let (service, providers) = service_with(&["polygon"]);
        providers[0].fail_next(10);

        let result = service.anchor("polygon", "root").await.unwrap();
        assert!(!result.success);
        assert_eq!(result.attempts, 3);
        assert!(result.is_retryable());
        assert_eq!(providers[0].transaction_count(), 0);
    }

    #[tokio::test]
    async fn test_anchor_times_out() {
        let (service, providers) = service_with(&["polygon"]);
        providers[0].set_latency(Duration::from_secs(5));

        let result = service.anchor("polygon", "root").await.unwrap();
        assert!(!result.success);
        assert!(matches!(result.error, Some(ChainError::Timeout(_))));
        assert!(result.is_retryable());
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let (service, providers) = service_with(&["polygon"]);
        providers[0].reject_submissions(true);

        let result = service.anchor("polygon", "root").await.unwrap();
        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert!(!result.is_retryable());
    }

    #[tokio::test]
    async fn test_verify_anchor_indeterminate_when_down() {
        let (service, providers) = service_with(&["polygon"]);
        let result = service.anchor("polygon", "root").await.unwrap();
        let tx = result.tx_hash.unwrap();

        assert_eq!(service.verify_anchor("polygon", &tx, "root").await, Some(true));
        assert_eq!(service.verify_anchor("polygon", &tx, "other").await, Some(false));

        assert_eq!(service.verify_anchor("polygon", "0xunmined", "root").await, None);

        providers[0].set_healthy(false);
        assert_eq!(service.verify_anchor("polygon", &tx, "root").await, None);
        assert_eq!(service.verify_anchor("unknown", &tx, "root").await, None);
    }

    #[tokio::test]
    async fn test_transaction_url_and_health() {
        let (service, providers) = service_with(&["ethereum", "polygon"]);
        assert_eq!(
            service.get_transaction_url("ethereum", "0xabc").as_deref(),
            Some("https://etherscan.io/tx/0xabc")
        );
        assert_eq!(
            service.get_transaction_url("arbitrum", "0xabc").as_deref(),
            Some("https://arbiscan.io/tx/0xabc")
        );

        providers[1].set_healthy(false);
        let health = service.health().await;
        assert_eq!(health.len(), 2);
        assert!(health[0].healthy);
        assert!(!health[1].healthy);
    }

    #[tokio::test]
    async fn test_find_anchor_reports_unreachable_chain() {
        let (service, providers) = service_with(&["polygon"]);
        let tx = service.anchor("polygon", "root").await.unwrap().tx_hash;

        let found = service.find_anchor("polygon", "root").await.unwrap();
        assert_eq!(found.map(|receipt| receipt.tx_hash), tx);
        assert_eq!(service.find_anchor("polygon", "other").await.unwrap(), None);

        providers[0].set_healthy(false);
        assert!(matches!(
            service.find_anchor("polygon", "root").await,
            Err(LedgerError::ChainUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_chain_is_error() {
        let (service, _) = service_with(&["polygon"]);
        assert!(matches!(
            service.anchor("solana", "root").await,
            Err(LedgerError::NotFound(_))
        ));
    }
}
