//! Verification Engine
//!
//! Answers whether a record hash is genuine and, once anchored, whether its
//! stored inclusion proof folds back to the root written on chain.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::anchor::{AnchorService, AnchorStore, ChainInfo};
use crate::database::models::{AnchorState, TransparencyAnchor, TransparencyProof};
use crate::error::{LedgerError, Result};
use crate::ledger::{AnchorStatus, RecordLedger, TransparencyRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorDetails {
    pub chain: String,
    pub chain_name: Option<String>,
    pub tx_hash: String,
    pub anchored_at: Option<DateTime<Utc>>,
    pub merkle_root: Option<String>,
    pub block_number: Option<u64>,
    pub anchor_status: Option<AnchorState>,
    /// Public block explorer link for third-party audit
    pub explorer_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub hash: String,
    pub record_exists: bool,
    pub hash_matches: bool,
    pub is_anchored: bool,
    pub merkle_proof_valid: bool,
    pub anchor_details: Option<AnchorDetails>,
    pub errors: Vec<String>,
    pub is_valid: bool,
}

impl VerificationResult {
    fn missing(hash: &str) -> Self {
        Self {
            hash: hash.to_string(),
            record_exists: false,
            hash_matches: false,
            is_anchored: false,
            merkle_proof_valid: false,
            anchor_details: None,
            errors: vec![format!("No record with hash {}", hash)],
            is_valid: false,
        }
    }
}

/// Verification outcome plus the raw material behind it, so a client can
/// re-check the proof without trusting this service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationDetails {
    pub verification: VerificationResult,
    pub record: Option<TransparencyRecord>,
    pub proof: Option<TransparencyProof>,
    pub anchor: Option<TransparencyAnchor>,
}

#[derive(Clone)]
pub struct VerificationEngine {
    ledger: RecordLedger,
    store: AnchorStore,
    service: Arc<AnchorService>,
}

impl VerificationEngine {
    pub fn new(ledger: RecordLedger, store: AnchorStore, service: Arc<AnchorService>) -> Self {
        Self {
            ledger,
            store,
            service,
        }
    }

    pub async fn verify(&self, hash: &str) -> Result<VerificationResult> {
        Ok(self.get_verification_details(hash).await?.verification)
    }

    pub async fn get_verification_details(&self, hash: &str) -> Result<VerificationDetails> {
        let record = match self.ledger.get_by_hash(hash).await {
            Ok(record) => record,
            Err(LedgerError::NotFound(_)) => {
                debug!("Verification requested for unknown hash {}", hash);
                return Ok(VerificationDetails {
                    verification: VerificationResult::missing(hash),
                    record: None,
                    proof: None,
                    anchor: None,
                });
            }
            Err(e) => return Err(e),
        };

        let mut errors = Vec::new();

        let hash_matches = match record.calculate_hash() {
            Ok(computed) if computed == record.hash => true,
            Ok(computed) => {
                let mismatch = LedgerError::HashMismatch {
                    record_id: record.id.clone(),
                    stored: record.hash.clone(),
                    computed,
                };
                error!("Integrity alert: {}", mismatch);
                errors.push(mismatch.to_string());
                false
            }
            Err(e) => {
                errors.push(format!("Cannot recompute record hash: {}", e));
                false
            }
        };

        let is_anchored = record.is_anchored();
        let mut merkle_proof_valid = false;
        let mut proof = None;
        let mut anchor = None;
        let mut anchor_details = None;

        if is_anchored {
            proof = self.store.get_proof_for_record(&record.id).await?;
            anchor = match &proof {
                Some(p) => self.store.get_anchor(&p.anchor_id).await?,
                None => match &record.anchor_tx_hash {
                    Some(tx) => self.store.get_anchor_by_tx(tx).await?,
                    None => None,
                },
            };

            match &proof {
                Some(p) => {
                    merkle_proof_valid =
                        check_proof(&record, p, anchor.as_ref(), &mut errors);
                }
                None => {
                    warn!("Anchored record {} has no stored proof yet", record.id);
                    errors.push("Inclusion proof not generated yet".to_string());
                }
            }

            anchor_details = self.anchor_details(&record, anchor.as_ref());
        } else if record.anchor_status == AnchorStatus::Failed {
            warn!("Record {} sits in a failed anchoring batch", record.id);
            errors.push("Anchoring failed; the batch awaits operator review".to_string());
        }

        let is_valid = hash_matches && (!is_anchored || merkle_proof_valid);

        Ok(VerificationDetails {
            verification: VerificationResult {
                hash: hash.to_string(),
                record_exists: true,
                hash_matches,
                is_anchored,
                merkle_proof_valid,
                anchor_details,
                errors,
                is_valid,
            },
            record: Some(record),
            proof,
            anchor,
        })
    }

    fn anchor_details(
        &self,
        record: &TransparencyRecord,
        anchor: Option<&TransparencyAnchor>,
    ) -> Option<AnchorDetails> {
        let chain = record.anchor_chain.clone()?;
        let tx_hash = record.anchor_tx_hash.clone()?;

        let chain_name = match self.service.provider(&chain) {
            Ok(provider) => Some(provider.name().to_string()),
            Err(_) => ChainInfo::lookup(&chain).map(|info| info.name),
        };

        Some(AnchorDetails {
            explorer_url: self.service.get_transaction_url(&chain, &tx_hash),
            chain_name,
            anchored_at: record.anchored_at,
            merkle_root: anchor.map(|a| a.merkle_root.clone()),
            block_number: anchor.and_then(|a| a.block_number),
            anchor_status: anchor.map(|a| a.status),
            chain,
            tx_hash,
        })
    }
}

fn check_proof(
    record: &TransparencyRecord,
    stored: &TransparencyProof,
    anchor: Option<&TransparencyAnchor>,
    errors: &mut Vec<String>,
) -> bool {
    let mut valid = true;

    if stored.proof.leaf_hash != record.hash {
        errors.push("Proof leaf does not match the record hash".to_string());
        valid = false;
    }
    if record.anchor_tx_hash.as_deref() != Some(stored.anchor_tx_hash.as_str()) {
        errors.push(format!(
            "Proof belongs to tx {}, record is anchored by {:?}",
            stored.anchor_tx_hash, record.anchor_tx_hash
        ));
        valid = false;
    }
    if !stored.proof.verify() {
        errors.push(format!(
            "Merkle proof folds to {} instead of {}",
            stored.proof.computed_root(),
            stored.proof.root
        ));
        valid = false;
    }

    match anchor {
        Some(anchor) if anchor.merkle_root != stored.proof.root => {
            errors.push(format!(
                "Proof root {} differs from anchored root {}",
                stored.proof.root, anchor.merkle_root
            ));
            valid = false;
        }
        Some(anchor) if anchor.status == AnchorState::Rejected => {
            errors.push(format!("Anchor {} was rejected by {}", anchor.id, anchor.chain));
            valid = false;
        }
        Some(_) => {}
        None => {
            errors.push(format!("Anchor {} not found", stored.anchor_id));
            valid = false;
        }
    }

    valid
}
