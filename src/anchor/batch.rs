//! Batch Anchoring
//!
//! Periodically takes the oldest pending ledger records, commits to them
//! with a Merkle root and writes that root to a chain. Records are claimed
//! into a batch before the chain is contacted, so concurrent runs never
//! share a record. A batch left behind by a crashed run is taken over once
//! its lease expires, and the chain is asked for the root before anything
//! is submitted again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::anchor::provider::AnchorReceipt;
use crate::anchor::service::{AnchorPriority, AnchorService};
use crate::anchor::store::{AnchorStore, BatchClaim};
use crate::database::models::{AnchorState, TransparencyAnchor};
use crate::error::{LedgerError, Result};
use crate::hashing::truncate_to_millis;
use crate::ledger::{RecordLedger, TransparencyRecord};
use crate::merkle::{build_tree, MerkleProof, MerkleTree};

/// Summary of one anchored batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub anchor_id: String,
    pub chain: String,
    pub merkle_root: String,
    pub tx_hash: String,
    pub record_count: usize,
    pub proofs_generated: usize,
    pub proof_failures: usize,
    /// The chain confirmed the root right after submission
    pub confirmed: bool,
    /// The root was already on chain from an interrupted run
    pub recovered_from_chain: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    NothingPending,
    Anchored(BatchReport),
    /// Transient chain failure; the records stay pending for the next run
    Deferred { record_count: usize, reason: String },
    /// The chain refused or contradicted the root; the records are marked failed
    Rejected {
        record_count: usize,
        chain: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationReport {
    pub confirmed: usize,
    pub rejected: usize,
    pub still_submitted: usize,
}

#[derive(Clone)]
pub struct AnchorBatcher {
    ledger: RecordLedger,
    store: AnchorStore,
    service: Arc<AnchorService>,
    priority: AnchorPriority,
    lease: Duration,
    run_lock: Arc<Mutex<()>>,
}

impl AnchorBatcher {
    pub fn new(
        ledger: RecordLedger,
        store: AnchorStore,
        service: Arc<AnchorService>,
        priority: AnchorPriority,
    ) -> Self {
        let lease = service.worst_case_duration().saturating_mul(2);
        Self {
            ledger,
            store,
            service,
            priority,
            lease,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    /// How long a claimed batch stays reserved for the run that claimed it
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn store(&self) -> &AnchorStore {
        &self.store
    }

    /// Anchor up to `limit` of the oldest pending records as one batch. An
    /// abandoned batch is resumed first and takes the place of a new one.
    pub async fn anchor_pending_records(&self, limit: u32) -> Result<BatchOutcome> {
        let _guard = self.run_lock.lock().await;

        let regenerated = self.regenerate_missing_proofs().await?;
        if regenerated > 0 {
            info!("Regenerated {} missing inclusion proofs", regenerated);
        }

        let claim = match self.store.take_over_expired_batch(self.lease).await? {
            Some(claim) => {
                warn!("Resuming unfinished batch {} on {}", claim.id, claim.chain);
                claim
            }
            None => {
                let chain = self.service.select_chain(self.priority)?.id().to_string();
                match self.store.claim_batch(&chain, limit, self.lease).await? {
                    Some(claim) => claim,
                    None => {
                        debug!("No pending records to anchor");
                        return Ok(BatchOutcome::NothingPending);
                    }
                }
            }
        };

        let records = self.ledger.claimed_records(&claim.id).await?;
        let hashes: Vec<String> = records.iter().map(|r| r.hash.clone()).collect();
        let tree = build_tree(&hashes).ok_or_else(|| {
            LedgerError::ValidationError(format!("batch {} holds no records", claim.id))
        })?;
        let root = tree.root().to_string();
        info!(
            "Anchoring batch {} of {} records with Merkle root {}",
            claim.id,
            records.len(),
            root
        );

        let on_chain = if claim.resumed {
            match self.service.find_anchor(&claim.chain, &root).await {
                Ok(found) => found,
                Err(e) if e.is_retryable() => {
                    warn!("Cannot look up root {} on {}: {}", root, claim.chain, e);
                    return self.defer(&claim, records.len(), e.to_string()).await;
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let recovered = on_chain.is_some();
        let receipt = match on_chain {
            Some(receipt) => {
                info!(
                    "Root {} already carried by tx {} on {}, not resubmitting",
                    root, receipt.tx_hash, claim.chain
                );
                receipt
            }
            None => match self.submit(&claim, &records, &root).await? {
                Ok(receipt) => receipt,
                Err(outcome) => return Ok(outcome),
            },
        };

        let status = match self
            .service
            .verify_anchor(&claim.chain, &receipt.tx_hash, &root)
            .await
        {
            Some(true) => AnchorState::Confirmed,
            Some(false) => AnchorState::Rejected,
            None => AnchorState::Submitted,
        };

        let now = truncate_to_millis(Utc::now());
        let anchor = TransparencyAnchor {
            id: claim.id.clone(),
            chain: claim.chain.clone(),
            merkle_root: root.clone(),
            record_count: u32::try_from(records.len()).unwrap_or(u32::MAX),
            first_record_id: records[0].id.clone(),
            last_record_id: records[records.len() - 1].id.clone(),
            tx_hash: receipt.tx_hash.clone(),
            block_number: receipt.block_number,
            cost: receipt.cost,
            status,
            created_at: now,
            confirmed_at: (status == AnchorState::Confirmed).then_some(now),
        };

        if status == AnchorState::Rejected {
            error!(
                "Chain {} reports different content for tx {} (expected root {})",
                claim.chain, receipt.tx_hash, root
            );
            let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
            let mut tx = self.ledger.pool().begin().await?;
            if !AnchorStore::close_batch(&mut tx, &claim).await? {
                tx.rollback().await?;
                return Ok(lost_lease(&claim, records.len()));
            }
            AnchorStore::insert_anchor(&mut tx, &anchor).await?;
            RecordLedger::mark_failed(&mut tx, &ids).await?;
            tx.commit().await?;

            return Ok(BatchOutcome::Rejected {
                record_count: records.len(),
                chain: claim.chain,
                reason: format!("tx {} does not carry root {}", receipt.tx_hash, root),
            });
        }

        self.commit_batch(&claim, &records, &tree, anchor, recovered)
            .await
    }

    /// Submit the root. The inner `Err` is the outcome to report when the
    /// chain did not take it.
    async fn submit(
        &self,
        claim: &BatchClaim,
        records: &[TransparencyRecord],
        root: &str,
    ) -> Result<std::result::Result<AnchorReceipt, BatchOutcome>> {
        let result = self.service.anchor(&claim.chain, root).await?;

        if !result.success {
            let reason = result
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown chain failure".to_string());

            if result.is_retryable() {
                warn!(
                    "Anchoring on {} deferred after {} attempts: {}",
                    claim.chain, result.attempts, reason
                );
                return self.defer(claim, records.len(), reason).await.map(Err);
            }

            error!(
                "Chain {} rejected root {} for {} records: {}",
                claim.chain,
                root,
                records.len(),
                reason
            );
            let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
            let mut tx = self.ledger.pool().begin().await?;
            if !AnchorStore::close_batch(&mut tx, claim).await? {
                tx.rollback().await?;
                return Ok(Err(lost_lease(claim, records.len())));
            }
            RecordLedger::mark_failed(&mut tx, &ids).await?;
            tx.commit().await?;

            return Ok(Err(BatchOutcome::Rejected {
                record_count: records.len(),
                chain: claim.chain.clone(),
                reason,
            }));
        }

        let tx_hash = result.tx_hash.ok_or_else(|| {
            LedgerError::ChainUnavailable(format!("{} returned no transaction hash", claim.chain))
        })?;
        Ok(Ok(AnchorReceipt {
            tx_hash,
            block_number: result.block_number,
            cost: result.cost,
        }))
    }

    async fn defer(
        &self,
        claim: &BatchClaim,
        record_count: usize,
        reason: String,
    ) -> Result<BatchOutcome> {
        self.store.release_batch(claim).await?;
        Ok(BatchOutcome::Deferred {
            record_count,
            reason,
        })
    }

    /// Record the anchor, flip the batch to anchored, then attach proofs
    async fn commit_batch(
        &self,
        claim: &BatchClaim,
        records: &[TransparencyRecord],
        tree: &MerkleTree,
        anchor: TransparencyAnchor,
        recovered: bool,
    ) -> Result<BatchOutcome> {
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        let anchored_at = truncate_to_millis(Utc::now());

        let mut tx = self.ledger.pool().begin().await?;
        if !AnchorStore::close_batch(&mut tx, claim).await? {
            tx.rollback().await?;
            warn!(
                "Tx {} on {} left unrecorded for batch {}",
                anchor.tx_hash, anchor.chain, claim.id
            );
            return Ok(lost_lease(claim, records.len()));
        }
        AnchorStore::insert_anchor(&mut tx, &anchor).await?;
        let moved =
            RecordLedger::mark_anchored(&mut tx, &ids, &anchor.chain, &anchor.tx_hash, anchored_at)
                .await?;
        if moved as usize != records.len() {
            tx.rollback().await?;
            error!(
                "Batch {} holds {} records but only {} are still pending",
                claim.id,
                records.len(),
                moved
            );
            return Err(LedgerError::ValidationError(format!(
                "batch {} holds records that are no longer pending",
                claim.id
            )));
        }
        tx.commit().await?;

        let mut proofs_generated = 0;
        let mut proof_failures = 0;
        for (index, record) in records.iter().enumerate() {
            match self.store_proof(tree, index, record, &anchor).await {
                Ok(true) => proofs_generated += 1,
                Ok(false) => debug!("Proof for record {} already stored", record.id),
                Err(e) => {
                    proof_failures += 1;
                    warn!("{}; will retry on a later run", e);
                }
            }
        }

        info!(
            "Anchor {} on {} covers {} records (tx {}, {} proofs)",
            anchor.id,
            anchor.chain,
            records.len(),
            anchor.tx_hash,
            proofs_generated
        );

        Ok(BatchOutcome::Anchored(BatchReport {
            anchor_id: anchor.id,
            chain: anchor.chain,
            merkle_root: anchor.merkle_root,
            tx_hash: anchor.tx_hash,
            record_count: records.len(),
            proofs_generated,
            proof_failures,
            confirmed: anchor.status == AnchorState::Confirmed,
            recovered_from_chain: recovered,
        }))
    }

    /// Returns whether a new proof row was written
    async fn store_proof(
        &self,
        tree: &MerkleTree,
        index: usize,
        record: &TransparencyRecord,
        anchor: &TransparencyAnchor,
    ) -> Result<bool> {
        let proof = checked_proof(tree, index, record)?;
        if proof.root != anchor.merkle_root {
            return Err(LedgerError::ProofGeneration {
                record_id: record.id.clone(),
                reason: format!(
                    "tree root {} differs from anchored root {}",
                    proof.root, anchor.merkle_root
                ),
            });
        }
        self.store.insert_proof(&record.id, anchor, &proof).await
    }

    /// Rebuild proofs for anchored records whose proof row never got written
    pub async fn regenerate_missing_proofs(&self) -> Result<usize> {
        let mut generated = 0;

        for anchor in self.store.anchors_missing_proofs().await? {
            let records = self
                .ledger
                .records_for_anchor(&anchor.chain, &anchor.tx_hash)
                .await?;
            let hashes: Vec<String> = records.iter().map(|r| r.hash.clone()).collect();

            let tree = match build_tree(&hashes) {
                Some(tree) if tree.root() == anchor.merkle_root => tree,
                _ => {
                    error!(
                        "Records of anchor {} no longer reproduce root {}",
                        anchor.id, anchor.merkle_root
                    );
                    continue;
                }
            };

            for (index, record) in records.iter().enumerate() {
                if self.store.get_proof_for_record(&record.id).await?.is_some() {
                    continue;
                }
                match self.store_proof(&tree, index, record, &anchor).await {
                    Ok(true) => generated += 1,
                    Ok(false) => {}
                    Err(e) => warn!("{}", e),
                }
            }
        }

        Ok(generated)
    }

    /// Ask the chain again about anchors it could not answer for at submit time
    pub async fn confirm_submitted_anchors(&self) -> Result<ConfirmationReport> {
        let _guard = self.run_lock.lock().await;
        let mut report = ConfirmationReport::default();

        for anchor in self.store.anchors_with_status(AnchorState::Submitted).await? {
            match self
                .service
                .verify_anchor(&anchor.chain, &anchor.tx_hash, &anchor.merkle_root)
                .await
            {
                Some(true) => {
                    self.store
                        .set_anchor_status(
                            &anchor.id,
                            AnchorState::Confirmed,
                            Some(truncate_to_millis(Utc::now())),
                        )
                        .await?;
                    info!("Anchor {} confirmed on {}", anchor.id, anchor.chain);
                    report.confirmed += 1;
                }
                Some(false) => {
                    self.store
                        .set_anchor_status(&anchor.id, AnchorState::Rejected, None)
                        .await?;
                    let failed = self
                        .ledger
                        .mark_anchor_failed(&anchor.chain, &anchor.tx_hash)
                        .await?;
                    error!(
                        "Chain {} does not carry root {} for tx {}; {} records marked failed",
                        anchor.chain, anchor.merkle_root, anchor.tx_hash, failed
                    );
                    report.rejected += 1;
                }
                None => report.still_submitted += 1,
            }
        }

        Ok(report)
    }
}

fn lost_lease(claim: &BatchClaim, record_count: usize) -> BatchOutcome {
    warn!("Lease on batch {} passed to another run", claim.id);
    BatchOutcome::Deferred {
        record_count,
        reason: format!("lease on batch {} expired before commit", claim.id),
    }
}

fn checked_proof(
    tree: &MerkleTree,
    index: usize,
    record: &TransparencyRecord,
) -> Result<MerkleProof> {
    let proof = tree.proof(index).ok_or_else(|| LedgerError::ProofGeneration {
        record_id: record.id.clone(),
        reason: format!("leaf {} outside a tree of {}", index, tree.leaf_count()),
    })?;

    if proof.leaf_hash != record.hash || !proof.verify() {
        return Err(LedgerError::ProofGeneration {
            record_id: record.id.clone(),
            reason: "proof does not fold back to the batch root".to_string(),
        });
    }
    Ok(proof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::provider::ChainProvider;
    use crate::anchor::service::RetryPolicy;
    use crate::anchor::simulated::SimulatedChainProvider;
    use crate::database::Database;
    use crate::ledger::{AnchorStatus, EntityType, RecordMetadata, RecordType};
    use crate::merkle;

    struct Harness {
        db: Database,
        ledger: RecordLedger,
        batcher: AnchorBatcher,
        chain: Arc<SimulatedChainProvider>,
    }

    fn batcher_for(db: &Database, chain: Arc<SimulatedChainProvider>) -> AnchorBatcher {
        let service = AnchorService::new(
            "polygon",
            RetryPolicy {
                timeout: Duration::from_millis(200),
                max_retries: 1,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
        )
        .with_provider(chain);

        AnchorBatcher::new(
            RecordLedger::new(db),
            AnchorStore::new(db),
            Arc::new(service),
            AnchorPriority::Balanced,
        )
    }

    async fn harness() -> Harness {
        let db = Database::new_in_memory().await.unwrap();
        let chain = Arc::new(SimulatedChainProvider::for_chain("polygon"));
        Harness {
            ledger: RecordLedger::new(&db),
            batcher: batcher_for(&db, chain.clone()),
            chain,
            db,
        }
    }

    async fn append_records(ledger: &RecordLedger, count: usize) -> Vec<String> {
        let mut hashes = Vec::new();
        for i in 0..count {
            let appended = ledger
                .append(
                    RecordType::Impact,
                    EntityType::Watershed,
                    &format!("ws-{}", i),
                    None,
                    RecordMetadata::empty(),
                )
                .await
                .unwrap();
            hashes.push(appended.hash);
        }
        hashes
    }

    fn report(outcome: BatchOutcome) -> BatchReport {
        match outcome {
            BatchOutcome::Anchored(report) => report,
            other => panic!("expected an anchored batch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nothing_pending() {
        let h = harness().await;
        assert_eq!(
            h.batcher.anchor_pending_records(10).await.unwrap(),
            BatchOutcome::NothingPending
        );
        assert_eq!(h.chain.transaction_count(), 0);
    }

    #[tokio::test]
    async fn test_anchor_batch_is_idempotent() {
        let h = harness().await;
        append_records(&h.ledger, 3).await;

        let first = report(h.batcher.anchor_pending_records(10).await.unwrap());
        assert_eq!(first.record_count, 3);
        assert_eq!(first.proofs_generated, 3);
        assert!(first.confirmed);
        assert!(!first.recovered_from_chain);

        assert_eq!(
            h.batcher.anchor_pending_records(10).await.unwrap(),
            BatchOutcome::NothingPending
        );
        assert_eq!(h.chain.transaction_count(), 1);
        assert_eq!(h.batcher.store().count_anchors().await.unwrap(), 1);
        assert_eq!(h.batcher.store().count_proofs().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_limited_batches_are_disjoint_and_fifo() {
        let h = harness().await;
        let hashes = append_records(&h.ledger, 5).await;

        let first = report(h.batcher.anchor_pending_records(2).await.unwrap());
        let second = report(h.batcher.anchor_pending_records(2).await.unwrap());
        let third = report(h.batcher.anchor_pending_records(2).await.unwrap());
        assert_eq!(
            (first.record_count, second.record_count, third.record_count),
            (2, 2, 1)
        );

        let oldest = h.ledger.get_by_hash(&hashes[0]).await.unwrap();
        assert_eq!(oldest.anchor_tx_hash.as_deref(), Some(first.tx_hash.as_str()));
        let newest = h.ledger.get_by_hash(&hashes[4]).await.unwrap();
        assert_eq!(newest.anchor_tx_hash.as_deref(), Some(third.tx_hash.as_str()));

        assert_eq!(h.ledger.count_with_status(AnchorStatus::Anchored).await.unwrap(), 5);
        assert_eq!(h.batcher.store().count_anchors().await.unwrap(), 3);
        assert_eq!(h.batcher.store().count_proofs().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_outage_leaves_records_pending() {
        let h = harness().await;
        append_records(&h.ledger, 2).await;
        h.chain.set_healthy(false);

        let outcome = h.batcher.anchor_pending_records(10).await.unwrap();
        assert!(matches!(outcome, BatchOutcome::Deferred { record_count: 2, .. }));
        assert_eq!(h.ledger.count_with_status(AnchorStatus::Pending).await.unwrap(), 2);
        assert_eq!(h.batcher.store().count_anchors().await.unwrap(), 0);
        assert_eq!(h.batcher.store().count_open_batches().await.unwrap(), 1);

        h.chain.set_healthy(true);
        let retried = report(h.batcher.anchor_pending_records(10).await.unwrap());
        assert_eq!(retried.record_count, 2);
        assert!(!retried.recovered_from_chain);
        assert_eq!(h.chain.transaction_count(), 1);
        assert_eq!(h.batcher.store().count_open_batches().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_batchers_claim_disjoint_records() {
        let h = harness().await;
        append_records(&h.ledger, 3).await;
        h.chain.set_latency(Duration::from_millis(50));
        let other = batcher_for(&h.db, h.chain.clone());

        let (a, b) = tokio::join!(
            h.batcher.anchor_pending_records(10),
            other.anchor_pending_records(10)
        );
        let outcomes = [a.unwrap(), b.unwrap()];

        let anchored: Vec<&BatchReport> = outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                BatchOutcome::Anchored(report) => Some(report),
                _ => None,
            })
            .collect();
        assert_eq!(anchored.len(), 1);
        assert_eq!(anchored[0].record_count, 3);
        assert_eq!(anchored[0].proofs_generated, 3);
        assert!(outcomes.contains(&BatchOutcome::NothingPending));

        assert_eq!(h.chain.transaction_count(), 1);
        assert_eq!(h.batcher.store().count_anchors().await.unwrap(), 1);
        assert_eq!(h.batcher.store().count_proofs().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_live_batch_is_not_taken_over() {
        let h = harness().await;
        append_records(&h.ledger, 2).await;
        let claim = h
            .batcher
            .store()
            .claim_batch("polygon", 10, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(h.ledger.claimed_records(&claim.id).await.unwrap().len(), 2);

        assert_eq!(
            h.batcher.anchor_pending_records(10).await.unwrap(),
            BatchOutcome::NothingPending
        );
        assert_eq!(h.chain.transaction_count(), 0);
        assert_eq!(h.ledger.count_with_status(AnchorStatus::Pending).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_interrupted_batch_reuses_root_already_on_chain() {
        let h = harness().await;
        let hashes = append_records(&h.ledger, 3).await;
        let batcher = h.batcher.clone().with_lease(Duration::ZERO);

        // the chain write lands but the run dies before recording it
        let claim = batcher
            .store()
            .claim_batch("polygon", 10, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let root = merkle::root(&hashes).unwrap();
        let landed = h.chain.anchor(&root).await.unwrap();

        let batch = report(batcher.anchor_pending_records(10).await.unwrap());
        assert!(batch.recovered_from_chain);
        assert_eq!(batch.anchor_id, claim.id);
        assert_eq!(batch.tx_hash, landed.tx_hash);
        assert_eq!(batch.record_count, 3);
        assert!(batch.confirmed);

        assert_eq!(h.chain.transaction_count(), 1);
        assert_eq!(h.ledger.count_with_status(AnchorStatus::Anchored).await.unwrap(), 3);
        assert_eq!(h.batcher.store().count_proofs().await.unwrap(), 3);
        assert_eq!(h.batcher.store().count_open_batches().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_interrupted_batch_without_chain_write_is_submitted() {
        let h = harness().await;
        append_records(&h.ledger, 2).await;
        let batcher = h.batcher.clone().with_lease(Duration::ZERO);
        batcher
            .store()
            .claim_batch("polygon", 10, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let batch = report(batcher.anchor_pending_records(10).await.unwrap());
        assert!(!batch.recovered_from_chain);
        assert_eq!(batch.record_count, 2);
        assert_eq!(h.chain.transaction_count(), 1);
    }

    #[tokio::test]
    async fn test_rejection_marks_records_failed() {
        let h = harness().await;
        append_records(&h.ledger, 2).await;
        h.chain.reject_submissions(true);

        let outcome = h.batcher.anchor_pending_records(10).await.unwrap();
        assert!(matches!(outcome, BatchOutcome::Rejected { record_count: 2, .. }));
        assert_eq!(h.ledger.count_with_status(AnchorStatus::Failed).await.unwrap(), 2);
        assert_eq!(
            h.batcher.anchor_pending_records(10).await.unwrap(),
            BatchOutcome::NothingPending
        );
    }

    #[tokio::test]
    async fn test_missing_proofs_are_regenerated() {
        let h = harness().await;
        let hashes = append_records(&h.ledger, 3).await;
        report(h.batcher.anchor_pending_records(10).await.unwrap());

        let record = h.ledger.get_by_hash(&hashes[1]).await.unwrap();
        h.batcher.store().delete_proof_for_test(&record.id).await.unwrap();
        assert_eq!(h.batcher.store().count_proofs().await.unwrap(), 2);

        assert_eq!(
            h.batcher.anchor_pending_records(10).await.unwrap(),
            BatchOutcome::NothingPending
        );
        let proof = h
            .batcher
            .store()
            .get_proof_for_record(&record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(proof.proof.leaf_hash, record.hash);
        assert_eq!(proof.proof.index, 1);
        assert!(proof.proof.verify());
    }

    #[tokio::test]
    async fn test_unconfirmed_anchor_is_confirmed_later() {
        let h = harness().await;
        append_records(&h.ledger, 2).await;
        h.chain.fail_verifications(true);

        let batch = report(h.batcher.anchor_pending_records(10).await.unwrap());
        assert!(!batch.confirmed);
        assert_eq!(h.ledger.count_with_status(AnchorStatus::Anchored).await.unwrap(), 2);

        let report = h.batcher.confirm_submitted_anchors().await.unwrap();
        assert_eq!(report.still_submitted, 1);

        h.chain.fail_verifications(false);
        let report = h.batcher.confirm_submitted_anchors().await.unwrap();
        assert_eq!(report.confirmed, 1);
        let anchor = h.batcher.store().get_anchor(&batch.anchor_id).await.unwrap().unwrap();
        assert_eq!(anchor.status, AnchorState::Confirmed);
        assert!(anchor.confirmed_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_tx_stays_submitted() {
        let h = harness().await;
        let hashes = append_records(&h.ledger, 3).await;
        h.chain.fail_verifications(true);
        let batch = report(h.batcher.anchor_pending_records(10).await.unwrap());

        // a restarted chain has no record of the earlier transaction
        let restarted = batcher_for(&h.db, Arc::new(SimulatedChainProvider::for_chain("polygon")));
        let confirmation = restarted.confirm_submitted_anchors().await.unwrap();
        assert_eq!(
            confirmation,
            ConfirmationReport {
                confirmed: 0,
                rejected: 0,
                still_submitted: 1,
            }
        );

        assert_eq!(h.ledger.count_with_status(AnchorStatus::Failed).await.unwrap(), 0);
        assert_eq!(h.ledger.count_with_status(AnchorStatus::Anchored).await.unwrap(), 3);
        let anchor = h.batcher.store().get_anchor(&batch.anchor_id).await.unwrap().unwrap();
        assert_eq!(anchor.status, AnchorState::Submitted);
        let record = h.ledger.get_by_hash(&hashes[0]).await.unwrap();
        assert_eq!(record.anchor_status, AnchorStatus::Anchored);
    }

    #[tokio::test]
    async fn test_contradicted_anchor_fails_its_records() {
        let h = harness().await;
        append_records(&h.ledger, 2).await;
        h.chain.fail_verifications(true);
        let batch = report(h.batcher.anchor_pending_records(10).await.unwrap());

        h.chain.overwrite_transaction(&batch.tx_hash, "not-the-root");
        h.chain.fail_verifications(false);

        let report = h.batcher.confirm_submitted_anchors().await.unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(h.ledger.count_with_status(AnchorStatus::Failed).await.unwrap(), 2);
        let anchor = h.batcher.store().get_anchor_by_tx(&batch.tx_hash).await.unwrap().unwrap();
        assert_eq!(anchor.status, AnchorState::Rejected);
    }
}
