//! Persistence for batch anchors and per-record inclusion proofs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::database::models::{AnchorState, TransparencyAnchor, TransparencyProof};
use crate::database::Database;
use crate::error::Result;
use crate::hashing::canonical_timestamp;
use crate::merkle::MerkleProof;

const ANCHOR_COLUMNS: &str = "id, chain, merkle_root, record_count, first_record_id, \
     last_record_id, tx_hash, block_number, cost, status, created_at, confirmed_at";

const PROOF_COLUMNS: &str = "id, record_id, record_hash, anchor_id, anchor_tx_hash, \
     merkle_root, leaf_index, proof_path, created_at";

/// Pending records held by one anchoring run until its anchor is committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchClaim {
    pub id: String,
    pub chain: String,
    pub lease_token: String,
    /// Taken over from a run whose lease expired
    pub resumed: bool,
}

fn lease_deadline(lease: Duration) -> String {
    let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(1));
    canonical_timestamp(&(Utc::now() + lease))
}

#[derive(Clone)]
pub struct AnchorStore {
    pool: SqlitePool,
}

impl AnchorStore {
    pub fn new(database: &Database) -> Self {
        Self {
            pool: database.pool().clone(),
        }
    }

    pub(crate) async fn insert_anchor(
        conn: &mut SqliteConnection,
        anchor: &TransparencyAnchor,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transparency_anchors
            (id, chain, merkle_root, record_count, first_record_id, last_record_id,
             tx_hash, block_number, cost, status, created_at, confirmed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&anchor.id)
        .bind(&anchor.chain)
        .bind(&anchor.merkle_root)
        .bind(i64::from(anchor.record_count))
        .bind(&anchor.first_record_id)
        .bind(&anchor.last_record_id)
        .bind(&anchor.tx_hash)
        .bind(anchor.block_number.map(|b| b as i64))
        .bind(anchor.cost)
        .bind(anchor.status.as_str())
        .bind(canonical_timestamp(&anchor.created_at))
        .bind(anchor.confirmed_at.as_ref().map(canonical_timestamp))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn get_anchor(&self, id: &str) -> Result<Option<TransparencyAnchor>> {
        let sql = format!("SELECT {} FROM transparency_anchors WHERE id = ?", ANCHOR_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(TransparencyAnchor::from_row).transpose()
    }

    pub async fn get_anchor_by_tx(&self, tx_hash: &str) -> Result<Option<TransparencyAnchor>> {
        let sql = format!(
            "SELECT {} FROM transparency_anchors WHERE tx_hash = ?",
            ANCHOR_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(tx_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(TransparencyAnchor::from_row).transpose()
    }

    pub async fn anchors_with_status(&self, status: AnchorState) -> Result<Vec<TransparencyAnchor>> {
        let sql = format!(
            "SELECT {} FROM transparency_anchors WHERE status = ? ORDER BY created_at ASC",
            ANCHOR_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(TransparencyAnchor::from_row).collect()
    }

    /// Newest first
    pub async fn list_anchors(&self, limit: u32) -> Result<Vec<TransparencyAnchor>> {
        let sql = format!(
            "SELECT {} FROM transparency_anchors ORDER BY created_at DESC LIMIT ?",
            ANCHOR_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(TransparencyAnchor::from_row).collect()
    }

    pub async fn count_anchors(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transparency_anchors")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn set_anchor_status(
        &self,
        anchor_id: &str,
        status: AnchorState,
        confirmed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query("UPDATE transparency_anchors SET status = ?, confirmed_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(confirmed_at.as_ref().map(canonical_timestamp))
            .bind(anchor_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Store a proof unless the record already has one. Returns whether a row was written.
    pub async fn insert_proof(
        &self,
        record_id: &str,
        anchor: &TransparencyAnchor,
        proof: &MerkleProof,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO transparency_proofs
            (id, record_id, record_hash, anchor_id, anchor_tx_hash, merkle_root,
             leaf_index, proof_path, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(record_id)
        .bind(&proof.leaf_hash)
        .bind(&anchor.id)
        .bind(&anchor.tx_hash)
        .bind(&proof.root)
        .bind(proof.index as i64)
        .bind(serde_json::to_string(&proof.siblings)?)
        .bind(canonical_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get_proof_for_record(&self, record_id: &str) -> Result<Option<TransparencyProof>> {
        let sql = format!(
            "SELECT {} FROM transparency_proofs WHERE record_id = ?",
            PROOF_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(TransparencyProof::from_row).transpose()
    }

    pub async fn count_proofs(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transparency_proofs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Anchors that still have anchored records without a stored proof
    pub async fn anchors_missing_proofs(&self) -> Result<Vec<TransparencyAnchor>> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.chain, a.merkle_root, a.record_count, a.first_record_id,
                   a.last_record_id, a.tx_hash, a.block_number, a.cost, a.status,
                   a.created_at, a.confirmed_at
            FROM transparency_anchors a
            WHERE a.status != 'rejected' AND EXISTS (
                SELECT 1 FROM transparency_records r
                LEFT JOIN transparency_proofs p ON p.record_id = r.id
                WHERE r.anchor_chain = a.chain AND r.anchor_tx_hash = a.tx_hash
                  AND r.anchor_status = 'anchored' AND p.id IS NULL)
            ORDER BY a.created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(TransparencyAnchor::from_row).collect()
    }

    /// Claim up to `limit` of the oldest pending records that no open batch
    /// holds yet. `None` when there is nothing to claim.
    pub(crate) async fn claim_batch(
        &self,
        chain: &str,
        limit: u32,
        lease: Duration,
    ) -> Result<Option<BatchClaim>> {
        let claim = BatchClaim {
            id: Uuid::new_v4().to_string(),
            chain: chain.to_string(),
            lease_token: Uuid::new_v4().to_string(),
            resumed: false,
        };

        // the first statement writes, so concurrent claimers queue on the write lock
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO anchor_batches (id, chain, lease_token, lease_expires_at, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&claim.id)
        .bind(&claim.chain)
        .bind(&claim.lease_token)
        .bind(lease_deadline(lease))
        .bind(canonical_timestamp(&Utc::now()))
        .execute(&mut *tx)
        .await?;

        let claimed = sqlx::query(
            r#"
            INSERT INTO anchor_batch_records (record_id, batch_id)
            SELECT r.id, ? FROM transparency_records r
            WHERE r.anchor_status = 'pending'
              AND NOT EXISTS (SELECT 1 FROM anchor_batch_records c WHERE c.record_id = r.id)
            ORDER BY r.seq ASC
            LIMIT ?
            "#,
        )
        .bind(&claim.id)
        .bind(i64::from(limit))
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }
        tx.commit().await?;
        Ok(Some(claim))
    }

    /// Take over the oldest open batch whose lease has run out
    pub(crate) async fn take_over_expired_batch(&self, lease: Duration) -> Result<Option<BatchClaim>> {
        let token = Uuid::new_v4().to_string();
        let now = canonical_timestamp(&Utc::now());

        let taken = sqlx::query(
            r#"
            UPDATE anchor_batches SET lease_token = ?, lease_expires_at = ?
            WHERE id = (SELECT id FROM anchor_batches WHERE lease_expires_at <= ?
                        ORDER BY created_at ASC LIMIT 1)
              AND lease_expires_at <= ?
            "#,
        )
        .bind(&token)
        .bind(lease_deadline(lease))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if taken.rows_affected() == 0 {
            return Ok(None);
        }

        let row = sqlx::query("SELECT id, chain FROM anchor_batches WHERE lease_token = ?")
            .bind(&token)
            .fetch_one(&self.pool)
            .await?;
        Ok(Some(BatchClaim {
            id: row.try_get("id")?,
            chain: row.try_get("chain")?,
            lease_token: token,
            resumed: true,
        }))
    }

    /// Give the batch up so the next run resumes it straight away
    pub(crate) async fn release_batch(&self, claim: &BatchClaim) -> Result<()> {
        sqlx::query(
            "UPDATE anchor_batches SET lease_expires_at = ? WHERE id = ? AND lease_token = ?",
        )
        .bind(canonical_timestamp(&Utc::now()))
        .bind(&claim.id)
        .bind(&claim.lease_token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop a finished batch and its record claims. Returns `false` when the
    /// lease was lost to another run, in which case nothing is deleted.
    pub(crate) async fn close_batch(conn: &mut SqliteConnection, claim: &BatchClaim) -> Result<bool> {
        let closed = sqlx::query("DELETE FROM anchor_batches WHERE id = ? AND lease_token = ?")
            .bind(&claim.id)
            .bind(&claim.lease_token)
            .execute(&mut *conn)
            .await?;
        if closed.rows_affected() != 1 {
            return Ok(false);
        }

        sqlx::query("DELETE FROM anchor_batch_records WHERE batch_id = ?")
            .bind(&claim.id)
            .execute(&mut *conn)
            .await?;
        Ok(true)
    }

    pub async fn count_open_batches(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM anchor_batches")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Delete a stored proof. Only used to simulate a lost proof write.
    #[cfg(test)]
    pub(crate) async fn delete_proof_for_test(&self, record_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM transparency_proofs WHERE record_id = ?")
            .bind(record_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
