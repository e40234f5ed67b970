//! Record Ledger
//!
//! Append-only, hash-chained store of transparency records. Every record
//! links to the hash of the record appended immediately before it, across
//! all entity types.
//!
//! The chain tail lives in the single-row `ledger_tail` table. An append
//! reads the tail, inserts the new record and advances the tail with a
//! compare-and-swap, all in one transaction; losing the swap rolls back and
//! retries, so two appends can never share a previous hash.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::database::{is_busy, Database};
use crate::error::{LedgerError, Result};
use crate::hashing::{canonical_timestamp, truncate_to_millis};
use crate::ledger::record::{
    AnchorStatus, EntityType, RecordContent, RecordMetadata, RecordType, TransparencyRecord,
};

const MAX_APPEND_ATTEMPTS: u32 = 5;

const RECORD_COLUMNS: &str = "id, record_type, entity_type, entity_id, amount, metadata, hash, \
     previous_hash, anchor_status, anchor_tx_hash, anchor_chain, anchored_at, created_at";

/// Identity of a freshly appended record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendedRecord {
    pub id: String,
    pub hash: String,
}

/// Aggregate view over the whole ledger
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total_records: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_status: BTreeMap<String, u64>,
    pub tail_hash: Option<String>,
}

#[derive(Clone)]
pub struct RecordLedger {
    pool: SqlitePool,
    append_lock: Arc<Mutex<()>>,
}

impl RecordLedger {
    pub fn new(database: &Database) -> Self {
        Self {
            pool: database.pool().clone(),
            append_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Append a record at the tail of the chain
    pub async fn append(
        &self,
        record_type: RecordType,
        entity_type: EntityType,
        entity_id: &str,
        amount: Option<f64>,
        metadata: RecordMetadata,
    ) -> Result<AppendedRecord> {
        if entity_id.trim().is_empty() {
            return Err(LedgerError::ValidationError(
                "entity_id must not be empty".to_string(),
            ));
        }
        if let Some(typed) = metadata.record_type() {
            if typed != record_type {
                return Err(LedgerError::ValidationError(format!(
                    "{} metadata supplied for a {} record",
                    typed, record_type
                )));
            }
        }
        let metadata = metadata.to_map()?;

        let _guard = self.append_lock.lock().await;

        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            match self
                .try_append(record_type, entity_type, entity_id, amount, &metadata)
                .await
            {
                Ok(appended) => {
                    debug!(
                        "Appended {} record {} for {}:{}",
                        record_type, appended.id, entity_type, entity_id
                    );
                    return Ok(appended);
                }
                Err(LedgerError::TailConflict(reason)) => {
                    warn!(
                        "Ledger tail moved during append (attempt {}/{}): {}",
                        attempt, MAX_APPEND_ATTEMPTS, reason
                    );
                    tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(LedgerError::TailConflict(format!(
            "gave up after {} attempts",
            MAX_APPEND_ATTEMPTS
        )))
    }

    async fn try_append(
        &self,
        record_type: RecordType,
        entity_type: EntityType,
        entity_id: &str,
        amount: Option<f64>,
        metadata: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<AppendedRecord> {
        let mut tx = self.pool.begin().await.map_err(contention)?;

        let tail: Option<String> =
            sqlx::query_scalar("SELECT tail_hash FROM ledger_tail WHERE id = 1")
                .fetch_one(&mut *tx)
                .await
                .map_err(contention)?;

        let created_at = truncate_to_millis(Utc::now());
        let content = RecordContent {
            record_type,
            entity_type,
            entity_id,
            amount,
            metadata,
            previous_hash: tail.as_deref(),
            created_at,
        };
        let hash = content.calculate_hash()?;
        let id = Uuid::new_v4().to_string();
        let created_at = canonical_timestamp(&created_at);

        let swapped = sqlx::query(
            r#"
            UPDATE ledger_tail
            SET tail_hash = ?, record_count = record_count + 1, updated_at = ?
            WHERE id = 1 AND tail_hash IS ?
            "#,
        )
        .bind(&hash)
        .bind(&created_at)
        .bind(tail.as_deref())
        .execute(&mut *tx)
        .await
        .map_err(contention)?;

        if swapped.rows_affected() != 1 {
            tx.rollback().await.map_err(contention)?;
            return Err(LedgerError::TailConflict(format!(
                "expected tail {:?}",
                tail
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO transparency_records
            (id, record_type, entity_type, entity_id, amount, metadata, hash,
             previous_hash, anchor_status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(&id)
        .bind(record_type.as_str())
        .bind(entity_type.as_str())
        .bind(entity_id)
        .bind(amount)
        .bind(serde_json::to_string(metadata)?)
        .bind(&hash)
        .bind(tail.as_deref())
        .bind(&created_at)
        .execute(&mut *tx)
        .await
        .map_err(contention)?;

        tx.commit().await.map_err(contention)?;

        Ok(AppendedRecord { id, hash })
    }

    pub async fn get_by_hash(&self, hash: &str) -> Result<TransparencyRecord> {
        let sql = format!(
            "SELECT {} FROM transparency_records WHERE hash = ?",
            RECORD_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => TransparencyRecord::from_row(&row),
            None => Err(LedgerError::record_not_found(hash)),
        }
    }

    pub async fn get_by_id(&self, id: &str) -> Result<TransparencyRecord> {
        let sql = format!(
            "SELECT {} FROM transparency_records WHERE id = ?",
            RECORD_COLUMNS
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;

        match row {
            Some(row) => TransparencyRecord::from_row(&row),
            None => Err(LedgerError::NotFound(format!("record {}", id))),
        }
    }

    /// Records about one entity, newest first
    pub async fn get_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<TransparencyRecord>> {
        let sql = format!(
            "SELECT {} FROM transparency_records \
             WHERE entity_type = ? AND entity_id = ? ORDER BY seq DESC",
            RECORD_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(entity_type.as_str())
            .bind(entity_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(TransparencyRecord::from_row).collect()
    }

    /// Most recent records across the whole ledger, newest first
    pub async fn recent(&self, limit: u32) -> Result<Vec<TransparencyRecord>> {
        let sql = format!(
            "SELECT {} FROM transparency_records ORDER BY seq DESC LIMIT ?",
            RECORD_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(TransparencyRecord::from_row).collect()
    }

    /// Oldest pending records first
    pub async fn pending(&self, limit: u32) -> Result<Vec<TransparencyRecord>> {
        let sql = format!(
            "SELECT {} FROM transparency_records \
             WHERE anchor_status = 'pending' ORDER BY seq ASC LIMIT ?",
            RECORD_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(TransparencyRecord::from_row).collect()
    }

    /// Records held by an open anchoring batch, in creation order
    pub(crate) async fn claimed_records(&self, batch_id: &str) -> Result<Vec<TransparencyRecord>> {
        let sql = format!(
            "SELECT {} FROM transparency_records \
             WHERE id IN (SELECT record_id FROM anchor_batch_records WHERE batch_id = ?) \
             ORDER BY seq ASC",
            RECORD_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(batch_id).fetch_all(&self.pool).await?;

        rows.iter().map(TransparencyRecord::from_row).collect()
    }

    /// Records anchored by one transaction, in creation order
    pub async fn records_for_anchor(
        &self,
        chain: &str,
        tx_hash: &str,
    ) -> Result<Vec<TransparencyRecord>> {
        let sql = format!(
            "SELECT {} FROM transparency_records \
             WHERE anchor_chain = ? AND anchor_tx_hash = ? ORDER BY seq ASC",
            RECORD_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(chain)
            .bind(tx_hash)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(TransparencyRecord::from_row).collect()
    }

    /// Every record in creation order
    pub async fn all_in_order(&self) -> Result<Vec<TransparencyRecord>> {
        let sql = format!(
            "SELECT {} FROM transparency_records ORDER BY seq ASC",
            RECORD_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(TransparencyRecord::from_row).collect()
    }

    pub async fn tail_hash(&self) -> Result<Option<String>> {
        let tail: Option<String> =
            sqlx::query_scalar("SELECT tail_hash FROM ledger_tail WHERE id = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(tail)
    }

    /// Transition still-pending records to anchored. Returns how many moved.
    pub(crate) async fn mark_anchored(
        conn: &mut SqliteConnection,
        record_ids: &[String],
        chain: &str,
        tx_hash: &str,
        anchored_at: DateTime<Utc>,
    ) -> Result<u64> {
        let anchored_at = canonical_timestamp(&anchored_at);
        let mut moved = 0;

        for id in record_ids {
            let result = sqlx::query(
                r#"
                UPDATE transparency_records
                SET anchor_status = 'anchored', anchor_tx_hash = ?, anchor_chain = ?, anchored_at = ?
                WHERE id = ? AND anchor_status = 'pending'
                "#,
            )
            .bind(tx_hash)
            .bind(chain)
            .bind(&anchored_at)
            .bind(id)
            .execute(&mut *conn)
            .await?;
            moved += result.rows_affected();
        }

        Ok(moved)
    }

    /// Mark still-pending records as failed after a hard chain rejection
    pub(crate) async fn mark_failed(
        conn: &mut SqliteConnection,
        record_ids: &[String],
    ) -> Result<u64> {
        let mut moved = 0;

        for id in record_ids {
            let result = sqlx::query(
                "UPDATE transparency_records SET anchor_status = 'failed' \
                 WHERE id = ? AND anchor_status = 'pending'",
            )
            .bind(id)
            .execute(&mut *conn)
            .await?;
            moved += result.rows_affected();
        }

        Ok(moved)
    }

    /// Mark every record of an anchor the chain disowned as failed. The anchor
    /// fields stay in place for the investigation.
    pub(crate) async fn mark_anchor_failed(&self, chain: &str, tx_hash: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE transparency_records SET anchor_status = 'failed' \
             WHERE anchor_chain = ? AND anchor_tx_hash = ? AND anchor_status = 'anchored'",
        )
        .bind(chain)
        .bind(tx_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> Result<LedgerStats> {
        let by_type: Vec<(String, i64)> = sqlx::query_as(
            "SELECT record_type, COUNT(*) FROM transparency_records GROUP BY record_type",
        )
        .fetch_all(&self.pool)
        .await?;

        let by_status: Vec<(String, i64)> = sqlx::query_as(
            "SELECT anchor_status, COUNT(*) FROM transparency_records GROUP BY anchor_status",
        )
        .fetch_all(&self.pool)
        .await?;

        let by_type: BTreeMap<String, u64> = by_type
            .into_iter()
            .map(|(k, v)| (k, v.max(0) as u64))
            .collect();
        let by_status: BTreeMap<String, u64> = by_status
            .into_iter()
            .map(|(k, v)| (k, v.max(0) as u64))
            .collect();

        Ok(LedgerStats {
            total_records: by_type.values().sum(),
            by_type,
            by_status,
            tail_hash: self.tail_hash().await?,
        })
    }

    pub async fn count_with_status(&self, status: AnchorStatus) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM transparency_records WHERE anchor_status = ?",
        )
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    /// Overwrite a stored hash. Only used to simulate storage corruption.
    #[cfg(test)]
    pub(crate) async fn corrupt_hash_for_test(&self, id: &str, hash: &str) -> Result<()> {
        sqlx::query("UPDATE transparency_records SET hash = ? WHERE id = ?")
            .bind(hash)
            .bind(id)
            .execute(&self.pool)
            .await?;
        debug!("Corrupted stored hash of record {}", id);
        Ok(())
    }
}

fn contention(err: sqlx::Error) -> LedgerError {
    if is_busy(&err) {
        LedgerError::TailConflict(err.to_string())
    } else {
        err.into()
    }
}
