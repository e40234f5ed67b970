use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::database::{parse_optional_timestamp, parse_timestamp};
use crate::error::{LedgerError, Result};
use crate::merkle::{MerkleProof, ProofStep};

/// Lifecycle of a batch anchor on its chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorState {
    /// Written to the chain, confirmation not yet observed
    Submitted,
    Confirmed,
    /// Chain reports different content for this transaction
    Rejected,
}

impl AnchorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorState::Submitted => "submitted",
            AnchorState::Confirmed => "confirmed",
            AnchorState::Rejected => "rejected",
        }
    }
}

impl FromStr for AnchorState {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "submitted" => Ok(AnchorState::Submitted),
            "confirmed" => Ok(AnchorState::Confirmed),
            "rejected" => Ok(AnchorState::Rejected),
            other => Err(LedgerError::ValidationError(format!(
                "Unknown anchor state: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for AnchorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One Merkle root written to an external chain, covering a contiguous
/// range of ledger records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransparencyAnchor {
    pub id: String,
    pub chain: String,
    pub merkle_root: String,
    pub record_count: u32,
    pub first_record_id: String,
    pub last_record_id: String,
    pub tx_hash: String,
    pub block_number: Option<u64>,
    pub cost: Option<f64>,
    pub status: AnchorState,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl TransparencyAnchor {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        let status: String = row.try_get("status")?;
        let created_at: String = row.try_get("created_at")?;
        let record_count: i64 = row.try_get("record_count")?;
        let block_number: Option<i64> = row.try_get("block_number")?;

        Ok(Self {
            id: row.try_get("id")?,
            chain: row.try_get("chain")?,
            merkle_root: row.try_get("merkle_root")?,
            record_count: u32::try_from(record_count).map_err(|_| {
                LedgerError::DatabaseError(format!("Invalid record_count {}", record_count))
            })?,
            first_record_id: row.try_get("first_record_id")?,
            last_record_id: row.try_get("last_record_id")?,
            tx_hash: row.try_get("tx_hash")?,
            block_number: block_number.map(|b| b.max(0) as u64),
            cost: row.try_get("cost")?,
            status: status.parse()?,
            created_at: parse_timestamp(&created_at)?,
            confirmed_at: parse_optional_timestamp(row.try_get("confirmed_at")?)?,
        })
    }
}

/// Stored inclusion proof of one record in its anchored batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransparencyProof {
    pub id: String,
    pub record_id: String,
    pub anchor_id: String,
    pub anchor_tx_hash: String,
    pub proof: MerkleProof,
    pub created_at: DateTime<Utc>,
}

impl TransparencyProof {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        let proof_path: String = row.try_get("proof_path")?;
        let siblings: Vec<ProofStep> = serde_json::from_str(&proof_path)?;
        let leaf_index: i64 = row.try_get("leaf_index")?;
        let created_at: String = row.try_get("created_at")?;

        Ok(Self {
            id: row.try_get("id")?,
            record_id: row.try_get("record_id")?,
            anchor_id: row.try_get("anchor_id")?,
            anchor_tx_hash: row.try_get("anchor_tx_hash")?,
            proof: MerkleProof {
                leaf_hash: row.try_get("record_hash")?,
                siblings,
                root: row.try_get("merkle_root")?,
                index: usize::try_from(leaf_index).map_err(|_| {
                    LedgerError::DatabaseError(format!("Invalid leaf_index {}", leaf_index))
                })?,
            },
            created_at: parse_timestamp(&created_at)?,
        })
    }
}
