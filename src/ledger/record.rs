//! Transparency Record
//!
//! A single hash-chained ledger entry and the typed metadata carried
//! by each kind of platform event.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::database::{parse_optional_timestamp, parse_timestamp};
use crate::error::{LedgerError, Result};
use crate::hashing::{canonical_timestamp, hash_value};

/// Kind of platform event a record captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Contribution,
    Allocation,
    Disbursement,
    Impact,
    LoanFunded,
    LoanRepaid,
    Milestone,
}

impl RecordType {
    pub const ALL: [RecordType; 7] = [
        RecordType::Contribution,
        RecordType::Allocation,
        RecordType::Disbursement,
        RecordType::Impact,
        RecordType::LoanFunded,
        RecordType::LoanRepaid,
        RecordType::Milestone,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Contribution => "contribution",
            RecordType::Allocation => "allocation",
            RecordType::Disbursement => "disbursement",
            RecordType::Impact => "impact",
            RecordType::LoanFunded => "loan_funded",
            RecordType::LoanRepaid => "loan_repaid",
            RecordType::Milestone => "milestone",
        }
    }
}

impl FromStr for RecordType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        RecordType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| LedgerError::ValidationError(format!("Unknown record type: {}", s)))
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of entity an event is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Project,
    Loan,
    Community,
    Watershed,
    User,
    Grant,
}

impl EntityType {
    pub const ALL: [EntityType; 6] = [
        EntityType::Project,
        EntityType::Loan,
        EntityType::Community,
        EntityType::Watershed,
        EntityType::User,
        EntityType::Grant,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Project => "project",
            EntityType::Loan => "loan",
            EntityType::Community => "community",
            EntityType::Watershed => "watershed",
            EntityType::User => "user",
            EntityType::Grant => "grant",
        }
    }
}

impl FromStr for EntityType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| LedgerError::ValidationError(format!("Unknown entity type: {}", s)))
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorStatus {
    Pending,
    Anchored,
    Failed,
}

impl AnchorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorStatus::Pending => "pending",
            AnchorStatus::Anchored => "anchored",
            AnchorStatus::Failed => "failed",
        }
    }
}

impl FromStr for AnchorStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(AnchorStatus::Pending),
            "anchored" => Ok(AnchorStatus::Anchored),
            "failed" => Ok(AnchorStatus::Failed),
            other => Err(LedgerError::ValidationError(format!(
                "Unknown anchor status: {}",
                other
            ))),
        }
    }
}

/// Typed event metadata.
///
/// Records persist and hash the untagged object form produced by
/// [`RecordMetadata::to_map`], so `Generic` maps written before a typed
/// variant existed keep hashing identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordMetadata {
    Contribution(ContributionMetadata),
    Allocation(AllocationMetadata),
    Disbursement(DisbursementMetadata),
    Impact(ImpactMetadata),
    LoanFunded(LoanFundedMetadata),
    LoanRepaid(LoanRepaidMetadata),
    Milestone(MilestoneMetadata),
    Generic(Map<String, Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContributionMetadata {
    pub contribution_id: String,
    pub user_id: String,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AllocationMetadata {
    pub allocation_id: String,
    pub source_id: String,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DisbursementMetadata {
    pub disbursement_id: String,
    pub recipient_id: String,
    pub purpose: String,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImpactMetadata {
    pub metric: String,
    pub value: f64,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoanFundedMetadata {
    pub loan_id: String,
    pub lender_id: String,
    pub borrower_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interest_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term_months: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoanRepaidMetadata {
    pub loan_id: String,
    pub payment_id: String,
    pub principal: f64,
    pub interest: f64,
    pub remaining_balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MilestoneMetadata {
    pub milestone_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_by: Option<String>,
}

impl RecordMetadata {
    pub fn empty() -> Self {
        RecordMetadata::Generic(Map::new())
    }

    /// Generic object form used for storage and hashing
    pub fn to_map(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(LedgerError::SerializationError(format!(
                "Metadata must serialize to an object, got {}",
                other
            ))),
        }
    }

    /// Decode a stored map into the variant matching `record_type`,
    /// falling back to `Generic` when the fields do not fit it
    pub fn from_map(record_type: RecordType, map: Map<String, Value>) -> Self {
        let value = Value::Object(map);
        let typed = match record_type {
            RecordType::Contribution => {
                serde_json::from_value(value.clone()).map(RecordMetadata::Contribution)
            }
            RecordType::Allocation => {
                serde_json::from_value(value.clone()).map(RecordMetadata::Allocation)
            }
            RecordType::Disbursement => {
                serde_json::from_value(value.clone()).map(RecordMetadata::Disbursement)
            }
            RecordType::Impact => serde_json::from_value(value.clone()).map(RecordMetadata::Impact),
            RecordType::LoanFunded => {
                serde_json::from_value(value.clone()).map(RecordMetadata::LoanFunded)
            }
            RecordType::LoanRepaid => {
                serde_json::from_value(value.clone()).map(RecordMetadata::LoanRepaid)
            }
            RecordType::Milestone => {
                serde_json::from_value(value.clone()).map(RecordMetadata::Milestone)
            }
        };

        match (typed, value) {
            (Ok(metadata), _) => metadata,
            (Err(_), Value::Object(map)) => RecordMetadata::Generic(map),
            (Err(_), _) => RecordMetadata::empty(),
        }
    }

    /// Record type this variant belongs to, if it is typed
    pub fn record_type(&self) -> Option<RecordType> {
        match self {
            RecordMetadata::Contribution(_) => Some(RecordType::Contribution),
            RecordMetadata::Allocation(_) => Some(RecordType::Allocation),
            RecordMetadata::Disbursement(_) => Some(RecordType::Disbursement),
            RecordMetadata::Impact(_) => Some(RecordType::Impact),
            RecordMetadata::LoanFunded(_) => Some(RecordType::LoanFunded),
            RecordMetadata::LoanRepaid(_) => Some(RecordType::LoanRepaid),
            RecordMetadata::Milestone(_) => Some(RecordType::Milestone),
            RecordMetadata::Generic(_) => None,
        }
    }
}

impl From<Map<String, Value>> for RecordMetadata {
    fn from(map: Map<String, Value>) -> Self {
        RecordMetadata::Generic(map)
    }
}

/// Hash-chained ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransparencyRecord {
    pub id: String,
    pub record_type: RecordType,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub amount: Option<f64>,
    pub metadata: Map<String, Value>,
    pub hash: String,
    pub previous_hash: Option<String>,
    pub anchor_status: AnchorStatus,
    pub anchor_tx_hash: Option<String>,
    pub anchor_chain: Option<String>,
    pub anchored_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Hashed content of a record, before it has an id or hash
#[derive(Debug, Clone)]
pub struct RecordContent<'a> {
    pub record_type: RecordType,
    pub entity_type: EntityType,
    pub entity_id: &'a str,
    pub amount: Option<f64>,
    pub metadata: &'a Map<String, Value>,
    pub previous_hash: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

impl RecordContent<'_> {
    /// Canonical hash input
    pub fn canonical_value(&self) -> Value {
        json!({
            "recordType": self.record_type.as_str(),
            "entityType": self.entity_type.as_str(),
            "entityId": self.entity_id,
            "amount": self.amount,
            "metadata": self.metadata,
            "previousHash": self.previous_hash,
            "createdAt": canonical_timestamp(&self.created_at),
        })
    }

    pub fn calculate_hash(&self) -> Result<String> {
        hash_value(&self.canonical_value())
    }
}

impl TransparencyRecord {
    pub fn content(&self) -> RecordContent<'_> {
        RecordContent {
            record_type: self.record_type,
            entity_type: self.entity_type,
            entity_id: &self.entity_id,
            amount: self.amount,
            metadata: &self.metadata,
            previous_hash: self.previous_hash.as_deref(),
            created_at: self.created_at,
        }
    }

    /// Recompute the digest from the stored content
    pub fn calculate_hash(&self) -> Result<String> {
        self.content().calculate_hash()
    }

    pub fn verify_hash(&self) -> bool {
        self.calculate_hash()
            .map(|computed| computed == self.hash)
            .unwrap_or(false)
    }

    pub fn typed_metadata(&self) -> RecordMetadata {
        RecordMetadata::from_map(self.record_type, self.metadata.clone())
    }

    pub fn is_anchored(&self) -> bool {
        self.anchor_status == AnchorStatus::Anchored
    }

    pub fn summary(&self) -> String {
        format!(
            "{} {}:{} ({})",
            self.record_type, self.entity_type, self.entity_id, self.hash
        )
    }

    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        let record_type: String = row.try_get("record_type")?;
        let entity_type: String = row.try_get("entity_type")?;
        let anchor_status: String = row.try_get("anchor_status")?;
        let metadata: String = row.try_get("metadata")?;
        let created_at: String = row.try_get("created_at")?;

        Ok(Self {
            id: row.try_get("id")?,
            record_type: record_type.parse()?,
            entity_type: entity_type.parse()?,
            entity_id: row.try_get("entity_id")?,
            amount: row.try_get("amount")?,
            metadata: serde_json::from_str(&metadata)?,
            hash: row.try_get("hash")?,
            previous_hash: row.try_get("previous_hash")?,
            anchor_status: anchor_status.parse()?,
            anchor_tx_hash: row.try_get("anchor_tx_hash")?,
            anchor_chain: row.try_get("anchor_chain")?,
            anchored_at: parse_optional_timestamp(row.try_get("anchored_at")?)?,
            created_at: parse_timestamp(&created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_metadata() -> Map<String, Value> {
        RecordMetadata::Contribution(ContributionMetadata {
            contribution_id: "c-1".to_string(),
            user_id: "u-1".to_string(),
            currency: "USD".to_string(),
            payment_method: None,
        })
        .to_map()
        .unwrap()
    }

    fn fixture_timestamp() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-15T10:30:00.000Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_record_hash_fixture() {
        let metadata = fixture_metadata();
        let content = RecordContent {
            record_type: RecordType::Contribution,
            entity_type: EntityType::Project,
            entity_id: "proj-1",
            amount: Some(250.0),
            metadata: &metadata,
            previous_hash: None,
            created_at: fixture_timestamp(),
        };

        assert_eq!(
            content.calculate_hash().unwrap(),
            "8d493e32eef138433a7af0bded30ed7850991d21ab8e2b87a029c2a8d33af024"
        );
    }

    #[test]
    fn test_hash_depends_on_previous_hash() {
        let metadata = fixture_metadata();
        let first = RecordContent {
            record_type: RecordType::Contribution,
            entity_type: EntityType::Project,
            entity_id: "proj-1",
            amount: Some(250.0),
            metadata: &metadata,
            previous_hash: None,
            created_at: fixture_timestamp(),
        };
        let mut second = first.clone();
        second.previous_hash = Some("abc");

        assert_ne!(first.calculate_hash().unwrap(), second.calculate_hash().unwrap());
        assert_eq!(first.calculate_hash().unwrap(), first.calculate_hash().unwrap());
    }

    #[test]
    fn test_metadata_round_trips_through_generic_form() {
        let map = fixture_metadata();
        assert_eq!(map.get("contributionId"), Some(&json!("c-1")));
        assert!(!map.contains_key("paymentMethod"));

        match RecordMetadata::from_map(RecordType::Contribution, map) {
            RecordMetadata::Contribution(meta) => assert_eq!(meta.user_id, "u-1"),
            other => panic!("expected contribution metadata, got {:?}", other),
        }
    }

    #[test]
    fn test_unfamiliar_metadata_stays_generic() {
        let mut map = Map::new();
        map.insert("legacyField".to_string(), json!(42));

        let metadata = RecordMetadata::from_map(RecordType::Milestone, map.clone());
        assert_eq!(metadata, RecordMetadata::Generic(map.clone()));
        assert_eq!(metadata.to_map().unwrap(), map);
        assert_eq!(metadata.record_type(), None);
    }

    #[test]
    fn test_enum_string_forms() {
        assert_eq!("loan_funded".parse::<RecordType>().unwrap(), RecordType::LoanFunded);
        assert_eq!("watershed".parse::<EntityType>().unwrap(), EntityType::Watershed);
        assert_eq!("anchored".parse::<AnchorStatus>().unwrap(), AnchorStatus::Anchored);
        assert!("refund".parse::<RecordType>().is_err());
    }
}
