use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::database::parse_timestamp;
use crate::error::{LedgerError, Result};
use crate::hashing::{canonical_timestamp, hash_value};
use crate::ledger::EntityType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateType {
    Contribution,
    ProjectBacker,
    LoanFunder,
    Volunteer,
    Milestone,
}

impl CertificateType {
    pub const ALL: [CertificateType; 5] = [
        CertificateType::Contribution,
        CertificateType::ProjectBacker,
        CertificateType::LoanFunder,
        CertificateType::Volunteer,
        CertificateType::Milestone,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateType::Contribution => "contribution",
            CertificateType::ProjectBacker => "project_backer",
            CertificateType::LoanFunder => "loan_funder",
            CertificateType::Volunteer => "volunteer",
            CertificateType::Milestone => "milestone",
        }
    }
}

impl FromStr for CertificateType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        CertificateType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                LedgerError::ValidationError(format!("Unknown certificate type: {}", s))
            })
    }
}

impl fmt::Display for CertificateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a caller supplies when issuing a certificate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateRequest {
    pub user_id: String,
    pub certificate_type: CertificateType,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub amount: Option<f64>,
    pub impact_claim: String,
    /// Hash of the ledger record backing the claim
    pub record_hash: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "default_public")]
    pub is_public: bool,
}

fn default_public() -> bool {
    true
}

impl CertificateRequest {
    /// Canonical hash input. Visibility and view count change after issuance
    /// and are not part of it.
    pub fn canonical_value(&self, issued_at: &DateTime<Utc>) -> Value {
        json!({
            "userId": self.user_id,
            "certificateType": self.certificate_type.as_str(),
            "entityType": self.entity_type.as_str(),
            "entityId": self.entity_id,
            "amount": self.amount,
            "impactClaim": self.impact_claim,
            "recordHash": self.record_hash,
            "metadata": self.metadata,
            "issuedAt": canonical_timestamp(issued_at),
        })
    }

    pub fn calculate_hash(&self, issued_at: &DateTime<Utc>) -> Result<String> {
        hash_value(&self.canonical_value(issued_at))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCertificate {
    pub id: String,
    pub certificate_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactCertificate {
    pub id: String,
    pub user_id: String,
    pub certificate_type: CertificateType,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub amount: Option<f64>,
    pub impact_claim: String,
    pub record_hash: String,
    pub certificate_hash: String,
    pub metadata: Map<String, Value>,
    pub is_public: bool,
    pub issued_at: DateTime<Utc>,
    pub view_count: u64,
}

impl ImpactCertificate {
    /// Recompute the content address from the stored fields
    pub fn calculate_hash(&self) -> Result<String> {
        CertificateRequest {
            user_id: self.user_id.clone(),
            certificate_type: self.certificate_type,
            entity_type: self.entity_type,
            entity_id: self.entity_id.clone(),
            amount: self.amount,
            impact_claim: self.impact_claim.clone(),
            record_hash: self.record_hash.clone(),
            metadata: self.metadata.clone(),
            is_public: self.is_public,
        }
        .calculate_hash(&self.issued_at)
    }

    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        let certificate_type: String = row.try_get("certificate_type")?;
        let entity_type: String = row.try_get("entity_type")?;
        let metadata: String = row.try_get("metadata")?;
        let issued_at: String = row.try_get("issued_at")?;
        let view_count: i64 = row.try_get("view_count")?;

        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            certificate_type: certificate_type.parse()?,
            entity_type: entity_type.parse()?,
            entity_id: row.try_get("entity_id")?,
            amount: row.try_get("amount")?,
            impact_claim: row.try_get("impact_claim")?,
            record_hash: row.try_get("record_hash")?,
            certificate_hash: row.try_get("certificate_hash")?,
            metadata: serde_json::from_str(&metadata)?,
            is_public: row.try_get("is_public")?,
            issued_at: parse_timestamp(&issued_at)?,
            view_count: view_count.max(0) as u64,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CertificateStats {
    pub total: u64,
    pub by_type: BTreeMap<String, u64>,
    pub total_views: u64,
    pub total_amount: f64,
}
