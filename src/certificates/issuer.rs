//! Certificate Issuer
//!
//! Issues content-addressed public impact claims tied to a ledger record's
//! hash. Issuance is independent of anchoring.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::certificates::types::{
    CertificateRequest, CertificateStats, CertificateType, ImpactCertificate, IssuedCertificate,
};
use crate::config::CertificateConfig;
use crate::database::Database;
use crate::error::{LedgerError, Result};
use crate::hashing::{canonical_timestamp, truncate_to_millis};
use crate::ledger::{EntityType, RecordLedger};

const MAX_ISSUE_ATTEMPTS: i64 = 5;

const CERTIFICATE_COLUMNS: &str = "id, user_id, certificate_type, entity_type, entity_id, amount, \
     impact_claim, record_hash, certificate_hash, metadata, is_public, issued_at, view_count";

#[derive(Clone)]
pub struct CertificateIssuer {
    pool: SqlitePool,
    ledger: RecordLedger,
    require_existing_record: bool,
}

impl CertificateIssuer {
    pub fn new(database: &Database, ledger: RecordLedger, config: &CertificateConfig) -> Self {
        Self {
            pool: database.pool().clone(),
            ledger,
            require_existing_record: config.require_existing_record,
        }
    }

    pub async fn issue(&self, request: CertificateRequest) -> Result<IssuedCertificate> {
        if request.user_id.trim().is_empty() {
            return Err(LedgerError::ValidationError("user_id must not be empty".to_string()));
        }
        if request.impact_claim.trim().is_empty() {
            return Err(LedgerError::ValidationError(
                "impact_claim must not be empty".to_string(),
            ));
        }
        if self.require_existing_record {
            self.ledger.get_by_hash(&request.record_hash).await?;
        }

        let id = Uuid::new_v4().to_string();
        let metadata = serde_json::to_string(&request.metadata)?;
        let base = truncate_to_millis(Utc::now());

        // identical requests within one millisecond get distinct issuance instants
        for offset in 0..MAX_ISSUE_ATTEMPTS {
            let issued_at = base + Duration::milliseconds(offset);
            let certificate_hash = request.calculate_hash(&issued_at)?;

            let inserted = sqlx::query(
                r#"
                INSERT INTO impact_certificates
                (id, user_id, certificate_type, entity_type, entity_id, amount, impact_claim,
                 record_hash, certificate_hash, metadata, is_public, issued_at, view_count)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
                "#,
            )
            .bind(&id)
            .bind(&request.user_id)
            .bind(request.certificate_type.as_str())
            .bind(request.entity_type.as_str())
            .bind(&request.entity_id)
            .bind(request.amount)
            .bind(&request.impact_claim)
            .bind(&request.record_hash)
            .bind(&certificate_hash)
            .bind(&metadata)
            .bind(request.is_public)
            .bind(canonical_timestamp(&issued_at))
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => {
                    info!(
                        "Issued {} certificate {} to {}",
                        request.certificate_type, certificate_hash, request.user_id
                    );
                    return Ok(IssuedCertificate {
                        id,
                        certificate_hash,
                    });
                }
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                    debug!("Certificate hash {} already taken", certificate_hash);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(LedgerError::ValidationError(format!(
            "could not allocate a unique certificate hash for {}",
            request.user_id
        )))
    }

    pub async fn issue_contribution_certificate(
        &self,
        user_id: &str,
        project_id: &str,
        project_name: &str,
        amount: f64,
        record_hash: &str,
    ) -> Result<IssuedCertificate> {
        self.issue(CertificateRequest {
            user_id: user_id.to_string(),
            certificate_type: CertificateType::Contribution,
            entity_type: EntityType::Project,
            entity_id: project_id.to_string(),
            amount: Some(amount),
            impact_claim: format!("Contributed ${:.2} to {}", amount, project_name),
            record_hash: record_hash.to_string(),
            metadata: object(json!({ "projectName": project_name })),
            is_public: true,
        })
        .await
    }

    pub async fn issue_project_backer_certificate(
        &self,
        user_id: &str,
        project_id: &str,
        project_name: &str,
        total_contributed: f64,
        contribution_count: u32,
        record_hash: &str,
    ) -> Result<IssuedCertificate> {
        let plural = if contribution_count == 1 { "" } else { "s" };
        self.issue(CertificateRequest {
            user_id: user_id.to_string(),
            certificate_type: CertificateType::ProjectBacker,
            entity_type: EntityType::Project,
            entity_id: project_id.to_string(),
            amount: Some(total_contributed),
            impact_claim: format!(
                "Backed {} with ${:.2} across {} contribution{}",
                project_name, total_contributed, contribution_count, plural
            ),
            record_hash: record_hash.to_string(),
            metadata: object(json!({
                "projectName": project_name,
                "contributionCount": contribution_count,
            })),
            is_public: true,
        })
        .await
    }

    pub async fn issue_loan_funder_certificate(
        &self,
        user_id: &str,
        loan_id: &str,
        borrower_name: &str,
        amount: f64,
        record_hash: &str,
    ) -> Result<IssuedCertificate> {
        self.issue(CertificateRequest {
            user_id: user_id.to_string(),
            certificate_type: CertificateType::LoanFunder,
            entity_type: EntityType::Loan,
            entity_id: loan_id.to_string(),
            amount: Some(amount),
            impact_claim: format!("Funded a ${:.2} loan for {}", amount, borrower_name),
            record_hash: record_hash.to_string(),
            metadata: object(json!({ "borrowerName": borrower_name })),
            is_public: true,
        })
        .await
    }

    pub async fn issue_volunteer_certificate(
        &self,
        user_id: &str,
        community_id: &str,
        activity: &str,
        hours: f64,
        record_hash: &str,
    ) -> Result<IssuedCertificate> {
        self.issue(CertificateRequest {
            user_id: user_id.to_string(),
            certificate_type: CertificateType::Volunteer,
            entity_type: EntityType::Community,
            entity_id: community_id.to_string(),
            amount: None,
            impact_claim: format!("Volunteered {} hours: {}", hours, activity),
            record_hash: record_hash.to_string(),
            metadata: object(json!({ "activity": activity, "hours": hours })),
            is_public: true,
        })
        .await
    }

    pub async fn issue_milestone_certificate(
        &self,
        user_id: &str,
        project_id: &str,
        project_name: &str,
        milestone_title: &str,
        record_hash: &str,
    ) -> Result<IssuedCertificate> {
        self.issue(CertificateRequest {
            user_id: user_id.to_string(),
            certificate_type: CertificateType::Milestone,
            entity_type: EntityType::Project,
            entity_id: project_id.to_string(),
            amount: None,
            impact_claim: format!(
                "Helped {} reach the milestone \"{}\"",
                project_name, milestone_title
            ),
            record_hash: record_hash.to_string(),
            metadata: object(json!({
                "projectName": project_name,
                "milestoneTitle": milestone_title,
            })),
            is_public: true,
        })
        .await
    }

    /// Public lookup. Every successful call counts as one view.
    pub async fn get_by_hash(&self, certificate_hash: &str) -> Result<ImpactCertificate> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE impact_certificates SET view_count = view_count + 1 \
             WHERE certificate_hash = ? AND is_public = 1",
        )
        .bind(certificate_hash)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(LedgerError::certificate_not_found(certificate_hash));
        }

        let sql = format!(
            "SELECT {} FROM impact_certificates WHERE certificate_hash = ?",
            CERTIFICATE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(certificate_hash)
            .fetch_one(&mut *tx)
            .await?;
        let certificate = ImpactCertificate::from_row(&row)?;

        tx.commit().await?;
        Ok(certificate)
    }

    /// All of a user's certificates, private ones included, newest first
    pub async fn get_for_user(&self, user_id: &str) -> Result<Vec<ImpactCertificate>> {
        let sql = format!(
            "SELECT {} FROM impact_certificates WHERE user_id = ? ORDER BY issued_at DESC",
            CERTIFICATE_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(user_id).fetch_all(&self.pool).await?;
        rows.iter().map(ImpactCertificate::from_row).collect()
    }

    /// Returns `false` without changing anything when `owner_id` does not own
    /// the certificate
    pub async fn toggle_visibility(
        &self,
        certificate_id: &str,
        owner_id: &str,
        is_public: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE impact_certificates SET is_public = ? WHERE id = ? AND user_id = ?",
        )
        .bind(is_public)
        .bind(certificate_id)
        .bind(owner_id)
        .execute(&self.pool)
        .await?;

        let changed = result.rows_affected() == 1;
        if !changed {
            debug!(
                "Visibility change for certificate {} refused for {}",
                certificate_id, owner_id
            );
        }
        Ok(changed)
    }

    pub async fn stats(&self, user_id: &str) -> Result<CertificateStats> {
        let rows: Vec<(String, i64, i64, Option<f64>)> = sqlx::query_as(
            r#"
            SELECT certificate_type, COUNT(*), COALESCE(SUM(view_count), 0), SUM(amount)
            FROM impact_certificates
            WHERE user_id = ?
            GROUP BY certificate_type
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = CertificateStats {
            by_type: BTreeMap::new(),
            ..Default::default()
        };
        for (certificate_type, count, views, amount) in rows {
            let count = count.max(0) as u64;
            stats.total += count;
            stats.total_views += views.max(0) as u64;
            stats.total_amount += amount.unwrap_or(0.0);
            stats.by_type.insert(certificate_type, count);
        }

        Ok(stats)
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
