//! Event Recording
//!
//! Typed entry points used by the business workflows. Each one fixes the
//! record and entity type for its event kind and hands the event's
//! metadata to [`RecordLedger::append`].

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ledger::chain::{AppendedRecord, RecordLedger};
use crate::ledger::record::{
    AllocationMetadata, ContributionMetadata, DisbursementMetadata, EntityType, ImpactMetadata,
    LoanFundedMetadata, LoanRepaidMetadata, MilestoneMetadata, RecordMetadata, RecordType,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionEvent {
    pub contribution_id: String,
    pub user_id: String,
    pub project_id: String,
    pub amount: f64,
    pub currency: String,
    pub payment_method: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationEvent {
    pub allocation_id: String,
    /// Fund or pool the money is allocated from
    pub source_id: String,
    pub project_id: String,
    pub amount: f64,
    pub currency: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisbursementEvent {
    pub disbursement_id: String,
    pub project_id: String,
    pub recipient_id: String,
    pub amount: f64,
    pub currency: String,
    pub purpose: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoanFundedEvent {
    pub loan_id: String,
    pub lender_id: String,
    pub borrower_id: String,
    pub amount: f64,
    pub interest_rate: Option<f64>,
    pub term_months: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoanRepaidEvent {
    pub loan_id: String,
    pub payment_id: String,
    pub principal: f64,
    pub interest: f64,
    pub remaining_balance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneEvent {
    pub project_id: String,
    pub milestone_id: String,
    pub title: String,
    pub verified_by: Option<String>,
    /// Funds released on completion, if any
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactEvent {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub metric: String,
    pub value: f64,
    pub unit: String,
    pub period: Option<String>,
}

pub async fn record_contribution(
    ledger: &RecordLedger,
    event: ContributionEvent,
) -> Result<AppendedRecord> {
    ledger
        .append(
            RecordType::Contribution,
            EntityType::Project,
            &event.project_id,
            Some(event.amount),
            RecordMetadata::Contribution(ContributionMetadata {
                contribution_id: event.contribution_id,
                user_id: event.user_id,
                currency: event.currency,
                payment_method: event.payment_method,
            }),
        )
        .await
}

pub async fn record_allocation(
    ledger: &RecordLedger,
    event: AllocationEvent,
) -> Result<AppendedRecord> {
    ledger
        .append(
            RecordType::Allocation,
            EntityType::Project,
            &event.project_id,
            Some(event.amount),
            RecordMetadata::Allocation(AllocationMetadata {
                allocation_id: event.allocation_id,
                source_id: event.source_id,
                currency: event.currency,
                reason: event.reason,
            }),
        )
        .await
}

pub async fn record_disbursement(
    ledger: &RecordLedger,
    event: DisbursementEvent,
) -> Result<AppendedRecord> {
    ledger
        .append(
            RecordType::Disbursement,
            EntityType::Project,
            &event.project_id,
            Some(event.amount),
            RecordMetadata::Disbursement(DisbursementMetadata {
                disbursement_id: event.disbursement_id,
                recipient_id: event.recipient_id,
                purpose: event.purpose,
                currency: event.currency,
            }),
        )
        .await
}

pub async fn record_loan_funded(
    ledger: &RecordLedger,
    event: LoanFundedEvent,
) -> Result<AppendedRecord> {
    ledger
        .append(
            RecordType::LoanFunded,
            EntityType::Loan,
            &event.loan_id,
            Some(event.amount),
            RecordMetadata::LoanFunded(LoanFundedMetadata {
                loan_id: event.loan_id.clone(),
                lender_id: event.lender_id,
                borrower_id: event.borrower_id,
                interest_rate: event.interest_rate,
                term_months: event.term_months,
            }),
        )
        .await
}

/// The recorded amount is the full payment, principal plus interest
pub async fn record_loan_repaid(
    ledger: &RecordLedger,
    event: LoanRepaidEvent,
) -> Result<AppendedRecord> {
    ledger
        .append(
            RecordType::LoanRepaid,
            EntityType::Loan,
            &event.loan_id,
            Some(event.principal + event.interest),
            RecordMetadata::LoanRepaid(LoanRepaidMetadata {
                loan_id: event.loan_id.clone(),
                payment_id: event.payment_id,
                principal: event.principal,
                interest: event.interest,
                remaining_balance: event.remaining_balance,
            }),
        )
        .await
}

pub async fn record_milestone(
    ledger: &RecordLedger,
    event: MilestoneEvent,
) -> Result<AppendedRecord> {
    ledger
        .append(
            RecordType::Milestone,
            EntityType::Project,
            &event.project_id,
            event.amount,
            RecordMetadata::Milestone(MilestoneMetadata {
                milestone_id: event.milestone_id,
                title: event.title,
                verified_by: event.verified_by,
            }),
        )
        .await
}

pub async fn record_impact(ledger: &RecordLedger, event: ImpactEvent) -> Result<AppendedRecord> {
    ledger
        .append(
            RecordType::Impact,
            event.entity_type,
            &event.entity_id,
            None,
            RecordMetadata::Impact(ImpactMetadata {
                metric: event.metric,
                value: event.value,
                unit: event.unit,
                period: event.period,
            }),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use serde_json::json;

    #[tokio::test]
    async fn test_event_wrappers_fix_types() {
        let db = Database::new_in_memory().await.unwrap();
        let ledger = RecordLedger::new(&db);

        let repaid = record_loan_repaid(
            &ledger,
            LoanRepaidEvent {
                loan_id: "loan-7".to_string(),
                payment_id: "pay-1".to_string(),
                principal: 90.0,
                interest: 10.5,
                remaining_balance: 810.0,
            },
        )
        .await
        .unwrap();

        let record = ledger.get_by_hash(&repaid.hash).await.unwrap();
        assert_eq!(record.record_type, RecordType::LoanRepaid);
        assert_eq!(record.entity_type, EntityType::Loan);
        assert_eq!(record.entity_id, "loan-7");
        assert_eq!(record.amount, Some(100.5));
        assert_eq!(record.metadata.get("remainingBalance"), Some(&json!(810.0)));
        assert!(matches!(
            record.typed_metadata(),
            RecordMetadata::LoanRepaid(_)
        ));

        let impact = record_impact(
            &ledger,
            ImpactEvent {
                entity_type: EntityType::Watershed,
                entity_id: "ws-3".to_string(),
                metric: "liters_restored".to_string(),
                value: 12_000.0,
                unit: "L".to_string(),
                period: Some("2024-Q1".to_string()),
            },
        )
        .await
        .unwrap();

        let record = ledger.get_by_hash(&impact.hash).await.unwrap();
        assert_eq!(record.entity_type, EntityType::Watershed);
        assert_eq!(record.amount, None);
        assert_eq!(record.previous_hash.as_deref(), Some(repaid.hash.as_str()));
    }

    #[tokio::test]
    async fn test_contribution_and_milestone() {
        let db = Database::new_in_memory().await.unwrap();
        let ledger = RecordLedger::new(&db);

        record_contribution(
            &ledger,
            ContributionEvent {
                contribution_id: "c-1".to_string(),
                user_id: "user-1".to_string(),
                project_id: "proj-9".to_string(),
                amount: 25.0,
                currency: "USD".to_string(),
                payment_method: None,
            },
        )
        .await
        .unwrap();

        record_milestone(
            &ledger,
            MilestoneEvent {
                project_id: "proj-9".to_string(),
                milestone_id: "m-1".to_string(),
                title: "Pump installed".to_string(),
                verified_by: Some("field-officer-2".to_string()),
                amount: None,
            },
        )
        .await
        .unwrap();

        let records = ledger
            .get_for_entity(EntityType::Project, "proj-9")
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_type, RecordType::Milestone);
        assert_eq!(records[1].record_type, RecordType::Contribution);
    }
}
