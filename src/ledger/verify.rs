//! Ledger Chain Audit
//!
//! Walks the whole ledger in creation order and reports every broken
//! link and every record whose stored hash no longer matches its content.

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::Result;
use crate::ledger::chain::RecordLedger;
use crate::ledger::record::TransparencyRecord;

/// A record whose `previous_hash` does not point at its predecessor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainBreak {
    pub index: usize,
    pub record_id: String,
    pub expected_previous: Option<String>,
    pub actual_previous: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainAuditReport {
    pub record_count: usize,
    pub broken_links: Vec<ChainBreak>,
    /// Ids of records whose content no longer hashes to the stored value
    pub tampered_records: Vec<String>,
    pub tail_matches: bool,
}

impl ChainAuditReport {
    pub fn is_valid(&self) -> bool {
        self.broken_links.is_empty() && self.tampered_records.is_empty() && self.tail_matches
    }

    pub fn summary(&self) -> String {
        if self.is_valid() {
            format!("Ledger chain is valid ({} records)", self.record_count)
        } else {
            format!(
                "Ledger chain is INVALID ({} records): {} broken links, {} tampered records, tail {}",
                self.record_count,
                self.broken_links.len(),
                self.tampered_records.len(),
                if self.tail_matches { "ok" } else { "mismatch" }
            )
        }
    }
}

/// Check hash integrity and linkage of records given in creation order
pub fn verify_chain(records: &[TransparencyRecord], tail_hash: Option<&str>) -> ChainAuditReport {
    let mut report = ChainAuditReport {
        record_count: records.len(),
        ..Default::default()
    };

    let mut expected_previous: Option<&str> = None;
    for (index, record) in records.iter().enumerate() {
        if record.previous_hash.as_deref() != expected_previous {
            report.broken_links.push(ChainBreak {
                index,
                record_id: record.id.clone(),
                expected_previous: expected_previous.map(str::to_string),
                actual_previous: record.previous_hash.clone(),
            });
        }

        if !record.verify_hash() {
            report.tampered_records.push(record.id.clone());
        }

        expected_previous = Some(record.hash.as_str());
    }

    report.tail_matches = expected_previous == tail_hash;
    report
}

impl RecordLedger {
    /// Audit the complete ledger
    pub async fn audit_chain(&self) -> Result<ChainAuditReport> {
        let records = self.all_in_order().await?;
        let tail = self.tail_hash().await?;
        let report = verify_chain(&records, tail.as_deref());

        if report.is_valid() {
            info!("{}", report.summary());
        } else {
            error!("{}", report.summary());
        }
        Ok(report)
    }
}
