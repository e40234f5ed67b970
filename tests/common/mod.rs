#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use transparency_ledger::anchor::{
    AnchorBatcher, AnchorPriority, AnchorService, AnchorStore, RetryPolicy,
    SimulatedChainProvider,
};
use transparency_ledger::certificates::CertificateIssuer;
use transparency_ledger::config::CertificateConfig;
use transparency_ledger::database::Database;
use transparency_ledger::ledger::RecordLedger;
use transparency_ledger::verification::VerificationEngine;

/// Every component wired to one in-memory database and one simulated chain
pub struct TestLedger {
    pub database: Database,
    pub ledger: RecordLedger,
    pub anchors: AnchorStore,
    pub chain: Arc<SimulatedChainProvider>,
    pub service: Arc<AnchorService>,
    pub batcher: AnchorBatcher,
    pub verifier: VerificationEngine,
    pub certificates: CertificateIssuer,
}

/// Setup an in-memory SQLite database for testing
pub async fn setup_test_db() -> Database {
    Database::new_in_memory()
        .await
        .expect("Failed to create test database")
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        timeout: Duration::from_millis(250),
        max_retries: 2,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
    }
}

pub async fn setup_ledger(chain_id: &str) -> TestLedger {
    let database = setup_test_db().await;
    let ledger = RecordLedger::new(&database);
    let anchors = AnchorStore::new(&database);
    let chain = Arc::new(SimulatedChainProvider::for_chain(chain_id));
    let service = Arc::new(AnchorService::new(chain_id, fast_retry()).with_provider(chain.clone()));

    TestLedger {
        batcher: AnchorBatcher::new(
            ledger.clone(),
            anchors.clone(),
            service.clone(),
            AnchorPriority::Balanced,
        ),
        verifier: VerificationEngine::new(ledger.clone(), anchors.clone(), service.clone()),
        certificates: CertificateIssuer::new(&database, ledger.clone(), &CertificateConfig::default()),
        database,
        ledger,
        anchors,
        chain,
        service,
    }
}
