//! External chain anchoring of ledger batches

pub mod batch;
pub mod provider;
pub mod service;
pub mod simulated;
pub mod store;

pub use batch::{AnchorBatcher, BatchOutcome, BatchReport, ConfirmationReport};
pub use provider::{known_chains, AnchorReceipt, ChainInfo, ChainProvider};
pub use service::{AnchorPriority, AnchorResult, AnchorService, ChainHealth, RetryPolicy};
pub use simulated::SimulatedChainProvider;
pub use store::{AnchorStore, BatchClaim};
