//! Transparency Ledger
//!
//! Append-only, hash-chained record of platform financial events.

pub mod chain;
pub mod events;
pub mod record;
pub mod verify;

pub use chain::{AppendedRecord, LedgerStats, RecordLedger};
pub use record::{AnchorStatus, EntityType, RecordMetadata, RecordType, TransparencyRecord};
pub use verify::{verify_chain, ChainAuditReport};
