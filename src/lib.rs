pub mod anchor;
pub mod certificates;
pub mod config;
pub mod database;
pub mod error;
pub mod hashing;
pub mod ledger;
pub mod merkle;
pub mod server;
pub mod verification;

pub use error::{LedgerError, Result};
