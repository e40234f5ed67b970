use std::time::Duration;

use thiserror::Error;

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            other => Self::DatabaseError(format!("Database error: {}", other)),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for LedgerError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::DatabaseError(format!("Migration error: {}", err))
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Hash mismatch for {record_id}: stored {stored}, computed {computed}")]
    HashMismatch {
        record_id: String,
        stored: String,
        computed: String,
    },

    #[error("Chain unavailable: {0}")]
    ChainUnavailable(String),

    #[error("Chain timeout: {0}")]
    ChainTimeout(String),

    #[error("Chain rejected anchor: {0}")]
    ChainRejected(String),

    #[error("Proof generation failed for record {record_id}: {reason}")]
    ProofGeneration { record_id: String, reason: String },

    #[error("Ledger tail contention: {0}")]
    TailConflict(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl LedgerError {
    pub fn record_not_found(hash: &str) -> Self {
        Self::NotFound(format!("record with hash {}", hash))
    }

    pub fn certificate_not_found(key: &str) -> Self {
        Self::NotFound(format!("certificate {}", key))
    }

    /// Transient chain failures leave the batch retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ChainUnavailable(_) | Self::ChainTimeout(_) | Self::TailConflict(_)
        )
    }
}

/// Failure reported by a chain provider
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChainError {
    #[error("chain unavailable: {0}")]
    Unavailable(String),

    #[error("chain request timed out after {0:?}")]
    Timeout(Duration),

    #[error("chain rejected submission: {0}")]
    Rejected(String),

    /// The chain has no record of the transaction, e.g. not yet mined or indexed
    #[error("transaction not found on chain: {0}")]
    NotFound(String),
}

impl ChainError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ChainError::Rejected(_))
    }
}

impl From<ChainError> for LedgerError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Unavailable(msg) => Self::ChainUnavailable(msg),
            ChainError::Timeout(after) => Self::ChainTimeout(format!("no response after {:?}", after)),
            ChainError::Rejected(msg) => Self::ChainRejected(msg),
            ChainError::NotFound(tx) => Self::NotFound(format!("transaction {}", tx)),
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
