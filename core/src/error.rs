use thiserror::Error;

use crate::lifecycle::LifecycleError;

#[derive(Error, Debug)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Client '{client_id}' not found")]
    ClientNotFound { client_id: String },

    #[error("Payment {gateway}/{external_reference} not found")]
    PaymentNotFound {
        gateway: String,
        external_reference: String,
    },

    #[error("Lifecycle rejected operation for client '{client_id}': {source}")]
    Lifecycle {
        client_id: String,
        #[source]
        source: LifecycleError,
    },

    /// The stored row changed between read and write.
    #[error("Concurrent update on client '{client_id}'")]
    Conflict { client_id: String },

    /// Ledger contract broken. The surrounding transaction is rolled back.
    #[error("Ledger invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BillingResult<T> = Result<T, BillingError>;

impl BillingError {
    /// True when the operation was rolled back for a reason a redelivery
    /// can get past: storage trouble or a lost race.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Conflict { .. } | Self::InvariantViolation(_) | Self::Other(_)
        )
    }
}
