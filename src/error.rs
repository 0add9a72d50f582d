use crate::domain::transaction::{TransactionId, TransactionState};
use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Error, Diagnostic, Debug)]
pub enum LedgerError {
    #[error("Validation error: {0}")]
    #[diagnostic(code(ledger2pc::validation))]
    ValidationError(String),

    #[error("{collection} record `{id}` not found")]
    #[diagnostic(code(ledger2pc::not_found))]
    NotFound { collection: &'static str, id: String },

    #[error("Store error: {0}")]
    #[diagnostic(
        code(ledger2pc::store),
        help("transient storage failures are retried with backoff")
    )]
    StoreError(String),

    #[error("Transaction {transaction} stuck in state `{state}`: {source}")]
    #[diagnostic(
        code(ledger2pc::coordinator),
        help("the recorded state is unchanged; a later recovery sweep resumes it")
    )]
    CoordinatorError {
        transaction: TransactionId,
        state: TransactionState,
        #[source]
        source: Box<LedgerError>,
    },

    #[error("Serialization error: {0}")]
    #[diagnostic(code(ledger2pc::serialization))]
    SerializationError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    #[diagnostic(code(ledger2pc::csv))]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    #[diagnostic(code(ledger2pc::io))]
    IoError(#[from] std::io::Error),
}

impl LedgerError {
    pub fn not_found(collection: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            collection,
            id: id.to_string(),
        }
    }

    /// Whether the failure may clear up on its own and is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreError(_))
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for LedgerError {
    fn from(err: rocksdb::Error) -> Self {
        Self::StoreError(err.into_string())
    }
}
