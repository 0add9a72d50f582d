use super::account::{AccountId, Amount};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TransactionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Position of a transfer in the two-phase protocol.
///
/// Variants are declared in protocol order so `Ord` reflects progress; a
/// recorded state never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Initial,
    Pending,
    Applied,
    Done,
}

impl TransactionState {
    /// The state a successful step out of `self` lands in.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Initial => Some(Self::Pending),
            Self::Pending => Some(Self::Applied),
            Self::Applied => Some(Self::Done),
            Self::Done => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Done
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "initial",
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// A validated request to move `value` from `source` to `destination`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransferRequest {
    pub source: AccountId,
    pub destination: AccountId,
    pub value: Decimal,
}

impl TransferRequest {
    pub fn new(
        source: impl Into<AccountId>,
        destination: impl Into<AccountId>,
        value: Decimal,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            value,
        }
    }

    /// Checks the request and returns the positive amount to move.
    pub fn validate(&self) -> Result<Amount> {
        if self.source == self.destination {
            return Err(LedgerError::ValidationError(format!(
                "Source and destination must differ, both are `{}`",
                self.source
            )));
        }
        Amount::new(self.value)
    }
}

/// A transfer record in the transaction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: TransactionId,
    pub source: AccountId,
    pub destination: AccountId,
    pub value: Amount,
    pub state: TransactionState,
    pub last_modified: DateTime<Utc>,
}

impl Transaction {
    /// Builds a fresh `initial` record from a validated request.
    pub fn from_request(request: TransferRequest) -> Result<Self> {
        let value = request.validate()?;
        Ok(Self {
            id: TransactionId::new(),
            source: request.source,
            destination: request.destination,
            value,
            state: TransactionState::Initial,
            last_modified: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPredicate {
    StateIs(TransactionState),
}

impl TransactionPredicate {
    pub fn matches(&self, tx: &Transaction) -> bool {
        match self {
            Self::StateIs(state) => tx.state == *state,
        }
    }
}

/// Changes a store may make to a transaction record. Every mutation stamps
/// `last_modified`; `Touch` does only that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMutation {
    SetState(TransactionState),
    Touch,
}

impl TransactionMutation {
    pub fn apply(&self, tx: &mut Transaction, now: DateTime<Utc>) {
        if let Self::SetState(state) = self {
            tx.state = *state;
        }
        tx.last_modified = now;
    }
}
