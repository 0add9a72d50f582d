use super::transaction::TransactionId;
use crate::error::LedgerError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::{Add, Sub};

/// Represents a monetary value held by an account.
///
/// This is a wrapper around `rust_decimal::Decimal` so balances never pass through
/// floating point. Balances are signed: the protocol does not enforce overdraft rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Balance(pub Decimal);

/// Represents a positive monetary amount moved by a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, LedgerError> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(LedgerError::ValidationError(format!(
                "Transfer value must be positive, got {value}"
            )))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = LedgerError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Balance {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(amount: Decimal) -> Self {
        Self(amount)
    }

    /// Adds `amount`, failing instead of overflowing the decimal range.
    pub fn credited(self, amount: Amount) -> Result<Self, LedgerError> {
        self.0
            .checked_add(amount.value())
            .map(Self)
            .ok_or_else(|| out_of_range(self, "credit", amount))
    }

    /// Subtracts `amount`, failing instead of overflowing the decimal range.
    pub fn debited(self, amount: Amount) -> Result<Self, LedgerError> {
        self.0
            .checked_sub(amount.value())
            .map(Self)
            .ok_or_else(|| out_of_range(self, "debit", amount))
    }
}

fn out_of_range(balance: Balance, operation: &str, amount: Amount) -> LedgerError {
    LedgerError::ValidationError(format!(
        "Balance {balance} cannot take a {operation} of {amount} without overflowing"
    ))
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Add for Balance {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Balance {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AccountId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A ledger account touched by two-phase transfers.
///
/// `pending_transactions` holds the ids of transfers whose delta has been applied
/// but not yet released. `settled_transactions` remembers released ids so a
/// transfer can never be applied to the same account twice, even by a worker
/// that read a stale transaction state.
///
/// The settled set grows with every transfer the account takes part in. An id
/// may be dropped with [`AccountMutation::Forget`] once its transaction is `done`
/// and no worker can still hold a view of it from before `done`, i.e. it has not
/// been modified for longer than any drive can take. Dropping it earlier lets a
/// late worker apply the transfer again.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: AccountId,
    pub balance: Balance,
    #[serde(default)]
    pub pending_transactions: BTreeSet<TransactionId>,
    #[serde(default)]
    pub settled_transactions: BTreeSet<TransactionId>,
}

impl Account {
    pub fn new(id: impl Into<AccountId>, balance: Balance) -> Self {
        Self {
            id: id.into(),
            balance,
            pending_transactions: BTreeSet::new(),
            settled_transactions: BTreeSet::new(),
        }
    }

    /// True when the transfer has neither been applied nor released here.
    pub fn is_untouched_by(&self, tx: &TransactionId) -> bool {
        !self.pending_transactions.contains(tx) && !self.settled_transactions.contains(tx)
    }

    pub fn is_pending(&self, tx: &TransactionId) -> bool {
        self.pending_transactions.contains(tx)
    }
}

/// Guard evaluated atomically against the stored account before a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountPredicate {
    /// The transfer has not been applied to this account yet.
    Untouched(TransactionId),
    /// The transfer is applied and still marked pending on this account.
    Pending(TransactionId),
    /// The transfer was released here and is still remembered as settled.
    Settled(TransactionId),
}

impl AccountPredicate {
    pub fn matches(&self, account: &Account) -> bool {
        match self {
            Self::Untouched(tx) => account.is_untouched_by(tx),
            Self::Pending(tx) => account.is_pending(tx),
            Self::Settled(tx) => account.settled_transactions.contains(tx),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountMutation {
    Debit {
        transaction: TransactionId,
        amount: Amount,
    },
    Credit {
        transaction: TransactionId,
        amount: Amount,
    },
    Release {
        transaction: TransactionId,
    },
    /// Drops a settled id. See [`Account`] for when this is safe.
    Forget {
        transaction: TransactionId,
    },
}

impl AccountMutation {
    /// Applies the mutation, leaving the account untouched when it fails.
    pub fn apply(&self, account: &mut Account) -> Result<(), LedgerError> {
        match *self {
            Self::Debit {
                transaction,
                amount,
            } => {
                account.balance = account.balance.debited(amount)?;
                account.pending_transactions.insert(transaction);
            }
            Self::Credit {
                transaction,
                amount,
            } => {
                account.balance = account.balance.credited(amount)?;
                account.pending_transactions.insert(transaction);
            }
            Self::Release { transaction } => {
                account.pending_transactions.remove(&transaction);
                account.settled_transactions.insert(transaction);
            }
            Self::Forget { transaction } => {
                account.settled_transactions.remove(&transaction);
            }
        }
        Ok(())
    }
}
