use super::account::{Account, AccountId, AccountMutation, AccountPredicate};
use super::transaction::{
    Transaction, TransactionId, TransactionMutation, TransactionPredicate, TransactionState,
};
use crate::error::Result;
use async_trait::async_trait;

/// Result of a conditional update. A missing record is reported as
/// `LedgerError::NotFound` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    PredicateMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    DuplicateId,
}

/// Account records with single-record compare-and-set.
///
/// `conditional_update` must evaluate the predicate and apply the mutation as
/// one atomic step against the stored record.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn create(&self, account: Account) -> Result<CreateOutcome>;
    async fn get(&self, id: &AccountId) -> Result<Option<Account>>;
    async fn conditional_update(
        &self,
        id: &AccountId,
        predicate: AccountPredicate,
        mutation: AccountMutation,
    ) -> Result<UpdateOutcome>;
    async fn all(&self) -> Result<Vec<Account>>;
}

/// Transaction records with the same compare-and-set primitive. Implementations
/// stamp `last_modified` on every applied mutation.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn create(&self, tx: Transaction) -> Result<CreateOutcome>;
    async fn get(&self, id: &TransactionId) -> Result<Option<Transaction>>;
    async fn conditional_update(
        &self,
        id: &TransactionId,
        predicate: TransactionPredicate,
        mutation: TransactionMutation,
    ) -> Result<UpdateOutcome>;
    /// Oldest `last_modified` first among records not in `excluded`.
    async fn find_oldest_excluding(
        &self,
        excluded: TransactionState,
    ) -> Result<Option<Transaction>>;
    /// Every record not in `excluded`, oldest first.
    async fn find_excluding(&self, excluded: TransactionState) -> Result<Vec<Transaction>>;
    async fn count_by_state(&self, state: TransactionState) -> Result<usize>;
}

pub type AccountStoreBox = Box<dyn AccountStore>;
pub type TransactionStoreBox = Box<dyn TransactionStore>;
