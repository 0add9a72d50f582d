use crate::domain::account::{Account, AccountId, AccountMutation, AccountPredicate};
use crate::domain::ports::{AccountStore, CreateOutcome, TransactionStore, UpdateOutcome};
use crate::domain::transaction::{
    Transaction, TransactionId, TransactionMutation, TransactionPredicate, TransactionState,
};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory store for ledger accounts.
///
/// Uses `Arc<RwLock<HashMap<AccountId, Account>>>`; clones share the same map, so
/// several coordinators can operate on the same records. A conditional update
/// holds the write guard across predicate and mutation, which makes it atomic.
#[derive(Default, Clone)]
pub struct InMemoryAccountStore {
    accounts: Arc<RwLock<HashMap<AccountId, Account>>>,
}

impl InMemoryAccountStore {
    /// Creates a new, empty in-memory account store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn create(&self, account: Account) -> Result<CreateOutcome> {
        let mut accounts = self.accounts.write().await;
        match accounts.entry(account.id.clone()) {
            Entry::Occupied(_) => Ok(CreateOutcome::DuplicateId),
            Entry::Vacant(slot) => {
                slot.insert(account);
                Ok(CreateOutcome::Created)
            }
        }
    }

    async fn get(&self, id: &AccountId) -> Result<Option<Account>> {
        let accounts = self.accounts.read().await;
        Ok(accounts.get(id).cloned())
    }

    async fn conditional_update(
        &self,
        id: &AccountId,
        predicate: AccountPredicate,
        mutation: AccountMutation,
    ) -> Result<UpdateOutcome> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(id)
            .ok_or_else(|| LedgerError::not_found("accounts", id))?;

        if !predicate.matches(account) {
            return Ok(UpdateOutcome::PredicateMismatch);
        }
        mutation.apply(account)?;
        Ok(UpdateOutcome::Applied)
    }

    async fn all(&self) -> Result<Vec<Account>> {
        let accounts = self.accounts.read().await;
        let mut all: Vec<Account> = accounts.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }
}

/// A thread-safe in-memory transaction log.
///
/// Same sharing and atomicity rules as [`InMemoryAccountStore`].
#[derive(Default, Clone)]
pub struct InMemoryTransactionStore {
    transactions: Arc<RwLock<HashMap<TransactionId, Transaction>>>,
}

impl InMemoryTransactionStore {
    /// Creates a new, empty in-memory transaction store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn create(&self, tx: Transaction) -> Result<CreateOutcome> {
        let mut transactions = self.transactions.write().await;
        match transactions.entry(tx.id) {
            Entry::Occupied(_) => Ok(CreateOutcome::DuplicateId),
            Entry::Vacant(slot) => {
                slot.insert(tx);
                Ok(CreateOutcome::Created)
            }
        }
    }

    async fn get(&self, id: &TransactionId) -> Result<Option<Transaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions.get(id).cloned())
    }

    async fn conditional_update(
        &self,
        id: &TransactionId,
        predicate: TransactionPredicate,
        mutation: TransactionMutation,
    ) -> Result<UpdateOutcome> {
        let mut transactions = self.transactions.write().await;
        let tx = transactions
            .get_mut(id)
            .ok_or_else(|| LedgerError::not_found("transactions", id))?;

        if !predicate.matches(tx) {
            return Ok(UpdateOutcome::PredicateMismatch);
        }
        mutation.apply(tx, Utc::now());
        Ok(UpdateOutcome::Applied)
    }

    async fn find_oldest_excluding(
        &self,
        excluded: TransactionState,
    ) -> Result<Option<Transaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions
            .values()
            .filter(|tx| tx.state != excluded)
            .min_by_key(|tx| (tx.last_modified, tx.id))
            .cloned())
    }

    async fn find_excluding(&self, excluded: TransactionState) -> Result<Vec<Transaction>> {
        let transactions = self.transactions.read().await;
        let mut found: Vec<Transaction> = transactions
            .values()
            .filter(|tx| tx.state != excluded)
            .cloned()
            .collect();
        found.sort_by_key(|tx| (tx.last_modified, tx.id));
        Ok(found)
    }

    async fn count_by_state(&self, state: TransactionState) -> Result<usize> {
        let transactions = self.transactions.read().await;
        Ok(transactions.values().filter(|tx| tx.state == state).count())
    }
}
