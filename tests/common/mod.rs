#![allow(dead_code)]

use async_trait::async_trait;
use ledger2pc::application::coordinator::TransferCoordinator;
use ledger2pc::config::{CoordinatorConfig, RetryPolicy};
use ledger2pc::domain::account::{Account, AccountId, AccountMutation, AccountPredicate, Balance};
use ledger2pc::domain::ports::{AccountStore, CreateOutcome, TransactionStore, UpdateOutcome};
use ledger2pc::domain::transaction::{
    Transaction, TransactionId, TransactionMutation, TransactionPredicate, TransactionState,
};
use ledger2pc::error::{LedgerError, Result};
use ledger2pc::infrastructure::in_memory::{InMemoryAccountStore, InMemoryTransactionStore};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

/// Routes library logs through the test harness. Use `RUST_LOG=ledger2pc=debug`
/// to see state transitions.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn seed_accounts(store: &dyn AccountStore, accounts: &[(&str, Decimal)]) {
    for (id, balance) in accounts {
        let outcome = store
            .create(Account::new(*id, Balance::new(*balance)))
            .await
            .unwrap();
        assert_eq!(outcome, CreateOutcome::Created);
    }
}

pub fn fast_config(max_attempts: u32) -> CoordinatorConfig {
    CoordinatorConfig {
        retry: RetryPolicy::immediate(max_attempts),
        ..CoordinatorConfig::default()
    }
}

pub fn coordinator(
    accounts: &InMemoryAccountStore,
    transactions: &InMemoryTransactionStore,
) -> TransferCoordinator {
    TransferCoordinator::with_config(
        Box::new(accounts.clone()),
        Box::new(transactions.clone()),
        fast_config(3),
    )
}

pub async fn balance_of(store: &dyn AccountStore, id: &str) -> Balance {
    store
        .get(&AccountId::from(id))
        .await
        .unwrap()
        .expect("account exists")
        .balance
}

pub async fn total_balance(store: &dyn AccountStore) -> Balance {
    store
        .all()
        .await
        .unwrap()
        .iter()
        .fold(Balance::ZERO, |sum, account| sum + account.balance)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    /// Fail before touching the record.
    Refuse,
    /// Apply the write, then report a failure as if the reply was lost.
    LoseReply,
}

/// Per-key fault schedule shared between clones of a faulty store.
#[derive(Clone, Default)]
struct FaultPlan {
    faults: Arc<Mutex<HashMap<String, (Fault, u32)>>>,
}

impl FaultPlan {
    fn set(&self, key: String, fault: Fault, times: u32) {
        self.faults.lock().unwrap().insert(key, (fault, times));
    }

    fn clear(&self) {
        self.faults.lock().unwrap().clear();
    }

    fn take(&self, key: &str) -> Option<Fault> {
        let mut faults = self.faults.lock().unwrap();
        let entry = faults.get_mut(key)?;
        if entry.1 == 0 {
            return None;
        }
        entry.1 -= 1;
        Some(entry.0)
    }
}

fn injected(what: &str) -> LedgerError {
    LedgerError::StoreError(format!("injected failure on {what}"))
}

/// Account store that injects transient failures into conditional updates of
/// selected accounts.
#[derive(Clone)]
pub struct FaultyAccountStore {
    inner: InMemoryAccountStore,
    plan: FaultPlan,
}

impl FaultyAccountStore {
    pub fn wrap(inner: InMemoryAccountStore) -> Self {
        Self {
            inner,
            plan: FaultPlan::default(),
        }
    }

    pub fn refuse_updates(&self, account: &str, times: u32) {
        self.plan.set(account.to_string(), Fault::Refuse, times);
    }

    pub fn lose_update_replies(&self, account: &str, times: u32) {
        self.plan.set(account.to_string(), Fault::LoseReply, times);
    }

    pub fn heal(&self) {
        self.plan.clear();
    }
}

#[async_trait]
impl AccountStore for FaultyAccountStore {
    async fn create(&self, account: Account) -> Result<CreateOutcome> {
        self.inner.create(account).await
    }

    async fn get(&self, id: &AccountId) -> Result<Option<Account>> {
        self.inner.get(id).await
    }

    async fn conditional_update(
        &self,
        id: &AccountId,
        predicate: AccountPredicate,
        mutation: AccountMutation,
    ) -> Result<UpdateOutcome> {
        match self.plan.take(id.as_str()) {
            Some(Fault::Refuse) => Err(injected(id.as_str())),
            Some(Fault::LoseReply) => {
                self.inner
                    .conditional_update(id, predicate, mutation)
                    .await?;
                Err(injected(id.as_str()))
            }
            None => self.inner.conditional_update(id, predicate, mutation).await,
        }
    }

    async fn all(&self) -> Result<Vec<Account>> {
        self.inner.all().await
    }
}

const CREATE_KEY: &str = "create";
const TOUCH_KEY: &str = "touch";

/// Transaction log that injects transient failures into transitions out of a
/// given state, into touches, or into record creation.
#[derive(Clone)]
pub struct FaultyTransactionStore {
    inner: InMemoryTransactionStore,
    plan: FaultPlan,
}

impl FaultyTransactionStore {
    pub fn wrap(inner: InMemoryTransactionStore) -> Self {
        Self {
            inner,
            plan: FaultPlan::default(),
        }
    }

    pub fn refuse_transitions_from(&self, state: TransactionState, times: u32) {
        self.plan.set(state.to_string(), Fault::Refuse, times);
    }

    pub fn refuse_touches(&self, times: u32) {
        self.plan.set(TOUCH_KEY.to_string(), Fault::Refuse, times);
    }

    pub fn lose_create_replies(&self, times: u32) {
        self.plan.set(CREATE_KEY.to_string(), Fault::LoseReply, times);
    }

    pub fn heal(&self) {
        self.plan.clear();
    }
}

#[async_trait]
impl TransactionStore for FaultyTransactionStore {
    async fn create(&self, tx: Transaction) -> Result<CreateOutcome> {
        match self.plan.take(CREATE_KEY) {
            Some(Fault::Refuse) => Err(injected(CREATE_KEY)),
            Some(Fault::LoseReply) => {
                self.inner.create(tx).await?;
                Err(injected(CREATE_KEY))
            }
            None => self.inner.create(tx).await,
        }
    }

    async fn get(&self, id: &TransactionId) -> Result<Option<Transaction>> {
        self.inner.get(id).await
    }

    async fn conditional_update(
        &self,
        id: &TransactionId,
        predicate: TransactionPredicate,
        mutation: TransactionMutation,
    ) -> Result<UpdateOutcome> {
        let TransactionPredicate::StateIs(from) = predicate;
        let fault = match mutation {
            TransactionMutation::SetState(_) => self.plan.take(&from.to_string()),
            TransactionMutation::Touch => self.plan.take(TOUCH_KEY),
        };
        if fault.is_some() {
            return Err(injected(&format!("{mutation:?} from {from}")));
        }
        self.inner.conditional_update(id, predicate, mutation).await
    }

    async fn find_oldest_excluding(
        &self,
        excluded: TransactionState,
    ) -> Result<Option<Transaction>> {
        self.inner.find_oldest_excluding(excluded).await
    }

    async fn find_excluding(&self, excluded: TransactionState) -> Result<Vec<Transaction>> {
        self.inner.find_excluding(excluded).await
    }

    async fn count_by_state(&self, state: TransactionState) -> Result<usize> {
        self.inner.count_by_state(state).await
    }
}
