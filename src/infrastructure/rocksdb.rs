use crate::domain::account::{Account, AccountId, AccountMutation, AccountPredicate};
use crate::domain::ports::{AccountStore, CreateOutcome, TransactionStore, UpdateOutcome};
use crate::domain::transaction::{
    Transaction, TransactionId, TransactionMutation, TransactionPredicate, TransactionState,
};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, ErrorKind, IteratorMode,
    OptimisticTransactionDB, Options,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Column Family for storing account records.
pub const CF_ACCOUNTS: &str = "accounts";
/// Column Family for storing the transaction log.
pub const CF_TRANSACTIONS: &str = "transactions";
/// Column Family indexing the transaction log by state, then `last_modified`.
pub const CF_TRANSACTION_INDEX: &str = "transaction_index";

/// How many times a single conditional update re-reads after losing a commit race.
const MAX_CONFLICT_RETRIES: usize = 16;

const STATES: [TransactionState; 4] = [
    TransactionState::Initial,
    TransactionState::Pending,
    TransactionState::Applied,
    TransactionState::Done,
];

/// Derives the secondary index key of a record, if the record is indexed.
type IndexKey<T> = fn(&T) -> Vec<u8>;

/// A persistent store implementation using RocksDB.
///
/// Handles both `Account` and `Transaction` records using separate Column
/// Families, serialized as JSON documents. Conditional updates run inside an
/// optimistic transaction: the record is read with `get_for_update`, the
/// predicate is evaluated, and the commit fails if another writer touched the
/// key in between, in which case the read-evaluate-write cycle starts over.
///
/// Transactions are also indexed by `(state, last_modified, id)` in
/// [`CF_TRANSACTION_INDEX`], written in the same optimistic transaction as the
/// record. Queries over unfinished transfers walk only the index ranges of the
/// states they ask for, so finished history is never deserialized.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<OptimisticTransactionDB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<OptimisticTransactionDB>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that the required column families exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = [CF_ACCOUNTS, CF_TRANSACTIONS, CF_TRANSACTION_INDEX]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect::<Vec<_>>();

        let db = OptimisticTransactionDB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| LedgerError::StoreError(format!("{name} column family not found")))
    }

    fn insert_if_absent<T: Serialize>(
        &self,
        cf_name: &str,
        key: &[u8],
        record: &T,
        index_key: Option<IndexKey<T>>,
    ) -> Result<CreateOutcome> {
        let cf = self.cf(cf_name)?;
        let value = serde_json::to_vec(record)?;

        for _ in 0..MAX_CONFLICT_RETRIES {
            let txn = self.db.transaction();
            if txn.get_for_update_cf(cf, key, true)?.is_some() {
                return Ok(CreateOutcome::DuplicateId);
            }
            txn.put_cf(cf, key, &value)?;
            if let Some(index_key) = index_key {
                txn.put_cf(self.cf(CF_TRANSACTION_INDEX)?, index_key(record), b"")?;
            }
            match txn.commit() {
                Ok(()) => return Ok(CreateOutcome::Created),
                Err(e) if is_conflict(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(conflict_exhausted(cf_name))
    }

    fn read<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Compare-and-set on one record. `update` returns `false` when the
    /// predicate does not hold, leaving the record untouched. An error from
    /// `update` aborts without writing. When `index_key` is given, the index
    /// entry moves with the record.
    fn compare_and_set<T, F>(
        &self,
        cf_name: &'static str,
        key: &[u8],
        id: &str,
        index_key: Option<IndexKey<T>>,
        update: F,
    ) -> Result<UpdateOutcome>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&mut T) -> Result<bool>,
    {
        let cf = self.cf(cf_name)?;

        for attempt in 0..MAX_CONFLICT_RETRIES {
            let txn = self.db.transaction();
            let bytes = txn
                .get_for_update_cf(cf, key, true)?
                .ok_or_else(|| LedgerError::not_found(cf_name, id))?;
            let mut record: T = serde_json::from_slice(&bytes)?;
            let before = index_key.map(|index_key| index_key(&record));

            if !update(&mut record)? {
                return Ok(UpdateOutcome::PredicateMismatch);
            }

            txn.put_cf(cf, key, serde_json::to_vec(&record)?)?;
            if let (Some(index_key), Some(before)) = (index_key, before) {
                let index = self.cf(CF_TRANSACTION_INDEX)?;
                txn.delete_cf(index, before)?;
                txn.put_cf(index, index_key(&record), b"")?;
            }
            match txn.commit() {
                Ok(()) => return Ok(UpdateOutcome::Applied),
                Err(e) if is_conflict(&e) => {
                    debug!(collection = cf_name, id, attempt, "write conflict, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(conflict_exhausted(cf_name))
    }

    /// Index keys of one state in `(last_modified, id)` order, at most `limit`.
    fn indexed(&self, state: TransactionState, limit: usize) -> Result<Vec<Box<[u8]>>> {
        let cf = self.cf(CF_TRANSACTION_INDEX)?;
        let prefix = [state_tag(state)];
        let mut keys = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix[..], Direction::Forward))
        {
            let (key, _) = item?;
            if key.first() != Some(&prefix[0]) || keys.len() == limit {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    /// Loads the records behind index keys, ordered by `(last_modified, id)`.
    fn load_indexed(&self, mut keys: Vec<Box<[u8]>>) -> Result<Vec<Transaction>> {
        keys.sort_by(|a, b| a[1..].cmp(&b[1..]));
        let mut transactions = Vec::with_capacity(keys.len());
        for key in keys {
            let id = indexed_id(&key)?;
            match self.read(CF_TRANSACTIONS, id.as_bytes())? {
                Some(tx) => transactions.push(tx),
                None => debug!(transaction = %id, "index entry without a record"),
            }
        }
        Ok(transactions)
    }
}

fn is_conflict(err: &rocksdb::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Busy | ErrorKind::TryAgain | ErrorKind::TimedOut
    )
}

fn conflict_exhausted(cf_name: &str) -> LedgerError {
    LedgerError::StoreError(format!(
        "write conflicts in {cf_name} persisted after {MAX_CONFLICT_RETRIES} attempts"
    ))
}

fn account_key(id: &AccountId) -> &[u8] {
    id.as_str().as_bytes()
}

fn transaction_key(id: &TransactionId) -> &[u8] {
    id.as_uuid().as_bytes()
}

fn state_tag(state: TransactionState) -> u8 {
    state as u8
}

/// `state tag | last_modified nanos, sign-flipped big endian | uuid`, so byte
/// order within a state is time order.
fn state_index_key(tx: &Transaction) -> Vec<u8> {
    let nanos = tx.last_modified.timestamp_nanos_opt().unwrap_or(i64::MAX);
    let mut key = Vec::with_capacity(1 + 8 + 16);
    key.push(state_tag(tx.state));
    key.extend_from_slice(&((nanos as u64) ^ (1 << 63)).to_be_bytes());
    key.extend_from_slice(tx.id.as_uuid().as_bytes());
    key
}

fn indexed_id(key: &[u8]) -> Result<TransactionId> {
    key.get(9..)
        .and_then(|bytes| Uuid::from_slice(bytes).ok())
        .map(TransactionId::from)
        .ok_or_else(|| LedgerError::StoreError("malformed transaction index key".into()))
}

#[async_trait]
impl AccountStore for RocksDBStore {
    async fn create(&self, account: Account) -> Result<CreateOutcome> {
        self.insert_if_absent(CF_ACCOUNTS, account_key(&account.id), &account, None)
    }

    async fn get(&self, id: &AccountId) -> Result<Option<Account>> {
        self.read(CF_ACCOUNTS, account_key(id))
    }

    async fn conditional_update(
        &self,
        id: &AccountId,
        predicate: AccountPredicate,
        mutation: AccountMutation,
    ) -> Result<UpdateOutcome> {
        self.compare_and_set(
            CF_ACCOUNTS,
            account_key(id),
            id.as_str(),
            None,
            |account: &mut Account| {
                if !predicate.matches(account) {
                    return Ok(false);
                }
                mutation.apply(account)?;
                Ok(true)
            },
        )
    }

    async fn all(&self) -> Result<Vec<Account>> {
        let cf = self.cf(CF_ACCOUNTS)?;
        let mut accounts = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            accounts.push(serde_json::from_slice::<Account>(&value)?);
        }
        Ok(accounts)
    }
}

#[async_trait]
impl TransactionStore for RocksDBStore {
    async fn create(&self, tx: Transaction) -> Result<CreateOutcome> {
        self.insert_if_absent(
            CF_TRANSACTIONS,
            transaction_key(&tx.id),
            &tx,
            Some(state_index_key),
        )
    }

    async fn get(&self, id: &TransactionId) -> Result<Option<Transaction>> {
        self.read(CF_TRANSACTIONS, transaction_key(id))
    }

    async fn conditional_update(
        &self,
        id: &TransactionId,
        predicate: TransactionPredicate,
        mutation: TransactionMutation,
    ) -> Result<UpdateOutcome> {
        let id_text = id.to_string();
        self.compare_and_set(
            CF_TRANSACTIONS,
            transaction_key(id),
            &id_text,
            Some(state_index_key),
            |tx: &mut Transaction| {
                if !predicate.matches(tx) {
                    return Ok(false);
                }
                mutation.apply(tx, Utc::now());
                Ok(true)
            },
        )
    }

    async fn find_oldest_excluding(
        &self,
        excluded: TransactionState,
    ) -> Result<Option<Transaction>> {
        let mut heads = Vec::new();
        for state in STATES.into_iter().filter(|state| *state != excluded) {
            heads.extend(self.indexed(state, 1)?);
        }
        Ok(self.load_indexed(heads)?.into_iter().next())
    }

    async fn find_excluding(&self, excluded: TransactionState) -> Result<Vec<Transaction>> {
        let mut keys = Vec::new();
        for state in STATES.into_iter().filter(|state| *state != excluded) {
            keys.extend(self.indexed(state, usize::MAX)?);
        }
        self.load_indexed(keys)
    }

    async fn count_by_state(&self, state: TransactionState) -> Result<usize> {
        Ok(self.indexed(state, usize::MAX)?.len())
    }
}
