use crate::application::retry::with_retry;
use crate::config::CoordinatorConfig;
use crate::domain::account::{Account, AccountId, AccountMutation, AccountPredicate};
use crate::domain::ports::{AccountStoreBox, CreateOutcome, TransactionStoreBox, UpdateOutcome};
use crate::domain::transaction::{
    Transaction, TransactionId, TransactionMutation, TransactionPredicate, TransactionState,
    TransferRequest,
};
use crate::error::{LedgerError, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One transfer that could not be driven to `done`.
#[derive(Debug)]
pub struct TransactionFailure {
    pub transaction: TransactionId,
    pub error: LedgerError,
}

/// Outcome of a recovery sweep.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Unfinished transfers driven to `done` by this sweep.
    pub resumed: usize,
    /// Unfinished transfers left alone because they were modified too recently.
    pub skipped: usize,
    pub failures: Vec<TransactionFailure>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of draining the transaction log with [`TransferCoordinator::run_until_idle`].
#[derive(Debug, Default)]
pub struct ProcessReport {
    pub completed: usize,
    pub failures: Vec<TransactionFailure>,
}

/// Drives transfers through the two-phase protocol
/// `initial -> pending -> applied -> done`.
///
/// Every write is a conditional update against a single record, so any number of
/// coordinators may share the same stores without further locking. A lost
/// conditional update means another worker already made that move; the
/// coordinator re-reads the record and carries on from whatever state it finds.
///
/// Transient store failures are retried per call with the configured backoff.
/// When retries run out the transfer is reported as stuck, its recorded state is
/// left as is, and a later [`recover`](Self::recover) picks it up again.
pub struct TransferCoordinator {
    accounts: AccountStoreBox,
    transactions: TransactionStoreBox,
    config: CoordinatorConfig,
}

impl TransferCoordinator {
    /// Creates a coordinator with the default configuration.
    ///
    /// # Arguments
    ///
    /// * `accounts` - The ledger store holding account records.
    /// * `transactions` - The transaction log.
    pub fn new(accounts: AccountStoreBox, transactions: TransactionStoreBox) -> Self {
        Self::with_config(accounts, transactions, CoordinatorConfig::default())
    }

    pub fn with_config(
        accounts: AccountStoreBox,
        transactions: TransactionStoreBox,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            accounts,
            transactions,
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Records a new transfer in `initial` state and returns its id.
    ///
    /// Invalid requests are rejected before anything is written. Both accounts
    /// must already exist.
    pub async fn submit(
        &self,
        source: impl Into<AccountId>,
        destination: impl Into<AccountId>,
        value: Decimal,
    ) -> Result<TransactionId> {
        self.submit_request(TransferRequest::new(source, destination, value))
            .await
    }

    pub async fn submit_request(&self, request: TransferRequest) -> Result<TransactionId> {
        let tx = Transaction::from_request(request)?;

        for account in [&tx.source, &tx.destination] {
            if self.account(account).await?.is_none() {
                return Err(LedgerError::not_found("accounts", account));
            }
        }

        let id = tx.id;
        let outcome = with_retry(&self.config.retry, "create transaction", || {
            self.transactions.create(tx.clone())
        })
        .await?;
        // The id is freshly generated, so a duplicate can only be an earlier
        // attempt of this same call that landed before its reply was lost.
        if outcome == CreateOutcome::DuplicateId {
            debug!(transaction = %id, "create retried after it had already landed");
        }

        info!(
            transaction = %id,
            source = %tx.source,
            destination = %tx.destination,
            value = %tx.value,
            "transfer submitted"
        );
        Ok(id)
    }

    /// Submits every request, reporting each outcome separately.
    pub async fn submit_batch<I>(&self, requests: I) -> Vec<Result<TransactionId>>
    where
        I: IntoIterator<Item = TransferRequest>,
    {
        let mut outcomes = Vec::new();
        for request in requests {
            let outcome = self.submit_request(request).await;
            if let Err(err) = &outcome {
                warn!(error = %err, "transfer rejected");
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Picks the unfinished transfer with the oldest `last_modified` and drives it
    /// as far as it will go. Returns `false` when there was nothing to do.
    pub async fn process_next(&self) -> Result<bool> {
        let Some(tx) = self.oldest_unfinished().await? else {
            return Ok(false);
        };
        self.resume(tx).await?;
        Ok(true)
    }

    /// Drives one named transfer to completion.
    pub async fn drive(&self, id: &TransactionId) -> Result<TransactionState> {
        let tx = self
            .transaction(id)
            .await?
            .ok_or_else(|| LedgerError::not_found("transactions", id))?;
        self.resume(tx).await
    }

    /// Resumes every unfinished transfer from its recorded state.
    ///
    /// Transfers touched more recently than `recovery.stale_after` are assumed to
    /// be in the hands of a live worker and skipped. Safe to run repeatedly and
    /// alongside normal processing.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let cutoff = chrono::Duration::from_std(self.config.recovery.stale_after())
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let unfinished = with_retry(&self.config.retry, "scan unfinished", || {
            self.transactions.find_excluding(TransactionState::Done)
        })
        .await?;

        let mut report = RecoveryReport::default();
        for tx in unfinished {
            if cutoff.is_none_or(|cutoff| tx.last_modified > cutoff) {
                report.skipped += 1;
                continue;
            }
            let id = tx.id;
            match self.resume(tx).await {
                Ok(_) => report.resumed += 1,
                Err(error) => report.failures.push(TransactionFailure {
                    transaction: id,
                    error,
                }),
            }
        }

        info!(
            resumed = report.resumed,
            skipped = report.skipped,
            failed = report.failures.len(),
            "recovery sweep finished"
        );
        Ok(report)
    }

    /// Calls into the log until every unfinished transfer left has already
    /// failed during this run.
    pub async fn run_until_idle(&self) -> Result<ProcessReport> {
        let mut report = ProcessReport::default();
        let mut failed = HashSet::new();

        loop {
            let unfinished = with_retry(&self.config.retry, "scan unfinished", || {
                self.transactions.find_excluding(TransactionState::Done)
            })
            .await?;
            let Some(tx) = unfinished.into_iter().find(|tx| !failed.contains(&tx.id)) else {
                break;
            };
            let id = tx.id;
            match self.resume(tx).await {
                Ok(_) => report.completed += 1,
                Err(error) => {
                    failed.insert(id);
                    report.failures.push(TransactionFailure {
                        transaction: id,
                        error,
                    });
                }
            }
        }
        Ok(report)
    }

    /// Drops settled ids from every account whose transfer has been `done`
    /// for at least `older_than`, and returns how many were dropped.
    ///
    /// A worker that still holds a view of a transfer from before `done` could
    /// apply it again once the id is gone, so `older_than` must be longer than
    /// any drive can take.
    pub async fn prune_settled(&self, older_than: Duration) -> Result<usize> {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };

        let mut forgotten = 0;
        for account in self.accounts_snapshot().await? {
            for id in &account.settled_transactions {
                let Some(tx) = self.transaction(id).await? else {
                    continue;
                };
                if !tx.state.is_terminal() || tx.last_modified > cutoff {
                    continue;
                }
                let outcome = self
                    .update_account(
                        &account.id,
                        AccountPredicate::Settled(*id),
                        AccountMutation::Forget { transaction: *id },
                    )
                    .await?;
                if outcome == UpdateOutcome::Applied {
                    forgotten += 1;
                }
            }
        }

        info!(forgotten, "settled transfers pruned");
        Ok(forgotten)
    }

    pub async fn account(&self, id: &AccountId) -> Result<Option<Account>> {
        with_retry(&self.config.retry, "get account", || self.accounts.get(id)).await
    }

    pub async fn transaction(&self, id: &TransactionId) -> Result<Option<Transaction>> {
        with_retry(&self.config.retry, "get transaction", || {
            self.transactions.get(id)
        })
        .await
    }

    /// Returns the current state of every account.
    pub async fn accounts_snapshot(&self) -> Result<Vec<Account>> {
        with_retry(&self.config.retry, "list accounts", || self.accounts.all()).await
    }

    async fn oldest_unfinished(&self) -> Result<Option<Transaction>> {
        with_retry(&self.config.retry, "find oldest unfinished", || {
            self.transactions
                .find_oldest_excluding(TransactionState::Done)
        })
        .await
    }

    async fn resume(&self, mut tx: Transaction) -> Result<TransactionState> {
        let err = match self.advance(&mut tx).await {
            Ok(state) => return Ok(state),
            Err(err) => err,
        };

        // Another worker may have moved the record while this drive was failing.
        let recorded = match self.transactions.get(&tx.id).await {
            Ok(Some(recorded)) => recorded,
            Ok(None) => return Err(stuck(&tx, err)),
            Err(read_err) => {
                warn!(transaction = %tx.id, error = %read_err, "could not re-read failed transfer");
                return Err(stuck(&tx, err));
            }
        };
        if recorded.state.is_terminal() {
            debug!(
                transaction = %tx.id,
                error = %err,
                "transfer finished by another worker while this drive failed"
            );
            return Ok(TransactionState::Done);
        }

        self.requeue(&recorded).await;
        Err(stuck(&recorded, err))
    }

    async fn advance(&self, tx: &mut Transaction) -> Result<TransactionState> {
        loop {
            let step = match tx.state {
                TransactionState::Initial => {
                    self.transition(tx, TransactionState::Initial, TransactionState::Pending)
                        .await
                }
                TransactionState::Pending => match self.apply(tx).await {
                    Ok(()) => {
                        self.transition(tx, TransactionState::Pending, TransactionState::Applied)
                            .await
                    }
                    Err(err) => Err(err),
                },
                TransactionState::Applied => match self.release(tx).await {
                    Ok(()) => {
                        self.transition(tx, TransactionState::Applied, TransactionState::Done)
                            .await
                    }
                    Err(err) => Err(err),
                },
                TransactionState::Done => return Ok(TransactionState::Done),
            };
            tx.state = step?;
        }
    }

    /// Moves the record from `from` to `to`. If someone else got there first,
    /// returns whatever state the record is in now.
    async fn transition(
        &self,
        tx: &Transaction,
        from: TransactionState,
        to: TransactionState,
    ) -> Result<TransactionState> {
        let outcome = with_retry(&self.config.retry, "transition", || {
            self.transactions.conditional_update(
                &tx.id,
                TransactionPredicate::StateIs(from),
                TransactionMutation::SetState(to),
            )
        })
        .await?;

        match outcome {
            UpdateOutcome::Applied => {
                debug!(transaction = %tx.id, %from, %to, "transfer advanced");
                Ok(to)
            }
            UpdateOutcome::PredicateMismatch => {
                let current = self
                    .transaction(&tx.id)
                    .await?
                    .ok_or_else(|| LedgerError::not_found("transactions", tx.id))?;
                debug!(
                    transaction = %tx.id,
                    expected = %from,
                    found = %current.state,
                    "transfer already advanced by another worker"
                );
                Ok(current.state)
            }
        }
    }

    /// Applies the transfer to both accounts. Both updates are always attempted.
    async fn apply(&self, tx: &Transaction) -> Result<()> {
        let (source, destination) = tokio::join!(
            self.update_account(
                &tx.source,
                AccountPredicate::Untouched(tx.id),
                AccountMutation::Debit {
                    transaction: tx.id,
                    amount: tx.value,
                },
            ),
            self.update_account(
                &tx.destination,
                AccountPredicate::Untouched(tx.id),
                AccountMutation::Credit {
                    transaction: tx.id,
                    amount: tx.value,
                },
            ),
        );
        source?;
        destination?;
        Ok(())
    }

    /// Clears the pending marker from both accounts. A marker that is already
    /// gone counts as cleaned.
    async fn release(&self, tx: &Transaction) -> Result<()> {
        let release = AccountMutation::Release {
            transaction: tx.id,
        };
        let (source, destination) = tokio::join!(
            self.update_account(&tx.source, AccountPredicate::Pending(tx.id), release),
            self.update_account(&tx.destination, AccountPredicate::Pending(tx.id), release),
        );
        source?;
        destination?;
        Ok(())
    }

    async fn update_account(
        &self,
        id: &AccountId,
        predicate: AccountPredicate,
        mutation: AccountMutation,
    ) -> Result<UpdateOutcome> {
        let outcome = with_retry(&self.config.retry, "update account", || {
            self.accounts.conditional_update(id, predicate, mutation)
        })
        .await?;
        if outcome == UpdateOutcome::PredicateMismatch {
            debug!(account = %id, ?mutation, "account already in target shape");
        }
        Ok(outcome)
    }

    /// Stamps `last_modified` without changing state so a transfer that just
    /// failed goes behind newer work. Best effort only, and never on a finished
    /// transfer.
    async fn requeue(&self, recorded: &Transaction) {
        if recorded.state.is_terminal() {
            return;
        }
        if let Err(err) = self
            .transactions
            .conditional_update(
                &recorded.id,
                TransactionPredicate::StateIs(recorded.state),
                TransactionMutation::Touch,
            )
            .await
        {
            warn!(transaction = %recorded.id, error = %err, "could not requeue failed transfer");
        }
    }
}

/// Wraps an exhausted transient failure with the transfer id and the state it
/// is recorded in. Permanent failures pass through unchanged.
fn stuck(tx: &Transaction, err: LedgerError) -> LedgerError {
    if !err.is_transient() {
        return err;
    }
    error!(
        transaction = %tx.id,
        state = %tx.state,
        error = %err,
        "retries exhausted, transfer left for recovery"
    );
    LedgerError::CoordinatorError {
        transaction: tx.id,
        state: tx.state,
        source: Box::new(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::Balance;
    use crate::domain::ports::{AccountStore, TransactionStore};
    use crate::infrastructure::in_memory::{InMemoryAccountStore, InMemoryTransactionStore};
    use rust_decimal_macros::dec;

    async fn seeded() -> (TransferCoordinator, InMemoryTransactionStore) {
        let accounts = InMemoryAccountStore::new();
        for id in ["A", "B"] {
            accounts
                .create(Account::new(id, Balance::new(dec!(1000))))
                .await
                .unwrap();
        }
        let transactions = InMemoryTransactionStore::new();
        let coordinator =
            TransferCoordinator::new(Box::new(accounts), Box::new(transactions.clone()));
        (coordinator, transactions)
    }

    #[tokio::test]
    async fn test_simple_two_phase_commit() {
        let (coordinator, transactions) = seeded().await;

        let id = coordinator.submit("A", "B", dec!(100)).await.unwrap();
        assert!(coordinator.process_next().await.unwrap());
        assert!(!coordinator.process_next().await.unwrap());

        let a = coordinator.account(&"A".into()).await.unwrap().unwrap();
        let b = coordinator.account(&"B".into()).await.unwrap().unwrap();
        assert_eq!(a.balance, Balance::new(dec!(900)));
        assert_eq!(b.balance, Balance::new(dec!(1100)));
        assert!(a.pending_transactions.is_empty());
        assert!(b.pending_transactions.is_empty());

        let tx = coordinator.transaction(&id).await.unwrap().unwrap();
        assert_eq!(tx.state, TransactionState::Done);
        assert_eq!(
            transactions
                .count_by_state(TransactionState::Done)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_invalid_submissions_write_nothing() {
        let (coordinator, transactions) = seeded().await;

        let zero = coordinator.submit("A", "B", dec!(0)).await;
        let negative = coordinator.submit("A", "B", dec!(-5)).await;
        let same = coordinator.submit("A", "A", dec!(10)).await;

        assert!(matches!(zero, Err(LedgerError::ValidationError(_))));
        assert!(matches!(negative, Err(LedgerError::ValidationError(_))));
        assert!(matches!(same, Err(LedgerError::ValidationError(_))));
        assert!(
            transactions
                .find_excluding(TransactionState::Done)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_submit_to_unknown_account_is_not_found() {
        let (coordinator, transactions) = seeded().await;

        let result = coordinator.submit("A", "Z", dec!(10)).await;
        assert!(matches!(result, Err(LedgerError::NotFound { .. })));
        assert!(
            transactions
                .find_oldest_excluding(TransactionState::Done)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_driving_a_done_transfer_is_a_no_op() {
        let (coordinator, _) = seeded().await;
        let id = coordinator.submit("A", "B", dec!(100)).await.unwrap();

        assert_eq!(
            coordinator.drive(&id).await.unwrap(),
            TransactionState::Done
        );
        let before = coordinator.accounts_snapshot().await.unwrap();
        let done_at = coordinator
            .transaction(&id)
            .await
            .unwrap()
            .unwrap()
            .last_modified;

        assert_eq!(
            coordinator.drive(&id).await.unwrap(),
            TransactionState::Done
        );
        assert!(!coordinator.process_next().await.unwrap());
        let report = coordinator.recover().await.unwrap();

        assert_eq!(report.resumed, 0);
        assert_eq!(coordinator.accounts_snapshot().await.unwrap(), before);
        let after = coordinator.transaction(&id).await.unwrap().unwrap();
        assert_eq!(after.last_modified, done_at);
    }

    #[tokio::test]
    async fn test_resumes_from_recorded_pending_state() {
        let (coordinator, transactions) = seeded().await;
        let id = coordinator.submit("A", "B", dec!(250)).await.unwrap();

        // Another worker already moved the record to `pending`.
        transactions
            .conditional_update(
                &id,
                TransactionPredicate::StateIs(TransactionState::Initial),
                TransactionMutation::SetState(TransactionState::Pending),
            )
            .await
            .unwrap();

        assert_eq!(
            coordinator.drive(&id).await.unwrap(),
            TransactionState::Done
        );
        let snapshot = coordinator.accounts_snapshot().await.unwrap();
        let total: Balance = snapshot
            .iter()
            .fold(Balance::ZERO, |sum, account| sum + account.balance);
        assert_eq!(total, Balance::new(dec!(2000)));
        assert_eq!(snapshot[0].balance, Balance::new(dec!(750)));
    }

    #[tokio::test]
    async fn test_drive_unknown_transaction_is_not_found() {
        let (coordinator, _) = seeded().await;
        let result = coordinator.drive(&TransactionId::new()).await;
        assert!(matches!(result, Err(LedgerError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_submit_batch_reports_each_request() {
        let (coordinator, _) = seeded().await;

        let outcomes = coordinator
            .submit_batch(vec![
                TransferRequest::new("A", "B", dec!(10)),
                TransferRequest::new("B", "B", dec!(10)),
                TransferRequest::new("B", "A", dec!(5)),
            ])
            .await;

        assert!(outcomes[0].is_ok());
        assert!(matches!(outcomes[1], Err(LedgerError::ValidationError(_))));
        assert!(outcomes[2].is_ok());

        let report = coordinator.run_until_idle().await.unwrap();
        assert_eq!(report.completed, 2);
        assert!(report.failures.is_empty());
        let a = coordinator.account(&"A".into()).await.unwrap().unwrap();
        assert_eq!(a.balance, Balance::new(dec!(995)));
    }

    #[tokio::test]
    async fn test_prune_drops_only_old_finished_transfers() {
        let (coordinator, _) = seeded().await;
        let id = coordinator.submit("A", "B", dec!(100)).await.unwrap();
        coordinator.drive(&id).await.unwrap();

        let kept = coordinator
            .prune_settled(Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(kept, 0);
        let a = coordinator.account(&"A".into()).await.unwrap().unwrap();
        assert!(a.settled_transactions.contains(&id));

        let dropped = coordinator.prune_settled(Duration::ZERO).await.unwrap();
        assert_eq!(dropped, 2);
        for account in coordinator.accounts_snapshot().await.unwrap() {
            assert!(account.settled_transactions.is_empty());
            assert!(account.pending_transactions.is_empty());
        }
        let a = coordinator.account(&"A".into()).await.unwrap().unwrap();
        assert_eq!(a.balance, Balance::new(dec!(900)));
    }
}
