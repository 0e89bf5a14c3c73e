//! Transaction coordinator interface and a lightweight in-process
//! implementation.
//!
//! The engine only needs three things from a transaction: its status, a way
//! to register a completion callback, and a way to mark it rollback-only.
//! [`LocalTransactionCoordinator`] provides those with one transaction per
//! thread, which is all the engine and its tests require.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, ThreadId},
};

use tracing::debug;

use crate::error::{Result, TimerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Status codes a transaction can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Active,
    MarkedRollback,
    Preparing,
    Prepared,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    NoTransaction,
    Unknown,
}

/// Final outcome passed to completion callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    RolledBack,
}

/// Completion callback registered with a transaction.
pub trait Synchronization: Send {
    fn before_completion(&mut self) {}

    /// Called exactly once, after the outcome is known.
    fn after_completion(self: Box<Self>, outcome: TxOutcome);
}

pub trait Transaction: Send + Sync {
    fn id(&self) -> TransactionId;

    fn status(&self) -> TxStatus;

    /// True while before-completion callbacks are running.
    fn is_before_completion(&self) -> bool;

    fn register_synchronization(&self, sync: Box<dyn Synchronization>) -> Result<()>;

    fn set_rollback_only(&self);
}

pub trait TransactionCoordinator: Send + Sync {
    /// The transaction associated with the calling thread, if any.
    fn current_transaction(&self) -> Option<Arc<dyn Transaction>>;
}

/// Whether new work should be staged against `tx` rather than applied now.
///
/// Rollback-only, finished, unknown and before-completion transactions all
/// count as "no transaction".
pub fn is_transaction_active(tx: &dyn Transaction) -> bool {
    if tx.is_before_completion() {
        return false;
    }
    !matches!(
        tx.status(),
        TxStatus::MarkedRollback
            | TxStatus::RolledBack
            | TxStatus::RollingBack
            | TxStatus::NoTransaction
            | TxStatus::Unknown
            | TxStatus::Committed
    )
}

/// Coordinator for deployments without transactions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTransactions;

impl TransactionCoordinator for NoTransactions {
    fn current_transaction(&self) -> Option<Arc<dyn Transaction>> {
        None
    }
}

// ---------------------------------------------------------------------------
// LocalTransaction
// ---------------------------------------------------------------------------

/// In-process transaction context.
pub struct LocalTransaction {
    id: TransactionId,
    status: Mutex<TxStatus>,
    syncs: Mutex<Vec<Box<dyn Synchronization>>>,
    before_completion: AtomicBool,
}

impl LocalTransaction {
    fn new(id: TransactionId) -> Self {
        Self {
            id,
            status: Mutex::new(TxStatus::Active),
            syncs: Mutex::new(Vec::new()),
            before_completion: AtomicBool::new(false),
        }
    }

    fn status_guard(&self) -> MutexGuard<'_, TxStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: TxStatus) {
        *self.status_guard() = status;
    }

    fn take_syncs(&self) -> Vec<Box<dyn Synchronization>> {
        std::mem::take(&mut *self.syncs.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Drive completion. A commit request on a rollback-only transaction
    /// rolls back instead. Returns the actual outcome.
    fn complete(&self, requested: TxOutcome) -> Result<TxOutcome> {
        match self.status() {
            TxStatus::Active | TxStatus::MarkedRollback => {}
            other => {
                return Err(TimerError::IllegalState(format!(
                    "{} cannot complete from status {other:?}",
                    self.id
                )))
            }
        }

        if requested == TxOutcome::Committed && self.status() == TxStatus::Active {
            self.set_status(TxStatus::Preparing);
            self.before_completion.store(true, Ordering::SeqCst);
            let mut syncs = self.take_syncs();
            for sync in syncs.iter_mut() {
                sync.before_completion();
            }
            self.before_completion.store(false, Ordering::SeqCst);
            // put them back ahead of anything registered meanwhile
            let mut guard = self.syncs.lock().unwrap_or_else(PoisonError::into_inner);
            syncs.append(&mut guard);
            *guard = syncs;
        }

        let outcome = match (requested, self.status()) {
            (TxOutcome::Committed, TxStatus::Preparing) => TxOutcome::Committed,
            _ => TxOutcome::RolledBack,
        };
        self.set_status(match outcome {
            TxOutcome::Committed => TxStatus::Committed,
            TxOutcome::RolledBack => TxStatus::RolledBack,
        });
        debug!(tx = %self.id, ?outcome, "transaction completed");

        for sync in self.take_syncs() {
            sync.after_completion(outcome);
        }
        Ok(outcome)
    }
}

impl Transaction for LocalTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn status(&self) -> TxStatus {
        *self.status_guard()
    }

    fn is_before_completion(&self) -> bool {
        self.before_completion.load(Ordering::SeqCst)
    }

    fn register_synchronization(&self, sync: Box<dyn Synchronization>) -> Result<()> {
        let status = self.status();
        if !matches!(status, TxStatus::Active | TxStatus::Preparing) {
            return Err(TimerError::TransactionRegistration(format!(
                "{} is {status:?}",
                self.id
            )));
        }
        self.syncs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sync);
        Ok(())
    }

    fn set_rollback_only(&self) {
        let mut status = self.status_guard();
        if matches!(*status, TxStatus::Active | TxStatus::Preparing) {
            *status = TxStatus::MarkedRollback;
        }
    }
}

impl fmt::Debug for LocalTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransaction")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// LocalTransactionCoordinator
// ---------------------------------------------------------------------------

/// Associates at most one [`LocalTransaction`] with each thread.
#[derive(Default)]
pub struct LocalTransactionCoordinator {
    current: Mutex<HashMap<ThreadId, Arc<LocalTransaction>>>,
    next_id: AtomicU64,
}

impl LocalTransactionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a transaction on the calling thread.
    pub fn begin(&self) -> Result<Arc<LocalTransaction>> {
        let mut current = self.guard();
        let thread = thread::current().id();
        if current.contains_key(&thread) {
            return Err(TimerError::IllegalState(
                "a transaction is already associated with this thread".to_string(),
            ));
        }
        let id = TransactionId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let tx = Arc::new(LocalTransaction::new(id));
        current.insert(thread, Arc::clone(&tx));
        debug!(tx = %id, "transaction begun");
        Ok(tx)
    }

    /// Commit the calling thread's transaction. Completion callbacks run on
    /// this thread before the call returns.
    pub fn commit(&self) -> Result<TxOutcome> {
        self.finish(TxOutcome::Committed)
    }

    pub fn rollback(&self) -> Result<TxOutcome> {
        self.finish(TxOutcome::RolledBack)
    }

    fn finish(&self, requested: TxOutcome) -> Result<TxOutcome> {
        let tx = self
            .guard()
            .get(&thread::current().id())
            .cloned()
            .ok_or_else(|| {
                TimerError::IllegalState("no transaction on this thread".to_string())
            })?;
        // stays associated while callbacks run, but reports a finished status
        let outcome = tx.complete(requested);
        self.guard().remove(&thread::current().id());
        outcome
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<ThreadId, Arc<LocalTransaction>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TransactionCoordinator for LocalTransactionCoordinator {
    fn current_transaction(&self) -> Option<Arc<dyn Transaction>> {
        self.guard()
            .get(&thread::current().id())
            .map(|tx| Arc::clone(tx) as Arc<dyn Transaction>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Synchronization for Recorder {
        fn before_completion(&mut self) {
            self.log.lock().unwrap().push("before".into());
        }

        fn after_completion(self: Box<Self>, outcome: TxOutcome) {
            self.log.lock().unwrap().push(format!("after:{outcome:?}"));
        }
    }

    #[test]
    fn commit_runs_before_then_after() {
        let coord = LocalTransactionCoordinator::new();
        let tx = coord.begin().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        tx.register_synchronization(Box::new(Recorder { log: log.clone() }))
            .unwrap();

        assert!(is_transaction_active(tx.as_ref()));
        assert_eq!(coord.commit().unwrap(), TxOutcome::Committed);
        assert_eq!(*log.lock().unwrap(), vec!["before", "after:Committed"]);
        assert!(coord.current_transaction().is_none());
        assert!(!is_transaction_active(tx.as_ref()));
    }

    #[test]
    fn rollback_skips_before_completion() {
        let coord = LocalTransactionCoordinator::new();
        let tx = coord.begin().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        tx.register_synchronization(Box::new(Recorder { log: log.clone() }))
            .unwrap();
        assert_eq!(coord.rollback().unwrap(), TxOutcome::RolledBack);
        assert_eq!(*log.lock().unwrap(), vec!["after:RolledBack"]);
    }

    #[test]
    fn rollback_only_commit_rolls_back() {
        let coord = LocalTransactionCoordinator::new();
        let tx = coord.begin().unwrap();
        tx.set_rollback_only();
        assert!(!is_transaction_active(tx.as_ref()));
        assert_eq!(coord.commit().unwrap(), TxOutcome::RolledBack);
        assert_eq!(tx.status(), TxStatus::RolledBack);
    }

    #[test]
    fn registration_refused_once_finished() {
        let coord = LocalTransactionCoordinator::new();
        let tx = coord.begin().unwrap();
        coord.commit().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let err = tx
            .register_synchronization(Box::new(Recorder { log }))
            .unwrap_err();
        assert!(matches!(err, TimerError::TransactionRegistration(_)));
    }

    #[test]
    fn one_transaction_per_thread() {
        let coord = Arc::new(LocalTransactionCoordinator::new());
        let _tx = coord.begin().unwrap();
        assert!(coord.begin().is_err());

        let other = Arc::clone(&coord);
        std::thread::spawn(move || {
            assert!(other.current_transaction().is_none());
            other.begin().unwrap();
            other.rollback().unwrap();
        })
        .join()
        .unwrap();

        assert!(coord.current_transaction().is_some());
        coord.rollback().unwrap();
    }

    struct ActivityWitness {
        coord: Arc<LocalTransactionCoordinator>,
        seen: Arc<Mutex<Vec<(bool, bool)>>>,
    }

    impl Synchronization for ActivityWitness {
        fn before_completion(&mut self) {
            let tx = self.coord.current_transaction();
            let active = tx.as_ref().is_some_and(|tx| is_transaction_active(tx.as_ref()));
            self.seen.lock().unwrap().push((tx.is_some(), active));
        }

        fn after_completion(self: Box<Self>, _: TxOutcome) {}
    }

    #[test]
    fn before_completion_counts_as_no_transaction() {
        let coord = Arc::new(LocalTransactionCoordinator::new());
        let tx = coord.begin().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        tx.register_synchronization(Box::new(ActivityWitness {
            coord: Arc::clone(&coord),
            seen: seen.clone(),
        }))
        .unwrap();

        coord.commit().unwrap();
        // still associated with the thread, but nothing may be staged on it
        assert_eq!(*seen.lock().unwrap(), vec![(true, false)]);
    }

    #[test]
    fn commit_without_transaction_is_illegal() {
        let coord = LocalTransactionCoordinator::new();
        assert!(matches!(coord.commit(), Err(TimerError::IllegalState(_))));
    }
}
