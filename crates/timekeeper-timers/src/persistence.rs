//! Persistence store interface and the engine-side failure policy around it.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use tracing::{debug, warn};

use crate::{
    error::{Result, TimerError},
    timer::TimerRecord,
    tx::Transaction,
};

/// Durable mirror of timer records, used for restart recovery only.
///
/// Every method must be idempotent under retry.
pub trait TimerPersistence: Send + Sync {
    fn add_timer(&self, timer: &TimerRecord) -> Result<()>;

    fn update_timer(&self, timer: &TimerRecord) -> Result<()>;

    /// Stored timers of `timed_object_id` that are not canceled or expired.
    fn load_active_timers(&self, timed_object_id: &str) -> Result<Vec<TimerRecord>>;

    /// The timed object is going away; the store may release resources.
    fn timer_undeployed(&self, timed_object_id: &str) -> Result<()>;
}

/// Wraps the optional store with the engine's failure accounting.
///
/// Non-persistent timers never reach the store. A missing store turns every
/// write into a logged no-op. Consecutive failures are counted; once the
/// count reaches the threshold the current transaction is marked
/// rollback-only.
pub(crate) struct PersistenceGuard {
    store: Option<Arc<dyn TimerPersistence>>,
    threshold: u32,
    consecutive_failures: AtomicU32,
}

impl PersistenceGuard {
    pub fn new(store: Option<Arc<dyn TimerPersistence>>, threshold: u32) -> Self {
        Self {
            store,
            threshold: threshold.max(1),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.store.is_some()
    }

    /// Write a new timer. Failure aborts the creation.
    pub fn add(&self, timer: &TimerRecord, tx: Option<&Arc<dyn Transaction>>) -> Result<()> {
        let Some(store) = self.target(timer) else {
            return Ok(());
        };
        match store.add_timer(timer) {
            Ok(()) => {
                self.succeeded();
                Ok(())
            }
            Err(e) => {
                self.failed(tx);
                Err(TimerError::Persistence(e.to_string()))
            }
        }
    }

    /// Write a changed timer. Failures are logged and swallowed so the
    /// in-memory transition can proceed.
    pub fn update(&self, timer: &TimerRecord, tx: Option<&Arc<dyn Transaction>>) {
        let Some(store) = self.target(timer) else {
            return;
        };
        match store.update_timer(timer) {
            Ok(()) => self.succeeded(),
            Err(e) => {
                warn!(timer_id = %timer.id, state = %timer.state, "failed to persist timer update: {e}");
                self.failed(tx);
            }
        }
    }

    pub fn load_active(&self, timed_object_id: &str) -> Result<Vec<TimerRecord>> {
        match &self.store {
            Some(store) => store
                .load_active_timers(timed_object_id)
                .map_err(|e| TimerError::Persistence(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    pub fn undeployed(&self, timed_object_id: &str) {
        if let Some(store) = &self.store {
            if let Err(e) = store.timer_undeployed(timed_object_id) {
                warn!(timed_object = timed_object_id, "timer_undeployed failed: {e}");
            }
        }
    }

    fn target(&self, timer: &TimerRecord) -> Option<&Arc<dyn TimerPersistence>> {
        if !timer.persistent {
            return None;
        }
        if self.store.is_none() {
            warn!(timer_id = %timer.id, "timer persistence is not configured; persistent timer kept in memory only");
        }
        self.store.as_ref()
    }

    fn succeeded(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    fn failed(&self, tx: Option<&Arc<dyn Transaction>>) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures < self.threshold {
            debug!(failures, threshold = self.threshold, "persistence failure below threshold");
            return;
        }
        if let Some(tx) = tx {
            warn!(tx = %tx.id(), failures, "persistence failure threshold reached; marking transaction rollback-only");
            tx.set_rollback_only();
        }
    }
}
