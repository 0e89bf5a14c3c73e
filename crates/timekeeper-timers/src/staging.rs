//! Transactional staging: timer mutations held back until the enclosing
//! transaction resolves.
//!
//! A mutation is staged by registering a [`StagedResolution`] with the
//! transaction. When the transaction completes, the resolution is applied
//! with the outcome (commit or rollback) through the owning service.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tracing::debug;

use crate::{
    service::ServiceInner,
    timer::TimerEntity,
    tx::{Synchronization, TransactionId, TxOutcome},
    types::{TimerId, TimerState},
};

/// What a transaction will decide about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StagedMutation {
    /// A timer created in the transaction; activated on commit.
    Create,
    /// A cancellation; made final on commit, undone on rollback.
    Cancel { previous: TimerState },
}

/// Timers created inside a still-open transaction, per transaction.
#[derive(Default)]
pub(crate) struct StagingArea {
    pending: Mutex<HashMap<TransactionId, HashMap<TimerId, Arc<TimerEntity>>>>,
}

impl StagingArea {
    pub fn stage(&self, tx: TransactionId, timer: Arc<TimerEntity>) {
        self.guard()
            .entry(tx)
            .or_default()
            .insert(timer.id().clone(), timer);
    }

    pub fn unstage(&self, tx: TransactionId, id: &TimerId) -> Option<Arc<TimerEntity>> {
        let mut pending = self.guard();
        let timers = pending.get_mut(&tx)?;
        let removed = timers.remove(id);
        if timers.is_empty() {
            pending.remove(&tx);
        }
        removed
    }

    pub fn get(&self, tx: TransactionId, id: &TimerId) -> Option<Arc<TimerEntity>> {
        self.guard().get(&tx)?.get(id).cloned()
    }

    pub fn contains(&self, tx: TransactionId, id: &TimerId) -> bool {
        self.guard()
            .get(&tx)
            .is_some_and(|timers| timers.contains_key(id))
    }

    /// Timers staged by `tx`, in no particular order.
    pub fn staged(&self, tx: TransactionId) -> Vec<Arc<TimerEntity>> {
        self.guard()
            .get(&tx)
            .map(|timers| timers.values().cloned().collect())
            .unwrap_or_default()
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<TransactionId, HashMap<TimerId, Arc<TimerEntity>>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Completion callback carrying one staged mutation.
pub(crate) struct StagedResolution {
    pub service: Weak<ServiceInner>,
    pub tx: TransactionId,
    pub timer: Arc<TimerEntity>,
    pub mutation: StagedMutation,
}

impl StagedResolution {
    /// Apply the mutation for `outcome`. A service that has been dropped
    /// meanwhile has nothing left to resolve against.
    pub fn resolve(self, outcome: TxOutcome) {
        let Some(service) = self.service.upgrade() else {
            debug!(timer_id = %self.timer.id(), "service gone before transaction resolved");
            return;
        };
        service.resolve_staged(self.tx, &self.timer, self.mutation, outcome);
    }
}

impl Synchronization for StagedResolution {
    fn after_completion(self: Box<Self>, outcome: TxOutcome) {
        (*self).resolve(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{timer::TimerRecord, types::TimerConfig};
    use chrono::Utc;

    fn entity() -> Arc<TimerEntity> {
        TimerEntity::new(TimerRecord::interval(
            "obj",
            None,
            Utc::now(),
            0,
            TimerConfig::transient(),
        ))
    }

    #[test]
    fn staging_is_scoped_per_transaction() {
        let area = StagingArea::default();
        let t = entity();
        area.stage(TransactionId(1), Arc::clone(&t));

        assert!(area.contains(TransactionId(1), t.id()));
        assert!(!area.contains(TransactionId(2), t.id()));
        assert!(area.get(TransactionId(2), t.id()).is_none());
        assert_eq!(area.staged(TransactionId(1)).len(), 1);
        assert!(area.staged(TransactionId(2)).is_empty());

        assert!(area.unstage(TransactionId(1), t.id()).is_some());
        assert!(area.unstage(TransactionId(1), t.id()).is_none());
        assert!(area.staged(TransactionId(1)).is_empty());
    }

    #[test]
    fn resolution_without_service_is_a_no_op() {
        let t = entity();
        let res = StagedResolution {
            service: Weak::new(),
            tx: TransactionId(9),
            timer: Arc::clone(&t),
            mutation: StagedMutation::Create,
        };
        Box::new(res).after_completion(TxOutcome::Committed);
        assert_eq!(t.state(), TimerState::Created);
    }
}
