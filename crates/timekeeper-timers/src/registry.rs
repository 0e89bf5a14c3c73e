use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{timer::TimerEntity, types::TimerId};

/// Live timers of one timed object, keyed by id.
///
/// Lock order: a caller may take this lock while holding a timer's entity
/// lock, never the other way round. Anything that needs to inspect timer
/// state first copies the entries out with [`TimerRegistry::entries`].
#[derive(Debug, Default)]
pub struct TimerRegistry {
    timers: Mutex<HashMap<TimerId, Arc<TimerEntity>>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, timer: Arc<TimerEntity>) {
        self.guard().insert(timer.id().clone(), timer);
    }

    pub fn get(&self, id: &TimerId) -> Option<Arc<TimerEntity>> {
        self.guard().get(id).cloned()
    }

    pub fn remove(&self, id: &TimerId) -> Option<Arc<TimerEntity>> {
        self.guard().remove(id)
    }

    pub fn contains(&self, id: &TimerId) -> bool {
        self.guard().contains_key(id)
    }

    /// Snapshot of all registered timers.
    pub fn entries(&self) -> Vec<Arc<TimerEntity>> {
        self.guard().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn clear(&self) {
        self.guard().clear();
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<TimerId, Arc<TimerEntity>>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
