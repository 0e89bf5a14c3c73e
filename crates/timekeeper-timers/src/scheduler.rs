//! Scheduling coordinator: maps active timers onto clock tasks.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{
    clock::{Clock, ClockTask, ScheduledTask},
    executor::{Job, TimeoutExecutor},
    types::TimerId,
};

type ExecutorSlot = RwLock<Option<Arc<dyn TimeoutExecutor>>>;

/// Owns the timer-id → scheduled-task table.
///
/// The table lock is only ever taken after an entity lock, never before.
pub(crate) struct SchedulingCoordinator {
    clock: Arc<dyn Clock>,
    executor: ExecutorSlot,
    scheduled: Mutex<HashMap<TimerId, Box<dyn ScheduledTask>>>,
}

impl SchedulingCoordinator {
    pub fn new(clock: Arc<dyn Clock>, executor: Option<Arc<dyn TimeoutExecutor>>) -> Self {
        Self {
            clock,
            executor: RwLock::new(executor),
            scheduled: Mutex::new(HashMap::new()),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn set_executor(&self, executor: Option<Arc<dyn TimeoutExecutor>>) {
        *self.executor.write().unwrap_or_else(PoisonError::into_inner) = executor;
    }

    /// Schedule the next timeout of `id` at `next`.
    ///
    /// A fresh timer always gets a task. A rescheduled one (`new_timer ==
    /// false`) only does if it is still present in the table, so a timer
    /// canceled while its callback ran is not brought back.
    pub fn schedule(
        &self,
        id: &TimerId,
        next: Option<DateTime<Utc>>,
        interval_ms: u64,
        new_timer: bool,
        task: ClockTask,
    ) {
        let Some(next) = next else {
            warn!(timer_id = %id, "timer has no next expiration; not scheduling");
            return;
        };

        let mut scheduled = self.guard();
        if !new_timer && !scheduled.contains_key(id) {
            debug!(timer_id = %id, "timer no longer scheduled; skipping reschedule");
            return;
        }

        let delay = (next - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let handle = if interval_ms > 0 {
            self.clock
                .schedule_repeating(task, delay, Duration::from_millis(interval_ms))
        } else {
            self.clock.schedule_once(task, delay)
        };
        debug!(timer_id = %id, delay_ms = delay.as_millis() as u64, interval_ms, "timeout scheduled");

        if let Some(previous) = scheduled.insert(id.clone(), handle) {
            previous.cancel();
        }
    }

    /// Drop the pending task of `id`. Unknown ids are ignored.
    pub fn cancel(&self, id: &TimerId) {
        let removed = self.guard().remove(id);
        if let Some(task) = removed {
            task.cancel();
            debug!(timer_id = %id, "timeout unscheduled");
        }
    }

    pub fn is_scheduled(&self, id: &TimerId) -> bool {
        self.guard().contains_key(id)
    }

    /// Cancel every pending task, leaving the timers themselves untouched.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.guard().drain().collect();
        let count = drained.len();
        for (_, task) in drained {
            task.cancel();
        }
        count
    }

    /// Hand a due timeout to the executor, or drop it when none is set.
    pub fn dispatch(&self, id: &TimerId, job: Job) {
        let executor = self
            .executor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(executor) = executor else {
            warn!(timer_id = %id, "no timeout executor available; firing dropped");
            return;
        };
        if let Err(e) = executor.submit(job) {
            warn!(timer_id = %id, "timeout executor rejected firing: {e}");
        }
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<TimerId, Box<dyn ScheduledTask>>> {
        self.scheduled.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
