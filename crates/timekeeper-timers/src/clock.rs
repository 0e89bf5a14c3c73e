//! Clock / scheduler adapters.
//!
//! The engine never sleeps itself; it asks a [`Clock`] to run a task after a
//! delay (once, or at a fixed rate) and keeps the returned handle so the
//! task can be canceled later.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{runtime::Handle, task::JoinHandle, time::MissedTickBehavior};

/// Work item run by the clock when a deadline is reached.
pub type ClockTask = Arc<dyn Fn() + Send + Sync>;

/// Cancelable handle to a scheduled clock task.
pub trait ScheduledTask: Send + Sync {
    /// Prevent any further runs. Idempotent.
    fn cancel(&self);
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn schedule_once(&self, task: ClockTask, delay: Duration) -> Box<dyn ScheduledTask>;

    /// Fixed-rate: runs at `delay`, `delay + interval`, `delay + 2*interval`, …
    fn schedule_repeating(
        &self,
        task: ClockTask,
        delay: Duration,
        interval: Duration,
    ) -> Box<dyn ScheduledTask>;
}

// ---------------------------------------------------------------------------
// TokioClock
// ---------------------------------------------------------------------------

/// Wall-clock adapter backed by tokio timers.
#[derive(Debug, Clone)]
pub struct TokioClock {
    runtime: Handle,
}

impl TokioClock {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Bind to the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime, like `Handle::current`.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

struct TokioTask(JoinHandle<()>);

impl ScheduledTask for TokioTask {
    fn cancel(&self) {
        self.0.abort();
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn schedule_once(&self, task: ClockTask, delay: Duration) -> Box<dyn ScheduledTask> {
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        Box::new(TokioTask(handle))
    }

    fn schedule_repeating(
        &self,
        task: ClockTask,
        delay: Duration,
        interval: Duration,
    ) -> Box<dyn ScheduledTask> {
        let handle = self.runtime.spawn(async move {
            let start = tokio::time::Instant::now() + delay;
            let mut ticker = tokio::time::interval_at(start, interval);
            // fixed-rate: catch up on missed ticks instead of shifting the grid
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                ticker.tick().await;
                task();
            }
        });
        Box::new(TokioTask(handle))
    }
}

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

struct ManualEntry {
    seq: u64,
    due: DateTime<Utc>,
    interval: Option<chrono::Duration>,
    task: ClockTask,
    canceled: Arc<AtomicBool>,
}

#[derive(Default)]
struct ManualState {
    now: Option<DateTime<Utc>>,
    seq: u64,
    entries: Vec<ManualEntry>,
}

/// Virtual clock: time only moves on [`ManualClock::advance`], which runs due
/// tasks on the calling thread in deadline order.
#[derive(Default)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

struct ManualTask(Arc<AtomicBool>);

impl ScheduledTask for ManualTask {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: Some(start),
                ..ManualState::default()
            }),
        }
    }

    fn guard(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of scheduled, not yet canceled tasks.
    pub fn pending(&self) -> usize {
        self.guard()
            .entries
            .iter()
            .filter(|e| !e.canceled.load(Ordering::SeqCst))
            .count()
    }

    /// Move time forward by `by`, running every task that falls due.
    /// `advance(Duration::ZERO)` runs tasks already due.
    pub fn advance(&self, by: Duration) {
        let target = {
            let state = self.guard();
            let now = state.now.unwrap_or_else(Utc::now);
            now + chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero())
        };

        loop {
            // pick the earliest due entry without holding the lock while it runs
            let next = {
                let mut state = self.guard();
                state.entries.retain(|e| !e.canceled.load(Ordering::SeqCst));
                let idx = state
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.due <= target)
                    .min_by_key(|(_, e)| (e.due, e.seq))
                    .map(|(i, _)| i);
                match idx {
                    Some(i) => {
                        let entry = state.entries.swap_remove(i);
                        state.now = Some(entry.due);
                        Some(entry)
                    }
                    None => None,
                }
            };

            let Some(entry) = next else { break };
            (entry.task)();

            if let Some(interval) = entry.interval {
                if !entry.canceled.load(Ordering::SeqCst) {
                    let mut state = self.guard();
                    state.entries.push(ManualEntry {
                        due: entry.due + interval,
                        ..entry
                    });
                }
            }
        }

        self.guard().now = Some(target);
    }

    fn push(
        &self,
        task: ClockTask,
        delay: Duration,
        interval: Option<Duration>,
    ) -> Box<dyn ScheduledTask> {
        let canceled = Arc::new(AtomicBool::new(false));
        let mut state = self.guard();
        let now = state.now.unwrap_or_else(Utc::now);
        state.seq += 1;
        let seq = state.seq;
        let to_chrono = |d: Duration| chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero());
        state.entries.push(ManualEntry {
            seq,
            due: now + to_chrono(delay),
            interval: interval.map(to_chrono),
            task,
            canceled: Arc::clone(&canceled),
        });
        Box::new(ManualTask(canceled))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.guard().now.unwrap_or_else(Utc::now)
    }

    fn schedule_once(&self, task: ClockTask, delay: Duration) -> Box<dyn ScheduledTask> {
        self.push(task, delay, None)
    }

    fn schedule_repeating(
        &self,
        task: ClockTask,
        delay: Duration,
        interval: Duration,
    ) -> Box<dyn ScheduledTask> {
        self.push(task, delay, Some(interval))
    }
}
