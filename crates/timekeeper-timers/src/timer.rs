//! Timer entity and its state machine.
//!
//! A [`TimerEntity`] is the authoritative in-memory record of one timer. All
//! state inspection and mutation goes through [`TimerEntity::lock`], so
//! cancel, fire and transaction completion on the same timer are serialized.
//! [`Timer`] is the cheap, cloneable view handed to callers and invokers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use timekeeper_core::ScheduleExpression;

use crate::{
    error::{Result, TimerError},
    types::{TimeoutMethod, TimerConfig, TimerHandle, TimerId, TimerState},
};

/// Durable shape of a timer, mirrored to the persistence store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerRecord {
    pub id: TimerId,
    pub timed_object_id: String,
    /// Owner instance key for per-instance timers; `None` for keyless components.
    pub primary_key: Option<String>,
    pub auto_timer: bool,
    pub info: Option<serde_json::Value>,
    pub persistent: bool,
    pub state: TimerState,
    pub initial_expiration: DateTime<Utc>,
    /// Kept while the timer is canceled inside an open transaction so a
    /// rollback can resume it; read through [`TimerRecord::next_expiration`].
    pub next_expiration: Option<DateTime<Utc>>,
    pub previous_run: Option<DateTime<Utc>>,
    /// 0 means single action (or calendar-driven).
    pub interval_ms: u64,
    pub schedule: Option<ScheduleExpression>,
    pub timeout_method: Option<TimeoutMethod>,
}

impl TimerRecord {
    /// A single-action or interval timer in state `Created`.
    pub fn interval(
        timed_object_id: &str,
        primary_key: Option<String>,
        initial_expiration: DateTime<Utc>,
        interval_ms: u64,
        config: TimerConfig,
    ) -> Self {
        Self {
            id: TimerId::new(),
            timed_object_id: timed_object_id.to_string(),
            primary_key,
            auto_timer: false,
            info: config.info,
            persistent: config.persistent,
            state: TimerState::Created,
            initial_expiration,
            next_expiration: Some(initial_expiration),
            previous_run: None,
            interval_ms,
            schedule: None,
            timeout_method: None,
        }
    }

    /// A calendar timer in state `Created`. Passing a timeout method marks it
    /// as an auto timer.
    pub fn calendar(
        timed_object_id: &str,
        primary_key: Option<String>,
        schedule: ScheduleExpression,
        first_expiration: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
        config: TimerConfig,
        timeout_method: Option<TimeoutMethod>,
    ) -> Self {
        Self {
            id: TimerId::new(),
            timed_object_id: timed_object_id.to_string(),
            primary_key,
            auto_timer: timeout_method.is_some(),
            info: config.info,
            persistent: config.persistent,
            state: TimerState::Created,
            initial_expiration: first_expiration.unwrap_or(created_at),
            next_expiration: first_expiration,
            previous_run: None,
            interval_ms: 0,
            schedule: Some(schedule),
            timeout_method,
        }
    }

    pub fn is_calendar(&self) -> bool {
        self.schedule.is_some()
    }

    pub fn is_repeating(&self) -> bool {
        self.interval_ms > 0
    }

    /// Created or active: still eligible for future timeouts.
    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Next timeout instant; only defined while the timer is active.
    pub fn next_expiration(&self) -> Option<DateTime<Utc>> {
        self.next_expiration
            .filter(|_| self.state == TimerState::Active)
    }

    /// Reject the operation if the timer is canceled or expired.
    pub fn assert_live(&self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(TimerError::IllegalTimerState {
                id: self.id.to_string(),
                state: self.state,
            });
        }
        Ok(())
    }

    /// `Created -> Active`. Idempotent on an already active timer.
    pub fn activate(&mut self) -> Result<()> {
        match self.state {
            TimerState::Created | TimerState::Active => {
                self.state = TimerState::Active;
                Ok(())
            }
            state => Err(TimerError::IllegalTimerState {
                id: self.id.to_string(),
                state,
            }),
        }
    }

    /// `{Created | Active} -> Canceled`, returning the state it left.
    pub fn cancel(&mut self) -> Result<TimerState> {
        self.assert_live()?;
        let previous = self.state;
        self.state = TimerState::Canceled;
        Ok(previous)
    }

    /// `Active -> Expired`.
    pub fn expire(&mut self) -> Result<()> {
        if self.state != TimerState::Active {
            return Err(TimerError::IllegalTimerState {
                id: self.id.to_string(),
                state: self.state,
            });
        }
        self.state = TimerState::Expired;
        Ok(())
    }

    /// Undo a cancellation whose transaction rolled back.
    pub fn restore(&mut self, previous: TimerState) {
        if self.state == TimerState::Canceled {
            self.state = previous;
        }
    }

    /// Interval bookkeeping after a firing: fixed-rate, so the next instant
    /// is derived from the previous one rather than from "now".
    pub fn advance_interval(&mut self) -> Option<DateTime<Utc>> {
        let previous = self.next_expiration?;
        let interval = i64::try_from(self.interval_ms).ok()?;
        let next = previous.checked_add_signed(Duration::milliseconds(interval))?;
        self.previous_run = Some(previous);
        self.next_expiration = Some(next);
        Some(next)
    }

    /// Move an interval timer's next expiration to the first grid point
    /// after `now`, returning how many points were skipped. `previous_run`
    /// is left alone since nothing ran.
    pub fn skip_missed_intervals(&mut self, now: DateTime<Utc>) -> u64 {
        let Some(next) = self.next_expiration else {
            return 0;
        };
        let Ok(interval) = i64::try_from(self.interval_ms) else {
            return 0;
        };
        if interval == 0 || next > now {
            return 0;
        }
        let missed = (now - next).num_milliseconds() / interval + 1;
        let step = Duration::milliseconds(interval.saturating_mul(missed));
        let Some(caught_up) = next.checked_add_signed(step) else {
            return 0;
        };
        self.next_expiration = Some(caught_up);
        u64::try_from(missed).unwrap_or(0)
    }
}

/// The lock-bearing, registry-owned timer.
#[derive(Debug)]
pub struct TimerEntity {
    id: TimerId,
    timed_object_id: String,
    record: Mutex<TimerRecord>,
}

impl TimerEntity {
    pub fn new(record: TimerRecord) -> Arc<Self> {
        Arc::new(Self {
            id: record.id.clone(),
            timed_object_id: record.timed_object_id.clone(),
            record: Mutex::new(record),
        })
    }

    pub fn id(&self) -> &TimerId {
        &self.id
    }

    pub fn timed_object_id(&self) -> &str {
        &self.timed_object_id
    }

    /// Acquire the timer's exclusive lock.
    ///
    /// A panic inside a timeout callback must not wedge the timer forever, so
    /// a poisoned lock is recovered rather than propagated.
    pub fn lock(&self) -> MutexGuard<'_, TimerRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> TimerRecord {
        self.lock().clone()
    }

    pub fn state(&self) -> TimerState {
        self.lock().state
    }
}

/// Caller-facing view of a timer.
#[derive(Debug, Clone)]
pub struct Timer {
    entity: Arc<TimerEntity>,
}

impl Timer {
    pub(crate) fn new(entity: Arc<TimerEntity>) -> Self {
        Self { entity }
    }

    pub(crate) fn entity(&self) -> &Arc<TimerEntity> {
        &self.entity
    }

    pub fn id(&self) -> &TimerId {
        self.entity.id()
    }

    pub fn handle(&self) -> TimerHandle {
        TimerHandle {
            timed_object_id: self.entity.timed_object_id().to_string(),
            timer_id: self.entity.id().clone(),
        }
    }

    pub fn state(&self) -> TimerState {
        self.entity.state()
    }

    pub fn is_active(&self) -> bool {
        self.entity.lock().is_live()
    }

    pub fn info(&self) -> Option<serde_json::Value> {
        self.entity.lock().info.clone()
    }

    pub fn is_persistent(&self) -> bool {
        self.entity.lock().persistent
    }

    pub fn is_calendar_timer(&self) -> bool {
        self.entity.lock().is_calendar()
    }

    pub fn is_auto_timer(&self) -> bool {
        self.entity.lock().auto_timer
    }

    pub fn timeout_method(&self) -> Option<TimeoutMethod> {
        self.entity.lock().timeout_method.clone()
    }

    pub fn snapshot(&self) -> TimerRecord {
        self.entity.snapshot()
    }

    /// The calendar schedule. Fails for non-calendar or dead timers.
    pub fn schedule(&self) -> Result<ScheduleExpression> {
        let record = self.entity.lock();
        record.assert_live()?;
        record.schedule.clone().ok_or_else(|| {
            TimerError::IllegalState(format!("timer {} is not a calendar timer", record.id))
        })
    }

    /// Next timeout instant. Fails once the timer is canceled or expired,
    /// while it is still waiting for its transaction to commit, or when a
    /// calendar schedule has no further match.
    pub fn next_timeout(&self) -> Result<DateTime<Utc>> {
        let record = self.entity.lock();
        record.assert_live()?;
        record.next_expiration().ok_or_else(|| {
            TimerError::IllegalState(format!("timer {} has no next timeout", record.id))
        })
    }

    /// Time left until the next timeout as seen from `now`, clamped at zero.
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Result<Duration> {
        let next = self.next_timeout()?;
        Ok((next - now).max(Duration::zero()))
    }
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.entity.id() == other.entity.id()
    }
}

impl Eq for Timer {}
