//! The timer service: public operations over one timed object's timers.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use chrono::{DateTime, Duration, Utc};
use timekeeper_core::{EngineConfig, ScheduleExpression};
use tracing::{debug, error, info, warn};

use crate::{
    clock::{Clock, ClockTask},
    error::{Result, TimerError},
    executor::TimeoutExecutor,
    invoker::{InvocationContext, NoInvocationContext, TimedObjectInvoker},
    persistence::{PersistenceGuard, TimerPersistence},
    reconcile::{reconcile, AutoTimer},
    registry::TimerRegistry,
    schedule::{BasicCalendar, ScheduleEvaluator},
    scheduler::SchedulingCoordinator,
    staging::{StagedMutation, StagedResolution, StagingArea},
    timer::{Timer, TimerEntity, TimerRecord},
    tx::{is_transaction_active, NoTransactions, Transaction, TransactionCoordinator, TransactionId, TxOutcome},
    types::{TimeoutMethod, TimerConfig, TimerHandle, TimerId, TimerState},
};

/// Timer service of a single timed object.
///
/// Cheap to clone; all clones share the same registry and schedule.
#[derive(Clone)]
pub struct TimerService {
    inner: Arc<ServiceInner>,
}

pub(crate) struct ServiceInner {
    this: Weak<ServiceInner>,
    timed_object_id: String,
    invoker: Arc<dyn TimedObjectInvoker>,
    registry: TimerRegistry,
    staging: StagingArea,
    scheduler: SchedulingCoordinator,
    persistence: PersistenceGuard,
    transactions: Arc<dyn TransactionCoordinator>,
    evaluator: Arc<dyn ScheduleEvaluator>,
    context: Arc<dyn InvocationContext>,
    auto_timers: Vec<AutoTimer>,
    allow_lifecycle_ops: bool,
    started: AtomicBool,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct TimerServiceBuilder {
    invoker: Arc<dyn TimedObjectInvoker>,
    clock: Arc<dyn Clock>,
    persistence: Option<Arc<dyn TimerPersistence>>,
    executor: Option<Arc<dyn TimeoutExecutor>>,
    transactions: Arc<dyn TransactionCoordinator>,
    evaluator: Arc<dyn ScheduleEvaluator>,
    context: Arc<dyn InvocationContext>,
    auto_timers: Vec<AutoTimer>,
    config: EngineConfig,
}

impl TimerServiceBuilder {
    pub fn persistence(mut self, store: Arc<dyn TimerPersistence>) -> Self {
        self.persistence = Some(store);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn TimeoutExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn transactions(mut self, coordinator: Arc<dyn TransactionCoordinator>) -> Self {
        self.transactions = coordinator;
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn ScheduleEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn context(mut self, context: Arc<dyn InvocationContext>) -> Self {
        self.context = context;
        self
    }

    /// Declared auto timers, reconciled against the store on every start.
    pub fn auto_timers(mut self, timers: impl IntoIterator<Item = AutoTimer>) -> Self {
        self.auto_timers.extend(timers);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> TimerService {
        let timed_object_id = self.invoker.timed_object_id().to_string();
        let inner = Arc::new_cyclic(|this| ServiceInner {
            this: this.clone(),
            timed_object_id,
            invoker: self.invoker,
            registry: TimerRegistry::new(),
            staging: StagingArea::default(),
            scheduler: SchedulingCoordinator::new(self.clock, self.executor),
            persistence: PersistenceGuard::new(
                self.persistence,
                self.config.persistence_failure_threshold,
            ),
            transactions: self.transactions,
            evaluator: self.evaluator,
            context: self.context,
            auto_timers: self.auto_timers,
            allow_lifecycle_ops: self.config.allow_lifecycle_timer_ops,
            started: AtomicBool::new(false),
        });
        TimerService { inner }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

impl TimerService {
    /// Start configuring a service. Without further calls the service has no
    /// persistence, no executor (firings are dropped), no transactions and
    /// evaluates schedules with [`BasicCalendar`].
    pub fn builder(invoker: Arc<dyn TimedObjectInvoker>, clock: Arc<dyn Clock>) -> TimerServiceBuilder {
        TimerServiceBuilder {
            invoker,
            clock,
            persistence: None,
            executor: None,
            transactions: Arc::new(NoTransactions),
            evaluator: Arc::new(BasicCalendar),
            context: Arc::new(NoInvocationContext),
            auto_timers: Vec::new(),
            config: EngineConfig::default(),
        }
    }

    pub fn timed_object_id(&self) -> &str {
        &self.inner.timed_object_id
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Current instant according to the service's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.scheduler.now()
    }

    /// Mark the service started and restore persisted and declared timers.
    pub fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!(timed_object = %self.inner.timed_object_id, "timer service already started");
            return Ok(());
        }
        info!(timed_object = %self.inner.timed_object_id, "starting timer service");
        if let Err(e) = self.inner.restore_timers() {
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Suspend all timers, notify the store and mark the service stopped.
    /// Persistent timers come back on the next [`TimerService::start`].
    pub fn stop(&self) {
        if !self.is_started() {
            return;
        }
        self.suspend_timers();
        self.inner.registry.clear();
        self.inner.persistence.undeployed(&self.inner.timed_object_id);
        self.inner.started.store(false, Ordering::SeqCst);
        info!(timed_object = %self.inner.timed_object_id, "timer service stopped");
    }

    /// Cancel every pending timeout without canceling the timers.
    pub fn suspend_timers(&self) {
        let count = self.inner.scheduler.cancel_all();
        info!(timed_object = %self.inner.timed_object_id, count, "timers suspended");
    }

    /// Re-run reconciliation: reschedule persisted timers and create auto
    /// timers that are neither stored nor already live.
    pub fn restore_timers(&self) -> Result<()> {
        self.inner.assert_started()?;
        self.inner.restore_timers()
    }

    /// Replace the execution pool. `None` makes future firings drop.
    pub fn set_executor(&self, executor: Option<Arc<dyn TimeoutExecutor>>) {
        self.inner.scheduler.set_executor(executor);
    }

    pub fn create_single_action_timer(&self, expiration: DateTime<Utc>, config: TimerConfig) -> Result<Timer> {
        self.inner.assert_can_create()?;
        validate_instant("expiration", expiration)?;
        self.inner.create_interval(expiration, 0, config)
    }

    /// Single-action timer expiring `delay` from now.
    pub fn create_single_action_timer_in(&self, delay: Duration, config: TimerConfig) -> Result<Timer> {
        validate_duration("duration", delay)?;
        self.create_single_action_timer(self.now() + delay, config)
    }

    pub fn create_interval_timer(
        &self,
        initial_expiration: DateTime<Utc>,
        interval_ms: i64,
        config: TimerConfig,
    ) -> Result<Timer> {
        self.inner.assert_can_create()?;
        validate_instant("initial expiration", initial_expiration)?;
        let interval = u64::try_from(interval_ms).map_err(|_| {
            TimerError::Validation(format!("interval must not be negative, got {interval_ms} ms"))
        })?;
        self.inner.create_interval(initial_expiration, interval, config)
    }

    /// Interval timer whose first timeout is `initial` from now.
    pub fn create_interval_timer_in(
        &self,
        initial: Duration,
        interval: Duration,
        config: TimerConfig,
    ) -> Result<Timer> {
        validate_duration("initial duration", initial)?;
        validate_duration("interval", interval)?;
        self.create_interval_timer(self.now() + initial, interval.num_milliseconds(), config)
    }

    /// Calendar timer driven by `schedule`. A `timeout_method` marks it as an
    /// auto timer bound to that method.
    pub fn create_calendar_timer(
        &self,
        schedule: ScheduleExpression,
        config: TimerConfig,
        timeout_method: Option<TimeoutMethod>,
    ) -> Result<Timer> {
        self.inner.assert_can_create()?;
        if let (Some(start), Some(end)) = (schedule.start, schedule.end) {
            if start > end {
                return Err(TimerError::Validation(format!(
                    "schedule start {start} is after end {end}"
                )));
            }
        }
        let primary_key = self.inner.context.current().primary_key;
        self.inner
            .create_calendar(schedule, config, timeout_method, primary_key)
    }

    /// Cancel `timer`. Inside an active transaction the timer stops firing
    /// right away but is only unscheduled once the transaction commits.
    pub fn cancel_timer(&self, timer: &Timer) -> Result<()> {
        self.inner.assert_started()?;
        self.inner.assert_owned(timer)?;
        self.inner.cancel(timer.entity())
    }

    /// Force an active timer into `Expired`.
    pub fn expire_timer(&self, timer: &Timer) -> Result<()> {
        self.inner.assert_started()?;
        self.inner.assert_owned(timer)?;
        let entity = timer.entity();
        let mut record = entity.lock();
        record.expire()?;
        self.inner.retire_expired(&record);
        info!(timer_id = %record.id, "timer expired explicitly");
        Ok(())
    }

    /// Live timers visible to the caller: its own (or keyless) registered
    /// timers plus timers created by its still-open transaction.
    pub fn get_timers(&self) -> Result<Vec<Timer>> {
        self.get_active_timers()
    }

    pub fn get_active_timers(&self) -> Result<Vec<Timer>> {
        self.inner.assert_started()?;
        self.inner.assert_not_lifecycle()?;
        Ok(self.inner.visible_timers())
    }

    /// Resolve a handle: registry first, then the current transaction's
    /// staged timers.
    pub fn get_timer(&self, handle: &TimerHandle) -> Result<Timer> {
        self.inner.assert_started()?;
        let not_found = || TimerError::NotFound {
            id: handle.timer_id.to_string(),
        };
        if handle.timed_object_id != self.inner.timed_object_id {
            return Err(not_found());
        }
        if let Some(entity) = self.inner.registry.get(&handle.timer_id) {
            return Ok(Timer::new(entity));
        }
        self.inner
            .current_transaction()
            .and_then(|tx| self.inner.staging.get(tx.id(), &handle.timer_id))
            .map(Timer::new)
            .ok_or_else(not_found)
    }

    /// Whether a clock task is outstanding for `timer`.
    pub fn is_scheduled(&self, timer: &Timer) -> bool {
        self.inner.scheduler.is_scheduled(timer.id())
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

impl ServiceInner {
    fn assert_started(&self) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(TimerError::IllegalState(format!(
                "timer service for {} is not started",
                self.timed_object_id
            )));
        }
        Ok(())
    }

    fn assert_not_lifecycle(&self) -> Result<()> {
        if self.context.current().lifecycle_callback && !self.allow_lifecycle_ops {
            return Err(TimerError::IllegalState(
                "timer service is not available during lifecycle callbacks".to_string(),
            ));
        }
        Ok(())
    }

    fn assert_can_create(&self) -> Result<()> {
        self.assert_started()?;
        self.assert_not_lifecycle()
    }

    fn assert_owned(&self, timer: &Timer) -> Result<()> {
        if timer.entity().timed_object_id() != self.timed_object_id {
            return Err(TimerError::NotFound {
                id: timer.id().to_string(),
            });
        }
        Ok(())
    }

    fn current_transaction(&self) -> Option<Arc<dyn Transaction>> {
        self.transactions.current_transaction()
    }

    /// The current transaction, if work should be staged against it.
    fn active_transaction(&self) -> Option<Arc<dyn Transaction>> {
        self.current_transaction()
            .filter(|tx| is_transaction_active(tx.as_ref()))
    }

    fn persist_update(&self, record: &TimerRecord) {
        let tx = self.current_transaction();
        self.persistence.update(record, tx.as_ref());
    }

    // -- creation ------------------------------------------------------------

    fn create_interval(
        &self,
        initial_expiration: DateTime<Utc>,
        interval_ms: u64,
        config: TimerConfig,
    ) -> Result<Timer> {
        let primary_key = self.context.current().primary_key;
        let record = TimerRecord::interval(
            &self.timed_object_id,
            primary_key,
            initial_expiration,
            interval_ms,
            config,
        );
        self.create(record)
    }

    fn create_calendar(
        &self,
        schedule: ScheduleExpression,
        config: TimerConfig,
        timeout_method: Option<TimeoutMethod>,
        primary_key: Option<String>,
    ) -> Result<Timer> {
        let now = self.scheduler.now();
        let first = self.evaluator.next_timeout(&schedule, now);
        let record = TimerRecord::calendar(
            &self.timed_object_id,
            primary_key,
            schedule,
            first,
            now,
            config,
            timeout_method,
        );
        self.create(record)
    }

    fn create(&self, record: TimerRecord) -> Result<Timer> {
        self.persistence
            .add(&record, self.current_transaction().as_ref())?;
        let entity = TimerEntity::new(record);
        self.start_timer(&entity)?;
        info!(
            timer_id = %entity.id(),
            timed_object = %self.timed_object_id,
            "timer created"
        );
        Ok(Timer::new(entity))
    }

    /// Activate a freshly created timer now, or stage it until the current
    /// transaction resolves.
    fn start_timer(&self, entity: &Arc<TimerEntity>) -> Result<()> {
        let Some(tx) = self.active_transaction() else {
            let mut record = entity.lock();
            self.activate(entity, &mut record, true);
            return Ok(());
        };

        let tx_id = tx.id();
        self.staging.stage(tx_id, Arc::clone(entity));
        let sync = StagedResolution {
            service: self.this.clone(),
            tx: tx_id,
            timer: Arc::clone(entity),
            mutation: StagedMutation::Create,
        };
        if let Err(e) = tx.register_synchronization(Box::new(sync)) {
            self.staging.unstage(tx_id, entity.id());
            let mut record = entity.lock();
            if record.cancel().is_ok() {
                self.persistence.update(&record, Some(&tx));
            }
            return Err(registration_error(e));
        }
        debug!(timer_id = %entity.id(), tx = %tx_id, "timer creation staged");
        Ok(())
    }

    /// `Created -> Active`, register and schedule. A calendar timer with no
    /// further match expires on the spot.
    fn activate(&self, entity: &Arc<TimerEntity>, record: &mut TimerRecord, new_timer: bool) {
        if let Err(e) = record.activate() {
            debug!(timer_id = %record.id, "not activating: {e}");
            return;
        }
        self.registry.insert(Arc::clone(entity));
        if record.next_expiration.is_none() {
            info!(timer_id = %record.id, "schedule has no future expiration; expiring timer");
            if record.expire().is_ok() {
                self.retire_expired(record);
            }
            return;
        }
        self.schedule(record, new_timer);
    }

    // -- scheduling ----------------------------------------------------------

    fn schedule(&self, record: &TimerRecord, new_timer: bool) {
        let id = record.id.clone();
        let service = self.this.clone();
        let task: ClockTask = Arc::new(move || {
            if let Some(service) = service.upgrade() {
                service.dispatch(&id);
            }
        });
        self.scheduler.schedule(
            &record.id,
            record.next_expiration(),
            record.interval_ms,
            new_timer,
            task,
        );
    }

    /// Clock side of a firing: hand the timeout to the execution pool.
    fn dispatch(&self, id: &TimerId) {
        let service = self.this.clone();
        let job_id = id.clone();
        self.scheduler.dispatch(
            id,
            Box::new(move || {
                if let Some(service) = service.upgrade() {
                    service.on_timeout(&job_id);
                }
            }),
        );
    }

    /// Execution side of a firing.
    fn on_timeout(&self, id: &TimerId) {
        let Some(entity) = self.registry.get(id) else {
            debug!(timer_id = %id, "timeout for unregistered timer ignored");
            return;
        };
        if entity.state() != TimerState::Active {
            debug!(timer_id = %id, state = %entity.state(), "timeout suppressed");
            return;
        }

        let timer = Timer::new(Arc::clone(&entity));
        if let Err(e) = self.invoker.call_timeout(&timer) {
            error!(timer_id = %id, timed_object = %self.timed_object_id, "timeout callback failed: {e:#}");
        }
        self.after_timeout(&entity);
    }

    /// Work out the next expiration after a firing, or expire the timer.
    fn after_timeout(&self, entity: &Arc<TimerEntity>) {
        let mut record = entity.lock();
        if record.state != TimerState::Active {
            return;
        }

        if let Some(schedule) = record.schedule.clone() {
            let now = self.scheduler.now();
            let from = record.next_expiration.map_or(now, |prev| prev.max(now));
            match self.evaluator.next_timeout(&schedule, from) {
                Some(next) => {
                    record.previous_run = record.next_expiration;
                    record.next_expiration = Some(next);
                    self.persist_update(&record);
                    self.schedule(&record, false);
                }
                None => {
                    if record.expire().is_ok() {
                        self.retire_expired(&record);
                    }
                }
            }
        } else if record.is_repeating() {
            // the fixed-rate clock task keeps running; only bookkeeping here
            if record.advance_interval().is_none() {
                warn!(timer_id = %record.id, "interval overflow; expiring timer");
                if record.expire().is_ok() {
                    self.retire_expired(&record);
                }
                return;
            }
            self.persist_update(&record);
        } else if record.expire().is_ok() {
            self.retire_expired(&record);
        }
    }

    /// Bookkeeping for a timer that has just moved to `Expired`.
    fn retire_expired(&self, record: &TimerRecord) {
        self.scheduler.cancel(&record.id);
        self.registry.remove(&record.id);
        self.persist_update(record);
        debug!(timer_id = %record.id, "timer expired");
    }

    // -- cancellation --------------------------------------------------------

    fn cancel(&self, entity: &Arc<TimerEntity>) -> Result<()> {
        let mut record = entity.lock();
        let previous = record.cancel()?;
        let tx = self.active_transaction();
        let staged_here = tx
            .as_ref()
            .is_some_and(|tx| self.staging.contains(tx.id(), &record.id));

        match tx {
            Some(tx) if !staged_here => {
                let sync = StagedResolution {
                    service: self.this.clone(),
                    tx: tx.id(),
                    timer: Arc::clone(entity),
                    mutation: StagedMutation::Cancel { previous },
                };
                if let Err(e) = tx.register_synchronization(Box::new(sync)) {
                    record.restore(previous);
                    return Err(registration_error(e));
                }
                debug!(timer_id = %record.id, tx = %tx.id(), "timer cancellation staged");
            }
            _ => {
                self.scheduler.cancel(&record.id);
                self.registry.remove(&record.id);
            }
        }

        self.persist_update(&record);
        info!(timer_id = %record.id, timed_object = %self.timed_object_id, "timer canceled");
        Ok(())
    }

    // -- transaction resolution ----------------------------------------------

    pub(crate) fn resolve_staged(
        &self,
        tx: TransactionId,
        entity: &Arc<TimerEntity>,
        mutation: StagedMutation,
        outcome: TxOutcome,
    ) {
        debug!(timer_id = %entity.id(), %tx, ?mutation, ?outcome, "resolving staged timer");
        let started = self.started.load(Ordering::SeqCst);
        match (mutation, outcome) {
            (StagedMutation::Create, TxOutcome::Committed) => {
                self.staging.unstage(tx, entity.id());
                let mut record = entity.lock();
                if record.state != TimerState::Created {
                    // canceled inside the same transaction
                    return;
                }
                if !started {
                    if record.cancel().is_ok() {
                        self.persistence.update(&record, None);
                    }
                    info!(timer_id = %record.id, "service stopped before commit; staged timer dropped");
                    return;
                }
                self.activate(entity, &mut record, true);
            }
            (StagedMutation::Create, TxOutcome::RolledBack) => {
                self.staging.unstage(tx, entity.id());
                let mut record = entity.lock();
                if record.cancel().is_ok() {
                    self.persistence.update(&record, None);
                }
            }
            (StagedMutation::Cancel { .. }, TxOutcome::Committed) => {
                let _record = entity.lock();
                self.scheduler.cancel(entity.id());
                self.registry.remove(entity.id());
            }
            (StagedMutation::Cancel { previous }, TxOutcome::RolledBack) => {
                let mut record = entity.lock();
                record.restore(previous);
                if started && record.state == TimerState::Active {
                    if record.is_repeating() {
                        // the fixed-rate task kept ticking; catch the
                        // bookkeeping up with the firings it suppressed
                        let skipped = record.skip_missed_intervals(self.scheduler.now());
                        if skipped > 0 {
                            debug!(timer_id = %record.id, skipped, "suppressed interval firings skipped");
                        }
                    } else {
                        // a suppressed one-shot firing is made up right away
                        self.schedule(&record, false);
                    }
                }
                self.persistence.update(&record, None);
            }
        }
    }

    // -- restore -------------------------------------------------------------

    fn restore_timers(&self) -> Result<()> {
        let persisted = self.persistence.load_active(&self.timed_object_id)?;
        let plan = reconcile(persisted, self.auto_timers.clone());
        info!(
            timed_object = %self.timed_object_id,
            resume = plan.resume.len(),
            cancel = plan.cancel.len(),
            create = plan.create.len(),
            persistence = self.persistence.is_configured(),
            "restoring timers"
        );

        for mut stale in plan.cancel {
            if let Some(entity) = self.registry.remove(&stale.id) {
                let mut record = entity.lock();
                let _ = record.cancel();
            }
            self.scheduler.cancel(&stale.id);
            stale.state = TimerState::Canceled;
            self.persistence.update(&stale, None);
            info!(timer_id = %stale.id, "stale auto timer canceled");
        }

        for record in plan.resume {
            let entity = self
                .registry
                .get(&record.id)
                .unwrap_or_else(|| TimerEntity::new(record));
            let mut record = entity.lock();
            if record.is_calendar() && record.next_expiration.is_none() {
                let now = self.scheduler.now();
                let next = record
                    .schedule
                    .as_ref()
                    .and_then(|schedule| self.evaluator.next_timeout(schedule, now));
                record.next_expiration = next;
            }
            self.activate(&entity, &mut record, true);
        }

        // auto timers still live from an earlier pass (transient ones, or
        // all of them without a store) are not created again
        let mut live: Vec<TimerRecord> = self
            .registry
            .entries()
            .iter()
            .map(|entity| entity.snapshot())
            .filter(|record| record.auto_timer && record.is_live())
            .collect();
        for auto in plan.create {
            if let Some(idx) = live.iter().position(|record| auto.declares(record)) {
                live.swap_remove(idx);
                debug!(timed_object = %self.timed_object_id, method = %auto.method, "auto timer already live");
                continue;
            }
            let config = auto.timer_config();
            if let Err(e) = self.create_calendar(auto.schedule, config, Some(auto.method.clone()), None) {
                error!(timed_object = %self.timed_object_id, method = %auto.method, "failed to create auto timer: {e}");
            }
        }
        Ok(())
    }

    /// Registered live timers for the caller's key plus its staged timers.
    fn visible_timers(&self) -> Vec<Timer> {
        let primary_key = self.context.current().primary_key;
        let mut candidates = self.registry.entries();
        if let Some(tx) = self.current_transaction() {
            candidates.extend(self.staging.staged(tx.id()));
        }

        let mut seen = HashSet::new();
        candidates
            .into_iter()
            .filter(|entity| seen.insert(entity.id().clone()))
            .filter(|entity| {
                let record = entity.lock();
                record.is_live()
                    && (record.primary_key.is_none() || record.primary_key == primary_key)
            })
            .map(Timer::new)
            .collect()
    }
}

fn registration_error(e: TimerError) -> TimerError {
    match e {
        TimerError::TransactionRegistration(_) => e,
        other => TimerError::TransactionRegistration(other.to_string()),
    }
}

fn validate_instant(what: &str, at: DateTime<Utc>) -> Result<()> {
    if at.timestamp_millis() < 0 {
        return Err(TimerError::Validation(format!("{what} must not be negative, got {at}")));
    }
    Ok(())
}

fn validate_duration(what: &str, d: Duration) -> Result<()> {
    if d < Duration::zero() {
        return Err(TimerError::Validation(format!(
            "{what} must not be negative, got {} ms",
            d.num_milliseconds()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        executor::InlineExecutor,
        invoker::CallContext,
        store::SqliteTimerStore,
        tx::LocalTransactionCoordinator,
    };
    use chrono::TimeZone;
    use std::sync::Mutex;

    struct Recorder {
        fired: Mutex<Vec<TimerId>>,
    }

    impl TimedObjectInvoker for Recorder {
        fn timed_object_id(&self) -> &str {
            "orders"
        }

        fn call_timeout(&self, timer: &Timer) -> anyhow::Result<()> {
            self.fired.lock().unwrap().push(timer.id().clone());
            Ok(())
        }
    }

    struct Ctx(Mutex<CallContext>);

    impl InvocationContext for Ctx {
        fn current(&self) -> CallContext {
            self.0.lock().unwrap().clone()
        }
    }

    fn setup() -> (TimerService, Arc<ManualClock>, Arc<Recorder>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).unwrap(),
        ));
        let invoker = Arc::new(Recorder {
            fired: Mutex::new(Vec::new()),
        });
        let service = TimerService::builder(invoker.clone(), clock.clone())
            .executor(Arc::new(InlineExecutor))
            .build();
        service.start().unwrap();
        (service, clock, invoker)
    }

    #[test]
    fn operations_require_a_started_service() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let invoker = Arc::new(Recorder {
            fired: Mutex::new(Vec::new()),
        });
        let service = TimerService::builder(invoker, clock).build();
        let err = service
            .create_single_action_timer_in(Duration::seconds(1), TimerConfig::transient())
            .unwrap_err();
        assert!(matches!(err, TimerError::IllegalState(_)));
        assert!(service.get_timers().is_err());
    }

    #[test]
    fn negative_arguments_are_rejected() {
        let (service, _, _) = setup();
        let epoch_minus = Utc.timestamp_millis_opt(-1).unwrap();
        assert!(matches!(
            service.create_single_action_timer(epoch_minus, TimerConfig::transient()),
            Err(TimerError::Validation(_))
        ));
        assert!(matches!(
            service.create_interval_timer(service.now(), -5, TimerConfig::transient()),
            Err(TimerError::Validation(_))
        ));
        assert!(matches!(
            service.create_single_action_timer_in(Duration::milliseconds(-1), TimerConfig::transient()),
            Err(TimerError::Validation(_))
        ));
        let now = service.now();
        let inverted = ScheduleExpression::default()
            .start(now + Duration::days(1))
            .end(now);
        assert!(matches!(
            service.create_calendar_timer(inverted, TimerConfig::transient(), None),
            Err(TimerError::Validation(_))
        ));
        assert!(service.get_timers().unwrap().is_empty());
    }

    #[test]
    fn single_action_fires_once_then_expires() {
        let (service, clock, invoker) = setup();
        let timer = service
            .create_single_action_timer_in(Duration::seconds(2), TimerConfig::transient())
            .unwrap();
        assert_eq!(timer.state(), TimerState::Active);
        clock.advance(std::time::Duration::from_secs(5));
        assert_eq!(invoker.fired.lock().unwrap().len(), 1);
        assert_eq!(timer.state(), TimerState::Expired);
        assert!(!service.is_scheduled(&timer));
        assert!(service.get_timers().unwrap().is_empty());
    }

    #[test]
    fn calendar_timer_reschedules_after_each_firing() {
        let (service, clock, invoker) = setup();
        let every_second = ScheduleExpression::default().second("*").minute("*").hour("*");
        let timer = service
            .create_calendar_timer(every_second, TimerConfig::transient(), None)
            .unwrap();
        assert!(timer.is_calendar_timer());
        clock.advance(std::time::Duration::from_millis(3_100));
        assert_eq!(invoker.fired.lock().unwrap().len(), 3);
        assert_eq!(timer.state(), TimerState::Active);
        assert!(service.is_scheduled(&timer));
    }

    #[test]
    fn exhausted_calendar_timer_expires_immediately() {
        let (service, _, _) = setup();
        let past = service.now() - Duration::days(2);
        let over = ScheduleExpression::default()
            .hour("*")
            .start(past - Duration::days(1))
            .end(past);
        let timer = service
            .create_calendar_timer(over, TimerConfig::transient(), None)
            .unwrap();
        assert_eq!(timer.state(), TimerState::Expired);
    }

    #[test]
    fn lifecycle_callers_are_refused() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let invoker = Arc::new(Recorder {
            fired: Mutex::new(Vec::new()),
        });
        let ctx = Arc::new(Ctx(Mutex::new(CallContext {
            primary_key: None,
            lifecycle_callback: true,
        })));
        let service = TimerService::builder(invoker, clock)
            .context(ctx.clone())
            .build();
        service.start().unwrap();
        assert!(matches!(
            service.create_single_action_timer_in(Duration::seconds(1), TimerConfig::transient()),
            Err(TimerError::IllegalState(_))
        ));

        ctx.0.lock().unwrap().lifecycle_callback = false;
        assert!(service
            .create_single_action_timer_in(Duration::seconds(1), TimerConfig::transient())
            .is_ok());
    }

    #[test]
    fn timers_are_filtered_by_primary_key() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let invoker = Arc::new(Recorder {
            fired: Mutex::new(Vec::new()),
        });
        let ctx = Arc::new(Ctx(Mutex::new(CallContext::default())));
        let service = TimerService::builder(invoker, clock)
            .context(ctx.clone())
            .build();
        service.start().unwrap();

        let keyless = service
            .create_single_action_timer_in(Duration::hours(1), TimerConfig::transient())
            .unwrap();
        ctx.0.lock().unwrap().primary_key = Some("a".into());
        let for_a = service
            .create_single_action_timer_in(Duration::hours(1), TimerConfig::transient())
            .unwrap();
        ctx.0.lock().unwrap().primary_key = Some("b".into());
        let for_b = service
            .create_single_action_timer_in(Duration::hours(1), TimerConfig::transient())
            .unwrap();

        let visible = service.get_timers().unwrap();
        assert_eq!(visible.len(), 2);
        assert!(visible.contains(&keyless));
        assert!(visible.contains(&for_b));
        assert!(!visible.contains(&for_a));
    }

    #[test]
    fn handle_lookup_and_explicit_expiry() {
        let (service, _, _) = setup();
        let timer = service
            .create_interval_timer_in(Duration::seconds(1), Duration::seconds(1), TimerConfig::transient())
            .unwrap();
        let found = service.get_timer(&timer.handle()).unwrap();
        assert_eq!(found, timer);

        service.expire_timer(&timer).unwrap();
        assert_eq!(timer.state(), TimerState::Expired);
        assert!(matches!(
            service.get_timer(&timer.handle()),
            Err(TimerError::NotFound { .. })
        ));
        assert!(matches!(
            service.expire_timer(&timer),
            Err(TimerError::IllegalTimerState { .. })
        ));

        let foreign = TimerHandle {
            timed_object_id: "elsewhere".into(),
            timer_id: timer.id().clone(),
        };
        assert!(matches!(service.get_timer(&foreign), Err(TimerError::NotFound { .. })));
    }

    #[test]
    fn staged_timer_is_visible_only_to_its_transaction() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let invoker = Arc::new(Recorder {
            fired: Mutex::new(Vec::new()),
        });
        let coord = Arc::new(LocalTransactionCoordinator::new());
        let service = TimerService::builder(invoker, clock)
            .transactions(coord.clone())
            .build();
        service.start().unwrap();

        coord.begin().unwrap();
        let timer = service
            .create_single_action_timer_in(Duration::minutes(1), TimerConfig::transient())
            .unwrap();
        assert_eq!(timer.state(), TimerState::Created);
        assert!(!service.is_scheduled(&timer));
        assert_eq!(service.get_timers().unwrap(), vec![timer.clone()]);
        assert!(service.get_timer(&timer.handle()).is_ok());

        let other = service.clone();
        let handle = timer.handle();
        std::thread::spawn(move || {
            assert!(other.get_timers().unwrap().is_empty());
            assert!(other.get_timer(&handle).is_err());
        })
        .join()
        .unwrap();

        coord.commit().unwrap();
        assert_eq!(timer.state(), TimerState::Active);
        assert!(service.is_scheduled(&timer));
    }

    #[test]
    fn stop_suspends_and_restart_restores_persistent_timers() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let invoker = Arc::new(Recorder {
            fired: Mutex::new(Vec::new()),
        });
        let store = Arc::new(SqliteTimerStore::in_memory().unwrap());
        let service = TimerService::builder(invoker.clone(), clock.clone())
            .executor(Arc::new(InlineExecutor))
            .persistence(store)
            .build();
        service.start().unwrap();

        let durable = service
            .create_single_action_timer_in(Duration::seconds(10), TimerConfig::default())
            .unwrap();
        service
            .create_single_action_timer_in(Duration::seconds(10), TimerConfig::transient())
            .unwrap();

        service.stop();
        assert!(!service.is_started());
        assert_eq!(clock.pending(), 0);
        clock.advance(std::time::Duration::from_secs(20));
        assert!(invoker.fired.lock().unwrap().is_empty());

        service.start().unwrap();
        let restored = service.get_timers().unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].id(), durable.id());
        // overdue: fires on the next tick
        clock.advance(std::time::Duration::ZERO);
        assert_eq!(*invoker.fired.lock().unwrap(), vec![durable.id().clone()]);
    }
}
