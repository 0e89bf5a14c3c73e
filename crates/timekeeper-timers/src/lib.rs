//! `timekeeper-timers`: transactional timer service with durable recovery.
//!
//! # Overview
//!
//! A [`TimerService`] owns the timers of one timed object. Timers are created
//! in state `Created`, become `Active` immediately (or when the enclosing
//! transaction commits), and end `Canceled` or `Expired`. Active timers are
//! turned into clock tasks by the scheduling coordinator; a due task is handed
//! to the execution pool, which calls the [`TimedObjectInvoker`].
//!
//! # Timer kinds
//!
//! | Kind          | Next expiration after a firing               |
//! |---------------|----------------------------------------------|
//! | Single action | none, the timer expires                      |
//! | Interval      | previous expiration + interval (fixed rate)  |
//! | Calendar      | next schedule match after the previous one   |
//!
//! # Collaborators
//!
//! Everything outside the engine sits behind a trait with a reference
//! implementation: [`Clock`] ([`TokioClock`], [`ManualClock`]),
//! [`TimeoutExecutor`] ([`TokioExecutor`], [`InlineExecutor`]),
//! [`TimerPersistence`] ([`SqliteTimerStore`]), [`TransactionCoordinator`]
//! ([`LocalTransactionCoordinator`], [`NoTransactions`]) and
//! [`ScheduleEvaluator`] ([`BasicCalendar`]).

pub mod clock;
pub mod db;
pub mod error;
pub mod executor;
pub mod invoker;
pub mod persistence;
pub mod reconcile;
pub mod registry;
pub mod schedule;
mod scheduler;
pub mod service;
mod staging;
pub mod store;
pub mod timer;
pub mod tx;
pub mod types;

pub use clock::{Clock, ManualClock, ScheduledTask, TokioClock};
pub use error::{Result, TimerError};
pub use executor::{InlineExecutor, TimeoutExecutor, TokioExecutor};
pub use invoker::{CallContext, InvocationContext, NoInvocationContext, TimedObjectInvoker};
pub use persistence::TimerPersistence;
pub use reconcile::{reconcile, AutoTimer, RestorePlan};
pub use schedule::{BasicCalendar, ScheduleEvaluator};
pub use service::{TimerService, TimerServiceBuilder};
pub use store::SqliteTimerStore;
pub use timekeeper_core::ScheduleExpression;
pub use timer::{Timer, TimerRecord};
pub use tx::{
    LocalTransaction, LocalTransactionCoordinator, NoTransactions, Synchronization, Transaction,
    TransactionCoordinator, TxOutcome, TxStatus,
};
pub use types::{TimeoutMethod, TimerConfig, TimerHandle, TimerId, TimerState};
