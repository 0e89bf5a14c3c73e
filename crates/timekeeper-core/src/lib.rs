//! `timekeeper-core`: configuration, shared value types and the top-level
//! error type used by every timekeeper crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::{AutoTimerConfig, EngineConfig, TimedObjectConfig, TimekeeperConfig};
pub use error::{Result, TimekeeperError};
pub use types::ScheduleExpression;
