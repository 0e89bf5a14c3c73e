//! Shared value types for timekeeper-timers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TimerId
// ---------------------------------------------------------------------------

/// Opaque, immutable identifier of a timer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerId(pub String);

impl TimerId {
    /// Generate a fresh random timer ID (UUIDv4).
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TimerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TimerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TimerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// TimerState
// ---------------------------------------------------------------------------

/// Lifecycle state of a timer.
///
/// `Created -> Active -> {Canceled | Expired}`; `Canceled` is also reachable
/// straight from `Created` (rollback, or cancel before commit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerState {
    Created,
    Active,
    Canceled,
    Expired,
}

impl TimerState {
    /// Canceled and expired timers never fire again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TimerState::Canceled | TimerState::Expired)
    }
}

impl fmt::Display for TimerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimerState::Created => "created",
            TimerState::Active => "active",
            TimerState::Canceled => "canceled",
            TimerState::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TimerState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created" => Ok(TimerState::Created),
            "active" => Ok(TimerState::Active),
            "canceled" => Ok(TimerState::Canceled),
            "expired" => Ok(TimerState::Expired),
            other => Err(format!("unknown timer state: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutMethod
// ---------------------------------------------------------------------------

/// Symbolic reference to the timeout method an auto timer is bound to.
///
/// Only ever compared, never invoked by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeoutMethod {
    pub name: String,
    /// Ordered parameter type names.
    #[serde(default)]
    pub params: Vec<String>,
}

impl TimeoutMethod {
    pub fn new(name: impl Into<String>, params: &[&str]) -> Self {
        Self {
            name: name.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl fmt::Display for TimeoutMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.params.join(", "))
    }
}

// ---------------------------------------------------------------------------
// TimerHandle / TimerConfig
// ---------------------------------------------------------------------------

/// Serializable reference to a timer, valid across calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerHandle {
    pub timed_object_id: String,
    pub timer_id: TimerId,
}

/// Creation options shared by every `create_*` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    /// User payload handed back on every timeout.
    #[serde(default)]
    pub info: Option<serde_json::Value>,
    #[serde(default = "bool_true")]
    pub persistent: bool,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            info: None,
            persistent: true,
        }
    }
}

impl TimerConfig {
    pub fn transient() -> Self {
        Self {
            info: None,
            persistent: false,
        }
    }

    pub fn with_info(mut self, info: serde_json::Value) -> Self {
        self.info = Some(info);
        self
    }
}

fn bool_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_str() {
        for state in [
            TimerState::Created,
            TimerState::Active,
            TimerState::Canceled,
            TimerState::Expired,
        ] {
            assert_eq!(state.to_string().parse::<TimerState>().unwrap(), state);
        }
        assert!("paused".parse::<TimerState>().is_err());
    }

    #[test]
    fn only_canceled_and_expired_are_terminal() {
        assert!(!TimerState::Created.is_terminal());
        assert!(!TimerState::Active.is_terminal());
        assert!(TimerState::Canceled.is_terminal());
        assert!(TimerState::Expired.is_terminal());
    }

    #[test]
    fn fresh_ids_are_unique() {
        assert_ne!(TimerId::new(), TimerId::new());
    }

    #[test]
    fn method_equality_includes_parameter_order() {
        let a = TimeoutMethod::new("tick", &["Timer", "String"]);
        let b = TimeoutMethod::new("tick", &["String", "Timer"]);
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "tick(Timer, String)");
    }
}
