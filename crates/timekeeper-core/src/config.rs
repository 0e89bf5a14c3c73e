use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::types::ScheduleExpression;

pub const DEFAULT_PERSISTENCE_FAILURE_THRESHOLD: u32 = 1;
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Top-level config (timekeeper.toml + TIMEKEEPER_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimekeeperConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Components owning timers, each with its declared auto timers.
    #[serde(default)]
    pub timed_objects: Vec<TimedObjectConfig>,
}

/// Knobs of a single timer service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Consecutive persistence failures tolerated before the current
    /// transaction is marked rollback-only. 1 means the first failure does it.
    #[serde(default = "default_failure_threshold")]
    pub persistence_failure_threshold: u32,
    /// Singleton components may touch the timer service from lifecycle
    /// callbacks; everyone else gets an illegal-state error.
    #[serde(default)]
    pub allow_lifecycle_timer_ops: bool,
    /// Size of the blocking pool that runs timeout callbacks.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            persistence_failure_threshold: DEFAULT_PERSISTENCE_FAILURE_THRESHOLD,
            allow_lifecycle_timer_ops: false,
            worker_threads: DEFAULT_WORKER_THREADS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimedObjectConfig {
    /// Stable identifier of the component, used as the persistence partition.
    pub id: String,
    #[serde(default)]
    pub auto_timers: Vec<AutoTimerConfig>,
}

/// A schedule-based timer declared statically for a timeout method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTimerConfig {
    /// Name of the timeout method the timer is bound to.
    pub method: String,
    /// Ordered parameter type names of that method.
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub schedule: ScheduleExpression,
    #[serde(default = "bool_true")]
    pub persistent: bool,
    #[serde(default)]
    pub info: Option<serde_json::Value>,
}

fn bool_true() -> bool {
    true
}
fn default_failure_threshold() -> u32 {
    DEFAULT_PERSISTENCE_FAILURE_THRESHOLD
}
fn default_worker_threads() -> usize {
    DEFAULT_WORKER_THREADS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.timekeeper/timers.db", home)
}

impl TimekeeperConfig {
    /// Load config from a TOML file with TIMEKEEPER_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `TIMEKEEPER_ENGINE__PERSISTENCE_FAILURE_THRESHOLD=3`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: TimekeeperConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TIMEKEEPER_").split("__"))
            .extract()
            .map_err(|e| crate::error::TimekeeperError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.timekeeper/timekeeper.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = TimekeeperConfig::load(Some("/nonexistent/timekeeper.toml")).unwrap();
        assert_eq!(cfg.engine.persistence_failure_threshold, 1);
        assert!(!cfg.engine.allow_lifecycle_timer_ops);
        assert!(cfg.timed_objects.is_empty());
    }

    #[test]
    fn auto_timers_parse_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[engine]
persistence_failure_threshold = 3

[[timed_objects]]
id = "billing"

[[timed_objects.auto_timers]]
method = "nightly_invoice"
params = ["Timer"]
schedule = {{ hour = "2", minute = "30" }}

[[timed_objects.auto_timers]]
method = "heartbeat"
persistent = false
schedule = {{ second = "*", minute = "*", hour = "*" }}
"#
        )
        .unwrap();

        let cfg = TimekeeperConfig::load(file.path().to_str()).unwrap();
        assert_eq!(cfg.engine.persistence_failure_threshold, 3);
        assert_eq!(cfg.timed_objects.len(), 1);

        let billing = &cfg.timed_objects[0];
        assert_eq!(billing.id, "billing");
        assert_eq!(billing.auto_timers.len(), 2);

        let nightly = &billing.auto_timers[0];
        assert_eq!(nightly.params, vec!["Timer".to_string()]);
        assert_eq!(nightly.schedule.hour, "2");
        assert_eq!(nightly.schedule.second, "0");
        assert!(nightly.persistent);

        assert!(!billing.auto_timers[1].persistent);
        assert!(billing.auto_timers[1].params.is_empty());
    }
}
