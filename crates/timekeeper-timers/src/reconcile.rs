//! Startup merge of declared auto timers with persisted timers.

use timekeeper_core::{AutoTimerConfig, ScheduleExpression};

use crate::{
    timer::TimerRecord,
    types::{TimeoutMethod, TimerConfig},
};

/// A statically declared, schedule-based timer.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoTimer {
    pub method: TimeoutMethod,
    pub schedule: ScheduleExpression,
    pub persistent: bool,
    pub info: Option<serde_json::Value>,
}

impl AutoTimer {
    pub fn new(method: TimeoutMethod, schedule: ScheduleExpression) -> Self {
        Self {
            method,
            schedule,
            persistent: true,
            info: None,
        }
    }

    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }

    pub fn timer_config(&self) -> TimerConfig {
        TimerConfig {
            info: self.info.clone(),
            persistent: self.persistent,
        }
    }

    /// Whether `timer` is an auto timer created from this declaration: same
    /// method signature and same schedule.
    pub fn declares(&self, timer: &TimerRecord) -> bool {
        timer.auto_timer
            && timer.timeout_method.as_ref() == Some(&self.method)
            && timer.schedule.as_ref() == Some(&self.schedule)
    }

    /// Whether a stored timer is the persisted incarnation of this
    /// declaration.
    fn matches(&self, stored: &TimerRecord) -> bool {
        self.persistent && self.declares(stored)
    }
}

impl From<&AutoTimerConfig> for AutoTimer {
    fn from(cfg: &AutoTimerConfig) -> Self {
        Self {
            method: TimeoutMethod {
                name: cfg.method.clone(),
                params: cfg.params.clone(),
            },
            schedule: cfg.schedule.clone(),
            persistent: cfg.persistent,
            info: cfg.info.clone(),
        }
    }
}

/// What to do with each timer source after a restart.
#[derive(Debug, Default)]
pub struct RestorePlan {
    /// Stored timers to bring back into the registry and schedule.
    pub resume: Vec<TimerRecord>,
    /// Stored auto timers whose declaration changed or disappeared.
    pub cancel: Vec<TimerRecord>,
    /// Declarations without a stored counterpart.
    pub create: Vec<AutoTimer>,
}

/// Pair stored auto timers with declarations. Each declaration is consumed
/// by at most one stored timer; stored timers in a terminal state are
/// ignored.
pub fn reconcile(persisted: Vec<TimerRecord>, declared: Vec<AutoTimer>) -> RestorePlan {
    let mut unmatched = declared;
    let mut plan = RestorePlan::default();

    for timer in persisted.into_iter().filter(TimerRecord::is_live) {
        if !timer.auto_timer {
            plan.resume.push(timer);
            continue;
        }
        match unmatched.iter().position(|auto| auto.matches(&timer)) {
            Some(idx) => {
                unmatched.remove(idx);
                plan.resume.push(timer);
            }
            None => plan.cancel.push(timer),
        }
    }

    plan.create = unmatched;
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TimerState;
    use chrono::Utc;

    fn stored_auto(method: &str, schedule: ScheduleExpression) -> TimerRecord {
        let mut rec = TimerRecord::calendar(
            "obj",
            None,
            schedule,
            Some(Utc::now()),
            Utc::now(),
            TimerConfig::default(),
            Some(TimeoutMethod::new(method, &["Timer"])),
        );
        rec.activate().unwrap();
        rec
    }

    fn declared(method: &str, schedule: ScheduleExpression) -> AutoTimer {
        AutoTimer::new(TimeoutMethod::new(method, &["Timer"]), schedule)
    }

    fn nightly() -> ScheduleExpression {
        ScheduleExpression::default().hour("2")
    }

    #[test]
    fn unchanged_declaration_resumes_without_duplicate() {
        let stored = stored_auto("sweep", nightly());
        let plan = reconcile(vec![stored.clone()], vec![declared("sweep", nightly())]);
        assert_eq!(plan.resume.len(), 1);
        assert_eq!(plan.resume[0].id, stored.id);
        assert!(plan.cancel.is_empty());
        assert!(plan.create.is_empty());
    }

    #[test]
    fn changed_schedule_cancels_old_and_creates_new() {
        let stored = stored_auto("sweep", nightly());
        let changed = ScheduleExpression::default().hour("3");
        let plan = reconcile(vec![stored.clone()], vec![declared("sweep", changed.clone())]);
        assert!(plan.resume.is_empty());
        assert_eq!(plan.cancel.len(), 1);
        assert_eq!(plan.cancel[0].id, stored.id);
        assert_eq!(plan.create.len(), 1);
        assert_eq!(plan.create[0].schedule, changed);
    }

    #[test]
    fn parameter_signature_must_match() {
        let stored = stored_auto("sweep", nightly());
        let other = AutoTimer::new(TimeoutMethod::new("sweep", &[]), nightly());
        let plan = reconcile(vec![stored], vec![other]);
        assert_eq!(plan.cancel.len(), 1);
        assert_eq!(plan.create.len(), 1);
    }

    #[test]
    fn transient_declaration_never_matches() {
        let stored = stored_auto("sweep", nightly());
        let plan = reconcile(vec![stored], vec![declared("sweep", nightly()).transient()]);
        assert_eq!(plan.cancel.len(), 1);
        assert_eq!(plan.create.len(), 1);
        assert!(!plan.create[0].persistent);
    }

    #[test]
    fn removed_declaration_cancels_stored_timer() {
        let plan = reconcile(vec![stored_auto("sweep", nightly())], Vec::new());
        assert_eq!(plan.cancel.len(), 1);
        assert!(plan.create.is_empty());
    }

    #[test]
    fn each_declaration_is_consumed_once() {
        let a = stored_auto("sweep", nightly());
        let b = stored_auto("sweep", nightly());
        let plan = reconcile(vec![a, b], vec![declared("sweep", nightly())]);
        assert_eq!(plan.resume.len(), 1);
        assert_eq!(plan.cancel.len(), 1);
        assert!(plan.create.is_empty());
    }

    #[test]
    fn programmatic_and_terminal_timers() {
        let mut programmatic =
            TimerRecord::interval("obj", None, Utc::now(), 1_000, TimerConfig::default());
        programmatic.activate().unwrap();
        let mut dead = stored_auto("sweep", nightly());
        dead.state = TimerState::Expired;

        let plan = reconcile(vec![programmatic.clone(), dead], vec![declared("sweep", nightly())]);
        assert_eq!(plan.resume.len(), 1);
        assert_eq!(plan.resume[0].id, programmatic.id);
        assert!(plan.cancel.is_empty());
        assert_eq!(plan.create.len(), 1);
    }

    #[test]
    fn declaration_ignores_persistence_flag_and_programmatic_timers() {
        let stored = stored_auto("sweep", nightly());
        assert!(declared("sweep", nightly()).transient().declares(&stored));
        assert!(!declared("sweep", ScheduleExpression::default().hour("3")).declares(&stored));

        let mut programmatic = stored.clone();
        programmatic.auto_timer = false;
        assert!(!declared("sweep", nightly()).declares(&programmatic));
    }

    #[test]
    fn declaration_from_config() {
        let cfg = AutoTimerConfig {
            method: "report".into(),
            params: vec!["Timer".into()],
            schedule: nightly(),
            persistent: true,
            info: Some(serde_json::json!("weekly")),
        };
        let auto = AutoTimer::from(&cfg);
        assert_eq!(auto.method, TimeoutMethod::new("report", &["Timer"]));
        assert_eq!(auto.timer_config().info, cfg.info);
    }
}
