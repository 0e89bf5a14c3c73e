use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Calendar schedule of a calendar-based timer.
///
/// Fields are kept as the raw attribute strings the component declared.
/// Two expressions are "the same schedule" iff every field is equal, which
/// is exactly what the derived `PartialEq` gives us. Interpreting the fields
/// is the job of a `ScheduleEvaluator` in `timekeeper-timers`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduleExpression {
    #[serde(default = "zero")]
    pub second: String,
    #[serde(default = "zero")]
    pub minute: String,
    #[serde(default = "zero")]
    pub hour: String,
    #[serde(default = "wildcard")]
    pub day_of_week: String,
    #[serde(default = "wildcard")]
    pub day_of_month: String,
    #[serde(default = "wildcard")]
    pub month: String,
    #[serde(default = "wildcard")]
    pub year: String,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl Default for ScheduleExpression {
    /// Midnight every day.
    fn default() -> Self {
        Self {
            second: zero(),
            minute: zero(),
            hour: zero(),
            day_of_week: wildcard(),
            day_of_month: wildcard(),
            month: wildcard(),
            year: wildcard(),
            start: None,
            end: None,
            timezone: None,
        }
    }
}

impl ScheduleExpression {
    pub fn second(mut self, v: impl Into<String>) -> Self {
        self.second = v.into();
        self
    }

    pub fn minute(mut self, v: impl Into<String>) -> Self {
        self.minute = v.into();
        self
    }

    pub fn hour(mut self, v: impl Into<String>) -> Self {
        self.hour = v.into();
        self
    }

    pub fn day_of_week(mut self, v: impl Into<String>) -> Self {
        self.day_of_week = v.into();
        self
    }

    pub fn day_of_month(mut self, v: impl Into<String>) -> Self {
        self.day_of_month = v.into();
        self
    }

    pub fn month(mut self, v: impl Into<String>) -> Self {
        self.month = v.into();
        self
    }

    pub fn year(mut self, v: impl Into<String>) -> Self {
        self.year = v.into();
        self
    }

    pub fn start(mut self, at: DateTime<Utc>) -> Self {
        self.start = Some(at);
        self
    }

    pub fn end(mut self, at: DateTime<Utc>) -> Self {
        self.end = Some(at);
        self
    }

    pub fn timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = Some(tz.into());
        self
    }
}

fn zero() -> String {
    "0".to_string()
}

fn wildcard() -> String {
    "*".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_daily_midnight() {
        let s = ScheduleExpression::default();
        assert_eq!(s.hour, "0");
        assert_eq!(s.day_of_month, "*");
        assert!(s.start.is_none());
    }

    #[test]
    fn equality_is_field_for_field() {
        let a = ScheduleExpression::default().hour("*").minute("15");
        let b = ScheduleExpression::default().hour("*").minute("15");
        let c = ScheduleExpression::default().hour("*").minute("30");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, a.clone().timezone("UTC"));
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() {
        let s: ScheduleExpression = serde_json::from_str(r#"{"minute":"*/5"}"#).unwrap();
        assert_eq!(s.minute, "*/5");
        assert_eq!(s.second, "0");
        assert_eq!(s.year, "*");
    }
}
