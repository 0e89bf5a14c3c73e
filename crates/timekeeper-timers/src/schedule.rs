use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc};
use timekeeper_core::ScheduleExpression;
use tracing::warn;

/// Computes calendar timer expirations.
pub trait ScheduleEvaluator: Send + Sync {
    /// First instant matching `schedule` strictly after `after`, or `None`
    /// when the schedule is exhausted or cannot be evaluated.
    fn next_timeout(
        &self,
        schedule: &ScheduleExpression,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>>;
}

/// Evaluator for simple UTC schedules.
///
/// Supported: `second`, `minute`, `hour` each `*` or a single integer;
/// `day_of_week` `*` or a single integer (0 and 7 are Sunday);
/// `day_of_month`, `month`, `year` must be `*`; timezone unset or `UTC`;
/// `start`/`end` bounds are honoured. Anything else yields `None`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicCalendar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Any,
    Exact(u32),
}

impl Field {
    fn parse(raw: &str, max: u32) -> Option<Self> {
        let raw = raw.trim();
        if raw == "*" {
            return Some(Field::Any);
        }
        raw.parse::<u32>()
            .ok()
            .filter(|v| *v <= max)
            .map(Field::Exact)
    }

    fn matches(self, v: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Exact(x) => x == v,
        }
    }

    /// Smallest matching value in `from..=max`.
    fn first_from(self, from: u32, max: u32) -> Option<u32> {
        match self {
            Field::Any => (from <= max).then_some(from),
            Field::Exact(x) => (x >= from && x <= max).then_some(x),
        }
    }
}

struct Compiled {
    second: Field,
    minute: Field,
    hour: Field,
    /// 0 = Sunday … 6 = Saturday
    weekday: Field,
}

impl Compiled {
    fn compile(s: &ScheduleExpression) -> Option<Self> {
        for (name, raw) in [
            ("day_of_month", &s.day_of_month),
            ("month", &s.month),
            ("year", &s.year),
        ] {
            if raw.trim() != "*" {
                warn!(field = name, value = %raw, "unsupported calendar field; schedule will not fire");
                return None;
            }
        }
        if let Some(tz) = s.timezone.as_deref() {
            if !tz.eq_ignore_ascii_case("utc") {
                warn!(timezone = tz, "only UTC schedules are supported");
                return None;
            }
        }
        let weekday = match Field::parse(&s.day_of_week, 7)? {
            Field::Exact(7) => Field::Exact(0),
            f => f,
        };
        Some(Self {
            second: Field::parse(&s.second, 59)?,
            minute: Field::parse(&s.minute, 59)?,
            hour: Field::parse(&s.hour, 23)?,
            weekday,
        })
    }

    /// Earliest matching time of day at or after `from`.
    fn time_on_or_after(&self, from: NaiveTime) -> Option<NaiveTime> {
        let mut h = self.hour.first_from(from.hour(), 23)?;
        loop {
            let m_from = if h == from.hour() { from.minute() } else { 0 };
            let mut m = self.minute.first_from(m_from, 59);
            while let Some(min) = m {
                let s_from = if h == from.hour() && min == from.minute() {
                    from.second()
                } else {
                    0
                };
                if let Some(sec) = self.second.first_from(s_from, 59) {
                    return NaiveTime::from_hms_opt(h, min, sec);
                }
                m = self.minute.first_from(min + 1, 59);
            }
            h = self.hour.first_from(h + 1, 23)?;
        }
    }
}

impl ScheduleEvaluator for BasicCalendar {
    fn next_timeout(
        &self,
        schedule: &ScheduleExpression,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let compiled = Compiled::compile(schedule)?;

        // strictly after `after`, on a whole second
        let mut lower = after.with_nanosecond(0)? + Duration::seconds(1);
        if let Some(start) = schedule.start {
            if start > lower {
                lower = start;
            }
        }

        // a weekday constraint repeats within 7 days; 8 covers the partial first day
        for offset in 0..8 {
            let day = lower.date_naive() + Duration::days(offset);
            if !compiled.weekday.matches(day.weekday().num_days_from_sunday()) {
                continue;
            }
            let from = if offset == 0 {
                lower.time()
            } else {
                NaiveTime::from_hms_opt(0, 0, 0)?
            };
            let Some(time) = compiled.time_on_or_after(from) else {
                continue;
            };
            let candidate = Utc.from_utc_datetime(&day.and_time(time));
            if schedule.end.is_some_and(|end| candidate > end) {
                return None;
            }
            return Some(candidate);
        }
        None
    }
}
