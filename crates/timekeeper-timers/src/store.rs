//! SQLite-backed [`TimerPersistence`].

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::{
    db::init_db,
    error::{Result, TimerError},
    persistence::TimerPersistence,
    timer::TimerRecord,
    types::TimerState,
};

/// Stores one row per timer; writes are upserts so retries are harmless.
pub struct SqliteTimerStore {
    conn: Mutex<Connection>,
}

impl SqliteTimerStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Fetch a single stored timer regardless of its state.
    pub fn get(&self, id: &str) -> Result<Option<TimerRecord>> {
        let conn = self.guard();
        let raw = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM timers WHERE id = ?1"),
                [id],
                RawRow::read,
            )
            .optional()?;
        raw.map(RawRow::into_record).transpose()
    }

    fn guard(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn upsert(&self, timer: &TimerRecord) -> Result<()> {
        let info = timer.info.as_ref().map(serde_json::to_string).transpose()?;
        let schedule = timer
            .schedule
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let method = timer
            .timeout_method
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let interval = i64::try_from(timer.interval_ms)
            .map_err(|_| TimerError::Validation(format!("interval {} ms too large", timer.interval_ms)))?;

        self.guard().execute(
            "INSERT INTO timers
             (id, timed_object_id, primary_key, auto_timer, info, state,
              initial_expiration, next_expiration, previous_run, interval_ms,
              schedule, timeout_method, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
             ON CONFLICT(id) DO UPDATE SET
                primary_key        = excluded.primary_key,
                info               = excluded.info,
                state              = excluded.state,
                next_expiration    = excluded.next_expiration,
                previous_run       = excluded.previous_run,
                schedule           = excluded.schedule,
                timeout_method     = excluded.timeout_method,
                updated_at         = excluded.updated_at",
            params![
                timer.id.as_str(),
                timer.timed_object_id,
                timer.primary_key,
                timer.auto_timer,
                info,
                timer.state.to_string(),
                timer.initial_expiration.to_rfc3339(),
                timer.next_expiration.map(|t| t.to_rfc3339()),
                timer.previous_run.map(|t| t.to_rfc3339()),
                interval,
                schedule,
                method,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

impl TimerPersistence for SqliteTimerStore {
    fn add_timer(&self, timer: &TimerRecord) -> Result<()> {
        self.upsert(timer)?;
        debug!(timer_id = %timer.id, timed_object = %timer.timed_object_id, "timer stored");
        Ok(())
    }

    fn update_timer(&self, timer: &TimerRecord) -> Result<()> {
        self.upsert(timer)?;
        debug!(timer_id = %timer.id, state = %timer.state, "timer updated");
        Ok(())
    }

    fn load_active_timers(&self, timed_object_id: &str) -> Result<Vec<TimerRecord>> {
        let conn = self.guard();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM timers
             WHERE timed_object_id = ?1 AND state NOT IN ('canceled', 'expired')
             ORDER BY initial_expiration"
        ))?;
        let rows = stmt
            .query_map([timed_object_id], RawRow::read)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let timers: Vec<TimerRecord> = rows
            .into_iter()
            .filter_map(|raw| {
                let id = raw.id.clone();
                match raw.into_record() {
                    Ok(rec) => Some(rec),
                    Err(e) => {
                        warn!(timer_id = %id, "skipping unreadable timer row: {e}");
                        None
                    }
                }
            })
            .collect();
        info!(timed_object = timed_object_id, count = timers.len(), "loaded persisted timers");
        Ok(timers)
    }

    fn timer_undeployed(&self, timed_object_id: &str) -> Result<()> {
        // rows are kept for the next deployment
        debug!(timed_object = timed_object_id, "timed object undeployed");
        Ok(())
    }
}

const COLUMNS: &str = "id, timed_object_id, primary_key, auto_timer, info, state,
     initial_expiration, next_expiration, previous_run, interval_ms,
     schedule, timeout_method";

struct RawRow {
    id: String,
    timed_object_id: String,
    primary_key: Option<String>,
    auto_timer: bool,
    info: Option<String>,
    state: String,
    initial_expiration: String,
    next_expiration: Option<String>,
    previous_run: Option<String>,
    interval_ms: i64,
    schedule: Option<String>,
    timeout_method: Option<String>,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timed_object_id: row.get(1)?,
            primary_key: row.get(2)?,
            auto_timer: row.get(3)?,
            info: row.get(4)?,
            state: row.get(5)?,
            initial_expiration: row.get(6)?,
            next_expiration: row.get(7)?,
            previous_run: row.get(8)?,
            interval_ms: row.get(9)?,
            schedule: row.get(10)?,
            timeout_method: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<TimerRecord> {
        let state: TimerState = self.state.parse().map_err(TimerError::Persistence)?;
        Ok(TimerRecord {
            id: self.id.into(),
            timed_object_id: self.timed_object_id,
            primary_key: self.primary_key,
            auto_timer: self.auto_timer,
            info: self.info.as_deref().map(serde_json::from_str).transpose()?,
            persistent: true,
            state,
            initial_expiration: parse_instant(&self.initial_expiration)?,
            next_expiration: self.next_expiration.as_deref().map(parse_instant).transpose()?,
            previous_run: self.previous_run.as_deref().map(parse_instant).transpose()?,
            interval_ms: u64::try_from(self.interval_ms).map_err(|_| {
                TimerError::Persistence(format!("negative interval {}", self.interval_ms))
            })?,
            schedule: self.schedule.as_deref().map(serde_json::from_str).transpose()?,
            timeout_method: self
                .timeout_method
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TimerError::Persistence(format!("bad timestamp {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TimeoutMethod, TimerConfig};
    use chrono::Duration;
    use timekeeper_core::ScheduleExpression;

    #[test]
    fn stored_calendar_timer_reads_back() {
        let store = SqliteTimerStore::in_memory().unwrap();
        let now = Utc::now();
        let mut rec = TimerRecord::calendar(
            "billing",
            Some("acct-7".into()),
            ScheduleExpression::default().hour("3"),
            Some(now + Duration::hours(1)),
            now,
            TimerConfig::default().with_info(serde_json::json!({"batch": 12})),
            Some(TimeoutMethod::new("nightly", &["Timer"])),
        );
        rec.activate().unwrap();
        store.add_timer(&rec).unwrap();

        let loaded = store.load_active_timers("billing").unwrap();
        assert_eq!(loaded.len(), 1);
        let got = &loaded[0];
        assert_eq!(got.id, rec.id);
        assert_eq!(got.primary_key.as_deref(), Some("acct-7"));
        assert!(got.auto_timer);
        assert_eq!(got.info, rec.info);
        assert_eq!(got.schedule, rec.schedule);
        assert_eq!(got.timeout_method, rec.timeout_method);
        assert_eq!(got.state, TimerState::Active);
        assert_eq!(
            got.next_expiration.map(|t| t.timestamp_millis()),
            rec.next_expiration.map(|t| t.timestamp_millis())
        );
    }

    #[test]
    fn terminal_timers_are_not_loaded() {
        let store = SqliteTimerStore::in_memory().unwrap();
        let mut rec = TimerRecord::interval("obj", None, Utc::now(), 500, TimerConfig::default());
        rec.activate().unwrap();
        store.add_timer(&rec).unwrap();
        rec.cancel().unwrap();
        store.update_timer(&rec).unwrap();
        // retry of the same write
        store.update_timer(&rec).unwrap();

        assert!(store.load_active_timers("obj").unwrap().is_empty());
        let row = store.get(rec.id.as_str()).unwrap().unwrap();
        assert_eq!(row.state, TimerState::Canceled);
        assert_eq!(row.interval_ms, 500);
    }

    #[test]
    fn partitions_by_timed_object() {
        let store = SqliteTimerStore::in_memory().unwrap();
        for owner in ["a", "a", "b"] {
            let rec = TimerRecord::interval(owner, None, Utc::now(), 0, TimerConfig::default());
            store.add_timer(&rec).unwrap();
        }
        assert_eq!(store.load_active_timers("a").unwrap().len(), 2);
        assert_eq!(store.load_active_timers("b").unwrap().len(), 1);
        assert!(store.load_active_timers("c").unwrap().is_empty());
        store.timer_undeployed("a").unwrap();
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timers.db");
        let path = path.to_str().unwrap();
        let rec = TimerRecord::interval("obj", None, Utc::now(), 0, TimerConfig::default());
        SqliteTimerStore::open(path).unwrap().add_timer(&rec).unwrap();

        let reopened = SqliteTimerStore::open(path).unwrap();
        assert!(reopened.get(rec.id.as_str()).unwrap().is_some());
    }
}
