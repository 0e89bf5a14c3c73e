use rusqlite::Connection;

use crate::error::Result;

/// Initialise the timer schema in `conn`.
///
/// Creates the `timers` table (idempotent) and an index on
/// `(timed_object_id, state)` so recovery loads stay cheap per component.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS timers (
            id                 TEXT    NOT NULL PRIMARY KEY,
            timed_object_id    TEXT    NOT NULL,
            primary_key        TEXT,
            auto_timer         INTEGER NOT NULL DEFAULT 0,
            info               TEXT,               -- JSON payload or NULL
            state              TEXT    NOT NULL,
            initial_expiration TEXT    NOT NULL,   -- RFC 3339
            next_expiration    TEXT,               -- RFC 3339 or NULL
            previous_run       TEXT,               -- RFC 3339 or NULL
            interval_ms        INTEGER NOT NULL DEFAULT 0,
            schedule           TEXT,               -- JSON ScheduleExpression or NULL
            timeout_method     TEXT,               -- JSON TimeoutMethod or NULL
            updated_at         TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_timers_object_state
            ON timers (timed_object_id, state);
        ",
    )?;
    Ok(())
}
