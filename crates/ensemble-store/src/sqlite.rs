use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use ensemble_core::error::{EnsembleError, Result};
use ensemble_core::run::Run;
use ensemble_core::schedule::{Schedule, ScheduleRun};
use ensemble_core::traits::{RunStore, ScheduleStore};
use ensemble_core::types::{RunId, SessionId};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        target TEXT NOT NULL,
        state TEXT NOT NULL,
        snapshot TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_runs_session
        ON runs(session_id, created_at);

    CREATE TABLE IF NOT EXISTS schedules (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        cron_expr TEXT NOT NULL,
        timezone TEXT NOT NULL,
        endpoint TEXT NOT NULL,
        payload TEXT NOT NULL,
        enabled INTEGER NOT NULL,
        next_run_at INTEGER,
        locked_by TEXT,
        locked_at INTEGER,
        max_retries INTEGER NOT NULL DEFAULT 0,
        retry_delay_seconds INTEGER NOT NULL DEFAULT 60,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_schedules_due
        ON schedules(enabled, next_run_at);

    CREATE TABLE IF NOT EXISTS schedule_runs (
        id TEXT PRIMARY KEY,
        schedule_id TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        triggered_at INTEGER NOT NULL,
        completed_at INTEGER NOT NULL,
        status TEXT NOT NULL,
        error TEXT,
        run_id TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_schedule_runs_schedule
        ON schedule_runs(schedule_id);";

const SCHEDULE_COLUMNS: &str = "id, name, cron_expr, timezone, endpoint, payload, enabled, \
     next_run_at, locked_by, locked_at, max_retries, retry_delay_seconds, created_at, updated_at";

/// SQLite-backed run and schedule store.
///
/// Run snapshots are stored as JSON documents keyed by run id. Schedule
/// timestamps are epoch milliseconds so due/lease checks are plain integer
/// comparisons inside a single `UPDATE`, which is what makes lease
/// acquisition atomic across processes sharing the database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EnsembleError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| EnsembleError::Database(e.to_string()))
    }
}

fn db_err(e: rusqlite::Error) -> EnsembleError {
    EnsembleError::Database(e.to_string())
}

fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn row_to_schedule(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    let payload: String = row.get(5)?;
    Ok(Schedule {
        id: row.get(0)?,
        name: row.get(1)?,
        cron_expr: row.get(2)?,
        timezone: row.get(3)?,
        endpoint: row.get(4)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        enabled: row.get::<_, i64>(6)? != 0,
        next_run_at: row.get::<_, Option<i64>>(7)?.map(from_ms),
        locked_by: row.get(8)?,
        locked_at: row.get::<_, Option<i64>>(9)?.map(from_ms),
        max_retries: row.get::<_, i64>(10)? as u32,
        retry_delay_seconds: row.get::<_, i64>(11)? as u64,
        created_at: from_ms(row.get(12)?),
        updated_at: from_ms(row.get(13)?),
    })
}

fn row_to_schedule_run(row: &Row<'_>) -> rusqlite::Result<ScheduleRun> {
    let status: String = row.get(5)?;
    Ok(ScheduleRun {
        id: row.get(0)?,
        schedule_id: row.get(1)?,
        attempt: row.get::<_, i64>(2)? as u32,
        triggered_at: from_ms(row.get(3)?),
        completed_at: from_ms(row.get(4)?),
        status: status
            .parse()
            .unwrap_or(ensemble_core::schedule::ScheduleRunStatus::Failed),
        error: row.get(6)?,
        run_id: row.get(7)?,
    })
}

fn parse_snapshot(json: &str) -> Result<Run> {
    serde_json::from_str(json)
        .map_err(|e| EnsembleError::Database(format!("Corrupt run snapshot: {}", e)))
}

impl RunStore for SqliteStore {
    fn save_run(&self, run: &Run) -> BoxFuture<'_, Result<()>> {
        let snapshot = serde_json::to_string(run);
        let run_id = run.run_id.0.clone();
        let session_id = run.session_id.0.clone();
        let target = run.target.clone();
        let state = run.state.to_string();
        let created_at = run.created_at.to_rfc3339();
        let updated_at = run.updated_at.to_rfc3339();

        Box::pin(async move {
            let snapshot = snapshot?;
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO runs (run_id, session_id, target, state, snapshot, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(run_id) DO UPDATE SET
                     state = excluded.state,
                     snapshot = excluded.snapshot,
                     updated_at = excluded.updated_at",
                params![run_id, session_id, target, state, snapshot, created_at, updated_at],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Run>>> {
        let run_id = run_id.0.clone();
        Box::pin(async move {
            let conn = self.conn()?;
            let snapshot: Option<String> = conn
                .query_row(
                    "SELECT snapshot FROM runs WHERE run_id = ?1",
                    params![run_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            snapshot.as_deref().map(parse_snapshot).transpose()
        })
    }

    fn list_runs(&self, session_id: &SessionId) -> BoxFuture<'_, Result<Vec<Run>>> {
        let session_id = session_id.0.clone();
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(
                    "SELECT snapshot FROM runs WHERE session_id = ?1 ORDER BY created_at, rowid",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![session_id], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows.iter().map(|s| parse_snapshot(s)).collect()
        })
    }
}

impl ScheduleStore for SqliteStore {
    fn save_schedule(&self, schedule: &Schedule) -> BoxFuture<'_, Result<()>> {
        let s = schedule.clone();
        Box::pin(async move {
            let payload = serde_json::to_string(&s.payload)?;
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO schedules (id, name, cron_expr, timezone, endpoint, payload, enabled, \
                 next_run_at, locked_by, locked_at, max_retries, retry_delay_seconds, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
                 ON CONFLICT(id) DO UPDATE SET name=excluded.name, cron_expr=excluded.cron_expr, \
                 timezone=excluded.timezone, endpoint=excluded.endpoint, payload=excluded.payload, \
                 enabled=excluded.enabled, next_run_at=excluded.next_run_at, locked_by=excluded.locked_by, \
                 locked_at=excluded.locked_at, max_retries=excluded.max_retries, \
                 retry_delay_seconds=excluded.retry_delay_seconds, updated_at=excluded.updated_at",
                params![
                    s.id,
                    s.name,
                    s.cron_expr,
                    s.timezone,
                    s.endpoint,
                    payload,
                    s.enabled as i64,
                    s.next_run_at.map(to_ms),
                    s.locked_by,
                    s.locked_at.map(to_ms),
                    s.max_retries as i64,
                    s.retry_delay_seconds as i64,
                    to_ms(s.created_at),
                    to_ms(s.updated_at),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get_schedule(&self, id: &str) -> BoxFuture<'_, Result<Option<Schedule>>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            conn.query_row(
                &format!("SELECT {} FROM schedules WHERE id = ?1", SCHEDULE_COLUMNS),
                params![id],
                row_to_schedule,
            )
            .optional()
            .map_err(db_err)
        })
    }

    fn list_schedules(&self) -> BoxFuture<'_, Result<Vec<Schedule>>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM schedules ORDER BY created_at, id",
                    SCHEDULE_COLUMNS
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], row_to_schedule)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }

    fn delete_schedule(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let deleted = conn
                .execute("DELETE FROM schedules WHERE id = ?1", params![id])
                .map_err(db_err)?;
            Ok(deleted > 0)
        })
    }

    fn list_due(&self, now: DateTime<Utc>, lease_ttl: Duration) -> BoxFuture<'_, Result<Vec<Schedule>>> {
        let now_ms = to_ms(now);
        let expired_before = to_ms(now - lease_ttl);
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM schedules \
                     WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1 \
                     AND (locked_by IS NULL OR locked_at <= ?2) \
                     ORDER BY next_run_at",
                    SCHEDULE_COLUMNS
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![now_ms, expired_before], row_to_schedule)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }

    fn try_acquire(
        &self,
        id: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        let owner = owner.to_string();
        let now_ms = to_ms(now);
        let expired_before = to_ms(now - lease_ttl);
        Box::pin(async move {
            let conn = self.conn()?;
            // Re-checks due-ness so a stale due list cannot re-fire a released schedule.
            let claimed = conn
                .execute(
                    "UPDATE schedules SET locked_by = ?2, locked_at = ?3, updated_at = ?3 \
                     WHERE id = ?1 AND enabled = 1 \
                     AND next_run_at IS NOT NULL AND next_run_at <= ?3 \
                     AND (locked_by IS NULL OR locked_at <= ?4)",
                    params![id, owner, now_ms, expired_before],
                )
                .map_err(db_err)?;
            Ok(claimed == 1)
        })
    }

    fn renew_lease(&self, id: &str, owner: &str, now: DateTime<Utc>) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        let owner = owner.to_string();
        let now_ms = to_ms(now);
        Box::pin(async move {
            let conn = self.conn()?;
            let renewed = conn
                .execute(
                    "UPDATE schedules SET locked_at = ?3, updated_at = ?3 \
                     WHERE id = ?1 AND locked_by = ?2",
                    params![id, owner, now_ms],
                )
                .map_err(db_err)?;
            Ok(renewed == 1)
        })
    }

    fn release(
        &self,
        id: &str,
        owner: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        let owner = owner.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let released = conn
                .execute(
                    "UPDATE schedules SET locked_by = NULL, locked_at = NULL, next_run_at = ?3, \
                     updated_at = ?4 WHERE id = ?1 AND locked_by = ?2",
                    params![id, owner, next_run_at.map(to_ms), to_ms(Utc::now())],
                )
                .map_err(db_err)?;
            Ok(released == 1)
        })
    }

    fn save_schedule_run(&self, run: &ScheduleRun) -> BoxFuture<'_, Result<()>> {
        let r = run.clone();
        Box::pin(async move {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO schedule_runs (id, schedule_id, attempt, triggered_at, completed_at, status, error, run_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    r.id,
                    r.schedule_id,
                    r.attempt as i64,
                    to_ms(r.triggered_at),
                    to_ms(r.completed_at),
                    r.status.to_string(),
                    r.error,
                    r.run_id,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn list_schedule_runs(&self, schedule_id: &str) -> BoxFuture<'_, Result<Vec<ScheduleRun>>> {
        let schedule_id = schedule_id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, schedule_id, attempt, triggered_at, completed_at, status, error, run_id \
                     FROM schedule_runs WHERE schedule_id = ?1 ORDER BY rowid",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![schedule_id], row_to_schedule_run)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }
}
