//! SQLite-backed run history. One row per firing; rows move from `pending` to
//! a terminal status exactly once.

use std::path::Path;

use chrono::{DateTime, Utc};
use switchyard_core::{Result, SwitchyardError};

use crate::job::{RunRecord, RunStatus};

/// Terminal fields written when a run finishes.
#[derive(Debug, Clone)]
pub struct RunFinish {
    pub status: RunStatus,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub result_preview: Option<String>,
    pub error: Option<String>,
}

/// Run history store.
pub struct RunHistory {
    conn: rusqlite::Connection,
}

fn storage(context: &str) -> impl FnOnce(rusqlite::Error) -> SwitchyardError + '_ {
    move |e| SwitchyardError::Storage(format!("{context}: {e}"))
}

impl RunHistory {
    /// Open or create the history database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path).map_err(storage("DB open"))?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().map_err(storage("DB open"))?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS cron_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                triggered_at TEXT NOT NULL,
                finished_at TEXT,
                status TEXT NOT NULL DEFAULT 'pending',  -- pending, completed, error, timeout
                duration_ms INTEGER,
                manual INTEGER NOT NULL DEFAULT 0,
                result_preview TEXT,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_cron_runs_job ON cron_runs(job_id, id);
         ",
            )
            .map_err(storage("Migration"))
    }

    /// Resolve runs left `pending` by a previous process as `timeout`.
    pub fn recover_pending(&self) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let n = self
            .conn
            .execute(
                "UPDATE cron_runs SET status = 'timeout', finished_at = ?1,
                    error = 'gateway restarted before the run completed'
                 WHERE status = 'pending'",
                rusqlite::params![now],
            )
            .map_err(storage("Recover pending"))?;
        if n > 0 {
            tracing::warn!("⚠️ {n} in-flight runs marked timeout after restart");
        }
        Ok(n)
    }

    /// Insert a pending run, returning its id.
    pub fn start_run(&self, job_id: &str, triggered_at: DateTime<Utc>, manual: bool) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO cron_runs (job_id, triggered_at, status, manual) VALUES (?1, ?2, 'pending', ?3)",
                rusqlite::params![job_id, triggered_at.to_rfc3339(), manual as i32],
            )
            .map_err(storage("Insert run"))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Move a pending run to its terminal status. Returns false if it was already terminal.
    pub fn finish_run(&self, run_id: i64, finish: &RunFinish) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE cron_runs SET status = ?1, finished_at = ?2, duration_ms = ?3,
                    result_preview = ?4, error = ?5
                 WHERE id = ?6 AND status = 'pending'",
                rusqlite::params![
                    finish.status.as_str(),
                    finish.finished_at.to_rfc3339(),
                    finish.duration_ms as i64,
                    finish.result_preview,
                    finish.error,
                    run_id,
                ],
            )
            .map_err(storage("Finish run"))?;
        Ok(n == 1)
    }

    /// Most recent runs first.
    pub fn recent(&self, job_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, job_id, triggered_at, finished_at, status, duration_ms, manual,
                        result_preview, error
                 FROM cron_runs WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(storage("Query runs"))?;
        let rows = stmt
            .query_map(rusqlite::params![job_id, limit as i64], |row| {
                Ok(RawRun {
                    run_id: row.get(0)?,
                    job_id: row.get(1)?,
                    triggered_at: row.get(2)?,
                    finished_at: row.get(3)?,
                    status: row.get(4)?,
                    duration_ms: row.get(5)?,
                    manual: row.get::<_, i32>(6)? != 0,
                    result_preview: row.get(7)?,
                    error: row.get(8)?,
                })
            })
            .map_err(storage("Query runs"))?;

        let mut runs = Vec::new();
        for row in rows {
            let raw = row.map_err(storage("Read run"))?;
            if let Some(run) = raw.into_record() {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    /// Latest run that reached a terminal status.
    pub fn last_terminal(&self, job_id: &str) -> Result<Option<RunRecord>> {
        Ok(self
            .recent(job_id, 10)?
            .into_iter()
            .find(|r| r.status.is_terminal()))
    }

    /// Keep only the newest `keep` runs of a job.
    pub fn prune(&self, job_id: &str, keep: usize) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM cron_runs WHERE job_id = ?1 AND id NOT IN (
                    SELECT id FROM cron_runs WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2
                 )",
                rusqlite::params![job_id, keep as i64],
            )
            .map_err(storage("Prune runs"))
    }
}

struct RawRun {
    run_id: i64,
    job_id: String,
    triggered_at: String,
    finished_at: Option<String>,
    status: String,
    duration_ms: Option<i64>,
    manual: bool,
    result_preview: Option<String>,
    error: Option<String>,
}

impl RawRun {
    fn into_record(self) -> Option<RunRecord> {
        let parse = |s: &str| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|d| d.with_timezone(&Utc))
        };
        let Some(status) = RunStatus::parse(&self.status) else {
            tracing::warn!("⚠️ Run {} has unknown status '{}'", self.run_id, self.status);
            return None;
        };
        Some(RunRecord {
            run_id: self.run_id,
            job_id: self.job_id,
            triggered_at: parse(&self.triggered_at)?,
            finished_at: self.finished_at.as_deref().and_then(parse),
            status,
            duration_ms: self.duration_ms.map(|d| d.max(0) as u64),
            manual: self.manual,
            result_preview: self.result_preview,
            error: self.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finish(status: RunStatus, duration_ms: u64) -> RunFinish {
        RunFinish {
            status,
            finished_at: Utc::now(),
            duration_ms,
            result_preview: Some("ok".into()),
            error: None,
        }
    }

    #[test]
    fn test_run_transitions_exactly_once() {
        let db = RunHistory::open_in_memory().unwrap();
        let id = db.start_run("job", Utc::now(), false).unwrap();
        assert_eq!(db.recent("job", 5).unwrap()[0].status, RunStatus::Pending);

        assert!(db.finish_run(id, &finish(RunStatus::Timeout, 100)).unwrap());
        // A late completion must not overwrite the timeout.
        assert!(!db.finish_run(id, &finish(RunStatus::Completed, 150)).unwrap());

        let run = &db.recent("job", 5).unwrap()[0];
        assert_eq!(run.status, RunStatus::Timeout);
        assert_eq!(run.duration_ms, Some(100));
    }

    #[test]
    fn test_recent_order_and_limit() {
        let db = RunHistory::open_in_memory().unwrap();
        for _ in 0..5 {
            let id = db.start_run("job", Utc::now(), false).unwrap();
            db.finish_run(id, &finish(RunStatus::Completed, 1)).unwrap();
        }
        db.start_run("other", Utc::now(), true).unwrap();

        let runs = db.recent("job", 3).unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs[0].run_id > runs[1].run_id);
        assert!(runs.iter().all(|r| r.job_id == "job"));
    }

    #[test]
    fn test_last_terminal_skips_pending() {
        let db = RunHistory::open_in_memory().unwrap();
        let first = db.start_run("job", Utc::now(), false).unwrap();
        db.finish_run(first, &finish(RunStatus::Error, 7)).unwrap();
        db.start_run("job", Utc::now(), false).unwrap();

        let last = db.last_terminal("job").unwrap().unwrap();
        assert_eq!(last.run_id, first);
        assert_eq!(last.status, RunStatus::Error);
        assert!(db.last_terminal("nope").unwrap().is_none());
    }

    #[test]
    fn test_prune_keeps_newest() {
        let db = RunHistory::open_in_memory().unwrap();
        for _ in 0..6 {
            db.start_run("job", Utc::now(), false).unwrap();
        }
        assert_eq!(db.prune("job", 4).unwrap(), 2);
        assert_eq!(db.recent("job", 100).unwrap().len(), 4);
    }

    #[test]
    fn test_recover_pending_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron").join("runs.db");
        {
            let db = RunHistory::open(&path).unwrap();
            db.start_run("job", Utc::now(), false).unwrap();
        }
        let db = RunHistory::open(&path).unwrap();
        assert_eq!(db.recover_pending().unwrap(), 1);
        let run = &db.recent("job", 1).unwrap()[0];
        assert_eq!(run.status, RunStatus::Timeout);
        assert!(run.error.as_deref().unwrap().contains("restarted"));
    }
}
