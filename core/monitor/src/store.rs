//! SQLite persistence for the monitor.
//!
//! One `MonitorState` per repository key, spread over four tables keyed by
//! `(owner, repo[, run_id[, job_id[, step_name]]])`. Rows are only ever
//! inserted or replaced; entities that stop showing up in polls stay in the
//! tree. `last_updated` columns are for debugging, detection never reads them.

use chrono::{DateTime, SecondsFormat, Utc};
use civiewer_protocol::{JobState, MonitorState, RepositoryKey, RunState, StepState};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DB_FILE_NAME: &str = "state.db";

pub struct StateStore {
    path: PathBuf,
    conn: Option<Connection>,
    closed: bool,
}

impl StateStore {
    pub fn open(path: PathBuf) -> Result<Self, String> {
        let mut store = Self {
            path,
            conn: None,
            closed: false,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the tree for `key`, degrading to the empty state on any storage
    /// error so the caller simply re-detects everything as new.
    pub fn load(&mut self, key: &RepositoryKey) -> MonitorState {
        match self.try_load(key) {
            Ok(state) => state,
            Err(err) => {
                warn!(error = %err, repository = %key, "Failed to load monitor state; starting empty");
                MonitorState::empty()
            }
        }
    }

    pub fn try_load(&mut self, key: &RepositoryKey) -> Result<MonitorState, String> {
        self.with_connection(|conn| {
            let last_poll: Option<String> = conn
                .query_row(
                    "SELECT last_poll_at FROM repo_state WHERE owner = ?1 AND repo = ?2",
                    params![key.owner, key.repo],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| format!("Failed to query repository watermark: {}", err))?;

            let Some(last_poll) = last_poll else {
                return Ok(MonitorState::empty());
            };
            let last_poll = parse_rfc3339(&last_poll)
                .ok_or_else(|| format!("Stored watermark is not RFC3339: {}", last_poll))?;

            let mut state = MonitorState {
                last_poll,
                known_runs: Default::default(),
            };
            load_runs(conn, key, &mut state)?;
            load_jobs(conn, key, &mut state)?;
            load_steps(conn, key, &mut state)?;

            debug!(
                repository = %key,
                runs = state.known_runs.len(),
                jobs = state.job_count(),
                "Loaded monitor state"
            );
            Ok(state)
        })
    }

    /// Upserts the watermark and every run, job and step in `state`. The batch
    /// is a single transaction: either all rows land or none do.
    pub fn save(&mut self, key: &RepositoryKey, state: &MonitorState) -> Result<(), String> {
        let now = format_rfc3339(Utc::now());
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to begin save transaction: {}", err))?;

            tx.execute(
                "INSERT INTO repo_state (owner, repo, last_poll_at, last_updated) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(owner, repo) DO UPDATE SET \
                    last_poll_at = excluded.last_poll_at, \
                    last_updated = excluded.last_updated",
                params![key.owner, key.repo, format_rfc3339(state.last_poll), now],
            )
            .map_err(|err| format!("Failed to upsert repository watermark: {}", err))?;

            for run in state.known_runs.values() {
                save_run(&tx, key, run, &now)?;
            }

            tx.commit()
                .map_err(|err| format!("Failed to commit monitor state: {}", err))?;
            Ok(())
        })
    }

    /// Removes every row stored for `key`.
    pub fn clear(&mut self, key: &RepositoryKey) -> Result<u64, String> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to begin clear transaction: {}", err))?;
            let mut removed = 0u64;
            for table in ["step_state", "job_state", "run_state", "repo_state"] {
                let sql = format!("DELETE FROM {} WHERE owner = ?1 AND repo = ?2", table);
                removed += tx
                    .execute(&sql, params![key.owner, key.repo])
                    .map_err(|err| format!("Failed to clear {}: {}", table, err))?
                    as u64;
            }
            tx.commit()
                .map_err(|err| format!("Failed to commit clear: {}", err))?;
            Ok(removed)
        })
    }

    /// Releases the connection. Later calls fail instead of reopening.
    pub fn close(&mut self) {
        self.closed = true;
        if let Some(conn) = self.conn.take() {
            if let Err((_, err)) = conn.close() {
                warn!(error = %err, path = %self.path.display(), "Failed to close state store");
            }
        }
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn init_schema(&mut self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS repo_state (
                    owner TEXT NOT NULL,
                    repo TEXT NOT NULL,
                    last_poll_at TEXT NOT NULL,
                    last_updated TEXT NOT NULL,
                    PRIMARY KEY (owner, repo)
                 );
                 CREATE TABLE IF NOT EXISTS run_state (
                    owner TEXT NOT NULL,
                    repo TEXT NOT NULL,
                    run_id INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    conclusion TEXT,
                    last_updated TEXT NOT NULL,
                    PRIMARY KEY (owner, repo, run_id)
                 );
                 CREATE TABLE IF NOT EXISTS job_state (
                    owner TEXT NOT NULL,
                    repo TEXT NOT NULL,
                    run_id INTEGER NOT NULL,
                    job_id INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    conclusion TEXT,
                    last_updated TEXT NOT NULL,
                    PRIMARY KEY (owner, repo, run_id, job_id)
                 );
                 CREATE TABLE IF NOT EXISTS step_state (
                    owner TEXT NOT NULL,
                    repo TEXT NOT NULL,
                    run_id INTEGER NOT NULL,
                    job_id INTEGER NOT NULL,
                    step_name TEXT NOT NULL,
                    status TEXT NOT NULL,
                    conclusion TEXT,
                    last_updated TEXT NOT NULL,
                    PRIMARY KEY (owner, repo, run_id, job_id, step_name)
                 );
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))
        })
    }

    fn with_connection<T>(
        &mut self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        if self.closed {
            return Err("State store is closed".to_string());
        }
        if self.conn.is_none() {
            self.conn = Some(self.open_connection()?);
        }
        match self.conn.as_mut() {
            Some(conn) => op(conn),
            None => Err("State store is closed".to_string()),
        }
    }

    fn open_connection(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs_err::create_dir_all(parent)
                    .map_err(|err| format!("Failed to create state directory: {}", err))?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}

fn save_run(
    conn: &Connection,
    key: &RepositoryKey,
    run: &RunState,
    now: &str,
) -> Result<(), String> {
    conn.prepare_cached(
        "INSERT OR REPLACE INTO run_state \
            (owner, repo, run_id, status, conclusion, last_updated) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .and_then(|mut stmt| {
        stmt.execute(params![
            key.owner,
            key.repo,
            run.run_id as i64,
            run.status,
            run.conclusion,
            now
        ])
    })
    .map_err(|err| format!("Failed to upsert run state {}: {}", run.run_id, err))?;

    for job in run.known_jobs.values() {
        save_job(conn, key, run.run_id, job, now)?;
    }
    Ok(())
}

fn save_job(
    conn: &Connection,
    key: &RepositoryKey,
    run_id: u64,
    job: &JobState,
    now: &str,
) -> Result<(), String> {
    conn.prepare_cached(
        "INSERT OR REPLACE INTO job_state \
            (owner, repo, run_id, job_id, status, conclusion, last_updated) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .and_then(|mut stmt| {
        stmt.execute(params![
            key.owner,
            key.repo,
            run_id as i64,
            job.job_id as i64,
            job.status,
            job.conclusion,
            now
        ])
    })
    .map_err(|err| format!("Failed to upsert job state {}: {}", job.job_id, err))?;

    for step in job.known_steps.values() {
        save_step(conn, key, run_id, job.job_id, step, now)?;
    }
    Ok(())
}

fn save_step(
    conn: &Connection,
    key: &RepositoryKey,
    run_id: u64,
    job_id: u64,
    step: &StepState,
    now: &str,
) -> Result<(), String> {
    conn.prepare_cached(
        "INSERT OR REPLACE INTO step_state \
            (owner, repo, run_id, job_id, step_name, status, conclusion, last_updated) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .and_then(|mut stmt| {
        stmt.execute(params![
            key.owner,
            key.repo,
            run_id as i64,
            job_id as i64,
            step.name,
            step.status,
            step.conclusion,
            now
        ])
    })
    .map_err(|err| format!("Failed to upsert step state '{}': {}", step.name, err))?;
    Ok(())
}

fn load_runs(
    conn: &Connection,
    key: &RepositoryKey,
    state: &mut MonitorState,
) -> Result<(), String> {
    let mut stmt = conn
        .prepare("SELECT run_id, status, conclusion FROM run_state WHERE owner = ?1 AND repo = ?2")
        .map_err(|err| format!("Failed to prepare runs query: {}", err))?;
    let rows = stmt
        .query_map(params![key.owner, key.repo], |row| {
            Ok(RunState {
                run_id: row.get::<_, i64>(0)? as u64,
                status: row.get(1)?,
                conclusion: row.get(2)?,
                known_jobs: Default::default(),
            })
        })
        .map_err(|err| format!("Failed to read run rows: {}", err))?;

    for row in rows {
        let run = row.map_err(|err| format!("Failed to decode run row: {}", err))?;
        state.known_runs.insert(run.run_id, run);
    }
    Ok(())
}

fn load_jobs(
    conn: &Connection,
    key: &RepositoryKey,
    state: &mut MonitorState,
) -> Result<(), String> {
    let mut stmt = conn
        .prepare(
            "SELECT run_id, job_id, status, conclusion FROM job_state \
             WHERE owner = ?1 AND repo = ?2",
        )
        .map_err(|err| format!("Failed to prepare jobs query: {}", err))?;
    let rows = stmt
        .query_map(params![key.owner, key.repo], |row| {
            Ok((
                row.get::<_, i64>(0)? as u64,
                JobState {
                    job_id: row.get::<_, i64>(1)? as u64,
                    status: row.get(2)?,
                    conclusion: row.get(3)?,
                    known_steps: Default::default(),
                },
            ))
        })
        .map_err(|err| format!("Failed to read job rows: {}", err))?;

    for row in rows {
        let (run_id, job) = row.map_err(|err| format!("Failed to decode job row: {}", err))?;
        match state.known_runs.get_mut(&run_id) {
            Some(run) => {
                run.known_jobs.insert(job.job_id, job);
            }
            None => debug!(run_id, job_id = job.job_id, "Skipping job row without run"),
        }
    }
    Ok(())
}

fn load_steps(
    conn: &Connection,
    key: &RepositoryKey,
    state: &mut MonitorState,
) -> Result<(), String> {
    let mut stmt = conn
        .prepare(
            "SELECT run_id, job_id, step_name, status, conclusion FROM step_state \
             WHERE owner = ?1 AND repo = ?2",
        )
        .map_err(|err| format!("Failed to prepare steps query: {}", err))?;
    let rows = stmt
        .query_map(params![key.owner, key.repo], |row| {
            Ok((
                row.get::<_, i64>(0)? as u64,
                row.get::<_, i64>(1)? as u64,
                StepState {
                    name: row.get(2)?,
                    status: row.get(3)?,
                    conclusion: row.get(4)?,
                },
            ))
        })
        .map_err(|err| format!("Failed to read step rows: {}", err))?;

    for row in rows {
        let (run_id, job_id, step) =
            row.map_err(|err| format!("Failed to decode step row: {}", err))?;
        let job = state
            .known_runs
            .get_mut(&run_id)
            .and_then(|run| run.known_jobs.get_mut(&job_id));
        match job {
            Some(job) => {
                job.known_steps.insert(step.name.clone(), step);
            }
            None => debug!(run_id, job_id, "Skipping step row without job"),
        }
    }
    Ok(())
}

fn format_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
