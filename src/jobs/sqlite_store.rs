//! SQLite-backed job store.
//!
//! One connection behind a mutex, WAL journal so API and worker processes can
//! share the database file, and a `PRAGMA user_version` stamp to catch scheme
//! drift on open. The claim is a single conditional `UPDATE … RETURNING`
//! committed together with its `job.started` event, so no two workers can
//! walk away with the same job.

use super::models::{
    CancelOutcome, JobErrorEntry, JobEvent, JobFilter, JobOutcome, JobPage, JobRecord, JobRequest,
    JobResultRecord, JobState,
};
use super::store::{EventScope, JobStore};
use crate::jobs::models::event_types;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql, Transaction};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id TEXT PRIMARY KEY,
    job_type TEXT NOT NULL,
    provider TEXT NOT NULL,
    collection TEXT NOT NULL,
    request_json TEXT NOT NULL,
    state TEXT NOT NULL,
    progress REAL NOT NULL DEFAULT 0,
    bytes_downloaded INTEGER NOT NULL DEFAULT 0,
    bytes_total INTEGER,
    attempt INTEGER NOT NULL DEFAULT 1,
    owner_token TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    last_heartbeat_at TEXT,
    errors_json TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_jobs_state_created ON jobs(state, created_at);
CREATE INDEX IF NOT EXISTS idx_jobs_provider ON jobs(provider);
CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at);

CREATE TABLE IF NOT EXISTS job_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    type TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    FOREIGN KEY(job_id) REFERENCES jobs(job_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_events_job_id ON job_events(job_id, id);

CREATE TABLE IF NOT EXISTS job_results (
    job_id TEXT PRIMARY KEY,
    result_json TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY(job_id) REFERENCES jobs(job_id) ON DELETE CASCADE
);
"#;

pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Open (or create) the store at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let created = !db_path.as_ref().exists();
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open job store at {:?}", db_path.as_ref()))?;
        let store = Self::init(conn)?;
        if created {
            info!("Created job store database at {:?}", db_path.as_ref());
        }
        Ok(store)
    }

    /// In-memory store, used by tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // WAL keeps readers and the single writer out of each other's way
        // when several processes share the file.
        conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
        if version == 0 {
            conn.execute_batch(SCHEMA_SQL)?;
            conn.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;
        } else if version != SCHEMA_VERSION {
            bail!(
                "Job store schema version {} is not supported (expected {})",
                version,
                SCHEMA_VERSION
            );
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn now_text() -> String {
        format_ts(Utc::now())
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<JobRecord> {
        let state_text: String = row.get("state")?;
        let request_text: String = row.get("request_json")?;
        let errors_text: String = row.get("errors_json")?;
        Ok(JobRecord {
            job_id: row.get("job_id")?,
            job_type: row.get("job_type")?,
            provider: row.get("provider")?,
            collection: row.get("collection")?,
            request: serde_json::from_str(&request_text).unwrap_or(serde_json::Value::Null),
            state: JobState::parse(&state_text).unwrap_or(JobState::Failed),
            progress: row.get("progress")?,
            bytes_downloaded: row.get::<_, i64>("bytes_downloaded")?.max(0) as u64,
            bytes_total: row.get::<_, Option<i64>>("bytes_total")?.map(|v| v.max(0) as u64),
            attempt: row.get::<_, i64>("attempt")?.max(1) as u32,
            owner_token: row.get("owner_token")?,
            created_at: parse_ts(row.get("created_at")?)?,
            updated_at: parse_ts(row.get("updated_at")?)?,
            started_at: parse_opt_ts(row.get("started_at")?)?,
            finished_at: parse_opt_ts(row.get("finished_at")?)?,
            last_heartbeat_at: parse_opt_ts(row.get("last_heartbeat_at")?)?,
            errors: serde_json::from_str::<Vec<JobErrorEntry>>(&errors_text).unwrap_or_default(),
        })
    }

    fn insert_event(
        tx: &Transaction,
        job_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
        now: &str,
    ) -> Result<i64> {
        tx.execute(
            "INSERT INTO job_events(job_id, type, timestamp, payload_json) VALUES (?1, ?2, ?3, ?4)",
            params![job_id, event_type, now, payload.to_string()],
        )?;
        Ok(tx.last_insert_rowid())
    }

    fn get_job_tx(tx: &Transaction, job_id: &str) -> Result<Option<JobRecord>> {
        let job = tx
            .query_row(
                "SELECT * FROM jobs WHERE job_id = ?1",
                [job_id],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    // Fixed-width UTC text keeps lexicographic order chronological.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_opt_ts(value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(parse_ts).transpose()
}

impl JobStore for SqliteJobStore {
    fn create_job(&self, request: &JobRequest) -> Result<String> {
        let job_id = uuid::Uuid::new_v4().simple().to_string();
        let request_json = serde_json::to_string(request)?;
        let now = Self::now_text();

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            r#"INSERT INTO jobs(
                job_id, job_type, provider, collection, request_json, state,
                progress, bytes_downloaded, bytes_total, attempt, owner_token,
                created_at, updated_at, started_at, finished_at,
                last_heartbeat_at, errors_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'queued', 0, 0, NULL, 1, NULL, ?6, ?6, NULL, NULL, NULL, '[]')"#,
            params![
                job_id,
                request.job_type(),
                request.provider().as_str(),
                request.collection(),
                request_json,
                now,
            ],
        )?;
        Self::insert_event(
            &tx,
            &job_id,
            event_types::QUEUED,
            &serde_json::json!({"state": "queued"}),
            &now,
        )?;
        tx.commit()?;
        Ok(job_id)
    }

    fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row(
                "SELECT * FROM jobs WHERE job_id = ?1",
                [job_id],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn claim_next(&self, worker_id: &str, providers: Option<&[String]>) -> Result<Option<JobRecord>> {
        let now = Self::now_text();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let mut pick_sql = String::from("SELECT job_id FROM jobs WHERE state = 'queued'");
        let mut params_vec: Vec<Box<dyn ToSql>> = vec![Box::new(worker_id.to_string()), Box::new(now.clone())];
        if let Some(allow) = providers {
            if allow.is_empty() {
                return Ok(None);
            }
            let placeholders: Vec<String> = (0..allow.len())
                .map(|i| format!("?{}", i + 3))
                .collect();
            pick_sql.push_str(&format!(" AND provider IN ({})", placeholders.join(", ")));
            for provider in allow {
                params_vec.push(Box::new(provider.clone()));
            }
        }
        pick_sql.push_str(" ORDER BY created_at ASC, job_id ASC LIMIT 1");

        let claim_sql = format!(
            r#"UPDATE jobs
               SET state = 'running', owner_token = ?1, started_at = ?2,
                   last_heartbeat_at = ?2, updated_at = ?2
               WHERE job_id = ({pick}) AND state = 'queued'
               RETURNING job_id"#,
            pick = pick_sql
        );

        let param_refs: Vec<&dyn ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
        let claimed_id: Option<String> = tx
            .query_row(&claim_sql, param_refs.as_slice(), |row| row.get(0))
            .optional()?;

        let Some(job_id) = claimed_id else {
            return Ok(None);
        };

        Self::insert_event(
            &tx,
            &job_id,
            event_types::STARTED,
            &serde_json::json!({"state": "running", "worker": worker_id}),
            &now,
        )?;
        let job = Self::get_job_tx(&tx, &job_id)?;
        tx.commit()?;
        Ok(job)
    }

    fn release_back_to_queue(&self, job_id: &str, worker_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            r#"UPDATE jobs
               SET state = 'queued', owner_token = NULL, updated_at = ?3
               WHERE job_id = ?1 AND owner_token = ?2 AND state = 'running'"#,
            params![job_id, worker_id, Self::now_text()],
        )?;
        Ok(rows > 0)
    }

    fn heartbeat(&self, job_id: &str, worker_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            r#"UPDATE jobs
               SET last_heartbeat_at = ?3, updated_at = ?3
               WHERE job_id = ?1 AND owner_token = ?2
                 AND state IN ('running', 'cancel_requested')"#,
            params![job_id, worker_id, Self::now_text()],
        )?;
        Ok(rows > 0)
    }

    fn update_progress(
        &self,
        job_id: &str,
        worker_id: &str,
        bytes_downloaded: u64,
        bytes_total: Option<u64>,
        progress: Option<f64>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            r#"UPDATE jobs
               SET bytes_downloaded = MAX(bytes_downloaded, ?3),
                   bytes_total = CASE
                       WHEN ?4 IS NULL THEN bytes_total
                       ELSE MAX(COALESCE(bytes_total, 0), ?4)
                   END,
                   progress = CASE
                       WHEN ?5 IS NULL THEN progress
                       ELSE MAX(progress, ?5)
                   END,
                   updated_at = ?6
               WHERE job_id = ?1 AND owner_token = ?2
                 AND state IN ('running', 'cancel_requested')"#,
            params![
                job_id,
                worker_id,
                bytes_downloaded as i64,
                bytes_total.map(|v| v as i64),
                progress,
                Self::now_text(),
            ],
        )?;
        Ok(rows > 0)
    }

    fn request_cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        let now = Self::now_text();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let state: Option<String> = tx
            .query_row("SELECT state FROM jobs WHERE job_id = ?1", [job_id], |row| {
                row.get(0)
            })
            .optional()?;

        let outcome = match state.as_deref().and_then(JobState::parse) {
            None => CancelOutcome::Unknown,
            Some(state) if state.is_terminal() => CancelOutcome::AlreadyTerminal,
            Some(JobState::Queued) => {
                tx.execute(
                    r#"UPDATE jobs
                       SET state = 'cancelled', finished_at = ?2, owner_token = NULL, updated_at = ?2
                       WHERE job_id = ?1 AND state = 'queued'"#,
                    params![job_id, now],
                )?;
                Self::insert_event(
                    &tx,
                    job_id,
                    event_types::CANCELLED,
                    &serde_json::json!({"status": "cancelled", "reason": "cancelled_while_queued"}),
                    &now,
                )?;
                CancelOutcome::Applied
            }
            Some(JobState::Running) => {
                tx.execute(
                    r#"UPDATE jobs SET state = 'cancel_requested', updated_at = ?2
                       WHERE job_id = ?1 AND state = 'running'"#,
                    params![job_id, now],
                )?;
                Self::insert_event(
                    &tx,
                    job_id,
                    event_types::CANCEL_REQUESTED,
                    &serde_json::json!({"state": "cancel_requested"}),
                    &now,
                )?;
                CancelOutcome::Applied
            }
            // Already flagged; keep the request idempotent.
            Some(_) => CancelOutcome::Applied,
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn finish(&self, job_id: &str, worker_id: &str, outcome: JobOutcome) -> Result<bool> {
        let now = Self::now_text();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let current = tx
            .query_row(
                "SELECT state, owner_token, errors_json FROM jobs WHERE job_id = ?1",
                [job_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((state_text, owner, errors_text)) = current else {
            return Ok(false);
        };
        let state = JobState::parse(&state_text);
        let live = matches!(state, Some(JobState::Running) | Some(JobState::CancelRequested));
        if !live || owner.as_deref() != Some(worker_id) {
            return Ok(false);
        }

        match outcome {
            JobOutcome::Succeeded(result) => {
                tx.execute(
                    r#"UPDATE jobs
                       SET state = 'succeeded', progress = 100,
                           finished_at = ?2, owner_token = NULL, updated_at = ?2
                       WHERE job_id = ?1"#,
                    params![job_id, now],
                )?;
                tx.execute(
                    r#"INSERT INTO job_results(job_id, result_json, updated_at)
                       VALUES (?1, ?2, ?3)
                       ON CONFLICT(job_id) DO UPDATE SET
                           result_json = excluded.result_json,
                           updated_at = excluded.updated_at"#,
                    params![job_id, serde_json::to_string(&result)?, now],
                )?;
                Self::insert_event(
                    &tx,
                    job_id,
                    event_types::SUCCEEDED,
                    &serde_json::json!({"status": "succeeded", "paths": result.paths}),
                    &now,
                )?;
            }
            JobOutcome::Failed(error) => {
                let mut errors: Vec<JobErrorEntry> =
                    serde_json::from_str(&errors_text).unwrap_or_default();
                errors.push(error.clone());
                tx.execute(
                    r#"UPDATE jobs
                       SET state = 'failed', finished_at = ?2, owner_token = NULL,
                           errors_json = ?3, updated_at = ?2
                       WHERE job_id = ?1"#,
                    params![job_id, now, serde_json::to_string(&errors)?],
                )?;
                Self::insert_event(
                    &tx,
                    job_id,
                    event_types::FAILED,
                    &serde_json::json!({"status": "failed", "error": error}),
                    &now,
                )?;
            }
            JobOutcome::Cancelled { reason } => {
                tx.execute(
                    r#"UPDATE jobs
                       SET state = 'cancelled', finished_at = ?2, owner_token = NULL, updated_at = ?2
                       WHERE job_id = ?1"#,
                    params![job_id, now],
                )?;
                Self::insert_event(
                    &tx,
                    job_id,
                    event_types::CANCELLED,
                    &serde_json::json!({"status": "cancelled", "reason": reason}),
                    &now,
                )?;
            }
        }

        tx.commit()?;
        Ok(true)
    }

    fn append_event(&self, job_id: &str, event_type: &str, payload: serde_json::Value) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO job_events(job_id, type, timestamp, payload_json) VALUES (?1, ?2, ?3, ?4)",
            params![job_id, event_type, Self::now_text(), payload.to_string()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn requeue_incomplete(&self, stale_before: Option<DateTime<Utc>>) -> Result<usize> {
        let now = Self::now_text();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let job_ids: Vec<String> = match stale_before {
            Some(threshold) => {
                let mut stmt = tx.prepare(
                    r#"SELECT job_id FROM jobs
                       WHERE state IN ('running', 'cancel_requested')
                         AND COALESCE(last_heartbeat_at, started_at, created_at) < ?1"#,
                )?;
                let rows = stmt
                    .query_map([format_ts(threshold)], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                rows
            }
            None => {
                let mut stmt = tx.prepare(
                    "SELECT job_id FROM jobs WHERE state IN ('running', 'cancel_requested')",
                )?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                rows
            }
        };

        for job_id in &job_ids {
            tx.execute(
                r#"UPDATE jobs
                   SET state = 'queued', owner_token = NULL,
                       attempt = attempt + 1, updated_at = ?2
                   WHERE job_id = ?1"#,
                params![job_id, now],
            )?;
            Self::insert_event(
                &tx,
                job_id,
                event_types::REQUEUED_AFTER_RESTART,
                &serde_json::json!({"reason": "stale_or_restarted_worker"}),
                &now,
            )?;
        }

        tx.commit()?;
        Ok(job_ids.len())
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(state) = filter.state {
            clauses.push("state = ?");
            params_vec.push(Box::new(state.as_str().to_string()));
        }
        if let Some(provider) = &filter.provider {
            clauses.push("provider = ?");
            params_vec.push(Box::new(provider.clone()));
        }
        if let Some(from) = filter.date_from {
            clauses.push("created_at >= ?");
            params_vec.push(Box::new(format_ts(from)));
        }
        if let Some(to) = filter.date_to {
            clauses.push("created_at <= ?");
            params_vec.push(Box::new(format_ts(to)));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let conn = self.conn.lock().unwrap();
        let param_refs: Vec<&dyn ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM jobs {}", where_sql),
            param_refs.as_slice(),
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            r#"SELECT * FROM jobs {}
               ORDER BY created_at DESC, job_id ASC
               LIMIT {} OFFSET {}"#,
            where_sql,
            filter.page_size(),
            filter.offset(),
        ))?;
        let items = stmt
            .query_map(param_refs.as_slice(), Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(JobPage {
            items,
            total: total.max(0) as usize,
        })
    }

    fn get_result(&self, job_id: &str) -> Result<Option<JobResultRecord>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT result_json FROM job_results WHERE job_id = ?1",
                [job_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(text) => Ok(Some(
                serde_json::from_str(&text).context("Corrupt job result payload")?,
            )),
            None => Ok(None),
        }
    }

    fn list_events(&self, scope: &EventScope, since: Option<i64>, limit: usize) -> Result<Vec<JobEvent>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();

        if let EventScope::Job(job_id) = scope {
            clauses.push("job_id = ?");
            params_vec.push(Box::new(job_id.clone()));
        }
        if let Some(cursor) = since {
            clauses.push("id > ?");
            params_vec.push(Box::new(cursor));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let conn = self.conn.lock().unwrap();
        let param_refs: Vec<&dyn ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, job_id, type, timestamp, payload_json FROM job_events {} ORDER BY id ASC LIMIT {}",
            where_sql,
            limit.clamp(1, 1000),
        ))?;
        let events = stmt
            .query_map(param_refs.as_slice(), |row| {
                let payload_text: String = row.get("payload_json")?;
                Ok(JobEvent {
                    id: row.get("id")?,
                    job_id: row.get("job_id")?,
                    event_type: row.get("type")?,
                    timestamp: parse_ts(row.get("timestamp")?)?,
                    payload: serde_json::from_str(&payload_text).unwrap_or(serde_json::Value::Null),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }
}
