//! Durable ledger of dispatch attempts and artifact approvals.
//!
//! One `StoryJob` row is appended per dispatch attempt; the retry guard in
//! the pipeline reads the durable failure count from here, never an
//! in-memory counter, so double dispatch across workers stays bounded.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::{Approval, JobStatus, StoryJob};

/// Async-safe handle to the ledger.
///
/// Wraps `Ledger` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Ledger>>,
}

impl DbHandle {
    pub fn new(db: Ledger) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the ledger on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Ledger) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("ledger lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("ledger task panicked")?
    }
}

pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS story_jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    issue_number INTEGER NOT NULL,
                    issue_title TEXT NOT NULL DEFAULT '',
                    branch_name TEXT NOT NULL DEFAULT '',
                    pr_number INTEGER,
                    status TEXT NOT NULL DEFAULT 'pending',
                    files_changed TEXT NOT NULL DEFAULT '',
                    passes_used INTEGER NOT NULL DEFAULT 0,
                    error_message TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS approvals (
                    repo TEXT NOT NULL,
                    file_path TEXT NOT NULL,
                    approved INTEGER NOT NULL DEFAULT 0,
                    approved_by TEXT NOT NULL DEFAULT '',
                    approved_at TEXT,
                    PRIMARY KEY (repo, file_path)
                );

                CREATE INDEX IF NOT EXISTS idx_story_jobs_issue ON story_jobs(issue_number);
                CREATE INDEX IF NOT EXISTS idx_story_jobs_status ON story_jobs(status);
                ",
            )
            .context("Failed to create ledger tables")?;
        Ok(())
    }

    // ── Story jobs ────────────────────────────────────────────────────

    /// Append a new running job row for a dispatch attempt.
    pub fn create_job(&self, issue_number: u64) -> Result<StoryJob> {
        self.conn
            .execute(
                "INSERT INTO story_jobs (issue_number, status, created_at) VALUES (?1, ?2, ?3)",
                params![
                    issue_number as i64,
                    JobStatus::Running.as_str(),
                    Utc::now().to_rfc3339()
                ],
            )
            .context("Failed to insert story job")?;
        let id = self.conn.last_insert_rowid();
        self.job(id)?.context("Job not found after insert")
    }

    pub fn job(&self, id: i64) -> Result<Option<StoryJob>> {
        self.conn
            .query_row(
                "SELECT id, issue_number, issue_title, branch_name, pr_number, status,
                        files_changed, passes_used, error_message, created_at, completed_at
                 FROM story_jobs WHERE id = ?1",
                params![id],
                row_to_job,
            )
            .optional()
            .context("Failed to query story job")
    }

    pub fn jobs_for_issue(&self, issue_number: u64) -> Result<Vec<StoryJob>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, issue_number, issue_title, branch_name, pr_number, status,
                        files_changed, passes_used, error_message, created_at, completed_at
                 FROM story_jobs WHERE issue_number = ?1 ORDER BY id",
            )
            .context("Failed to prepare jobs_for_issue")?;
        let rows = stmt
            .query_map(params![issue_number as i64], row_to_job)
            .context("Failed to query jobs for issue")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?);
        }
        Ok(jobs)
    }

    pub fn set_job_title(&self, id: i64, title: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE story_jobs SET issue_title = ?2 WHERE id = ?1",
                params![id, title],
            )
            .context("Failed to update job title")?;
        Ok(())
    }

    /// Seal a job as succeeded.
    pub fn seal_success(
        &self,
        id: i64,
        pr_number: u64,
        branch_name: &str,
        files_changed: &[String],
        passes_used: u32,
    ) -> Result<StoryJob> {
        self.conn
            .execute(
                "UPDATE story_jobs
                 SET status = ?2, pr_number = ?3, branch_name = ?4, files_changed = ?5,
                     passes_used = ?6, completed_at = ?7
                 WHERE id = ?1",
                params![
                    id,
                    JobStatus::Success.as_str(),
                    pr_number as i64,
                    branch_name,
                    files_changed.join(","),
                    passes_used,
                    Utc::now().to_rfc3339()
                ],
            )
            .context("Failed to seal job success")?;
        self.job(id)?.context("Job not found after update")
    }

    /// Seal a job as failed. The row stays forever; retry accounting counts
    /// these.
    pub fn seal_failure(
        &self,
        id: i64,
        error_message: &str,
        files_changed: &[String],
        passes_used: u32,
    ) -> Result<StoryJob> {
        self.conn
            .execute(
                "UPDATE story_jobs
                 SET status = ?2, error_message = ?3, files_changed = ?4, passes_used = ?5,
                     completed_at = ?6
                 WHERE id = ?1",
                params![
                    id,
                    JobStatus::Failed.as_str(),
                    error_message,
                    files_changed.join(","),
                    passes_used,
                    Utc::now().to_rfc3339()
                ],
            )
            .context("Failed to seal job failure")?;
        self.job(id)?.context("Job not found after update")
    }

    /// Number of failed attempts recorded for an issue. The pipeline's entry
    /// guard compares this against the retry limit.
    pub fn count_failed(&self, issue_number: u64) -> Result<u32> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM story_jobs WHERE issue_number = ?1 AND status = ?2",
                params![issue_number as i64, JobStatus::Failed.as_str()],
                |row| row.get(0),
            )
            .context("Failed to count failed jobs")?;
        Ok(count as u32)
    }

    /// The most recent failure messages for an issue, oldest first.
    pub fn recent_failure_messages(&self, issue_number: u64, limit: u32) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT error_message FROM (
                     SELECT id, error_message FROM story_jobs
                     WHERE issue_number = ?1 AND status = ?2 AND error_message != ''
                     ORDER BY id DESC LIMIT ?3
                 ) ORDER BY id",
            )
            .context("Failed to prepare recent_failure_messages")?;
        let rows = stmt
            .query_map(
                params![issue_number as i64, JobStatus::Failed.as_str(), limit],
                |row| row.get::<_, String>(0),
            )
            .context("Failed to query failure messages")?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.context("Failed to read message row")?);
        }
        Ok(messages)
    }

    /// Convert stale `failed` rows to `cancelled` so the retry counter starts
    /// fresh for a new service session. Returns the number of rows touched.
    pub fn cancel_stale_failures(&self) -> Result<usize> {
        let changed = self
            .conn
            .execute(
                "UPDATE story_jobs SET status = ?1 WHERE status = ?2",
                params![JobStatus::Cancelled.as_str(), JobStatus::Failed.as_str()],
            )
            .context("Failed to cancel stale failures")?;
        Ok(changed)
    }

    // ── Artifact approvals ────────────────────────────────────────────

    pub fn approval(&self, repo: &str, file_path: &str) -> Result<Option<Approval>> {
        self.conn
            .query_row(
                "SELECT repo, file_path, approved, approved_by, approved_at
                 FROM approvals WHERE repo = ?1 AND file_path = ?2",
                params![repo, file_path],
                |row| {
                    Ok(Approval {
                        repo: row.get(0)?,
                        file_path: row.get(1)?,
                        approved: row.get::<_, i64>(2)? != 0,
                        approved_by: row.get(3)?,
                        approved_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .context("Failed to query approval")
    }

    /// Record a human decision about a generated artifact. An existing row is
    /// only upgraded (denied → approved), never downgraded.
    pub fn record_approval(
        &self,
        repo: &str,
        file_path: &str,
        approved: bool,
        approved_by: &str,
    ) -> Result<()> {
        let approved_at = approved.then(|| Utc::now().to_rfc3339());
        self.conn
            .execute(
                "INSERT INTO approvals (repo, file_path, approved, approved_by, approved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(repo, file_path) DO UPDATE SET
                     approved = MAX(approvals.approved, excluded.approved),
                     approved_by = excluded.approved_by,
                     approved_at = COALESCE(approvals.approved_at, excluded.approved_at)",
                params![repo, file_path, approved as i64, approved_by, approved_at],
            )
            .context("Failed to record approval")?;
        Ok(())
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoryJob> {
    let status_raw: String = row.get(5)?;
    Ok(StoryJob {
        id: row.get(0)?,
        issue_number: row.get::<_, i64>(1)? as u64,
        issue_title: row.get(2)?,
        branch_name: row.get(3)?,
        pr_number: row.get::<_, Option<i64>>(4)?.map(|n| n as u64),
        status: JobStatus::from_str(&status_raw).unwrap_or(JobStatus::Failed),
        files_changed: row.get(6)?,
        passes_used: row.get::<_, i64>(7)? as u32,
        error_message: row.get(8)?,
        created_at: row.get(9)?,
        completed_at: row.get(10)?,
    })
}
