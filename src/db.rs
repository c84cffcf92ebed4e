use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::auth::Session;

/// Thread-safe database handle. rusqlite::Connection is !Sync,
/// so we wrap Db in a Mutex for cross-thread access.
pub type SharedDb = Arc<Mutex<Db>>;

// ---------------------------------------------------------------------------
// Row models
// ---------------------------------------------------------------------------

/// Last observed snapshot of a generation job this client is tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRow {
    pub id: String,
    pub project_id: Option<String>,
    pub status: String,               // "queued" | "generating" | ... | "completed" | "failed"
    pub video_status: Option<String>, // "processing" | "completed" | "failed"
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRow {
    pub tx_ref: String,
    pub package_id: String,
    pub method: String, // "mobile_money" | "card"
    pub status: String, // "pending" | "successful" | "failed"
    pub message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRow {
    pub job_id: String,
    pub channel: String, // "email" | "push"
    pub destination: String,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Database wrapper
// ---------------------------------------------------------------------------

pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open SQLite database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let db = Db { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Private in-memory database, used by tests and one-shot runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        let db = Db { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn into_shared(self) -> SharedDb {
        Arc::new(Mutex::new(self))
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS session (
                id            INTEGER PRIMARY KEY CHECK (id = 1),
                body          TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id           TEXT PRIMARY KEY,
                project_id   TEXT,
                status       TEXT NOT NULL,
                video_status TEXT,
                error        TEXT,
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);

            CREATE TABLE IF NOT EXISTS payments (
                tx_ref      TEXT PRIMARY KEY,
                package_id  TEXT NOT NULL,
                method      TEXT NOT NULL,
                status      TEXT NOT NULL DEFAULT 'pending',
                message     TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS subscriptions (
                job_id      TEXT NOT NULL,
                channel     TEXT NOT NULL,
                destination TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                PRIMARY KEY (job_id, channel)
            );

            CREATE TABLE IF NOT EXISTS drafts (
                id          TEXT PRIMARY KEY,
                body        TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------------

    pub fn save_session(&self, session: &Session) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO session (id, body, updated_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET body=excluded.body, updated_at=excluded.updated_at",
            params![serde_json::to_string(session)?, now],
        )?;
        Ok(())
    }

    pub fn load_session(&self) -> Result<Option<Session>> {
        let body: Option<String> = self
            .conn
            .query_row("SELECT body FROM session WHERE id=1", [], |r| r.get(0))
            .optional()?;
        match body {
            Some(b) => Ok(Some(
                serde_json::from_str(&b).context("stored session is not valid JSON")?,
            )),
            None => Ok(None),
        }
    }

    pub fn clear_session(&self) -> Result<()> {
        self.conn.execute("DELETE FROM session", [])?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Insert or refresh a job snapshot. A stored `project_id` is kept when the
    /// new snapshot omits it.
    pub fn upsert_job(
        &self,
        id: &str,
        project_id: Option<&str>,
        status: &str,
        video_status: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO jobs (id, project_id, status, video_status, error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(id) DO UPDATE SET
                project_id=COALESCE(excluded.project_id, jobs.project_id),
                status=excluded.status,
                video_status=excluded.video_status,
                error=excluded.error,
                updated_at=excluded.updated_at",
            params![id, project_id, status, video_status, error, now],
        )?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<JobRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, status, video_status, error, created_at, updated_at FROM jobs WHERE id=?1",
        )?;
        let mut rows = stmt.query_map(params![id], row_to_job)?;
        Ok(rows.next().transpose()?)
    }

    /// Jobs that have not reached a terminal status, oldest first.
    pub fn get_active_jobs(&self) -> Result<Vec<JobRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, status, video_status, error, created_at, updated_at FROM jobs
             WHERE status NOT IN ('completed', 'failed') OR video_status='processing'
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_job)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to collect active jobs")
    }

    // -----------------------------------------------------------------------
    // Payments
    // -----------------------------------------------------------------------

    pub fn insert_payment(&self, tx_ref: &str, package_id: &str, method: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT OR IGNORE INTO payments (tx_ref, package_id, method, status, message, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', NULL, ?4, ?4)",
            params![tx_ref, package_id, method, now],
        )?;
        Ok(())
    }

    pub fn update_payment(&self, tx_ref: &str, status: &str, message: Option<&str>) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE payments SET status=?2, message=?3, updated_at=?4 WHERE tx_ref=?1",
            params![tx_ref, status, message, now],
        )?;
        Ok(())
    }

    pub fn get_payment(&self, tx_ref: &str) -> Result<Option<PaymentRow>> {
        self.conn
            .query_row(
                "SELECT tx_ref, package_id, method, status, message, created_at, updated_at
                 FROM payments WHERE tx_ref=?1",
                params![tx_ref],
                |row| {
                    Ok(PaymentRow {
                        tx_ref: row.get(0)?,
                        package_id: row.get(1)?,
                        method: row.get(2)?,
                        status: row.get(3)?,
                        message: row.get(4)?,
                        created_at: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("failed to read payment")
    }

    // -----------------------------------------------------------------------
    // Notification subscriptions
    // -----------------------------------------------------------------------

    /// Record a confirmed subscription. One row per (job, channel); a new
    /// destination replaces the old one, mirroring the backend upsert.
    pub fn upsert_subscription(&self, job_id: &str, channel: &str, destination: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO subscriptions (job_id, channel, destination, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(job_id, channel) DO UPDATE SET destination=excluded.destination",
            params![job_id, channel, destination, now],
        )?;
        Ok(())
    }

    pub fn get_subscriptions(&self, job_id: &str) -> Result<Vec<SubscriptionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT job_id, channel, destination, created_at FROM subscriptions
             WHERE job_id=?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![job_id], |row| {
            Ok(SubscriptionRow {
                job_id: row.get(0)?,
                channel: row.get(1)?,
                destination: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to collect subscriptions")
    }

    // -----------------------------------------------------------------------
    // Drafts
    // -----------------------------------------------------------------------

    pub fn save_draft(&self, id: &str, body: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO drafts (id, body, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET body=excluded.body, updated_at=excluded.updated_at",
            params![id, body, now],
        )?;
        Ok(())
    }

    pub fn load_draft(&self, id: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT body FROM drafts WHERE id=?1", params![id], |r| r.get(0))
            .optional()
            .context("failed to read draft")
    }

    pub fn delete_draft(&self, id: &str) -> Result<()> {
        self.conn.execute("DELETE FROM drafts WHERE id=?1", params![id])?;
        Ok(())
    }
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        status: row.get(2)?,
        video_status: row.get(3)?,
        error: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}
