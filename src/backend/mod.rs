/// Durable Backend
///
/// SQLite (via sqlx) is the single shared mutable resource of the engine:
/// job queues, flow bookkeeping, prerequisite results, schedule rows and the
/// event log all live here. Components talk to each other only through this
/// backend, so more worker processes can be pointed at the same database
/// file: jobs are leased, schedule timers resync from their rows and events
/// are tailed from the shared log.

// Queue operations: atomic flow submission, claiming, retry, status queries
pub mod queue;

// Durable schedule rows for the cron scheduler
pub mod schedules;

// Append-only log behind the shared event transport
pub mod event_log;

// Record types shared by the backend and its callers
pub mod types;

pub use event_log::LoggedEvent;
pub use queue::{StalledRecovery, DEFAULT_JOB_LEASE, STALLED_REASON};
pub use types::{
    ChildResult, FlowHandle, FlowStatus, JobCounts, JobRecord, JobState, ScheduleEntry,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::{path::Path, str::FromStr, time::Duration};

/// SQLite-backed queue, flow and schedule store
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Connect to a database URL, creating the file (and its directory) if missing
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        if let Some(path) = sqlite_file_path(url) {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create database directory '{}'", parent.display())
                    })?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid database URL: {}", url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        tracing::info!("🗄️ Connecting durable backend: {}", url);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database: {}", url))?;

        let backend = Self { pool };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Private in-memory database, for tests and one-shot tooling
    ///
    /// Pinned to a single connection that never expires: an in-memory SQLite
    /// database lives exactly as long as its connection.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let backend = Self { pool };
        backend.init_schema().await?;
        Ok(backend)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create every table and index; safe to call multiple times
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS flows (
                id TEXT PRIMARY KEY,
                template TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                root_job_id TEXT NOT NULL,
                queues JSON NOT NULL,
                created_at INTEGER NOT NULL,
                finished_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                flow_id TEXT NOT NULL,
                parent_id TEXT,
                name TEXT NOT NULL,
                queue TEXT NOT NULL,
                payload JSON NOT NULL,
                opts JSON NOT NULL,
                state TEXT NOT NULL,
                attempts_made INTEGER NOT NULL DEFAULT 0,
                run_at INTEGER NOT NULL,
                processed_at INTEGER,
                lease_until INTEGER,
                return_value JSON,
                failed_reason TEXT,
                created_at INTEGER NOT NULL,
                finished_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_queue_state ON jobs(queue, state, run_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_flow ON jobs(flow_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_parent ON jobs(parent_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS child_results (
                parent_id TEXT NOT NULL,
                child_id TEXT NOT NULL,
                name TEXT NOT NULL,
                state TEXT NOT NULL,
                value JSON,
                error TEXT,
                PRIMARY KEY (parent_id, child_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                cron_expression TEXT NOT NULL,
                timezone TEXT NOT NULL,
                flow_name TEXT NOT NULL,
                flow_input JSON NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                last_fired_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                channel TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_channel ON events(channel, seq)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// File path of a sqlite URL, or None for in-memory databases
fn sqlite_file_path(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() || path == ":memory:" {
        None
    } else {
        Some(path)
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_file_path() {
        assert_eq!(sqlite_file_path("sqlite://data/x.db"), Some("data/x.db"));
        assert_eq!(sqlite_file_path("sqlite:x.db?mode=rwc"), Some("x.db"));
        assert_eq!(sqlite_file_path("sqlite::memory:"), None);
        assert_eq!(sqlite_file_path("postgres://x"), None);
    }

    #[tokio::test]
    async fn test_connect_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("queue.db");
        let url = format!("sqlite://{}", path.display());
        let backend = SqliteBackend::connect(&url, 2).await.unwrap();
        assert!(path.exists());
        // schema init is idempotent
        backend.init_schema().await.unwrap();
    }
}
