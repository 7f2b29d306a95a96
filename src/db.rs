//! SQLite connection and schema for the shared job and cache tables
//!
//! Every worker opens its own [`Database`] against the same file. All
//! cross-worker coordination happens through single-statement conditional
//! updates; there is no in-process locking between connections.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

const SCHEMA_VERSION: i32 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// One connection to the shared store
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create the database file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // WAL lets readers proceed while one writer holds the lock
        conn.pragma_update(None, "journal_mode", "WAL")
            .with_context(|| "Failed to enable WAL mode")?;

        Self::from_connection(conn)
    }

    /// Private in-memory database (single connection only)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .with_context(|| "Failed to set busy timeout")?;

        let mut db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn init_schema(&mut self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
                [],
            )
            .with_context(|| "Failed to create schema_version table")?;

        let version: Option<i32> = self
            .conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .with_context(|| "Failed to read schema version")?;
        let version = version.unwrap_or(0);

        if version < SCHEMA_VERSION {
            self.migrate_schema(version)?;
        } else if version > SCHEMA_VERSION {
            warn!(
                found = version,
                supported = SCHEMA_VERSION,
                "Database schema is newer than this build"
            );
        }

        Ok(())
    }

    fn migrate_schema(&mut self, from_version: i32) -> Result<()> {
        // IMMEDIATE so two workers starting together do not both migrate
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .with_context(|| "Failed to start migration transaction")?;

        // Re-read under the write lock; another connection may have migrated already
        let current: Option<i32> =
            tx.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
        if current.unwrap_or(0) > from_version {
            return Ok(());
        }

        if from_version == 0 {
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tenant_id TEXT NOT NULL,
                    payload_ref TEXT NOT NULL,
                    enqueued_at INTEGER NOT NULL,
                    not_before INTEGER NOT NULL,
                    locked_by TEXT,
                    locked_at INTEGER,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_jobs_dispatch
                    ON jobs(tenant_id, enqueued_at, id);
                CREATE INDEX IF NOT EXISTS idx_jobs_locked ON jobs(locked_at);

                CREATE TABLE IF NOT EXISTS dead_jobs (
                    id INTEGER PRIMARY KEY,
                    tenant_id TEXT NOT NULL,
                    payload_ref TEXT NOT NULL,
                    enqueued_at INTEGER NOT NULL,
                    attempts INTEGER NOT NULL,
                    last_error TEXT,
                    died_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS scan_cache (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    full_hash TEXT NOT NULL,
                    attachment_hash TEXT,
                    template_hash TEXT,
                    payload_size INTEGER NOT NULL,
                    score REAL NOT NULL,
                    threat INTEGER NOT NULL,
                    details TEXT NOT NULL,
                    message TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    last_used_at INTEGER NOT NULL,
                    use_count INTEGER NOT NULL DEFAULT 0,
                    UNIQUE(full_hash, payload_size)
                );
                CREATE INDEX IF NOT EXISTS idx_cache_attachment ON scan_cache(attachment_hash);
                CREATE INDEX IF NOT EXISTS idx_cache_template ON scan_cache(template_hash);
                CREATE INDEX IF NOT EXISTS idx_cache_last_used ON scan_cache(last_used_at);
                CREATE INDEX IF NOT EXISTS idx_cache_created ON scan_cache(created_at);",
            )
            .with_context(|| "Failed to create initial schema")?;
        }

        tx.execute("DELETE FROM schema_version", [])?;
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [SCHEMA_VERSION],
        )
        .with_context(|| "Failed to update schema version")?;

        tx.commit()
            .with_context(|| "Failed to commit migration transaction")?;

        debug!(from = from_version, to = SCHEMA_VERSION, "Migrated database schema");
        Ok(())
    }
}

/// Timestamps are stored as milliseconds since the Unix epoch
pub(crate) fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// `time - duration`, saturating instead of overflowing for huge windows
pub(crate) fn millis_before(time: DateTime<Utc>, duration: Duration) -> i64 {
    let span = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
    to_millis(time).saturating_sub(span)
}
