//! SQLite operations for scan result rows
//!
//! Each method is a single statement; rows are shared by all workers and
//! never need a cross-row transaction.

use crate::content::ContentHashes;
use crate::db::{from_millis, to_millis, Database};
use crate::error::StoreError;
use crate::scan_cache::outcome::{ScanDetail, ScanOutcome};
use crate::scan_cache::stats::CacheStats;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const ENTRY_COLUMNS: &str = "id, full_hash, attachment_hash, template_hash, payload_size,
    score, threat, details, message, created_at, last_used_at, use_count";

/// A stored scan result
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub id: i64,
    pub full_hash: String,
    pub attachment_hash: Option<String>,
    pub template_hash: Option<String>,
    pub payload_size: u64,
    pub outcome: ScanOutcome,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub use_count: u64,
}

pub struct ScanResultStore<'db> {
    db: &'db Database,
}

impl<'db> ScanResultStore<'db> {
    pub fn new(db: &'db Database) -> Self {
        Self { db }
    }

    /// Entry for exactly this content and size, created after `fresh_after` (ms)
    pub fn find_by_full(
        &self,
        full_hash: &str,
        payload_size: u64,
        fresh_after: i64,
    ) -> Result<Option<CacheEntry>, StoreError> {
        let row = self
            .db
            .conn()
            .prepare_cached(&format!(
                "SELECT {ENTRY_COLUMNS} FROM scan_cache
                 WHERE full_hash = ?1 AND payload_size = ?2 AND created_at > ?3"
            ))?
            .query_row(
                params![full_hash, size_to_sql(payload_size), fresh_after],
                entry_from_row,
            )
            .optional()?;
        row.transpose().map_err(StoreError::from)
    }

    pub fn find_by_attachment(
        &self,
        attachment_hash: &str,
        fresh_after: i64,
    ) -> Result<Option<CacheEntry>, StoreError> {
        self.find_by_secondary("attachment_hash", attachment_hash, fresh_after)
    }

    pub fn find_by_template(
        &self,
        template_hash: &str,
        fresh_after: i64,
    ) -> Result<Option<CacheEntry>, StoreError> {
        self.find_by_secondary("template_hash", template_hash, fresh_after)
    }

    /// Most recently used fresh entry sharing a secondary key
    fn find_by_secondary(
        &self,
        column: &'static str,
        hash: &str,
        fresh_after: i64,
    ) -> Result<Option<CacheEntry>, StoreError> {
        let row = self
            .db
            .conn()
            .prepare_cached(&format!(
                "SELECT {ENTRY_COLUMNS} FROM scan_cache
                 WHERE {column} = ?1 AND created_at > ?2
                 ORDER BY last_used_at DESC, id DESC LIMIT 1"
            ))?
            .query_row(params![hash, fresh_after], entry_from_row)
            .optional()?;
        row.transpose().map_err(StoreError::from)
    }

    /// Hit bookkeeping: the only mutation a present entry receives
    pub fn record_use(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.db.conn().execute(
            "UPDATE scan_cache SET use_count = use_count + 1, last_used_at = ?2 WHERE id = ?1",
            params![id, to_millis(now)],
        )?;
        Ok(())
    }

    /// Insert a result; a concurrent insert of the same (hash, size) is overwritten
    pub fn upsert(
        &self,
        hashes: &ContentHashes,
        payload_size: u64,
        outcome: &ScanOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let details = serde_json::to_string(&outcome.details)?;
        let now = to_millis(now);

        self.db.conn().execute(
            "INSERT INTO scan_cache (full_hash, attachment_hash, template_hash, payload_size,
                                     score, threat, details, message, created_at, last_used_at, use_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, 0)
             ON CONFLICT(full_hash, payload_size) DO UPDATE SET
                attachment_hash = excluded.attachment_hash,
                template_hash = excluded.template_hash,
                score = excluded.score,
                threat = excluded.threat,
                details = excluded.details,
                message = excluded.message,
                created_at = excluded.created_at",
            params![
                hashes.full,
                hashes.attachment,
                hashes.template,
                size_to_sql(payload_size),
                outcome.score,
                outcome.threat,
                details,
                outcome.message,
                now
            ],
        )?;
        Ok(())
    }

    pub fn delete_all(&self) -> Result<usize, StoreError> {
        Ok(self.db.conn().execute("DELETE FROM scan_cache", [])?)
    }

    /// Delete entries created at or before `cutoff` (ms)
    pub fn delete_created_up_to(&self, cutoff: i64) -> Result<usize, StoreError> {
        Ok(self
            .db
            .conn()
            .execute("DELETE FROM scan_cache WHERE created_at <= ?1", [cutoff])?)
    }

    /// Delete the `count` least recently used entries
    pub fn evict_lru(&self, count: u64) -> Result<usize, StoreError> {
        Ok(self.db.conn().execute(
            "DELETE FROM scan_cache WHERE id IN (
                SELECT id FROM scan_cache ORDER BY last_used_at ASC, id ASC LIMIT ?1
             )",
            [size_to_sql(count)],
        )?)
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .db
            .conn()
            .query_row("SELECT COUNT(*) FROM scan_cache", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub fn stats(&self) -> Result<CacheStats, StoreError> {
        let stats = self.db.conn().query_row(
            "SELECT COUNT(*), COALESCE(SUM(use_count), 0), MIN(created_at), MAX(created_at)
             FROM scan_cache",
            [],
            |row| {
                Ok(CacheStats {
                    entries: row.get::<_, i64>(0)?.max(0) as u64,
                    total_uses: row.get::<_, i64>(1)?.max(0) as u64,
                    oldest_entry: row.get::<_, Option<i64>>(2)?.map(from_millis),
                    newest_entry: row.get::<_, Option<i64>>(3)?.map(from_millis),
                })
            },
        )?;
        Ok(stats)
    }
}

/// Sizes above i64::MAX are capped rather than wrapped
fn size_to_sql(size: u64) -> i64 {
    if size > i64::MAX as u64 {
        i64::MAX
    } else {
        size as i64
    }
}

/// Outer error is SQL, inner is a details column that no longer deserializes
fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<Result<CacheEntry, serde_json::Error>> {
    let details_json: String = row.get(7)?;
    let details: Vec<ScanDetail> = match serde_json::from_str(&details_json) {
        Ok(details) => details,
        Err(e) => return Ok(Err(e)),
    };

    Ok(Ok(CacheEntry {
        id: row.get(0)?,
        full_hash: row.get(1)?,
        attachment_hash: row.get(2)?,
        template_hash: row.get(3)?,
        payload_size: row.get::<_, i64>(4)?.max(0) as u64,
        outcome: ScanOutcome {
            score: row.get(5)?,
            threat: row.get(6)?,
            details,
            message: row.get(8)?,
        },
        created_at: from_millis(row.get(9)?),
        last_used_at: from_millis(row.get(10)?),
        use_count: row.get::<_, i64>(11)?.max(0) as u64,
    }))
}
