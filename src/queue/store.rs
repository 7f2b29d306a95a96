//! Job table operations outside of dispatch
//!
//! Every mutation that touches a locked job is conditional on the lock owner,
//! so a worker whose lock was reclaimed cannot complete or requeue a job that
//! another worker now holds.

use crate::config::QueueConfig;
use crate::db::{from_millis, millis_before, to_millis, Database};
use crate::error::StoreError;
use crate::queue::job::{JobHandle, JobId, NewJob, QueuedJob};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on a single retry delay
const MAX_BACKOFF: Duration = Duration::from_secs(6 * 60 * 60);

/// What happened to a failed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back in the queue, eligible again at `not_before`
    Requeued { not_before: DateTime<Utc> },
    /// Out of attempts; moved to the dead job table
    Dead,
    /// The lock no longer belonged to this worker; nothing was changed
    LockLost,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    /// Unlocked and eligible now
    pub ready: u64,
    /// Held by a live (non-stale) lock
    pub locked: u64,
    /// Waiting for a retry time in the future
    pub delayed: u64,
    pub dead: u64,
}

pub struct JobQueue<'db> {
    db: &'db Database,
    max_attempts: u32,
    retry_base: Duration,
    stale_window: Duration,
}

impl<'db> JobQueue<'db> {
    pub fn new(db: &'db Database, config: &QueueConfig) -> Self {
        Self {
            db,
            max_attempts: config.max_attempts,
            retry_base: config.retry_base(),
            stale_window: config.lock_stale_window(),
        }
    }

    /// Insert a job; returns its id
    pub fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError> {
        let now = Utc::now();
        let not_before = job.not_before.unwrap_or(now);

        self.db.conn().execute(
            "INSERT INTO jobs (tenant_id, payload_ref, enqueued_at, not_before)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                job.tenant_id,
                job.payload_ref,
                to_millis(now),
                to_millis(not_before)
            ],
        )?;

        Ok(self.db.conn().last_insert_rowid())
    }

    pub fn get(&self, id: JobId) -> Result<Option<QueuedJob>, StoreError> {
        let job = self
            .db
            .conn()
            .query_row(
                "SELECT id, tenant_id, payload_ref, enqueued_at, not_before,
                        locked_by, locked_at, attempts, last_error
                 FROM jobs WHERE id = ?1",
                [id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Remove a successfully processed job
    ///
    /// Returns false if the lock was lost in the meantime.
    pub fn complete(&self, handle: &JobHandle) -> Result<bool, StoreError> {
        let deleted = self.db.conn().execute(
            "DELETE FROM jobs WHERE id = ?1 AND locked_by = ?2",
            params![handle.id, handle.worker_id],
        )?;

        if deleted == 0 {
            warn!(
                job_id = handle.id,
                worker = %handle.worker_id,
                "Job lock lost before completion"
            );
        }
        Ok(deleted == 1)
    }

    /// Release a failed job back to the queue with backoff, or dead-letter it
    pub fn fail(&self, handle: &JobHandle, error: &str) -> Result<FailOutcome, StoreError> {
        let attempts = handle.attempts.saturating_add(1);
        let now = Utc::now();

        if attempts >= self.max_attempts {
            return self.bury(handle, attempts, error, now);
        }

        let delay = self.backoff(attempts);
        let not_before = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(6));

        let updated = self.db.conn().execute(
            "UPDATE jobs
             SET locked_by = NULL, locked_at = NULL, attempts = ?3,
                 not_before = ?4, last_error = ?5
             WHERE id = ?1 AND locked_by = ?2",
            params![
                handle.id,
                handle.worker_id,
                attempts,
                to_millis(not_before),
                error
            ],
        )?;

        if updated == 0 {
            warn!(job_id = handle.id, "Job lock lost before requeue");
            return Ok(FailOutcome::LockLost);
        }

        debug!(
            job_id = handle.id,
            attempts,
            delay_secs = delay.as_secs(),
            "Requeued failed job"
        );
        Ok(FailOutcome::Requeued { not_before })
    }

    fn bury(
        &self,
        handle: &JobHandle,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreError> {
        let tx = self.db.conn().unchecked_transaction()?;

        let copied = tx.execute(
            "INSERT INTO dead_jobs (id, tenant_id, payload_ref, enqueued_at, attempts, last_error, died_at)
             SELECT id, tenant_id, payload_ref, enqueued_at, ?3, ?4, ?5
             FROM jobs WHERE id = ?1 AND locked_by = ?2",
            params![handle.id, handle.worker_id, attempts, error, to_millis(now)],
        )?;
        if copied == 0 {
            warn!(job_id = handle.id, "Job lock lost before dead-lettering");
            return Ok(FailOutcome::LockLost);
        }

        tx.execute(
            "DELETE FROM jobs WHERE id = ?1 AND locked_by = ?2",
            params![handle.id, handle.worker_id],
        )?;
        tx.commit()?;

        warn!(
            job_id = handle.id,
            tenant = %handle.tenant_id,
            attempts,
            error,
            "Job exhausted its attempts and was dead-lettered"
        );
        Ok(FailOutcome::Dead)
    }

    /// Clear locks older than the staleness window
    ///
    /// Dispatch already treats such locks as free; this makes the recovery
    /// explicit and countable.
    pub fn reclaim_stale(&self) -> Result<usize, StoreError> {
        let cutoff = millis_before(Utc::now(), self.stale_window);
        let reclaimed = self.db.conn().execute(
            "UPDATE jobs SET locked_by = NULL, locked_at = NULL
             WHERE locked_by IS NOT NULL AND locked_at <= ?1",
            [cutoff],
        )?;

        if reclaimed > 0 {
            info!(reclaimed, "Reclaimed abandoned job locks");
        }
        Ok(reclaimed)
    }

    pub fn stats(&self) -> Result<QueueStats, StoreError> {
        let now = Utc::now();
        let cutoff = millis_before(now, self.stale_window);

        let (ready, locked, delayed) = self.db.conn().query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN (locked_by IS NULL OR locked_at <= ?2) AND not_before <= ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN locked_by IS NOT NULL AND locked_at > ?2 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN (locked_by IS NULL OR locked_at <= ?2) AND not_before > ?1 THEN 1 ELSE 0 END), 0)
             FROM jobs",
            params![to_millis(now), cutoff],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
        )?;
        let dead: i64 = self
            .db
            .conn()
            .query_row("SELECT COUNT(*) FROM dead_jobs", [], |row| row.get(0))?;

        Ok(QueueStats {
            ready: ready as u64,
            locked: locked as u64,
            delayed: delayed as u64,
            dead: dead as u64,
        })
    }

    /// `retry_base * 2^(attempts - 1)`, capped
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        self.retry_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<QueuedJob> {
    Ok(QueuedJob {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        payload_ref: row.get(2)?,
        enqueued_at: from_millis(row.get(3)?),
        not_before: from_millis(row.get(4)?),
        locked_by: row.get(5)?,
        locked_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
        attempts: row.get(7)?,
        last_error: row.get(8)?,
    })
}
