//! Round-robin job dispatch across tenants
//!
//! Each worker keeps its own [`DispatchCursor`] holding the last tenant it
//! served. The next job always comes from the smallest tenant id strictly
//! greater than the cursor, wrapping to the smallest tenant overall. Within a
//! sweep every tenant is therefore served at most once, so a tenant with a
//! huge backlog delays any other tenant by at most one sweep (one dispatch per
//! active tenant).
//!
//! Locks are taken with a single conditional UPDATE. Losing the race to
//! another worker just means selecting again.

use crate::db::{from_millis, millis_before, to_millis, Database};
use crate::error::StoreError;
use crate::queue::job::{JobHandle, JobId};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use std::time::Duration;
use tracing::{debug, trace};

/// Last tenant this worker served; worker-local and never persisted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchCursor {
    last_tenant: Option<String>,
}

impl DispatchCursor {
    pub fn last_tenant(&self) -> Option<&str> {
        self.last_tenant.as_deref()
    }

    fn advance(&mut self, tenant: &str) {
        self.last_tenant = Some(tenant.to_string());
    }
}

struct Candidate {
    id: JobId,
    tenant_id: String,
    payload_ref: String,
    enqueued_at: i64,
    attempts: u32,
}

pub struct FairDispatcher {
    worker_id: String,
    cursor: DispatchCursor,
    stale_window: Duration,
}

impl FairDispatcher {
    pub fn new(worker_id: impl Into<String>, stale_window: Duration) -> Self {
        Self {
            worker_id: worker_id.into(),
            cursor: DispatchCursor::default(),
            stale_window,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn cursor(&self) -> &DispatchCursor {
        &self.cursor
    }

    /// Lock and return the next eligible job, or `None` if nothing is eligible
    pub fn dispatch_next(&mut self, db: &Database) -> Result<Option<JobHandle>, StoreError> {
        self.dispatch_with(db, |_, _| {})
    }

    /// `before_acquire` runs between selecting a candidate and locking it
    fn dispatch_with(
        &mut self,
        db: &Database,
        mut before_acquire: impl FnMut(&Database, JobId),
    ) -> Result<Option<JobHandle>, StoreError> {
        let mut lost_races = 0u32;

        loop {
            let now = Utc::now();
            let now_ms = to_millis(now);
            let stale_cutoff = millis_before(now, self.stale_window);

            let Some(candidate) = self.select(db, now_ms, stale_cutoff)? else {
                trace!(worker = %self.worker_id, "No eligible job");
                return Ok(None);
            };

            before_acquire(db, candidate.id);
            let acquired = db.conn().execute(
                "UPDATE jobs SET locked_by = ?1, locked_at = ?2
                 WHERE id = ?3 AND (locked_by IS NULL OR locked_at <= ?4)",
                params![self.worker_id, now_ms, candidate.id, stale_cutoff],
            )?;

            if acquired == 0 {
                // Another worker got there first
                lost_races += 1;
                debug!(
                    worker = %self.worker_id,
                    job_id = candidate.id,
                    lost_races,
                    "Lost lock race, reselecting"
                );
                continue;
            }

            self.cursor.advance(&candidate.tenant_id);
            return Ok(Some(JobHandle {
                id: candidate.id,
                tenant_id: candidate.tenant_id,
                payload_ref: candidate.payload_ref,
                enqueued_at: from_millis(candidate.enqueued_at),
                attempts: candidate.attempts,
                worker_id: self.worker_id.clone(),
                locked_at: from_millis(now_ms),
            }));
        }
    }

    /// Next tenant after the cursor, else wrap to the first tenant
    fn select(
        &self,
        db: &Database,
        now_ms: i64,
        stale_cutoff: i64,
    ) -> Result<Option<Candidate>, StoreError> {
        const ELIGIBLE: &str = "not_before <= ?1 AND (locked_by IS NULL OR locked_at <= ?2)";
        const ORDER: &str = "ORDER BY tenant_id ASC, enqueued_at ASC, id ASC LIMIT 1";
        const COLUMNS: &str = "SELECT id, tenant_id, payload_ref, enqueued_at, attempts FROM jobs";

        let map = |row: &rusqlite::Row<'_>| {
            Ok(Candidate {
                id: row.get(0)?,
                tenant_id: row.get(1)?,
                payload_ref: row.get(2)?,
                enqueued_at: row.get(3)?,
                attempts: row.get(4)?,
            })
        };

        if let Some(last) = self.cursor.last_tenant() {
            let after = db
                .conn()
                .prepare_cached(&format!("{COLUMNS} WHERE {ELIGIBLE} AND tenant_id > ?3 {ORDER}"))?
                .query_row(params![now_ms, stale_cutoff, last], map)
                .optional()?;
            if after.is_some() {
                return Ok(after);
            }
        }

        let first = db
            .conn()
            .prepare_cached(&format!("{COLUMNS} WHERE {ELIGIBLE} {ORDER}"))?
            .query_row(params![now_ms, stale_cutoff], map)
            .optional()?;
        Ok(first)
    }
}
