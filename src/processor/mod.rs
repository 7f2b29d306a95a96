//! Per-job pipeline: load, cache lookup or scan, store, deliver
//!
//! The processor is the error boundary for a job. Cache failures degrade to a
//! miss (lookup) or are dropped (store); load, scan and delivery failures,
//! panics included, mark the job failed so the queue's retry policy takes
//! over. Either way a full set of timing records is emitted.

pub mod timing;

use crate::config::Config;
use crate::db::Database;
use crate::error::{ProcessError, ScanError};
use crate::queue::{FailOutcome, JobHandle, JobQueue};
use crate::scan_cache::{CacheManager, MatchKind, ScanOutcome, StoreDecision};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub use timing::{JobStatus, Stage, StageTimer, TimingRecord};

/// Resolves a job's payload reference to the raw message
pub trait PayloadSource: Send + Sync {
    fn load(&self, payload_ref: &str) -> anyhow::Result<Vec<u8>>;
}

/// External content inspection; synchronous and opaque
pub trait Scanner: Send + Sync {
    fn scan(&self, payload: &[u8]) -> Result<ScanOutcome, ScanError>;
}

/// Hands a scanned message onward; called exactly once per successful job
pub trait Delivery: Send + Sync {
    fn deliver(&self, job: &JobHandle, payload: &[u8], outcome: &ScanOutcome)
        -> anyhow::Result<()>;
}

/// The external systems a worker talks to
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn PayloadSource>,
    pub scanner: Arc<dyn Scanner>,
    pub delivery: Arc<dyn Delivery>,
}

/// What happened to one job
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: i64,
    pub tenant: String,
    pub status: JobStatus,
    pub match_kind: Option<MatchKind>,
    /// Whether the external scanner was called
    pub scanned: bool,
    /// Set when the job failed and was handed to the retry policy
    pub failure: Option<FailOutcome>,
    pub timings: Vec<TimingRecord>,
}

impl JobReport {
    pub fn cache_hit(&self) -> bool {
        self.match_kind.is_some()
    }
}

#[derive(Default)]
struct Verdict {
    match_kind: Option<MatchKind>,
    scanned: bool,
}

pub struct MessageProcessor<'db> {
    config: Arc<Config>,
    cache: CacheManager<'db>,
    queue: JobQueue<'db>,
    collaborators: Collaborators,
}

impl<'db> MessageProcessor<'db> {
    pub fn new(db: &'db Database, config: Arc<Config>, collaborators: Collaborators) -> Self {
        Self {
            cache: CacheManager::new(db, config.cache.clone()),
            queue: JobQueue::new(db, &config.queue),
            config,
            collaborators,
        }
    }

    /// Run a locked job to completion or failure
    ///
    /// Never returns an error; everything is folded into the report.
    pub fn process(&self, handle: &JobHandle) -> JobReport {
        let mut timer = StageTimer::start(handle);
        let mut verdict = Verdict::default();

        // A panicking collaborator fails the job instead of the worker thread
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.run(handle, &mut timer, &mut verdict)
                .and_then(|()| self.finish(handle))
        }))
        .unwrap_or_else(|payload| Err(ProcessError::Panicked(panic_message(payload.as_ref()))));

        let (status, failure) = match result {
            Ok(()) => (JobStatus::Ok, None),
            Err(e) => {
                error!(
                    job_id = handle.id,
                    tenant = %handle.tenant_id,
                    attempts = handle.attempts,
                    error = %e,
                    "Job failed"
                );
                (JobStatus::Error, self.release(handle, &e))
            }
        };

        JobReport {
            job_id: handle.id,
            tenant: handle.tenant_id.clone(),
            status,
            match_kind: verdict.match_kind,
            scanned: verdict.scanned,
            failure,
            timings: timer.finish(status, verdict.match_kind),
        }
    }

    fn run(
        &self,
        handle: &JobHandle,
        timer: &mut StageTimer,
        verdict: &mut Verdict,
    ) -> Result<(), ProcessError> {
        let source = &self.collaborators.source;
        let payload = timer
            .time(Stage::Load, || source.load(&handle.payload_ref))
            .map_err(ProcessError::Load)?;
        let size = payload.len() as u64;
        timer.set_payload_size(size);

        let use_cache = self.config.cache_enabled_for(&handle.tenant_id);
        if !use_cache {
            debug!(tenant = %handle.tenant_id, "Scan cache bypassed for tenant");
        }

        let cached = if use_cache {
            timer.time(Stage::Lookup, || self.lookup(&payload, size))
        } else {
            None
        };

        let outcome = match cached {
            Some((kind, outcome)) => {
                verdict.match_kind = Some(kind);
                outcome
            }
            None => {
                let scanner = &self.collaborators.scanner;
                verdict.scanned = true;
                let outcome = timer.time(Stage::Scan, || scanner.scan(&payload))?;
                if use_cache {
                    timer.time(Stage::Store, || self.store(&payload, size, &outcome));
                }
                outcome
            }
        };

        let delivery = &self.collaborators.delivery;
        timer
            .time(Stage::Deliver, || delivery.deliver(handle, &payload, &outcome))
            .map_err(ProcessError::Deliver)
    }

    /// A failed lookup is treated as a miss
    fn lookup(&self, payload: &[u8], size: u64) -> Option<(MatchKind, ScanOutcome)> {
        match self.cache.lookup(payload, size) {
            Ok(hit) => hit.map(|hit| (hit.match_kind, hit.outcome)),
            Err(e) => {
                warn!(error = %e, transient = e.is_transient(), "Cache lookup failed, scanning");
                None
            }
        }
    }

    /// Best effort; a failed store never fails the job
    fn store(&self, payload: &[u8], size: u64, outcome: &ScanOutcome) {
        match self.cache.store(payload, size, outcome) {
            Ok(StoreDecision::Stored) => debug!(payload_size = size, "Cached scan outcome"),
            Ok(decision) => debug!(decision = ?decision, "Scan outcome not cached"),
            Err(e) => warn!(error = %e, "Failed to cache scan outcome"),
        }
    }

    fn finish(&self, handle: &JobHandle) -> Result<(), ProcessError> {
        // A lost lock means another worker owns the job now; nothing to undo
        self.queue.complete(handle)?;
        Ok(())
    }

    /// Hand a failed job to the retry policy
    fn release(&self, handle: &JobHandle, err: &ProcessError) -> Option<FailOutcome> {
        if let ProcessError::Queue(_) = err {
            // The queue itself is unhealthy; the lock will go stale and be redispatched
            return None;
        }
        match self.queue.fail(handle, &err.to_string()) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(job_id = handle.id, error = %e, "Failed to requeue job");
                None
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
