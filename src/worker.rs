//! Fixed-size worker pool
//!
//! Each worker is an OS thread with its own database connection and its own
//! dispatch cursor; workers share nothing in memory. A separate maintenance
//! thread expires and evicts cache entries and reclaims abandoned job locks on
//! a fixed schedule.

use crate::config::Config;
use crate::db::Database;
use crate::processor::{Collaborators, JobReport, JobStatus, MessageProcessor};
use crate::queue::{FairDispatcher, JobQueue};
use crate::scan_cache::CacheManager;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest single sleep, so shutdown is noticed promptly
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Totals across every job a pool handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolSummary {
    pub processed: u64,
    pub failed: u64,
    pub cache_hits: u64,
    pub scans: u64,
}

impl PoolSummary {
    fn record(&mut self, report: &JobReport) {
        match report.status {
            JobStatus::Ok => self.processed += 1,
            JobStatus::Error => self.failed += 1,
        }
        if report.cache_hit() {
            self.cache_hits += 1;
        }
        if report.scanned {
            self.scans += 1;
        }
    }

    fn merge(&mut self, other: PoolSummary) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.cache_hits += other.cache_hits;
        self.scans += other.scans;
    }
}

/// Idle poll delay, doubling up to a ceiling and reset on work
struct PollBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl PollBackoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.min;
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Poll until shutdown is requested
    Serve,
    /// Exit as soon as nothing is eligible for dispatch
    Drain,
}

pub struct WorkerPool {
    config: Arc<Config>,
    collaborators: Collaborators,
}

impl WorkerPool {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        Self {
            config: Arc::new(config),
            collaborators,
        }
    }

    /// Run workers and the maintenance thread until `shutdown` is set
    pub fn run(&self, shutdown: Arc<AtomicBool>) -> Result<PoolSummary> {
        info!(
            workers = self.config.queue.workers,
            database = %self.config.database.path.display(),
            "Starting worker pool"
        );

        let maintenance = self.spawn_maintenance(shutdown.clone())?;
        let summary = self.run_workers(Mode::Serve, shutdown.clone());

        // Workers may have exited on error; stop maintenance either way
        shutdown.store(true, Ordering::SeqCst);
        join(maintenance)?;

        let summary = summary?;
        info!(
            processed = summary.processed,
            failed = summary.failed,
            cache_hits = summary.cache_hits,
            scans = summary.scans,
            "Worker pool stopped"
        );
        Ok(summary)
    }

    /// Process every currently eligible job, then return
    pub fn run_until_idle(&self) -> Result<PoolSummary> {
        self.run_workers(Mode::Drain, Arc::new(AtomicBool::new(false)))
    }

    fn run_workers(&self, mode: Mode, shutdown: Arc<AtomicBool>) -> Result<PoolSummary> {
        let mut handles = Vec::with_capacity(self.config.queue.workers);
        for index in 0..self.config.queue.workers {
            let worker_id = format!("{}-{}", std::process::id(), index);
            let config = self.config.clone();
            let collaborators = self.collaborators.clone();
            let shutdown = shutdown.clone();

            let handle = thread::Builder::new()
                .name(format!("mailworker-{index}"))
                .spawn(move || worker_loop(&worker_id, &config, collaborators, mode, &shutdown))
                .context("Failed to spawn worker thread")?;
            handles.push(handle);
        }

        let mut summary = PoolSummary::default();
        let mut first_error = None;
        for handle in handles {
            match join(handle) {
                Ok(worker) => summary.merge(worker),
                Err(e) => {
                    error!(error = %e, "Worker exited with error");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn spawn_maintenance(&self, shutdown: Arc<AtomicBool>) -> Result<JoinHandle<Result<()>>> {
        let config = self.config.clone();
        thread::Builder::new()
            .name("mailworker-maintenance".to_string())
            .spawn(move || maintenance_loop(&config, &shutdown))
            .context("Failed to spawn maintenance thread")
    }
}

fn join<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    let name = handle.thread().name().unwrap_or("worker").to_string();
    handle
        .join()
        .map_err(|_| anyhow!("Thread {name} panicked"))?
}

fn worker_loop(
    worker_id: &str,
    config: &Arc<Config>,
    collaborators: Collaborators,
    mode: Mode,
    shutdown: &AtomicBool,
) -> Result<PoolSummary> {
    let db = Database::open(&config.database.path)
        .with_context(|| format!("Worker {worker_id} failed to open database"))?;
    let processor = MessageProcessor::new(&db, config.clone(), collaborators);
    let mut dispatcher = FairDispatcher::new(worker_id, config.queue.lock_stale_window());
    let mut backoff = PollBackoff::new(config.queue.poll_interval(), config.queue.max_poll_interval());
    let mut summary = PoolSummary::default();

    debug!(worker = worker_id, "Worker started");

    while !shutdown.load(Ordering::SeqCst) {
        match dispatcher.dispatch_next(&db) {
            Ok(Some(handle)) => {
                backoff.reset();
                let report = processor.process(&handle);
                summary.record(&report);
            }
            Ok(None) => {
                if mode == Mode::Drain {
                    break;
                }
                sleep_unless_shutdown(backoff.next_delay(), shutdown);
            }
            Err(e) => {
                warn!(
                    worker = worker_id,
                    error = %e,
                    transient = e.is_transient(),
                    "Dispatch failed, backing off"
                );
                sleep_unless_shutdown(backoff.next_delay(), shutdown);
            }
        }
    }

    debug!(
        worker = worker_id,
        processed = summary.processed,
        failed = summary.failed,
        "Worker stopped"
    );
    Ok(summary)
}

fn maintenance_loop(config: &Config, shutdown: &AtomicBool) -> Result<()> {
    let db = Database::open(&config.database.path)
        .context("Maintenance thread failed to open database")?;
    let cache = CacheManager::new(&db, config.cache.clone());
    let queue = JobQueue::new(&db, &config.queue);
    let interval = config.cache.maintenance_interval();

    while !shutdown.load(Ordering::SeqCst) {
        sleep_unless_shutdown(interval, shutdown);
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        if let Err(e) = cache.maintain() {
            warn!(error = %e, "Cache maintenance failed");
        }
        if let Err(e) = queue.reclaim_stale() {
            warn!(error = %e, "Stale lock reclaim failed");
        }
    }
    Ok(())
}

fn sleep_unless_shutdown(duration: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + duration;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
