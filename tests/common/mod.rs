//! Shared fakes for integration tests

#![allow(dead_code)]

use anyhow::anyhow;
use mailworker::config::Config;
use mailworker::queue::JobHandle;
use mailworker::scan_cache::ScanOutcome;
use mailworker::{Collaborators, Delivery, PayloadSource, ScanError, Scanner};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub struct MapSource(pub HashMap<String, Vec<u8>>);

impl PayloadSource for MapSource {
    fn load(&self, payload_ref: &str) -> anyhow::Result<Vec<u8>> {
        self.0
            .get(payload_ref)
            .cloned()
            .ok_or_else(|| anyhow!("unknown payload {payload_ref}"))
    }
}

#[derive(Default)]
pub struct CountingScanner {
    pub calls: AtomicUsize,
}

impl Scanner for CountingScanner {
    fn scan(&self, _payload: &[u8]) -> Result<ScanOutcome, ScanError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ScanOutcome::clean(0.5))
    }
}

pub struct PanickingScanner;

impl Scanner for PanickingScanner {
    fn scan(&self, _payload: &[u8]) -> Result<ScanOutcome, ScanError> {
        panic!("scanner engine crashed");
    }
}

/// Records deliveries and optionally raises a flag once `stop_after` is reached
#[derive(Default)]
pub struct RecordingDelivery {
    pub delivered: Mutex<Vec<(i64, String)>>,
    pub stop_after: Option<(usize, Arc<AtomicBool>)>,
}

impl Delivery for RecordingDelivery {
    fn deliver(&self, job: &JobHandle, _payload: &[u8], _outcome: &ScanOutcome) -> anyhow::Result<()> {
        let mut delivered = self.delivered.lock().map_err(|_| anyhow!("poisoned"))?;
        delivered.push((job.id(), job.tenant_id().to_string()));
        if let Some((limit, flag)) = &self.stop_after {
            if delivered.len() >= *limit {
                flag.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

pub fn collaborators(
    payloads: HashMap<String, Vec<u8>>,
    scanner: Arc<CountingScanner>,
    delivery: Arc<RecordingDelivery>,
) -> Collaborators {
    Collaborators {
        source: Arc::new(MapSource(payloads)),
        scanner,
        delivery,
    }
}

pub fn config(db_path: &Path, workers: usize) -> Config {
    let mut config = Config::default();
    config.database.path = db_path.to_path_buf();
    config.queue.workers = workers;
    config.queue.poll_interval_ms = 10;
    config.queue.max_poll_interval_ms = 50;
    config
}

pub fn message(to: &str, body: &str) -> Vec<u8> {
    format!(
        "From: promo@bulk.example\r\nTo: {to}\r\nMessage-ID: <{to}.1@bulk.example>\r\n\
         Subject: Weekly offers\r\n\r\n{body}\r\n"
    )
    .into_bytes()
}
