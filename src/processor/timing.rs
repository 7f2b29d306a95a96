//! Per-stage timing records
//!
//! Stage durations are collected while a job runs and emitted together once
//! the terminal status is known, so every record of a job carries the same
//! status.

use crate::logging::TIMING_TARGET;
use crate::queue::JobHandle;
use crate::scan_cache::MatchKind;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Load,
    Lookup,
    Scan,
    Store,
    Deliver,
    Total,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Load => "load",
            Stage::Lookup => "lookup",
            Stage::Scan => "scan",
            Stage::Store => "store",
            Stage::Deliver => "deliver",
            Stage::Total => "total",
        };
        f.write_str(name)
    }
}

/// Terminal status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Ok,
    Error,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Ok => f.write_str("ok"),
            JobStatus::Error => f.write_str("error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingRecord {
    pub job_id: i64,
    pub tenant: String,
    pub payload_size: u64,
    pub stage: Stage,
    pub elapsed_ms: f64,
    pub status: JobStatus,
    pub match_kind: Option<MatchKind>,
}

pub struct StageTimer {
    job_id: i64,
    tenant: String,
    payload_size: u64,
    started: Instant,
    stages: Vec<(Stage, Duration)>,
}

impl StageTimer {
    pub fn start(handle: &JobHandle) -> Self {
        Self {
            job_id: handle.id,
            tenant: handle.tenant_id.clone(),
            payload_size: 0,
            started: Instant::now(),
            stages: Vec::with_capacity(5),
        }
    }

    /// Known only once the payload is loaded
    pub fn set_payload_size(&mut self, size: u64) {
        self.payload_size = size;
    }

    /// Run `f` and record how long it took, whether or not it succeeded
    pub fn time<T>(&mut self, stage: Stage, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        self.stages.push((stage, start.elapsed()));
        result
    }

    /// Emit one record per recorded stage plus the total
    pub fn finish(self, status: JobStatus, match_kind: Option<MatchKind>) -> Vec<TimingRecord> {
        let total = self.started.elapsed();
        let mut records = Vec::with_capacity(self.stages.len() + 1);

        for (stage, elapsed) in self.stages.into_iter().chain([(Stage::Total, total)]) {
            let record = TimingRecord {
                job_id: self.job_id,
                tenant: self.tenant.clone(),
                payload_size: self.payload_size,
                stage,
                elapsed_ms: elapsed.as_secs_f64() * 1000.0,
                status,
                match_kind,
            };
            emit(&record);
            records.push(record);
        }
        records
    }
}

fn emit(record: &TimingRecord) {
    info!(
        target: TIMING_TARGET,
        job_id = record.job_id,
        tenant = %record.tenant,
        payload_size = record.payload_size,
        stage = %record.stage,
        elapsed_ms = record.elapsed_ms,
        status = %record.status,
        match_kind = record.match_kind.map(|k| k.as_str()),
        "stage timing"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn handle() -> JobHandle {
        JobHandle {
            id: 7,
            tenant_id: "acme".to_string(),
            payload_ref: "spool/7".to_string(),
            enqueued_at: Utc::now(),
            attempts: 0,
            worker_id: "w1".to_string(),
            locked_at: Utc::now(),
        }
    }

    #[test]
    fn test_records_every_stage_then_total() {
        let mut timer = StageTimer::start(&handle());
        timer.time(Stage::Load, || ());
        timer.set_payload_size(1234);
        let value = timer.time(Stage::Lookup, || 42);
        assert_eq!(value, 42);

        let records = timer.finish(JobStatus::Ok, Some(MatchKind::Full));
        let stages: Vec<Stage> = records.iter().map(|r| r.stage).collect();
        assert_eq!(stages, vec![Stage::Load, Stage::Lookup, Stage::Total]);

        for record in &records {
            assert_eq!(record.job_id, 7);
            assert_eq!(record.tenant, "acme");
            assert_eq!(record.payload_size, 1234);
            assert_eq!(record.status, JobStatus::Ok);
            assert_eq!(record.match_kind, Some(MatchKind::Full));
        }
    }

    #[test]
    fn test_failed_stage_is_still_timed() {
        let mut timer = StageTimer::start(&handle());
        let result: Result<(), &str> = timer.time(Stage::Scan, || Err("boom"));
        assert!(result.is_err());

        let records = timer.finish(JobStatus::Error, None);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stage, Stage::Scan);
        assert!(records.iter().all(|r| r.status == JobStatus::Error));
    }

    #[test]
    fn test_record_serializes_lowercase() {
        let mut timer = StageTimer::start(&handle());
        timer.time(Stage::Deliver, || ());
        let records = timer.finish(JobStatus::Error, Some(MatchKind::Template));

        let json = serde_json::to_value(&records[0]).unwrap();
        assert_eq!(json["stage"], "deliver");
        assert_eq!(json["status"], "error");
        assert_eq!(json["match_kind"], "template");
    }
}
