//! Job rows and the handle a worker holds while it owns one

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type JobId = i64;

/// What an enqueuer supplies
#[derive(Debug, Clone)]
pub struct NewJob {
    pub tenant_id: String,
    pub payload_ref: String,
    /// Earliest dispatch time; `None` means immediately
    pub not_before: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(tenant_id: impl Into<String>, payload_ref: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            payload_ref: payload_ref.into(),
            not_before: None,
        }
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }
}

/// A row of the shared job table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub tenant_id: String,
    pub payload_ref: String,
    pub enqueued_at: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
    /// `locked_by` and `locked_at` are either both set or both empty
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl QueuedJob {
    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }
}

/// Proof of ownership of a locked job
///
/// Only obtainable from a successful dispatch. Completion and failure are
/// conditional on the lock still belonging to `worker_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub(crate) id: JobId,
    pub(crate) tenant_id: String,
    pub(crate) payload_ref: String,
    pub(crate) enqueued_at: DateTime<Utc>,
    pub(crate) attempts: u32,
    pub(crate) worker_id: String,
    pub(crate) locked_at: DateTime<Utc>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn payload_ref(&self) -> &str {
        &self.payload_ref
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    /// Failed attempts before this dispatch
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn locked_at(&self) -> DateTime<Utc> {
        self.locked_at
    }
}
