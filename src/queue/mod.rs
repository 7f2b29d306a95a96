//! Persistent multi-tenant job queue

pub mod dispatcher;
pub mod job;
pub mod store;

pub use dispatcher::{DispatchCursor, FairDispatcher};
pub use job::{JobHandle, JobId, NewJob, QueuedJob};
pub use store::{FailOutcome, JobQueue, QueueStats};
