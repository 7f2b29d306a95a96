//! Mail scanning worker core
//!
//! Multi-tenant job dispatch with round-robin fairness, and a shared cache of
//! scanner verdicts keyed by normalized content hashes. Payload loading,
//! scanning and delivery are supplied by the embedder through the traits in
//! [`processor`].

pub mod cli;
pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod logging;
pub mod processor;
pub mod queue;
pub mod scan_cache;
pub mod worker;

pub use config::Config;
pub use error::{ProcessError, ScanError, StoreError};
pub use processor::{Collaborators, Delivery, MessageProcessor, PayloadSource, Scanner};
pub use worker::{PoolSummary, WorkerPool};
