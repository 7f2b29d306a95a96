//! Shared scan result cache
//!
//! Stores scanner outcomes keyed by content hashes so identical bulk mail is
//! scanned once and every further copy reuses the stored verdict.

pub mod database;
pub mod manager;
pub mod outcome;
pub mod stats;

pub use database::{CacheEntry, ScanResultStore};
pub use manager::{CacheManager, StoreDecision};
pub use outcome::{CacheHit, MatchKind, ScanDetail, ScanOutcome};
pub use stats::{CacheStats, MaintenanceReport};
