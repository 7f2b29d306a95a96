//! Cache statistics and maintenance reports

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: u64,
    pub total_uses: u64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

/// Result of one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    /// Entries removed for exceeding the TTL
    pub expired: usize,
    /// Entries removed to get back under the capacity ceiling
    pub evicted: usize,
    pub remaining: u64,
}

impl MaintenanceReport {
    pub fn removed(&self) -> usize {
        self.expired + self.evicted
    }
}
