//! Lookup, store, invalidation and maintenance over the scan result table
//!
//! Lookup is a precision cascade: full-content hash first, then the
//! attachment hash, then the template hash. The weaker keys are only computed
//! when the stronger ones missed, so identical bulk content costs a single
//! hash and a single query.
//!
//! Storing is guarded: threats and anything scoring above the configured
//! ceiling are never cached, so borderline content is always rescanned.

use crate::config::CacheConfig;
use crate::content::{self, ContentHashes};
use crate::db::{millis_before, to_millis, Database};
use crate::error::StoreError;
use crate::scan_cache::database::{CacheEntry, ScanResultStore};
use crate::scan_cache::outcome::{CacheHit, MatchKind, ScanOutcome};
use crate::scan_cache::stats::{CacheStats, MaintenanceReport};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Why `store` did or did not persist an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreDecision {
    Stored,
    /// A concurrent worker inserted the same key first
    AlreadyPresent,
    Disabled,
    RefusedThreat,
    RefusedScore,
}

pub struct CacheManager<'db> {
    store: ScanResultStore<'db>,
    config: CacheConfig,
}

impl<'db> CacheManager<'db> {
    pub fn new(db: &'db Database, config: CacheConfig) -> Self {
        Self {
            store: ScanResultStore::new(db),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Find a fresh outcome for equivalent content
    pub fn lookup(&self, raw: &[u8], payload_size: u64) -> Result<Option<CacheHit>, StoreError> {
        if !self.config.enabled {
            return Ok(None);
        }

        let now = Utc::now();
        let fresh_after = millis_before(now, self.config.ttl());

        let full = content::full_hash(raw);
        if let Some(entry) = self.store.find_by_full(&full, payload_size, fresh_after)? {
            return Ok(Some(self.hit(entry, MatchKind::Full, now)));
        }

        if self.config.attachment_matching {
            if let Some(hash) = content::attachment_hash(raw) {
                if let Some(entry) = self.store.find_by_attachment(&hash, fresh_after)? {
                    return Ok(Some(self.hit(entry, MatchKind::Attachment, now)));
                }
            }
        }

        if self.config.template_matching {
            if let Some(hash) = content::template_hash(raw) {
                if let Some(entry) = self.store.find_by_template(&hash, fresh_after)? {
                    return Ok(Some(self.hit(entry, MatchKind::Template, now)));
                }
            }
        }

        Ok(None)
    }

    fn hit(&self, entry: CacheEntry, match_kind: MatchKind, now: DateTime<Utc>) -> CacheHit {
        // Bookkeeping only; a failed update does not invalidate the hit
        if let Err(e) = self.store.record_use(entry.id, now) {
            warn!(entry_id = entry.id, error = %e, "Failed to record cache use");
        }
        debug!(entry_id = entry.id, match_kind = %match_kind, "Scan cache hit");

        CacheHit {
            entry_id: entry.id,
            match_kind,
            outcome: entry.outcome,
        }
    }

    /// Whether an outcome may ever be cached
    pub fn is_cacheable(&self, outcome: &ScanOutcome) -> StoreDecision {
        if outcome.threat {
            return StoreDecision::RefusedThreat;
        }
        // NaN fails this comparison too
        if !(outcome.score <= self.config.score_ceiling) {
            return StoreDecision::RefusedScore;
        }
        StoreDecision::Stored
    }

    /// Persist a freshly scanned outcome under every available key
    pub fn store(
        &self,
        raw: &[u8],
        payload_size: u64,
        outcome: &ScanOutcome,
    ) -> Result<StoreDecision, StoreError> {
        if !self.config.enabled {
            return Ok(StoreDecision::Disabled);
        }

        let decision = self.is_cacheable(outcome);
        if decision != StoreDecision::Stored {
            debug!(
                score = outcome.score,
                threat = outcome.threat,
                decision = ?decision,
                "Outcome not cacheable"
            );
            return Ok(decision);
        }

        let hashes = ContentHashes::compute(raw);
        match self.store.upsert(&hashes, payload_size, outcome, Utc::now()) {
            Ok(()) => Ok(StoreDecision::Stored),
            Err(e) if e.is_integrity() => {
                debug!(error = %e, "Concurrent cache insert for same content");
                Ok(StoreDecision::AlreadyPresent)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop every entry; run whenever detection rules change
    pub fn invalidate_all(&self) -> Result<usize, StoreError> {
        let removed = self.store.delete_all()?;
        info!(removed, "Invalidated entire scan cache");
        Ok(removed)
    }

    /// Drop entries created before `cutoff`
    pub fn invalidate_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        // created_at is inclusive-deleted, so step back one millisecond
        let removed = self.store.delete_created_up_to(to_millis(cutoff) - 1)?;
        info!(removed, cutoff = %cutoff, "Invalidated scan cache entries");
        Ok(removed)
    }

    /// Expire entries past TTL, then evict least recently used down to capacity
    pub fn maintain(&self) -> Result<MaintenanceReport, StoreError> {
        let cutoff = millis_before(Utc::now(), self.config.ttl());
        let expired = self.store.delete_created_up_to(cutoff)?;

        let count = self.store.count()?;
        let evicted = if count > self.config.max_entries {
            self.store.evict_lru(count - self.config.max_entries)?
        } else {
            0
        };

        let report = MaintenanceReport {
            expired,
            evicted,
            remaining: count.saturating_sub(evicted as u64),
        };
        if report.removed() > 0 {
            info!(
                expired = report.expired,
                evicted = report.evicted,
                remaining = report.remaining,
                "Scan cache maintenance"
            );
        }
        Ok(report)
    }

    pub fn stats(&self) -> Result<CacheStats, StoreError> {
        self.store.stats()
    }
}
