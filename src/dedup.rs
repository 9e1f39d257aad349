// =============================================================================
// dedup.rs - ONE BID PER ELEVATOR PER CROP PER DAY
// =============================================================================
//
// The datastore is the only real authority on whether today's corn bid for
// an elevator has been filed. Asking it costs a round trip, though, and a
// single run can ask the same question several times (two tables on the
// same page, the cron firing twice before lunch).
//
// So we keep a bounded LRU memo of keys we KNOW are already stored: either
// we inserted them ourselves or the datastore told us so. A memo hit skips
// the round trip. A memo miss always goes to the datastore. The memo never
// claims something is new; it only remembers what is old.
//
// The date is part of the key, so yesterday's memo entries simply age out
// of the LRU without any rotation ceremony.
// =============================================================================

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::EntryKey;
use crate::store::BasisStore;

/// What the dedup stage decided about a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupVerdict {
    /// Nobody has filed this key today
    New,
    /// This process already knows the key is stored
    KnownLocally,
    /// The datastore has a row for this key
    FoundRemotely,
}

impl DedupVerdict {
    pub fn is_new(&self) -> bool {
        matches!(self, DedupVerdict::New)
    }
}

pub struct DedupEngine {
    memo: Mutex<LruCache<String, ()>>,
    stats: Arc<DedupStats>,
}

/// Counters for the metrics endpoint.
pub struct DedupStats {
    pub checks: portable_atomic::AtomicU64,
    pub memo_hits: portable_atomic::AtomicU64,
    pub remote_hits: portable_atomic::AtomicU64,
    pub remote_misses: portable_atomic::AtomicU64,
    pub remembered: portable_atomic::AtomicU64,
}

impl DedupStats {
    fn new() -> Self {
        Self {
            checks: portable_atomic::AtomicU64::new(0),
            memo_hits: portable_atomic::AtomicU64::new(0),
            remote_hits: portable_atomic::AtomicU64::new(0),
            remote_misses: portable_atomic::AtomicU64::new(0),
            remembered: portable_atomic::AtomicU64::new(0),
        }
    }
}

impl DedupEngine {
    pub fn new(memo_capacity: usize) -> Self {
        info!(memo_capacity = memo_capacity, "Initializing dedup memo");

        let capacity = NonZeroUsize::new(memo_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            memo: Mutex::new(LruCache::new(capacity)),
            stats: Arc::new(DedupStats::new()),
        }
    }

    /// Decide whether `key` still needs inserting. Memo first, datastore
    /// second. A remote hit is remembered so the next check stays local.
    pub async fn check(
        &self,
        store: &dyn BasisStore,
        key: &EntryKey,
    ) -> Result<DedupVerdict, StoreError> {
        use portable_atomic::Ordering;

        self.stats.checks.fetch_add(1, Ordering::Relaxed);
        let memo_key = key.memo_key();

        if self.memo.lock().get(&memo_key).is_some() {
            self.stats.memo_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = memo_key.as_str(), "Dedup memo hit");
            return Ok(DedupVerdict::KnownLocally);
        }

        if store.exists(key).await? {
            self.stats.remote_hits.fetch_add(1, Ordering::Relaxed);
            self.memo.lock().put(memo_key.clone(), ());
            debug!(key = memo_key.as_str(), "Datastore already holds this key");
            return Ok(DedupVerdict::FoundRemotely);
        }

        self.stats.remote_misses.fetch_add(1, Ordering::Relaxed);
        Ok(DedupVerdict::New)
    }

    /// Record that `key` is now stored.
    pub fn remember(&self, key: &EntryKey) {
        self.memo.lock().put(key.memo_key(), ());
        self.stats
            .remembered
            .fetch_add(1, portable_atomic::Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DedupSnapshot {
        use portable_atomic::Ordering;
        DedupSnapshot {
            checks: self.stats.checks.load(Ordering::Relaxed),
            memo_hits: self.stats.memo_hits.load(Ordering::Relaxed),
            remote_hits: self.stats.remote_hits.load(Ordering::Relaxed),
            remote_misses: self.stats.remote_misses.load(Ordering::Relaxed),
            remembered: self.stats.remembered.load(Ordering::Relaxed),
            memo_size: self.memo.lock().len(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DedupSnapshot {
    pub checks: u64,
    pub memo_hits: u64,
    pub remote_hits: u64,
    pub remote_misses: u64,
    pub remembered: u64,
    pub memo_size: usize,
}
