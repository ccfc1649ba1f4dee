//! In-process counter store.
//!
//! Satisfies the same atomic-consume contract as the Redis store, but only
//! within one process. Used for single-instance deployments and tests.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::trace;

use super::{AtomicCounterStore, BucketState, ConsumeOutcome, ConsumeRequest, StoreError};

/// A bucket plus the store-clock instant after which it is discarded.
#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    state: BucketState,
    expires_at: u64,
}

/// DashMap-backed counter store.
///
/// Each consume runs under the map's per-key write lock, which makes it
/// atomic with respect to every other consume on the same key.
pub struct MemoryCounterStore {
    buckets: DashMap<String, StoredBucket>,
    /// Zero point of the store clock
    origin: Instant,
    keep_after_refill: Duration,
}

impl MemoryCounterStore {
    /// Create a store that keeps idle buckets for one hour after they refill.
    pub fn new() -> Self {
        Self::with_keep_after_refill(Duration::from_secs(3600))
    }

    pub fn with_keep_after_refill(keep_after_refill: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            origin: Instant::now(),
            keep_after_refill,
        }
    }

    fn now(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Current state of a bucket, if it exists and has not expired.
    pub fn bucket(&self, key: &str) -> Option<BucketState> {
        let now = self.now();
        self.buckets
            .get(key)
            .filter(|b| b.expires_at > now)
            .map(|b| b.state)
    }

    /// Drop every expired bucket. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.now();
        let before = self.buckets.len();
        self.buckets.retain(|_, b| b.expires_at > now);
        before - self.buckets.len()
    }

    /// Number of stored buckets, expired ones included until purged.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AtomicCounterStore for MemoryCounterStore {
    async fn consume(&self, request: ConsumeRequest) -> Result<ConsumeOutcome, StoreError> {
        let now = self.now();
        let fresh = StoredBucket {
            state: BucketState::new(request.algorithm, request.capacity, now),
            expires_at: u64::MAX,
        };

        let mut bucket = self.buckets.entry(request.key.clone()).or_insert(fresh);
        if bucket.expires_at <= now {
            trace!(key = %request.key, "Replacing expired bucket");
            *bucket = fresh;
        }

        let outcome = bucket
            .state
            .consume(request.capacity, request.period, request.tokens, now);
        let keep = bucket.state.time_to_reset(request.capacity, request.period, now)
            + self.keep_after_refill;
        bucket.expires_at = now.saturating_add(u64::try_from(keep.as_nanos()).unwrap_or(u64::MAX));

        Ok(outcome)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
