//! Shared counter store abstraction.
//!
//! Bucket state lives only in the store. Every consume is a single atomic
//! read-modify-write against one key, so any number of server instances can
//! share the same buckets.

mod memory;
mod redis_store;
mod state;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::ratelimit::Algorithm;

pub use memory::MemoryCounterStore;
pub use redis_store::RedisCounterStore;
pub use state::BucketState;

/// Errors raised by counter store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),
    #[error("store command failed: {0}")]
    Command(String),
    #[error("store did not answer within {0:?}")]
    Timeout(Duration),
    #[error("malformed store reply: {0}")]
    Protocol(String),
}

/// A single atomic consume against a named bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeRequest {
    /// Fully qualified bucket key
    pub key: String,
    /// Maximum tokens (or window count) for the bucket
    pub capacity: u64,
    /// Refill period (token bucket) or window length (fixed window)
    pub period: Duration,
    /// Tokens to take
    pub tokens: u64,
    /// Algorithm to apply if the bucket does not exist yet
    pub algorithm: Algorithm,
}

/// Result of a consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOutcome {
    pub consumed: bool,
    pub remaining: u64,
    /// Time until the request could succeed; zero when consumed
    pub nanos_to_refill: u64,
    /// Algorithm the bucket actually runs under
    pub algorithm: Algorithm,
}

/// Atomic, TTL-capable counter store shared by every server instance.
#[async_trait]
pub trait AtomicCounterStore: Send + Sync {
    /// Atomically consume tokens from a bucket, creating it if needed.
    async fn consume(&self, request: ConsumeRequest) -> Result<ConsumeOutcome, StoreError>;

    /// Short name for logging.
    fn name(&self) -> &'static str;
}
