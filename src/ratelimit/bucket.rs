//! Bucket keys, periods and the bucket engine.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};

use crate::error::{Result, TollgateError};
use crate::store::{AtomicCounterStore, ConsumeOutcome, ConsumeRequest, StoreError};

use super::Algorithm;

/// Refill period (token bucket) or window length (fixed window) of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeWindow {
    /// System-wide limit
    Second,
    /// Per-client short window
    Minute,
    /// Per-client quota, 30 days rolling from first use
    Month,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Month => Duration::from_secs(30 * 86_400),
        }
    }
}

/// A key that uniquely identifies a bucket in the counter store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BucketKey {
    /// The single cluster-wide bucket
    System,
    /// Per-minute bucket of one client
    Window(String),
    /// Monthly bucket of one client
    Monthly(String),
}

impl BucketKey {
    /// Convert the bucket key to its store representation.
    pub fn to_store_key(&self) -> String {
        match self {
            BucketKey::System => "system:global".to_string(),
            BucketKey::Window(client_id) => format!("window:user:{}", client_id),
            BucketKey::Monthly(client_id) => format!("monthly:user:{}", client_id),
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}

impl ConsumeOutcome {
    /// Whole seconds until a rejected consume could succeed, rounded up and
    /// never zero. Zero for a successful consume.
    pub fn retry_after_seconds(&self) -> u64 {
        if self.consumed {
            return 0;
        }
        self.nanos_to_refill.div_ceil(1_000_000_000).max(1)
    }
}

/// Runs consumes against the shared counter store.
///
/// Holds no bucket state of its own; every call is a store round trip.
pub struct BucketEngine {
    store: Arc<dyn AtomicCounterStore>,
    timeout: Duration,
}

impl BucketEngine {
    pub fn new(store: Arc<dyn AtomicCounterStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Atomically take `tokens` from the bucket.
    ///
    /// `algorithm` only applies if the bucket does not exist yet. A store
    /// error, or no answer within the configured timeout, is reported as
    /// [`TollgateError::StoreUnavailable`].
    pub async fn try_consume(
        &self,
        key: &BucketKey,
        capacity: u64,
        window: TimeWindow,
        tokens: u64,
        algorithm: Algorithm,
    ) -> Result<ConsumeOutcome> {
        let request = ConsumeRequest {
            key: key.to_store_key(),
            capacity,
            period: window.duration(),
            tokens,
            algorithm,
        };

        trace!(
            key = %key,
            capacity = capacity,
            tokens = tokens,
            algorithm = %algorithm,
            "Consuming from bucket"
        );

        match tokio::time::timeout(self.timeout, self.store.consume(request)).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(err)) => {
                warn!(key = %key, store = self.store.name(), error = %err, "Counter store error");
                Err(err.into())
            }
            Err(_) => {
                warn!(key = %key, store = self.store.name(), timeout = ?self.timeout, "Counter store timed out");
                Err(TollgateError::from(StoreError::Timeout(self.timeout)))
            }
        }
    }
}
