//! Rate limiting backend trait consumed by the gRPC service.

use async_trait::async_trait;

use crate::error::Result;
use crate::usage::UsageReport;

use super::algorithm::AlgorithmSetting;
use super::decision::LimitDecision;

/// Operations the gRPC service needs from the rate limiter.
///
/// Keeps the service independent of how clients are resolved and where
/// counters live, so tests can drive it with in-memory stores.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Decide whether the request carrying `api_key` is admitted.
    async fn decide(&self, api_key: &str) -> Result<LimitDecision>;

    /// Algorithm applied to newly created buckets.
    async fn algorithm_setting(&self) -> Result<AlgorithmSetting>;

    /// Change the algorithm for newly created buckets.
    async fn set_algorithm(&self, value: &str, actor: &str) -> Result<AlgorithmSetting>;

    /// Current calendar-month usage of a client.
    async fn usage_report(&self, client_id: &str) -> Result<UsageReport>;

    /// A client's most recent `months` months of usage, newest first.
    async fn usage_history(&self, client_id: &str, months: usize) -> Result<Vec<UsageReport>>;

    /// Current-month usage of every client that made requests this month.
    async fn list_usage(&self) -> Result<Vec<UsageReport>>;
}
