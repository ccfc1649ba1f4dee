//! Limit tier evaluation.
//!
//! One evaluator per scope. Each derives its bucket key and capacity, reads
//! the active algorithm, consumes one token and classifies how close the
//! caller is to the limit.

use std::sync::Arc;

use tracing::debug;

use crate::catalog::{Client, Tier};
use crate::error::Result;
use crate::store::ConsumeOutcome;

use super::algorithm::AlgorithmSelector;
use super::bucket::{BucketEngine, BucketKey, TimeWindow};
use super::decision::{LimitDecision, LimitType, ThrottlingLevel};

/// Window usage at or above this percentage is soft throttled.
const WINDOW_SOFT_THRESHOLD_PERCENT: u64 = 80;
/// Monthly usage at or above this percentage is soft throttled.
const MONTHLY_SOFT_THRESHOLD_PERCENT: u64 = 90;

/// Decision of one tier plus the raw store answer behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierOutcome {
    pub decision: LimitDecision,
    pub consumption: ConsumeOutcome,
}

/// Evaluates one limit scope.
pub struct TierEvaluator {
    limit_type: LimitType,
    engine: Arc<BucketEngine>,
    selector: Arc<AlgorithmSelector>,
    /// Capacity of the system-wide bucket; unused by per-client scopes
    system_capacity: u64,
}

impl TierEvaluator {
    /// Cluster-wide cap of `requests_per_second`, independent of the caller.
    pub fn system(engine: Arc<BucketEngine>, selector: Arc<AlgorithmSelector>, requests_per_second: u64) -> Self {
        Self {
            limit_type: LimitType::SystemWide,
            engine,
            selector,
            system_capacity: requests_per_second,
        }
    }

    /// Per-client cap of the tier's `requests_per_minute`.
    pub fn window(engine: Arc<BucketEngine>, selector: Arc<AlgorithmSelector>) -> Self {
        Self {
            limit_type: LimitType::Window,
            engine,
            selector,
            system_capacity: 0,
        }
    }

    /// Per-client quota of the tier's `requests_per_month`.
    pub fn monthly(engine: Arc<BucketEngine>, selector: Arc<AlgorithmSelector>) -> Self {
        Self {
            limit_type: LimitType::Monthly,
            engine,
            selector,
            system_capacity: 0,
        }
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    /// Capacity this evaluator applies for the given tier.
    pub fn capacity(&self, tier: &Tier) -> u64 {
        match self.limit_type {
            LimitType::SystemWide => self.system_capacity,
            LimitType::Window => tier.requests_per_minute,
            LimitType::Monthly => tier.requests_per_month,
        }
    }

    fn bucket(&self, client: &Client) -> (BucketKey, TimeWindow) {
        match self.limit_type {
            LimitType::SystemWide => (BucketKey::System, TimeWindow::Second),
            LimitType::Window => (BucketKey::Window(client.id.clone()), TimeWindow::Minute),
            LimitType::Monthly => (BucketKey::Monthly(client.id.clone()), TimeWindow::Month),
        }
    }

    /// Consume one request from this scope's bucket.
    pub async fn evaluate(&self, client: &Client, tier: &Tier) -> Result<TierOutcome> {
        let algorithm = self.selector.current().await?;
        let capacity = self.capacity(tier);
        let (key, window) = self.bucket(client);

        let consumption = self
            .engine
            .try_consume(&key, capacity, window, 1, algorithm)
            .await?;

        let current = capacity.saturating_sub(consumption.remaining);
        let decision = match self.limit_type {
            LimitType::SystemWide => system_decision(&consumption, capacity),
            LimitType::Window => client_decision(
                LimitType::Window,
                &consumption,
                capacity,
                current,
                WINDOW_SOFT_THRESHOLD_PERCENT,
                consumption.retry_after_seconds(),
            ),
            LimitType::Monthly => client_decision(
                LimitType::Monthly,
                &consumption,
                capacity,
                current,
                MONTHLY_SOFT_THRESHOLD_PERCENT,
                0,
            ),
        };

        debug!(
            key = %key,
            limit_type = %self.limit_type,
            allowed = decision.allowed,
            current = decision.current_usage,
            limit = capacity,
            throttling = %decision.throttling_level,
            "Tier evaluated"
        );

        Ok(TierOutcome { decision, consumption })
    }
}

/// The system tier is binary: there is no per-client soft zone for global capacity.
fn system_decision(consumption: &ConsumeOutcome, capacity: u64) -> LimitDecision {
    let (throttling_level, message) = if consumption.consumed {
        (ThrottlingLevel::None, "System operating normally".to_string())
    } else {
        (
            ThrottlingLevel::Hard,
            "System capacity exceeded. Too many requests across all clients.".to_string(),
        )
    };

    LimitDecision {
        allowed: consumption.consumed,
        limit_type: LimitType::SystemWide,
        current_usage: capacity.saturating_sub(consumption.remaining),
        limit: capacity,
        remaining: consumption.remaining,
        retry_after_seconds: consumption.retry_after_seconds(),
        throttling_level,
        algorithm_used: consumption.algorithm,
        message,
    }
}

fn client_decision(
    limit_type: LimitType,
    consumption: &ConsumeOutcome,
    capacity: u64,
    current: u64,
    soft_threshold_percent: u64,
    retry_after_seconds: u64,
) -> LimitDecision {
    let threshold = soft_threshold(capacity, soft_threshold_percent);
    let throttling_level = classify(current, capacity, threshold);

    LimitDecision {
        allowed: consumption.consumed,
        limit_type,
        current_usage: current,
        limit: capacity,
        remaining: consumption.remaining,
        retry_after_seconds: if consumption.consumed { 0 } else { retry_after_seconds },
        throttling_level,
        algorithm_used: consumption.algorithm,
        message: throttling_message(throttling_level, current, capacity),
    }
}

/// `floor(capacity * percent / 100)`.
pub fn soft_threshold(capacity: u64, percent: u64) -> u64 {
    (capacity as u128 * percent as u128 / 100) as u64
}

/// Classify usage against a limit and its soft threshold.
pub fn classify(current: u64, capacity: u64, soft_threshold: u64) -> ThrottlingLevel {
    if current >= capacity {
        ThrottlingLevel::Hard
    } else if current >= soft_threshold {
        ThrottlingLevel::Soft
    } else {
        ThrottlingLevel::None
    }
}

fn throttling_message(level: ThrottlingLevel, current: u64, capacity: u64) -> String {
    match level {
        ThrottlingLevel::Hard => {
            format!("Rate limit exceeded ({}/{}). Request blocked.", current, capacity)
        }
        ThrottlingLevel::Soft => {
            let percentage = current as f64 * 100.0 / capacity as f64;
            format!(
                "Warning: Approaching limit ({:.1}%). Consider slowing down.",
                percentage
            )
        }
        ThrottlingLevel::None => "Normal operation".to_string(),
    }
}
