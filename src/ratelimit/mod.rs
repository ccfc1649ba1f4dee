//! Rate limiting logic: bucket engine, tier evaluation and orchestration.

mod algorithm;
mod backend;
mod bucket;
mod decision;
mod gate;
mod orchestrator;
mod tier;

pub use algorithm::{
    Algorithm, AlgorithmSelector, AlgorithmSetting, ConfigEntry, ConfigRepository, MemoryConfigRepository,
    ALGORITHM_CONFIG_KEY,
};
pub use backend::RateLimitBackend;
pub use bucket::{BucketEngine, BucketKey, TimeWindow};
pub use decision::{LimitDecision, LimitType, ThrottlingLevel, SOFT_THROTTLE_RETRY_AFTER_SECS};
pub use gate::RateLimitGate;
pub use orchestrator::{FailPolicy, RateLimitOrchestrator};
pub use tier::{classify, soft_threshold, TierEvaluator, TierOutcome};

#[cfg(test)]
pub(crate) use gate::tests::test_gate;
