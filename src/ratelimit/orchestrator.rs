//! Multi-tier rate limit orchestration.
//!
//! Tiers always run in the same order: system-wide, then the client's
//! per-minute window, then the monthly quota. A client is never told its
//! monthly quota is exhausted while the system itself is overloaded.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::catalog::{Client, ThrottleMode, Tier, TierLookup};
use crate::error::{Result, TollgateError};

use super::algorithm::AlgorithmSelector;
use super::decision::LimitDecision;
use super::tier::TierEvaluator;

/// Behavior when the counter store is unreachable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailPolicy {
    /// Admit the request
    Open,
    /// Fail the decision with `StoreUnavailable`
    #[default]
    Closed,
}

/// Result of running one tier under the fail policy.
enum Step {
    Evaluated(LimitDecision),
    FailedOpen(LimitDecision),
}

/// Runs the three limit tiers and produces one decision per request.
pub struct RateLimitOrchestrator {
    /// `None` when system-wide limiting is disabled
    system: Option<TierEvaluator>,
    window: TierEvaluator,
    monthly: TierEvaluator,
    tiers: Arc<dyn TierLookup>,
    selector: Arc<AlgorithmSelector>,
    fail_policy: FailPolicy,
    default_soft_delay: Duration,
}

impl RateLimitOrchestrator {
    pub fn new(
        system: Option<TierEvaluator>,
        window: TierEvaluator,
        monthly: TierEvaluator,
        tiers: Arc<dyn TierLookup>,
        selector: Arc<AlgorithmSelector>,
    ) -> Self {
        Self {
            system,
            window,
            monthly,
            tiers,
            selector,
            fail_policy: FailPolicy::default(),
            default_soft_delay: Duration::from_millis(500),
        }
    }

    pub fn with_fail_policy(mut self, fail_policy: FailPolicy) -> Self {
        self.fail_policy = fail_policy;
        self
    }

    /// Soft-throttle delay for tiers that do not set their own.
    pub fn with_default_soft_delay(mut self, delay: Duration) -> Self {
        self.default_soft_delay = delay;
        self
    }

    pub fn selector(&self) -> &Arc<AlgorithmSelector> {
        &self.selector
    }

    /// Decide whether a request from `client` is admitted.
    pub async fn decide(&self, client: &Client) -> Result<LimitDecision> {
        self.decide_with_deadline(client, None).await
    }

    /// Decide, abandoning any soft-throttle delay that would run past `deadline`.
    ///
    /// An abandoned delay is reported the same way as a failed retry.
    pub async fn decide_with_deadline(&self, client: &Client, deadline: Option<Instant>) -> Result<LimitDecision> {
        let tier = self.tiers.tier(&client.tier_id).await?;
        self.decide_for_tier(client, &tier, deadline).await
    }

    async fn decide_for_tier(&self, client: &Client, tier: &Tier, deadline: Option<Instant>) -> Result<LimitDecision> {
        debug!(client_id = %client.id, tier = %tier.name, "Checking rate limits");

        if let Some(system) = &self.system {
            match self.run(system, client, tier).await? {
                Step::FailedOpen(decision) => return Ok(decision),
                Step::Evaluated(decision) if !decision.allowed => {
                    warn!(client_id = %client.id, "System-wide limit exceeded");
                    return Ok(decision);
                }
                Step::Evaluated(_) => {}
            }
        }

        let window = match self.run(&self.window, client, tier).await? {
            Step::FailedOpen(decision) => return Ok(decision),
            Step::Evaluated(decision) => decision,
        };

        let window_decision = if window.allowed {
            window
        } else if tier.throttle_mode == ThrottleMode::Soft {
            match self.soft_throttle(client, tier, window, deadline).await? {
                Step::FailedOpen(decision) => return Ok(decision),
                Step::Evaluated(decision) => decision,
            }
        } else {
            warn!(
                client_id = %client.id,
                retry_after = window.retry_after_seconds,
                "Window limit exceeded"
            );
            return Ok(window);
        };

        match self.run(&self.monthly, client, tier).await? {
            Step::FailedOpen(decision) => return Ok(decision),
            Step::Evaluated(decision) if !decision.allowed => {
                warn!(client_id = %client.id, "Monthly limit exceeded");
                return Ok(decision);
            }
            Step::Evaluated(_) => {}
        }

        debug!(
            client_id = %client.id,
            current = window_decision.current_usage,
            limit = window_decision.limit,
            "All rate limit checks passed"
        );
        Ok(window_decision)
    }

    /// Delay once, then re-evaluate the window bucket once.
    async fn soft_throttle(
        &self,
        client: &Client,
        tier: &Tier,
        rejected: LimitDecision,
        deadline: Option<Instant>,
    ) -> Result<Step> {
        let delay = tier
            .soft_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_soft_delay);

        info!(client_id = %client.id, delay_ms = delay.as_millis() as u64, "Soft throttle: delaying request");

        if !suspend(delay, deadline).await {
            warn!(client_id = %client.id, "Soft throttle interrupted by request deadline");
            return Ok(Step::Evaluated(rejected.soft_retry_exhausted()));
        }

        match self.run(&self.window, client, tier).await? {
            Step::Evaluated(retry) if retry.allowed => {
                info!(client_id = %client.id, "Soft throttle: request allowed after delay");
                Ok(Step::Evaluated(retry.soft_retry_admitted()))
            }
            Step::Evaluated(retry) => {
                warn!(client_id = %client.id, "Soft throttle: window still exhausted after delay");
                Ok(Step::Evaluated(retry.soft_retry_exhausted()))
            }
            failed_open => Ok(failed_open),
        }
    }

    /// Evaluate a tier, applying the fail policy to store outages.
    async fn run(&self, evaluator: &TierEvaluator, client: &Client, tier: &Tier) -> Result<Step> {
        match evaluator.evaluate(client, tier).await {
            Ok(outcome) => Ok(Step::Evaluated(outcome.decision)),
            Err(TollgateError::StoreUnavailable(reason)) if self.fail_policy == FailPolicy::Open => {
                warn!(
                    client_id = %client.id,
                    limit_type = %evaluator.limit_type(),
                    reason = %reason,
                    "Counter store unavailable, failing open"
                );
                let algorithm = match self.selector.current().await {
                    Ok(algorithm) => algorithm,
                    Err(e) => {
                        warn!(
                            error = %e,
                            fallback = %self.selector.default_algorithm(),
                            "Could not read rate limit algorithm, using default"
                        );
                        self.selector.default_algorithm()
                    }
                };
                Ok(Step::FailedOpen(LimitDecision::fail_open(
                    evaluator.limit_type(),
                    evaluator.capacity(tier),
                    algorithm,
                )))
            }
            Err(err) => Err(err),
        }
    }
}

/// Sleep for `delay` unless `deadline` comes first. Returns whether the full
/// delay elapsed.
async fn suspend(delay: Duration, deadline: Option<Instant>) -> bool {
    let Some(deadline) = deadline else {
        tokio::time::sleep(delay).await;
        return true;
    };

    tokio::select! {
        biased;
        _ = tokio::time::sleep(delay) => true,
        _ = tokio::time::sleep_until(deadline) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::ratelimit::algorithm::{ConfigEntry, ConfigRepository, MemoryConfigRepository};
    use crate::ratelimit::bucket::tests::{BrokenStore, StalledStore};
    use crate::ratelimit::bucket::BucketEngine;
    use crate::ratelimit::{Algorithm, LimitType, ThrottlingLevel};
    use crate::store::{AtomicCounterStore, ConsumeOutcome, ConsumeRequest, MemoryCounterStore, StoreError};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    const CATALOG: &str = r#"
tiers:
  - id: basic
    name: BASIC
    requests_per_minute: 10
    requests_per_month: 100000
  - id: pro
    name: PRO
    requests_per_minute: 100
    requests_per_month: 1000
  - id: soft
    name: SOFT
    requests_per_minute: 2
    requests_per_month: 100000
    throttle_mode: SOFT
    soft_delay_ms: 30000
  - id: soft_short
    name: SOFT_SHORT
    requests_per_minute: 2
    requests_per_month: 100000
    throttle_mode: SOFT
    soft_delay_ms: 100
  - id: tiny_month
    name: TINY_MONTH
    requests_per_minute: 1000
    requests_per_month: 5
clients:
  - id: basic_client
    api_key: k_basic
    tier: basic
  - id: other_basic
    api_key: k_other
    tier: basic
  - id: pro_client
    api_key: k_pro
    tier: pro
  - id: soft_client
    api_key: k_soft
    tier: soft
  - id: soft_short_client
    api_key: k_soft_short
    tier: soft_short
  - id: monthly_client
    api_key: k_monthly
    tier: tiny_month
"#;

    /// Records the time of every consume on window buckets.
    struct RecordingStore {
        inner: MemoryCounterStore,
        window_calls: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl AtomicCounterStore for RecordingStore {
        async fn consume(&self, request: ConsumeRequest) -> std::result::Result<ConsumeOutcome, StoreError> {
            if request.key.starts_with("window:") {
                self.window_calls.lock().push(Instant::now());
            }
            self.inner.consume(request).await
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    /// Store that fails for keys under one prefix and delegates the rest.
    struct PartialOutageStore {
        inner: MemoryCounterStore,
        failing_prefix: &'static str,
    }

    #[async_trait]
    impl AtomicCounterStore for PartialOutageStore {
        async fn consume(&self, request: ConsumeRequest) -> std::result::Result<ConsumeOutcome, StoreError> {
            if request.key.starts_with(self.failing_prefix) {
                return Err(StoreError::Connection("connection reset".to_string()));
            }
            self.inner.consume(request).await
        }

        fn name(&self) -> &'static str {
            "partial-outage"
        }
    }

    /// Configuration repository living in the same unreachable store.
    struct UnreachableConfig;

    #[async_trait]
    impl ConfigRepository for UnreachableConfig {
        async fn get(&self, _key: &str) -> Result<Option<ConfigEntry>> {
            Err(TollgateError::StoreUnavailable("config store down".to_string()))
        }

        async fn set(&self, _key: &str, _value: &str, _actor: &str) -> Result<ConfigEntry> {
            Err(TollgateError::StoreUnavailable("config store down".to_string()))
        }
    }

    fn partial_outage(failing_prefix: &'static str) -> Arc<dyn AtomicCounterStore> {
        Arc::new(PartialOutageStore {
            inner: MemoryCounterStore::new(),
            failing_prefix,
        })
    }

    struct Harness {
        orchestrator: RateLimitOrchestrator,
        catalog: Arc<Catalog>,
    }

    impl Harness {
        async fn client(&self, id: &str) -> Client {
            use crate::catalog::ClientLookup;
            self.catalog.client_by_id(id).await.unwrap()
        }
    }

    fn harness_with(store: Arc<dyn AtomicCounterStore>, system_rps: Option<u64>) -> Harness {
        let catalog = Arc::new(Catalog::from_yaml(CATALOG).unwrap());
        let engine = Arc::new(BucketEngine::new(store, Duration::from_millis(250)));
        let selector = Arc::new(AlgorithmSelector::new(
            Arc::new(MemoryConfigRepository::new()),
            Algorithm::TokenBucket,
        ));
        let system = system_rps.map(|rps| TierEvaluator::system(engine.clone(), selector.clone(), rps));
        let orchestrator = RateLimitOrchestrator::new(
            system,
            TierEvaluator::window(engine.clone(), selector.clone()),
            TierEvaluator::monthly(engine, selector.clone()),
            catalog.clone(),
            selector,
        );
        Harness {
            orchestrator,
            catalog,
        }
    }

    fn harness(system_rps: Option<u64>) -> Harness {
        harness_with(Arc::new(MemoryCounterStore::new()), system_rps)
    }

    #[tokio::test(start_paused = true)]
    async fn test_basic_tier_eleventh_request_rejected() {
        let h = harness(Some(1000));
        let client = h.client("basic_client").await;

        for i in 1..=10 {
            let decision = h.orchestrator.decide(&client).await.unwrap();
            assert!(decision.allowed, "Request {} should be allowed", i);
            assert_eq!(decision.limit_type, LimitType::Window);
        }

        let decision = h.orchestrator.decide(&client).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.limit_type, LimitType::Window);
        assert_eq!(decision.retry_after_seconds, 6);
        assert_eq!(decision.throttling_level, ThrottlingLevel::Hard);
        assert!(decision.clone().into_result().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_client_recovers_after_refill() {
        let h = harness(None);
        let client = h.client("basic_client").await;
        for _ in 0..10 {
            h.orchestrator.decide(&client).await.unwrap();
        }
        let rejected = h.orchestrator.decide(&client).await.unwrap();
        assert!(!rejected.allowed);

        tokio::time::advance(Duration::from_secs(rejected.retry_after_seconds)).await;
        assert!(h.orchestrator.decide(&client).await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_cap_short_circuits() {
        let h = harness(Some(1000));
        let basic = h.client("basic_client").await;
        let other = h.client("other_basic").await;
        let pro = h.client("pro_client").await;

        // 1000 requests spread over clients in the same instant
        for i in 0..1000 {
            let client = match i % 3 {
                0 => &basic,
                1 => &other,
                _ => &pro,
            };
            h.orchestrator.decide(client).await.unwrap();
        }

        // The monthly client has never been seen but still gets SYSTEM_WIDE
        let fresh = h.client("monthly_client").await;
        let decision = h.orchestrator.decide(&fresh).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.limit_type, LimitType::SystemWide);
        assert_eq!(decision.throttling_level, ThrottlingLevel::Hard);
        assert!(decision.retry_after_seconds >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_limit_disabled() {
        let h = harness_with(Arc::new(MemoryCounterStore::new()), None);
        let client = h.client("pro_client").await;

        // No system bucket, so only the client tiers apply
        for _ in 0..100 {
            let decision = h.orchestrator.decide(&client).await.unwrap();
            assert!(decision.allowed);
            assert_ne!(decision.limit_type, LimitType::SystemWide);
        }
        let decision = h.orchestrator.decide(&client).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.limit_type, LimitType::Window);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monthly_independent_of_window() {
        let h = harness(Some(1000));
        let client = h.client("monthly_client").await;

        for _ in 0..5 {
            let decision = h.orchestrator.decide(&client).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.throttling_level, ThrottlingLevel::None);
        }

        let decision = h.orchestrator.decide(&client).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.limit_type, LimitType::Monthly);
        assert_eq!(decision.retry_after_seconds, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_throttle_retry_succeeds() {
        let store = Arc::new(RecordingStore {
            inner: MemoryCounterStore::new(),
            window_calls: Mutex::new(Vec::new()),
        });
        let h = harness_with(store.clone(), Some(1000));
        let client = h.client("soft_client").await;

        h.orchestrator.decide(&client).await.unwrap();
        h.orchestrator.decide(&client).await.unwrap();

        // Window exhausted; one token refills every 30s, matching the delay
        let started = Instant::now();
        let decision = h.orchestrator.decide(&client).await.unwrap();

        assert!(decision.allowed);
        assert_eq!(decision.throttling_level, ThrottlingLevel::Soft);
        assert_eq!(decision.limit_type, LimitType::Window);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.message, "Request allowed after soft throttle delay");
        assert_eq!(started.elapsed(), Duration::from_secs(30));

        let calls = store.window_calls.lock().clone();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[3] - calls[2], Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_throttle_retry_exhausted() {
        let store = Arc::new(RecordingStore {
            inner: MemoryCounterStore::new(),
            window_calls: Mutex::new(Vec::new()),
        });
        let h = harness_with(store.clone(), None);
        let client = h.client("soft_short_client").await;

        h.orchestrator.decide(&client).await.unwrap();
        h.orchestrator.decide(&client).await.unwrap();

        let decision = h.orchestrator.decide(&client).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.throttling_level, ThrottlingLevel::Hard);
        assert_eq!(decision.retry_after_seconds, 60);
        assert_eq!(decision.limit_type, LimitType::Window);

        // Exactly one delayed retry
        let calls = store.window_calls.lock().clone();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[3] - calls[2], Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_throttle_interrupted_by_deadline() {
        let store = Arc::new(RecordingStore {
            inner: MemoryCounterStore::new(),
            window_calls: Mutex::new(Vec::new()),
        });
        let h = harness_with(store.clone(), None);
        let client = h.client("soft_client").await;

        h.orchestrator.decide(&client).await.unwrap();
        h.orchestrator.decide(&client).await.unwrap();

        let started = Instant::now();
        let deadline = started + Duration::from_secs(5);
        let decision = h
            .orchestrator
            .decide_with_deadline(&client, Some(deadline))
            .await
            .unwrap();

        assert!(decision.allowed);
        assert_eq!(decision.throttling_level, ThrottlingLevel::Hard);
        assert_eq!(decision.remaining, 0);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        // No retry was attempted
        assert_eq!(store.window_calls.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_throttle_does_not_block_other_clients() {
        let h = Arc::new(harness(None));
        let soft = h.client("soft_client").await;
        let basic = h.client("basic_client").await;

        h.orchestrator.decide(&soft).await.unwrap();
        h.orchestrator.decide(&soft).await.unwrap();

        let delayed = {
            let h = h.clone();
            tokio::spawn(async move { h.orchestrator.decide(&soft).await.unwrap() })
        };
        tokio::task::yield_now().await;

        let started = Instant::now();
        let decision = h.orchestrator.decide(&basic).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(started.elapsed(), Duration::ZERO);

        assert_eq!(delayed.await.unwrap().throttling_level, ThrottlingLevel::Soft);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_zone_warns_without_delay() {
        let h = harness(None);
        let client = h.client("basic_client").await;

        let mut last = None;
        for _ in 0..8 {
            last = Some(h.orchestrator.decide(&client).await.unwrap());
        }
        let decision = last.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.throttling_level, ThrottlingLevel::Soft);
        assert_eq!(decision.remaining, 2);
        assert!(decision.message.starts_with("Warning: Approaching limit (80.0%)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_algorithm_switch_only_affects_new_buckets() {
        let h = harness(Some(1000));
        let existing = h.client("basic_client").await;
        let decision = h.orchestrator.decide(&existing).await.unwrap();
        assert_eq!(decision.algorithm_used, Algorithm::TokenBucket);

        h.orchestrator
            .selector()
            .set("FIXED_WINDOW", "admin")
            .await
            .unwrap();

        let decision = h.orchestrator.decide(&existing).await.unwrap();
        assert_eq!(decision.algorithm_used, Algorithm::TokenBucket);
        assert_eq!(decision.remaining, 8);

        let newcomer = h.client("other_basic").await;
        let decision = h.orchestrator.decide(&newcomer).await.unwrap();
        assert_eq!(decision.algorithm_used, Algorithm::FixedWindow);
        assert_eq!(decision.remaining, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tier_change_applies_to_next_evaluation() {
        let h = harness(None);
        let client = h.client("basic_client").await;
        h.orchestrator.decide(&client).await.unwrap();

        use crate::catalog::TierLookup;
        let mut basic = h.catalog.tier("basic").await.unwrap();
        basic.requests_per_minute = 3;
        h.catalog.upsert_tier(basic);

        // Bucket had 9 tokens, clamped to the new capacity of 3
        let decision = h.orchestrator.decide(&client).await.unwrap();
        assert_eq!(decision.limit, 3);
        assert_eq!(decision.remaining, 2);
    }

    #[tokio::test]
    async fn test_unknown_tier() {
        let h = harness(None);
        let mut client = h.client("basic_client").await;
        client.tier_id = "gone".to_string();

        assert!(matches!(
            h.orchestrator.decide(&client).await,
            Err(TollgateError::UnknownClientOrTier(_))
        ));
    }

    #[tokio::test]
    async fn test_store_down_fails_closed_by_default() {
        let h = harness_with(Arc::new(BrokenStore), Some(1000));
        let client = h.client("basic_client").await;

        assert!(matches!(
            h.orchestrator.decide(&client).await,
            Err(TollgateError::StoreUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_fails_closed() {
        let h = harness_with(Arc::new(StalledStore), None);
        let client = h.client("basic_client").await;

        assert!(matches!(
            h.orchestrator.decide(&client).await,
            Err(TollgateError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_store_down_fail_open() {
        let mut h = harness_with(Arc::new(BrokenStore), Some(1000));
        h.orchestrator = h.orchestrator.with_fail_policy(FailPolicy::Open);
        let client = h.client("basic_client").await;

        let decision = h.orchestrator.decide(&client).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.limit_type, LimitType::SystemWide);
        assert_eq!(decision.limit, 1000);
        assert_eq!(decision.message, "Rate limit store unavailable; request admitted");
    }

    #[tokio::test]
    async fn test_window_store_down_fail_open() {
        let mut h = harness_with(partial_outage("window:"), Some(1000));
        h.orchestrator = h.orchestrator.with_fail_policy(FailPolicy::Open);
        let client = h.client("basic_client").await;

        let decision = h.orchestrator.decide(&client).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.limit_type, LimitType::Window);
        assert_eq!(decision.limit, 10);
        assert_eq!(decision.remaining, 10);
    }

    #[tokio::test]
    async fn test_monthly_store_down_fail_open() {
        let mut h = harness_with(partial_outage("monthly:"), Some(1000));
        h.orchestrator = h.orchestrator.with_fail_policy(FailPolicy::Open);
        let client = h.client("pro_client").await;

        let decision = h.orchestrator.decide(&client).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.limit_type, LimitType::Monthly);
        assert_eq!(decision.limit, 1000);
    }

    #[tokio::test]
    async fn test_monthly_store_down_fails_closed() {
        let h = harness_with(partial_outage("monthly:"), None);
        let client = h.client("pro_client").await;

        assert!(matches!(
            h.orchestrator.decide(&client).await,
            Err(TollgateError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_fail_open_with_unreadable_algorithm_uses_default() {
        let catalog = Arc::new(Catalog::from_yaml(CATALOG).unwrap());
        let engine = Arc::new(BucketEngine::new(Arc::new(BrokenStore), Duration::from_millis(250)));
        let selector = Arc::new(AlgorithmSelector::new(Arc::new(UnreachableConfig), Algorithm::FixedWindow));
        let orchestrator = RateLimitOrchestrator::new(
            None,
            TierEvaluator::window(engine.clone(), selector.clone()),
            TierEvaluator::monthly(engine, selector.clone()),
            catalog.clone(),
            selector,
        )
        .with_fail_policy(FailPolicy::Open);
        let h = Harness { orchestrator, catalog };
        let client = h.client("basic_client").await;

        let decision = h.orchestrator.decide(&client).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.limit_type, LimitType::Window);
        assert_eq!(decision.algorithm_used, Algorithm::FixedWindow);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_rejection_waits_for_window_end() {
        let h = harness(None);
        h.orchestrator
            .selector()
            .set("FIXED_WINDOW", "admin")
            .await
            .unwrap();
        let client = h.client("basic_client").await;

        // Window opens with the first request
        let first = h.orchestrator.decide(&client).await.unwrap();
        assert_eq!(first.algorithm_used, Algorithm::FixedWindow);

        tokio::time::advance(Duration::from_secs(10)).await;
        for _ in 0..9 {
            assert!(h.orchestrator.decide(&client).await.unwrap().allowed);
        }

        let decision = h.orchestrator.decide(&client).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.limit_type, LimitType::Window);
        assert_eq!(decision.algorithm_used, Algorithm::FixedWindow);
        assert_eq!(decision.retry_after_seconds, 50);

        // Nothing is admitted before the window ends, everything after it
        tokio::time::advance(Duration::from_secs(49)).await;
        assert!(!h.orchestrator.decide(&client).await.unwrap().allowed);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(h.orchestrator.decide(&client).await.unwrap().allowed);
    }
}
