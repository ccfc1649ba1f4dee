//! Request entry point: resolves the caller and runs the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::catalog::{ClientLookup, TierLookup};
use crate::error::{Result, TollgateError};
use crate::usage::{UsageReport, UsageTracker};

use super::algorithm::AlgorithmSetting;
use super::backend::RateLimitBackend;
use super::decision::LimitDecision;
use super::orchestrator::RateLimitOrchestrator;

/// Resolves API keys to clients, enforces limits and records usage.
pub struct RateLimitGate {
    clients: Arc<dyn ClientLookup>,
    tiers: Arc<dyn TierLookup>,
    orchestrator: Arc<RateLimitOrchestrator>,
    usage: Arc<UsageTracker>,
    /// Upper bound on a decision, soft-throttle delay included
    request_timeout: Duration,
}

impl RateLimitGate {
    pub fn new(
        clients: Arc<dyn ClientLookup>,
        tiers: Arc<dyn TierLookup>,
        orchestrator: Arc<RateLimitOrchestrator>,
        usage: Arc<UsageTracker>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            clients,
            tiers,
            orchestrator,
            usage,
            request_timeout,
        }
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    /// Decide for the client owning `api_key`.
    pub async fn check(&self, api_key: &str) -> Result<LimitDecision> {
        let client = self.clients.client_by_api_key(api_key).await?;
        if !client.active {
            warn!(client_id = %client.id, "Request from inactive client");
            return Err(TollgateError::InactiveClient(client.id));
        }

        let deadline = Instant::now() + self.request_timeout;
        let decision = self
            .orchestrator
            .decide_with_deadline(&client, Some(deadline))
            .await?;

        self.usage.record(&client.id, decision.allowed);

        debug!(
            client_id = %client.id,
            allowed = decision.allowed,
            limit_type = %decision.limit_type,
            throttling = %decision.throttling_level,
            "Decision made"
        );
        Ok(decision)
    }

    /// Calendar-month usage of a client against its tier.
    pub async fn report(&self, client_id: &str) -> Result<UsageReport> {
        let client = self.clients.client_by_id(client_id).await?;
        let tier = self.tiers.tier(&client.tier_id).await?;
        let usage = self.usage.current(&client.id);
        Ok(UsageReport::new(&client, &tier, &usage))
    }

    /// Usage history of a client, each month reported against its current tier.
    pub async fn history(&self, client_id: &str, months: usize) -> Result<Vec<UsageReport>> {
        let client = self.clients.client_by_id(client_id).await?;
        let tier = self.tiers.tier(&client.tier_id).await?;
        Ok(self
            .usage
            .history(&client.id, months)
            .iter()
            .map(|usage| UsageReport::new(&client, &tier, usage))
            .collect())
    }

    /// Current-month reports for every client with recorded usage. Clients
    /// that no longer resolve are left out.
    pub async fn current_month_reports(&self) -> Result<Vec<UsageReport>> {
        let mut reports = Vec::new();
        for usage in self.usage.month_usage(Utc::now()) {
            let client = match self.clients.client_by_id(&usage.client_id).await {
                Ok(client) => client,
                Err(err) => {
                    debug!(client_id = %usage.client_id, error = %err, "Skipping usage of unknown client");
                    continue;
                }
            };
            let tier = match self.tiers.tier(&client.tier_id).await {
                Ok(tier) => tier,
                Err(err) => {
                    debug!(client_id = %client.id, error = %err, "Skipping usage of client without tier");
                    continue;
                }
            };
            reports.push(UsageReport::new(&client, &tier, &usage));
        }
        Ok(reports)
    }
}

#[async_trait]
impl RateLimitBackend for RateLimitGate {
    async fn decide(&self, api_key: &str) -> Result<LimitDecision> {
        self.check(api_key).await
    }

    async fn algorithm_setting(&self) -> Result<AlgorithmSetting> {
        self.orchestrator.selector().setting().await
    }

    async fn set_algorithm(&self, value: &str, actor: &str) -> Result<AlgorithmSetting> {
        self.orchestrator.selector().set(value, actor).await
    }

    async fn usage_report(&self, client_id: &str) -> Result<UsageReport> {
        self.report(client_id).await
    }

    async fn usage_history(&self, client_id: &str, months: usize) -> Result<Vec<UsageReport>> {
        self.history(client_id, months).await
    }

    async fn list_usage(&self) -> Result<Vec<UsageReport>> {
        self.current_month_reports().await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::ratelimit::algorithm::{AlgorithmSelector, MemoryConfigRepository};
    use crate::ratelimit::bucket::BucketEngine;
    use crate::ratelimit::tier::TierEvaluator;
    use crate::ratelimit::{Algorithm, ThrottlingLevel};
    use crate::store::MemoryCounterStore;

    pub(crate) const CATALOG: &str = r#"
tiers:
  - id: basic
    name: BASIC
    requests_per_minute: 3
    requests_per_month: 1000
  - id: soft
    name: SOFT
    requests_per_minute: 1
    requests_per_month: 1000
    throttle_mode: SOFT
    soft_delay_ms: 120000
clients:
  - id: acme
    name: Acme Corp
    api_key: sk_acme
    tier: basic
  - id: slowpoke
    api_key: sk_slow
    tier: soft
  - id: dormant
    api_key: sk_dormant
    tier: basic
    active: false
"#;

    /// Gate over in-memory stores and [`CATALOG`].
    pub(crate) fn test_gate(request_timeout: Duration) -> RateLimitGate {
        let catalog = Arc::new(Catalog::from_yaml(CATALOG).unwrap());
        let engine = Arc::new(BucketEngine::new(
            Arc::new(MemoryCounterStore::new()),
            Duration::from_millis(250),
        ));
        let selector = Arc::new(AlgorithmSelector::new(
            Arc::new(MemoryConfigRepository::new()),
            Algorithm::TokenBucket,
        ));
        let orchestrator = RateLimitOrchestrator::new(
            Some(TierEvaluator::system(engine.clone(), selector.clone(), 1000)),
            TierEvaluator::window(engine.clone(), selector.clone()),
            TierEvaluator::monthly(engine, selector.clone()),
            catalog.clone(),
            selector,
        );
        RateLimitGate::new(
            catalog.clone(),
            catalog,
            Arc::new(orchestrator),
            Arc::new(UsageTracker::new()),
            request_timeout,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_decide_records_usage() {
        let gate = test_gate(Duration::from_secs(5));

        for _ in 0..3 {
            assert!(gate.decide("sk_acme").await.unwrap().allowed);
        }
        assert!(!gate.decide("sk_acme").await.unwrap().allowed);

        let report = gate.usage_report("acme").await.unwrap();
        assert_eq!(report.client_name, "Acme Corp");
        assert_eq!(report.total_requests, 3);
        assert_eq!(report.rate_limit_hits, 1);
        assert_eq!(report.remaining_requests, 997);
    }

    #[tokio::test]
    async fn test_unknown_api_key() {
        let gate = test_gate(Duration::from_secs(5));
        assert!(matches!(
            gate.decide("sk_nobody").await,
            Err(TollgateError::UnknownClientOrTier(_))
        ));
    }

    #[tokio::test]
    async fn test_inactive_client_rejected() {
        let gate = test_gate(Duration::from_secs(5));
        assert!(matches!(
            gate.decide("sk_dormant").await,
            Err(TollgateError::InactiveClient(id)) if id == "dormant"
        ));
        assert_eq!(gate.usage().current("dormant").total_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_bounds_soft_delay() {
        let gate = test_gate(Duration::from_secs(5));
        gate.decide("sk_slow").await.unwrap();

        let started = Instant::now();
        let decision = gate.decide("sk_slow").await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(decision.throttling_level, ThrottlingLevel::Hard);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_algorithm_round_trip() {
        let gate = test_gate(Duration::from_secs(5));
        assert_eq!(
            gate.algorithm_setting().await.unwrap().algorithm,
            Algorithm::TokenBucket
        );

        let setting = gate.set_algorithm("FIXED_WINDOW", "ops").await.unwrap();
        assert_eq!(setting.algorithm, Algorithm::FixedWindow);
        assert_eq!(setting.updated_by.as_deref(), Some("ops"));

        assert!(matches!(
            gate.set_algorithm("LEAKY_BUCKET", "ops").await,
            Err(TollgateError::InvalidConfiguration(_))
        ));
        assert_eq!(
            gate.algorithm_setting().await.unwrap().algorithm,
            Algorithm::FixedWindow
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_and_listing() {
        let gate = test_gate(Duration::from_secs(5));
        gate.decide("sk_acme").await.unwrap();
        gate.decide("sk_acme").await.unwrap();
        gate.decide("sk_slow").await.unwrap();

        let history = gate.usage_history("acme", 6).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].total_requests, 2);
        assert_eq!(history[0].tier_name, "BASIC");
        assert!(gate.usage_history("acme", 0).await.unwrap().is_empty());
        assert!(matches!(
            gate.usage_history("ghost", 6).await,
            Err(TollgateError::UnknownClientOrTier(_))
        ));

        let listing = gate.list_usage().await.unwrap();
        let clients: Vec<&str> = listing.iter().map(|r| r.client_id.as_str()).collect();
        assert_eq!(clients, vec!["acme", "slowpoke"]);
        assert_eq!(listing[1].total_requests, 1);
    }
}
