//! Calendar-month usage accounting.
//!
//! Independent of the monthly bucket: the bucket enforces a rolling quota,
//! this module reports how much of the current calendar month a client used.

use chrono::{DateTime, Datelike, Months, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::catalog::{Client, Tier};

/// Month key in `YYYY-MM` form.
pub fn month_key(at: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", at.year(), at.month())
}

/// Usage of one client during one calendar month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthlyUsage {
    pub client_id: String,
    pub month: String,
    pub total_requests: u64,
    pub rate_limit_hits: u64,
    pub last_updated: DateTime<Utc>,
}

impl MonthlyUsage {
    fn empty(client_id: &str, month: String, at: DateTime<Utc>) -> Self {
        Self {
            client_id: client_id.to_string(),
            month,
            total_requests: 0,
            rate_limit_hits: 0,
            last_updated: at,
        }
    }
}

/// Usage summary against a client's tier.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageReport {
    pub client_id: String,
    pub client_name: String,
    pub tier_name: String,
    pub current_month: String,
    pub total_requests: u64,
    pub rate_limit_hits: u64,
    pub requests_per_month: u64,
    pub requests_per_minute: u64,
    pub remaining_requests: u64,
    pub percentage_used: f64,
}

impl UsageReport {
    pub fn new(client: &Client, tier: &Tier, usage: &MonthlyUsage) -> Self {
        let remaining_requests = tier.requests_per_month.saturating_sub(usage.total_requests);
        let percentage_used = if tier.requests_per_month == 0 {
            100.0
        } else {
            (usage.total_requests as f64 * 100.0 / tier.requests_per_month as f64).min(100.0)
        };

        Self {
            client_id: client.id.clone(),
            client_name: client.display_name().to_string(),
            tier_name: tier.name.clone(),
            current_month: usage.month.clone(),
            total_requests: usage.total_requests,
            rate_limit_hits: usage.rate_limit_hits,
            requests_per_month: tier.requests_per_month,
            requests_per_minute: tier.requests_per_minute,
            remaining_requests,
            percentage_used,
        }
    }
}

/// Months of history kept per client unless configured otherwise.
pub const DEFAULT_RETENTION_MONTHS: u32 = 12;

/// Months returned by a history query that does not name a count.
pub const DEFAULT_HISTORY_MONTHS: usize = 6;

/// In-process usage counters keyed by client and month.
///
/// Only the most recent `retention_months` calendar months are kept; older
/// months are dropped whenever a new month is first recorded.
#[derive(Debug)]
pub struct UsageTracker {
    months: DashMap<(String, String), MonthlyUsage>,
    retention_months: u32,
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION_MONTHS)
    }
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `months` calendar months, the current one included.
    pub fn with_retention(months: u32) -> Self {
        Self {
            months: DashMap::new(),
            retention_months: months.max(1),
        }
    }

    /// Record one decision in the current month.
    pub fn record(&self, client_id: &str, allowed: bool) {
        self.record_at(client_id, allowed, Utc::now());
    }

    /// Record one decision at `at`. Admitted requests count toward
    /// `total_requests`; rejections count as rate limit hits.
    pub fn record_at(&self, client_id: &str, allowed: bool, at: DateTime<Utc>) {
        let month = month_key(at);
        let mut created = false;
        {
            let mut usage = self
                .months
                .entry((client_id.to_string(), month.clone()))
                .or_insert_with(|| {
                    created = true;
                    MonthlyUsage::empty(client_id, month, at)
                });

            if allowed {
                usage.total_requests += 1;
            } else {
                usage.rate_limit_hits += 1;
            }
            usage.last_updated = at;
        }

        if created {
            self.prune(at);
        }
    }

    /// Drop months older than the retention window ending at `at`.
    /// Returns how many entries were removed.
    pub fn prune(&self, at: DateTime<Utc>) -> usize {
        let Some(cutoff) = retention_cutoff(at, self.retention_months) else {
            return 0;
        };
        let before = self.months.len();
        self.months.retain(|(_, month), _| *month >= cutoff);
        let removed = before - self.months.len();
        if removed > 0 {
            debug!(removed, cutoff = %cutoff, "Pruned old usage months");
        }
        removed
    }

    /// Usage for the current month; zeroed if nothing was recorded yet.
    pub fn current(&self, client_id: &str) -> MonthlyUsage {
        self.for_month(client_id, Utc::now())
    }

    /// Usage for the month containing `at`.
    pub fn for_month(&self, client_id: &str, at: DateTime<Utc>) -> MonthlyUsage {
        let month = month_key(at);
        self.months
            .get(&(client_id.to_string(), month.clone()))
            .map(|usage| usage.clone())
            .unwrap_or_else(|| MonthlyUsage::empty(client_id, month, at))
    }

    /// The client's most recent `months` recorded months, newest first.
    pub fn history(&self, client_id: &str, months: usize) -> Vec<MonthlyUsage> {
        let mut history: Vec<MonthlyUsage> = self
            .months
            .iter()
            .filter(|entry| entry.key().0 == client_id)
            .map(|entry| entry.value().clone())
            .collect();
        history.sort_by(|a, b| b.month.cmp(&a.month));
        history.truncate(months);
        history
    }

    /// Every client with usage recorded in the month containing `at`,
    /// ordered by client id.
    pub fn month_usage(&self, at: DateTime<Utc>) -> Vec<MonthlyUsage> {
        let month = month_key(at);
        let mut usage: Vec<MonthlyUsage> = self
            .months
            .iter()
            .filter(|entry| entry.key().1 == month)
            .map(|entry| entry.value().clone())
            .collect();
        usage.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        usage
    }
}

/// First month key inside a window of `months` months ending at `at`.
fn retention_cutoff(at: DateTime<Utc>, months: u32) -> Option<String> {
    let first_of_month = at.with_day(1)?;
    let oldest = first_of_month.checked_sub_months(Months::new(months.saturating_sub(1)))?;
    Some(month_key(oldest))
}
