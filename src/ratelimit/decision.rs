//! The per-request limit decision and its header projection.

use std::fmt;

use crate::error::{Result, TollgateError};

use super::Algorithm;

/// Retry hint for a soft-throttled client whose retry also failed.
pub const SOFT_THROTTLE_RETRY_AFTER_SECS: u64 = 60;

/// Which limit produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitType {
    SystemWide,
    Window,
    Monthly,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::SystemWide => "SYSTEM_WIDE",
            LimitType::Window => "WINDOW",
            LimitType::Monthly => "MONTHLY",
        }
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How close a client is to exhausting a limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ThrottlingLevel {
    #[default]
    None,
    Soft,
    Hard,
}

impl ThrottlingLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThrottlingLevel::None => "NONE",
            ThrottlingLevel::Soft => "SOFT",
            ThrottlingLevel::Hard => "HARD",
        }
    }
}

impl fmt::Display for ThrottlingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of rate limiting one request. Never persisted.
///
/// `allowed` alone does not mean the client has capacity left: a
/// soft-throttled client whose retry failed is reported with `allowed` set,
/// `remaining == 0` and [`ThrottlingLevel::Hard`]. Check
/// [`LimitDecision::throttling_level`] as well.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitDecision {
    pub allowed: bool,
    pub limit_type: LimitType,
    pub current_usage: u64,
    pub limit: u64,
    pub remaining: u64,
    pub retry_after_seconds: u64,
    pub throttling_level: ThrottlingLevel,
    pub algorithm_used: Algorithm,
    pub message: String,
}

impl LimitDecision {
    /// HTTP status the caller should answer with.
    pub fn http_status(&self) -> u16 {
        if self.allowed {
            200
        } else {
            429
        }
    }

    /// Headers describing this decision.
    ///
    /// Admitted requests get the `X-RateLimit-*` set plus a warning when soft
    /// throttled; rejected requests get `Retry-After` as well.
    pub fn response_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Type", self.limit_type.to_string()),
            ("X-RateLimit-Throttling-Level", self.throttling_level.to_string()),
            ("X-RateLimit-Algorithm", self.algorithm_used.to_string()),
        ];
        if self.throttling_level == ThrottlingLevel::Soft {
            headers.push(("X-RateLimit-Warning", self.message.clone()));
        }
        if !self.allowed {
            headers.push(("Retry-After", self.retry_after_seconds.to_string()));
        }
        headers
    }

    /// Turn a rejection into [`TollgateError::LimitExceeded`].
    pub fn into_result(self) -> Result<LimitDecision> {
        if self.allowed {
            return Ok(self);
        }
        Err(TollgateError::LimitExceeded {
            limit_type: self.limit_type,
            current_usage: self.current_usage,
            limit: self.limit,
            retry_after_seconds: self.retry_after_seconds,
            message: self.message,
        })
    }

    /// Decision after a soft-throttle retry found capacity.
    pub(crate) fn soft_retry_admitted(mut self) -> Self {
        self.allowed = true;
        self.throttling_level = ThrottlingLevel::Soft;
        self.retry_after_seconds = 0;
        self.message = "Request allowed after soft throttle delay".to_string();
        self
    }

    /// Decision after a soft-throttle retry still found the window exhausted.
    pub(crate) fn soft_retry_exhausted(mut self) -> Self {
        self.allowed = true;
        self.remaining = 0;
        self.retry_after_seconds = SOFT_THROTTLE_RETRY_AFTER_SECS;
        self.throttling_level = ThrottlingLevel::Hard;
        self.message = format!(
            "Rate limit exceeded even after soft throttle. Retry after {} seconds.",
            SOFT_THROTTLE_RETRY_AFTER_SECS
        );
        self
    }

    /// Admitting decision used when the counter store is down and the
    /// fail-open policy is active.
    pub(crate) fn fail_open(limit_type: LimitType, limit: u64, algorithm: Algorithm) -> Self {
        Self {
            allowed: true,
            limit_type,
            current_usage: 0,
            limit,
            remaining: limit,
            retry_after_seconds: 0,
            throttling_level: ThrottlingLevel::None,
            algorithm_used: algorithm,
            message: "Rate limit store unavailable; request admitted".to_string(),
        }
    }
}
