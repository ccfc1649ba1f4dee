//! Bucket arithmetic shared by the store implementations.
//!
//! Timestamps are nanoseconds on the store's own clock. The Redis script
//! mirrors this logic in microseconds.

use std::time::Duration;

use crate::ratelimit::Algorithm;

use super::ConsumeOutcome;

/// Persisted state of a single bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    /// Algorithm fixed at creation
    pub algorithm: Algorithm,
    /// Available tokens (token bucket) or consumed count (fixed window)
    pub level: u64,
    /// Last refill (token bucket) or current window start (fixed window)
    pub stamp: u64,
}

impl BucketState {
    /// A freshly created bucket: full for token bucket, empty window otherwise.
    pub fn new(algorithm: Algorithm, capacity: u64, now: u64) -> Self {
        let level = match algorithm {
            Algorithm::TokenBucket => capacity,
            Algorithm::FixedWindow => 0,
        };
        Self {
            algorithm,
            level,
            stamp: now,
        }
    }

    /// Advance to `now` and try to take `tokens`.
    pub fn consume(&mut self, capacity: u64, period: Duration, tokens: u64, now: u64) -> ConsumeOutcome {
        let period = period_nanos(period);
        self.advance(capacity, period, now);

        let (consumed, remaining, nanos_to_refill) = match self.algorithm {
            Algorithm::TokenBucket => {
                if capacity > 0 && tokens <= self.level {
                    self.level -= tokens;
                    (true, self.level, 0)
                } else {
                    (false, self.level, self.token_wait(capacity, period, tokens, now))
                }
            }
            Algorithm::FixedWindow => {
                let window_end = self.stamp.saturating_add(period);
                if self.level.saturating_add(tokens) <= capacity && tokens <= capacity && capacity > 0 {
                    self.level += tokens;
                    (true, capacity - self.level, 0)
                } else {
                    (
                        false,
                        capacity.saturating_sub(self.level),
                        window_end.saturating_sub(now),
                    )
                }
            }
        };

        ConsumeOutcome {
            consumed,
            remaining,
            nanos_to_refill,
            algorithm: self.algorithm,
        }
    }

    /// How long the bucket must be kept before it is indistinguishable from a
    /// fresh one, i.e. until it is full again or its window has closed.
    pub fn time_to_reset(&self, capacity: u64, period: Duration, now: u64) -> Duration {
        let period = period_nanos(period);
        let nanos = match self.algorithm {
            Algorithm::TokenBucket => {
                if capacity == 0 || self.level >= capacity {
                    0
                } else {
                    let missing = (capacity - self.level) as u128;
                    let full_after = div_ceil(missing * period as u128, capacity as u128);
                    clamp_u64(full_after).saturating_sub(now.saturating_sub(self.stamp))
                }
            }
            Algorithm::FixedWindow => self.stamp.saturating_add(period).saturating_sub(now),
        };
        Duration::from_nanos(nanos)
    }

    fn advance(&mut self, capacity: u64, period: u64, now: u64) {
        match self.algorithm {
            Algorithm::TokenBucket => {
                if self.level >= capacity {
                    self.level = capacity;
                    self.stamp = now;
                    return;
                }
                let elapsed = now.saturating_sub(self.stamp) as u128;
                let refill = clamp_u64(elapsed * capacity as u128 / period as u128);
                if refill == 0 {
                    return;
                }
                let level = self.level.saturating_add(refill);
                if level >= capacity {
                    self.level = capacity;
                    self.stamp = now;
                } else {
                    // Keep the fractional remainder of the next token.
                    self.level = level;
                    self.stamp += clamp_u64(refill as u128 * period as u128 / capacity as u128);
                }
            }
            Algorithm::FixedWindow => {
                let elapsed = now.saturating_sub(self.stamp);
                if elapsed >= period {
                    self.stamp += (elapsed / period) * period;
                    self.level = 0;
                }
            }
        }
    }

    fn token_wait(&self, capacity: u64, period: u64, tokens: u64, now: u64) -> u64 {
        if capacity == 0 || tokens > capacity {
            return period;
        }
        let deficit = (tokens - self.level) as u128;
        let needed = clamp_u64(div_ceil(deficit * period as u128, capacity as u128));
        needed.saturating_sub(now.saturating_sub(self.stamp)).max(1)
    }
}

fn period_nanos(period: Duration) -> u64 {
    clamp_u64(period.as_nanos()).max(1)
}

fn div_ceil(a: u128, b: u128) -> u128 {
    (a + b - 1) / b
}

fn clamp_u64(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}
