//! Redis-backed counter store.
//!
//! Each consume is one `EVALSHA` of a Lua script, so the read-modify-write of
//! a bucket is atomic across every instance talking to the same Redis. The
//! script uses Redis' own clock, which keeps instances with skewed clocks
//! consistent.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info};

use crate::ratelimit::Algorithm;

use super::{AtomicCounterStore, ConsumeOutcome, ConsumeRequest, StoreError};

/// Bucket consume script. Mirrors `BucketState::consume` in microseconds.
///
/// KEYS[1] bucket key
/// ARGV[1] capacity, ARGV[2] period (us), ARGV[3] tokens,
/// ARGV[4] algorithm code for new buckets, ARGV[5] keep-after-refill (us)
///
/// Returns {consumed, remaining, wait_us, algorithm_code}.
const CONSUME_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local period = math.max(tonumber(ARGV[2]), 1)
local tokens = tonumber(ARGV[3])
local keep = tonumber(ARGV[5])

local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000000 + tonumber(t[2])

local alg, level, stamp
local stored = redis.call('HMGET', KEYS[1], 'alg', 'level', 'stamp')
if stored[1] then
  alg = tonumber(stored[1])
  level = tonumber(stored[2])
  stamp = tonumber(stored[3])
else
  alg = tonumber(ARGV[4])
  stamp = now
  if alg == 0 then level = capacity else level = 0 end
end

local consumed = 0
local remaining = 0
local wait = 0
local reset = 0

if alg == 0 then
  if level >= capacity then
    level = capacity
    stamp = now
  else
    local refill = math.floor((now - stamp) * capacity / period)
    if refill > 0 then
      if level + refill >= capacity then
        level = capacity
        stamp = now
      else
        level = level + refill
        stamp = stamp + math.floor(refill * period / capacity)
      end
    end
  end
  if capacity > 0 and tokens <= level then
    level = level - tokens
    consumed = 1
  elseif capacity == 0 or tokens > capacity then
    wait = period
  else
    wait = math.max(math.ceil((tokens - level) * period / capacity) - (now - stamp), 1)
  end
  remaining = level
  if capacity > 0 and level < capacity then
    reset = math.max(math.ceil((capacity - level) * period / capacity) - (now - stamp), 0)
  end
else
  if now - stamp >= period then
    stamp = stamp + math.floor((now - stamp) / period) * period
    level = 0
  end
  if capacity > 0 and tokens <= capacity and level + tokens <= capacity then
    level = level + tokens
    consumed = 1
  else
    wait = math.max(stamp + period - now, 0)
  end
  remaining = math.max(capacity - level, 0)
  reset = math.max(stamp + period - now, 0)
end

redis.call('HSET', KEYS[1],
  'alg', alg,
  'level', string.format('%.0f', level),
  'stamp', string.format('%.0f', stamp))
redis.call('PEXPIRE', KEYS[1], math.max(math.ceil((reset + keep) / 1000), 1))

return {consumed, remaining, wait, alg}
"#;

/// Counter store shared through Redis.
pub struct RedisCounterStore {
    connection: ConnectionManager,
    script: Script,
    key_prefix: String,
    keep_after_refill: Duration,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("key_prefix", &self.key_prefix)
            .field("keep_after_refill", &self.keep_after_refill)
            .finish()
    }
}

impl RedisCounterStore {
    /// Connect to Redis and prepare the consume script.
    pub async fn connect(
        url: &str,
        key_prefix: impl Into<String>,
        keep_after_refill: Duration,
    ) -> Result<Self, StoreError> {
        info!(url = %url, "Connecting to Redis counter store");

        let client = redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!("Redis counter store connected");

        Ok(Self {
            connection,
            script: Script::new(CONSUME_SCRIPT),
            key_prefix: key_prefix.into(),
            keep_after_refill,
        })
    }

    fn qualified_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl AtomicCounterStore for RedisCounterStore {
    async fn consume(&self, request: ConsumeRequest) -> Result<ConsumeOutcome, StoreError> {
        let key = self.qualified_key(&request.key);
        let mut connection = self.connection.clone();

        let (consumed, remaining, wait_us, alg): (i64, i64, i64, i64) = self
            .script
            .key(&key)
            .arg(request.capacity)
            .arg(micros(request.period))
            .arg(request.tokens)
            .arg(request.algorithm.code())
            .arg(micros(self.keep_after_refill))
            .invoke_async(&mut connection)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;

        let algorithm = Algorithm::from_code(alg)
            .ok_or_else(|| StoreError::Protocol(format!("unknown algorithm code {alg} for {key}")))?;

        debug!(
            key = %key,
            consumed = consumed == 1,
            remaining = remaining,
            "Redis bucket consume"
        );

        Ok(ConsumeOutcome {
            consumed: consumed == 1,
            remaining: remaining.max(0) as u64,
            nanos_to_refill: (wait_us.max(0) as u64).saturating_mul(1_000),
            algorithm,
        })
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}
