//! Redis-backed shared state: the global token bucket and idempotency markers.

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, FromRedisValue, RedisError, Script};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SynthesisError};
use crate::idempotency::{IdempotencyRecord, IdempotencyStore};
use crate::key_generator::KeyGenerator;
use crate::store::{BucketLimits, BucketReading, TokenStore};

/// Refill by elapsed server time, cap, then consume. Runs atomically on the
/// Redis server so concurrent callers in any process never overdraw.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local ttl_ms = tonumber(ARGV[4])

local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

local state = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end

tokens = math.min(capacity, tokens + math.max(0, now - ts) * rate / 1000)

local allowed = 0
if tokens >= requested then
  tokens = tokens - requested
  allowed = 1
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'ts', tostring(now))
redis.call('PEXPIRE', key, ttl_ms)
return {allowed, tostring(tokens)}
"#;

const TOKEN_PEEK_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  return tostring(capacity)
end

local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
return tostring(math.min(capacity, tokens + math.max(0, now - ts) * rate / 1000))
"#;

fn store_err(context: &str) -> impl Fn(RedisError) -> SynthesisError + '_ {
    move |e| SynthesisError::StoreUnavailable(format!("{}: {}", context, e))
}

/// Shared multiplexed connection. Cheap to clone per command.
pub struct RedisClient {
    connection: MultiplexedConnection,
}

impl RedisClient {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(store_err("Failed to create Redis client"))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_err("Failed to connect to Redis"))?;

        tracing::info!("Connected to Redis");
        Ok(Self { connection })
    }

    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection();
        let _: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_err("Ping failed"))?;
        Ok(())
    }

    pub async fn eval_script<T: FromRedisValue>(
        &self,
        script: &Script,
        keys: &[&str],
        args: &[String],
    ) -> Result<T> {
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(arg.as_str());
        }

        let mut conn = self.connection();
        invocation
            .invoke_async(&mut conn)
            .await
            .map_err(store_err("Script execution failed"))
    }

    pub async fn set_with_expiry(&self, key: &str, value: &str, expiry: Duration) -> Result<()> {
        let mut conn = self.connection();
        ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(expiry.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_err("SET failed"))
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection();
        ::redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_err("GET failed"))
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection();
        let count: i64 = ::redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_err("EXISTS failed"))?;
        Ok(count > 0)
    }
}

fn parse_tokens(raw: &str) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|_| SynthesisError::StoreUnavailable(format!("Unexpected token count '{}'", raw)))
}

/// Twice the time a drained bucket needs to fill, so idle buckets expire.
fn bucket_ttl_ms(limits: BucketLimits) -> u64 {
    if limits.refill_rate <= 0.0 {
        return 86_400_000;
    }
    let fill_ms = limits.capacity as f64 / limits.refill_rate * 1000.0;
    (fill_ms * 2.0).ceil() as u64 + 1000
}

pub struct RedisTokenStore {
    client: Arc<RedisClient>,
    consume: Script,
    peek: Script,
}

impl RedisTokenStore {
    pub fn new(client: Arc<RedisClient>) -> Self {
        Self {
            client,
            consume: Script::new(TOKEN_BUCKET_SCRIPT),
            peek: Script::new(TOKEN_PEEK_SCRIPT),
        }
    }
}

#[async_trait]
impl TokenStore for RedisTokenStore {
    async fn try_consume(&self, key: &str, limits: BucketLimits, tokens: u32) -> Result<BucketReading> {
        let args = [
            limits.capacity.to_string(),
            limits.refill_rate.to_string(),
            tokens.to_string(),
            bucket_ttl_ms(limits).to_string(),
        ];
        let (allowed, remaining): (i64, String) =
            self.client.eval_script(&self.consume, &[key], &args).await?;

        Ok(BucketReading {
            acquired: allowed == 1,
            remaining: parse_tokens(&remaining)?,
        })
    }

    async fn peek(&self, key: &str, limits: BucketLimits) -> Result<f64> {
        let args = [limits.capacity.to_string(), limits.refill_rate.to_string()];
        let raw: String = self.client.eval_script(&self.peek, &[key], &args).await?;
        parse_tokens(&raw)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredMarker {
    recorded_at: DateTime<Utc>,
    effect_id: Option<String>,
}

/// Markers are plain keys with a TTL, so expiry needs no sweeper.
pub struct RedisIdempotencyStore {
    client: Arc<RedisClient>,
    keys: KeyGenerator,
    ttl: Duration,
}

impl RedisIdempotencyStore {
    pub fn new(client: Arc<RedisClient>, keys: KeyGenerator, ttl: Duration) -> Self {
        Self { client, keys, ttl }
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn has(&self, key: &str) -> Result<bool> {
        self.client.exists(&self.keys.idempotency_key(key)).await
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let Some(raw) = self.client.get(&self.keys.idempotency_key(key)).await? else {
            return Ok(None);
        };
        let marker: StoredMarker = serde_json::from_str(&raw)?;
        Ok(Some(IdempotencyRecord {
            key: key.to_string(),
            recorded_at: marker.recorded_at,
            effect_id: marker.effect_id,
        }))
    }

    async fn record(&self, key: &str, effect_id: Option<&str>) -> Result<()> {
        let marker = StoredMarker {
            recorded_at: Utc::now(),
            effect_id: effect_id.map(str::to_string),
        };
        let raw = serde_json::to_string(&marker)?;
        self.client
            .set_with_expiry(&self.keys.idempotency_key(key), &raw, self.ttl)
            .await
    }
}
