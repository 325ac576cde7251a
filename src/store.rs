//! Shared counter store backing the global token bucket.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::error::{Result, SynthesisError};
use crate::token_bucket::TokenBucket;

/// Static shape of a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketLimits {
    pub capacity: u32,
    pub refill_rate: f64,
}

/// Outcome of one atomic refill-then-consume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketReading {
    pub acquired: bool,
    pub remaining: f64,
}

/// A store able to refill and consume a named bucket as one indivisible
/// operation, visible to every process sharing the store.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn try_consume(&self, key: &str, limits: BucketLimits, tokens: u32) -> Result<BucketReading>;

    /// Refilled token count without consuming.
    async fn peek(&self, key: &str, limits: BucketLimits) -> Result<f64>;
}

/// Single-process store. The mutex makes refill and consume one step.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn try_consume(&self, key: &str, limits: BucketLimits, tokens: u32) -> Result<BucketReading> {
        let now = Instant::now();
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| SynthesisError::StoreUnavailable("token store lock poisoned".into()))?;

        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::starting_at(limits.capacity, limits.refill_rate, now));

        let acquired = bucket.consume_at(tokens, now);
        Ok(BucketReading {
            acquired,
            remaining: bucket.available_at(now),
        })
    }

    async fn peek(&self, key: &str, limits: BucketLimits) -> Result<f64> {
        let now = Instant::now();
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| SynthesisError::StoreUnavailable("token store lock poisoned".into()))?;

        Ok(match buckets.get_mut(key) {
            Some(bucket) => bucket.available_at(now),
            None => limits.capacity as f64,
        })
    }
}
