//! "Already applied" markers for logical operations.
//!
//! The worker checks the marker before the external call and records it only
//! after the call is confirmed. A crash between confirmation and `record`
//! leaves no marker, so the next attempt repeats the external effect: the
//! guarantee is at-least-once for that window, exactly-once otherwise.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Result, SynthesisError};

/// Marker read back from a store.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub recorded_at: DateTime<Utc>,
    pub effect_id: Option<String>,
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn has(&self, key: &str) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    /// Record that `key` has been applied. The marker lives for the store's TTL.
    async fn record(&self, key: &str, effect_id: Option<&str>) -> Result<()>;

    /// Drop expired markers, returning how many went. Stores that expire
    /// keys themselves have nothing to do.
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

struct Entry {
    record: IdempotencyRecord,
    expires_at: Instant,
}

pub struct MemoryIdempotencyStore {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryIdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| SynthesisError::StoreUnavailable("idempotency lock poisoned".into()))
    }

    fn live(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let mut entries = self.entries()?;

        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.record.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

impl Default for MemoryIdempotencyStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(86_400))
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.live(key)?.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        self.live(key)
    }

    async fn record(&self, key: &str, effect_id: Option<&str>) -> Result<()> {
        let mut entries = self.entries()?;

        entries.insert(
            key.to_string(),
            Entry {
                record: IdempotencyRecord {
                    key: key.to_string(),
                    recorded_at: Utc::now(),
                    effect_id: effect_id.map(str::to_string),
                },
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let mut entries = self.entries()?;
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(before - entries.len())
    }
}
