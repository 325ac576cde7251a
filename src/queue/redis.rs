//! Redis queue backend.
//!
//! Each job is a JSON string under `{prefix}:job:{id}`. Sorted sets index it
//! by state: `ready` scored by run-at millis, `active` by claim time,
//! `completed` and `dead` by finish time. Terminal records carry a TTL equal
//! to their retention.

use ::redis::{pipe, Script};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::QueueBackend;
use crate::error::{Result, SynthesisError};
use crate::job::{JobId, JobState, SynthesisJob};
use crate::key_generator::KeyGenerator;
use crate::redis::RedisClient;

/// Move the earliest due id from `ready` to `active`, marking the stored
/// record active in the same step. Ids whose record is gone or no longer
/// claimable are dropped from `ready` on the way.
const CLAIM_SCRIPT: &str = r#"
for _ = 1, 32 do
  local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
  if #ids == 0 then
    return false
  end
  local id = ids[1]
  redis.call('ZREM', KEYS[1], id)
  local key = ARGV[2] .. id
  local raw = redis.call('GET', key)
  if raw then
    local job = cjson.decode(raw)
    if job.state == 'queued' or job.state == 'failed' then
      job.state = 'active'
      job.attempt = job.attempt + 1
      job.last_attempt_at = ARGV[3]
      raw = cjson.encode(job)
      redis.call('SET', key, raw)
      redis.call('ZADD', KEYS[2], ARGV[1], id)
      return raw
    end
  end
end
return false
"#;

/// Compare-and-set write of one job record and its indexes.
///
/// KEYS: job, ready, active, completed, dead.
/// ARGV: expected state, expected attempt, new record, new state, id, score,
/// ttl seconds for terminal records.
/// Returns `{1, state}` on success, `{0, stored_state}` on a mismatch and
/// `{0, ''}` when the record is missing.
const UPDATE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return {0, ''}
end
local stored = cjson.decode(current)
if stored.state ~= ARGV[1] or tonumber(stored.attempt) ~= tonumber(ARGV[2]) then
  return {0, stored.state}
end

local state = ARGV[4]
local id = ARGV[5]
if state == 'queued' or state == 'failed' then
  redis.call('SET', KEYS[1], ARGV[3])
  redis.call('ZREM', KEYS[3], id)
  redis.call('ZADD', KEYS[2], ARGV[6], id)
elseif state == 'active' then
  redis.call('SET', KEYS[1], ARGV[3])
  redis.call('ZADD', KEYS[3], ARGV[6], id)
else
  local index = KEYS[4]
  if state == 'dead_lettered' then
    index = KEYS[5]
  end
  redis.call('SET', KEYS[1], ARGV[3], 'EX', ARGV[7])
  redis.call('ZREM', KEYS[3], id)
  redis.call('ZADD', index, ARGV[6], id)
end
return {1, state}
"#;

fn queue_err(e: ::redis::RedisError) -> SynthesisError {
    SynthesisError::QueueUnavailable(e.to_string())
}

pub struct RedisQueue {
    client: Arc<RedisClient>,
    keys: KeyGenerator,
    completed_retention: Duration,
    dead_letter_retention: Duration,
    claim: Script,
    update: Script,
}

impl RedisQueue {
    pub fn new(
        client: Arc<RedisClient>,
        keys: KeyGenerator,
        completed_retention: Duration,
        dead_letter_retention: Duration,
    ) -> Self {
        Self {
            client,
            keys,
            completed_retention,
            dead_letter_retention,
            claim: Script::new(CLAIM_SCRIPT),
            update: Script::new(UPDATE_SCRIPT),
        }
    }

    async fn load_many(&self, ids: Vec<String>) -> Result<Vec<SynthesisJob>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("{}{}", self.keys.job_key_prefix(), id))
            .collect();

        let mut conn = self.client.connection();
        let raw: Vec<Option<String>> = ::redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(queue_err)?;

        raw.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(SynthesisError::from))
            .collect()
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn finished_millis(job: &SynthesisJob) -> i64 {
    millis(job.finished_at.unwrap_or_else(Utc::now))
}

/// RFC 3339 text that deserializes as `DateTime<Utc>`.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Index score for a record in its new state.
fn score(job: &SynthesisJob) -> i64 {
    match job.state {
        JobState::Queued | JobState::Failed => millis(job.run_at),
        JobState::Active => millis(job.last_attempt_at.unwrap_or_else(Utc::now)),
        JobState::Completed | JobState::DeadLettered => finished_millis(job),
    }
}

fn parse_state(raw: &str) -> Option<JobState> {
    serde_json::from_value(serde_json::Value::String(raw.to_string())).ok()
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn push(&self, job: &SynthesisJob) -> Result<()> {
        let raw = serde_json::to_string(job)?;
        let mut conn = self.client.connection();

        pipe()
            .atomic()
            .set(self.keys.job_key(job.id), raw)
            .ignore()
            .zadd(self.keys.ready_set(), job.id.to_string(), millis(job.run_at))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(queue_err)
    }

    async fn claim(&self, now: DateTime<Utc>) -> Result<Option<SynthesisJob>> {
        let mut conn = self.client.connection();
        let raw: Option<String> = self
            .claim
            .key(self.keys.ready_set())
            .key(self.keys.active_set())
            .arg(millis(now))
            .arg(self.keys.job_key_prefix())
            .arg(timestamp(now))
            .invoke_async(&mut conn)
            .await
            .map_err(queue_err)?;

        raw.map(|json| serde_json::from_str(&json).map_err(SynthesisError::from))
            .transpose()
    }

    async fn update(&self, job: &SynthesisJob, from: JobState) -> Result<()> {
        let ttl = match job.state {
            JobState::DeadLettered => self.dead_letter_retention,
            _ => self.completed_retention,
        };

        let mut conn = self.client.connection();
        let (applied, stored): (i64, String) = self
            .update
            .key(self.keys.job_key(job.id))
            .key(self.keys.ready_set())
            .key(self.keys.active_set())
            .key(self.keys.completed_set())
            .key(self.keys.dead_set())
            .arg(from.to_string())
            .arg(job.attempt)
            .arg(serde_json::to_string(job)?)
            .arg(job.state.to_string())
            .arg(job.id.to_string())
            .arg(score(job))
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(queue_err)?;

        if applied == 1 {
            return Ok(());
        }
        match parse_state(&stored) {
            Some(current) => Err(SynthesisError::InvalidTransition {
                id: job.id,
                from: current,
                to: job.state,
            }),
            None if stored.is_empty() => Err(SynthesisError::JobNotFound(job.id)),
            None => Err(SynthesisError::QueueUnavailable(format!(
                "job {} has unreadable state {:?}",
                job.id, stored
            ))),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<SynthesisJob>> {
        let raw = self
            .client
            .get(&self.keys.job_key(id))
            .await
            .map_err(|e| SynthesisError::QueueUnavailable(e.to_string()))?;
        raw.map(|json| serde_json::from_str(&json).map_err(SynthesisError::from))
            .transpose()
    }

    async fn list_dead(&self, limit: usize) -> Result<Vec<SynthesisJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.client.connection();
        let ids: Vec<String> = ::redis::cmd("ZREVRANGE")
            .arg(self.keys.dead_set())
            .arg(0)
            .arg(limit as isize - 1)
            .query_async(&mut conn)
            .await
            .map_err(queue_err)?;
        self.load_many(ids).await
    }

    async fn stale_active(&self, claimed_before: DateTime<Utc>) -> Result<Vec<SynthesisJob>> {
        let mut conn = self.client.connection();
        let ids: Vec<String> = ::redis::cmd("ZRANGEBYSCORE")
            .arg(self.keys.active_set())
            .arg("-inf")
            .arg(millis(claimed_before))
            .query_async(&mut conn)
            .await
            .map_err(queue_err)?;

        Ok(self
            .load_many(ids)
            .await?
            .into_iter()
            .filter(|job| job.state == JobState::Active)
            .collect())
    }

    async fn purge(&self, completed_before: DateTime<Utc>, dead_before: DateTime<Utc>) -> Result<usize> {
        // Records expire on their own; only the indexes need trimming.
        let mut conn = self.client.connection();
        let (completed, dead): (usize, usize) = pipe()
            .cmd("ZREMRANGEBYSCORE")
            .arg(self.keys.completed_set())
            .arg("-inf")
            .arg(format!("({}", millis(completed_before)))
            .cmd("ZREMRANGEBYSCORE")
            .arg(self.keys.dead_set())
            .arg("-inf")
            .arg(format!("({}", millis(dead_before)))
            .query_async(&mut conn)
            .await
            .map_err(queue_err)?;
        Ok(completed + dead)
    }

    async fn depth(&self) -> Result<usize> {
        let mut conn = self.client.connection();
        ::redis::cmd("ZCARD")
            .arg(self.keys.ready_set())
            .query_async(&mut conn)
            .await
            .map_err(queue_err)
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map_err(|e| SynthesisError::QueueUnavailable(e.to_string()))
    }
}
