//! Durable work queue: validation at the door, exactly-one delivery per
//! claim, backoff scheduling, dead-lettering and retention.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{Result, SynthesisError};
use crate::job::{JobId, JobState, JobType, RetryPolicy, SynthesisJob};
use crate::metrics::MetricsRegistry;
use crate::payload::JobPayload;
use crate::token_bucket::TokenBucket;
use crate::validation::RequestValidator;

pub use self::memory::MemoryQueue;
pub use self::redis::RedisQueue;

/// Storage behind the queue. Implementations must make `claim` atomic: a due
/// job is handed to exactly one caller and is `active` when returned.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn push(&self, job: &SynthesisJob) -> Result<()>;

    /// Claim the earliest due job (`run_at <= now`), marking it active.
    async fn claim(&self, now: DateTime<Utc>) -> Result<Option<SynthesisJob>>;

    /// Persist a transition made by the job's claimant. Compare-and-set: the
    /// write lands only if the stored record is still in `from` at the same
    /// attempt, else `InvalidTransition` naming the stored state.
    async fn update(&self, job: &SynthesisJob, from: JobState) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<Option<SynthesisJob>>;

    /// Most recently dead-lettered first
    async fn list_dead(&self, limit: usize) -> Result<Vec<SynthesisJob>>;

    /// Jobs claimed before `claimed_before` that are still active.
    async fn stale_active(&self, claimed_before: DateTime<Utc>) -> Result<Vec<SynthesisJob>>;

    /// Drop terminal jobs that finished before the cutoffs. Returns the count removed.
    async fn purge(&self, completed_before: DateTime<Utc>, dead_before: DateTime<Utc>) -> Result<usize>;

    /// Number of jobs waiting to be claimed
    async fn depth(&self) -> Result<usize>;

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// A job submission.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub payload: JobPayload,
    pub idempotency_key: Option<String>,
}

impl EnqueueRequest {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            payload,
            idempotency_key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Builds a request from an untyped payload, validating it for `job_type`.
    pub fn from_parts(
        job_type: JobType,
        payload: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            payload: JobPayload::parse(job_type, payload)?,
            idempotency_key,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Local job starts per second, independent of the global bucket
    pub admission_rate: f64,
    #[serde(with = "humantime_serde")]
    pub batch_stagger: Duration,
    pub retry: RetryPolicy,
    #[serde(with = "humantime_serde")]
    pub completed_retention: Duration,
    #[serde(with = "humantime_serde")]
    pub dead_letter_retention: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            admission_rate: 10.0,
            batch_stagger: Duration::from_millis(100),
            retry: RetryPolicy::default(),
            completed_retention: Duration::from_secs(3600),
            dead_letter_retention: Duration::from_secs(86_400),
        }
    }
}

/// What became of a job handed back through `release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    Requeued,
    DeadLettered,
}

/// Prefix a batch item's validation error with its position.
pub fn at_index(index: usize, err: SynthesisError) -> SynthesisError {
    match err {
        SynthesisError::InvalidPayload(msg) => {
            SynthesisError::InvalidPayload(format!("item {}: {}", index, msg))
        }
        other => other,
    }
}

/// Longest delay the queue schedules or looks back.
const MAX_DELAY: Duration = Duration::from_secs(365 * 86_400);

fn chrono_delay(delay: Duration) -> ChronoDuration {
    ChronoDuration::from_std(delay.min(MAX_DELAY)).unwrap_or_else(|_| ChronoDuration::days(365))
}

/// `now + delay`, saturating instead of overflowing.
fn later(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now.checked_add_signed(chrono_delay(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn earlier(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(chrono_delay(delay))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub struct WorkQueue {
    backend: Arc<dyn QueueBackend>,
    admission: Mutex<TokenBucket>,
    settings: QueueSettings,
    metrics: Arc<MetricsRegistry>,
}

impl WorkQueue {
    pub fn new(backend: Arc<dyn QueueBackend>, settings: QueueSettings, metrics: Arc<MetricsRegistry>) -> Self {
        let burst = settings.admission_rate.ceil().max(1.0) as u32;
        Self {
            backend,
            admission: Mutex::new(TokenBucket::new(burst, settings.admission_rate)),
            settings,
            metrics,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.settings.retry
    }

    fn prepare(&self, request: EnqueueRequest, run_at: DateTime<Utc>) -> Result<SynthesisJob> {
        request.payload.validate()?;
        let key = match request.idempotency_key {
            Some(key) => RequestValidator::validate_idempotency_key(&key)?,
            None => request.payload.derive_idempotency_key(),
        };
        Ok(SynthesisJob::new(request.payload, key, run_at))
    }

    async fn persist(&self, job: &SynthesisJob) -> Result<()> {
        self.backend.push(job).await?;
        self.metrics.record_enqueued(job.job_type());
        tracing::debug!(
            job_id = %job.id,
            job_type = %job.job_type(),
            idempotency_key = %job.idempotency_key,
            "Job enqueued"
        );
        Ok(())
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId> {
        let job = self.prepare(request, Utc::now())?;
        self.persist(&job).await?;
        Ok(job.id)
    }

    /// Every item is validated before any is stored. Successive jobs become
    /// due `batch_stagger` apart.
    pub async fn enqueue_batch(&self, requests: Vec<EnqueueRequest>) -> Result<Vec<JobId>> {
        let now = Utc::now();
        let stagger = self.settings.batch_stagger;

        let jobs = requests
            .into_iter()
            .enumerate()
            .map(|(i, request)| {
                let offset = stagger.saturating_mul(u32::try_from(i).unwrap_or(u32::MAX));
                self.prepare(request, later(now, offset))
                    .map_err(|e| at_index(i, e))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut ids = Vec::with_capacity(jobs.len());
        for job in &jobs {
            self.persist(job).await?;
            ids.push(job.id);
        }
        Ok(ids)
    }

    fn admission(&self) -> MutexGuard<'_, TokenBucket> {
        self.admission.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Admission bucket lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn admit(&self) -> bool {
        self.admission().consume(1)
    }

    fn refund_admission(&self) {
        self.admission().refund(1);
    }

    /// Claim the next due job, subject to the local admission ceiling.
    pub async fn claim_next(&self) -> Result<Option<SynthesisJob>> {
        if !self.admit() {
            return Ok(None);
        }

        match self.backend.claim(Utc::now()).await {
            Ok(Some(job)) => Ok(Some(job)),
            Ok(None) => {
                self.refund_admission();
                Ok(None)
            }
            Err(e) => {
                self.refund_admission();
                Err(e)
            }
        }
    }

    async fn load(&self, id: JobId) -> Result<SynthesisJob> {
        self.backend.get(id).await?.ok_or(SynthesisError::JobNotFound(id))
    }

    pub async fn get(&self, id: JobId) -> Result<SynthesisJob> {
        self.load(id).await
    }

    /// Transitions below start from the copy handed out by `claim_next` (or
    /// `stale_active`). The write is rejected if another party moved the job
    /// on since, e.g. a lease reclaim racing a slow worker.
    pub async fn ack(&self, claimed: &SynthesisJob, effect_id: Option<String>) -> Result<SynthesisJob> {
        let mut job = claimed.clone();
        job.mark_completed(effect_id, Utc::now())?;
        self.backend.update(&job, JobState::Active).await?;
        Ok(job)
    }

    pub async fn retry(&self, claimed: &SynthesisJob, delay: Duration, error: String) -> Result<SynthesisJob> {
        let mut job = claimed.clone();
        job.mark_retrying(error, later(Utc::now(), delay))?;
        self.backend.update(&job, JobState::Active).await?;
        tracing::info!(
            job_id = %job.id,
            attempt = job.attempt,
            delay_ms = delay.as_millis() as u64,
            "Job failed, scheduling retry with backoff"
        );
        Ok(job)
    }

    pub async fn dead_letter(&self, claimed: &SynthesisJob, reason: String) -> Result<SynthesisJob> {
        let mut job = claimed.clone();
        job.mark_dead(reason, Utc::now())?;
        self.backend.update(&job, JobState::Active).await?;
        self.metrics.record_dead_lettered(job.job_type());
        tracing::warn!(
            job_id = %job.id,
            job_type = %job.job_type(),
            attempt = job.attempt,
            reason = job.last_error.as_deref().unwrap_or(""),
            "Job dead-lettered"
        );
        Ok(job)
    }

    /// Hand an active job back after its worker stopped without an outcome.
    /// Follows the retry policy: requeued now, or dead-lettered if exhausted.
    pub async fn release(&self, claimed: &SynthesisJob, reason: &str) -> Result<Released> {
        if self.settings.retry.exhausted(claimed.attempt) {
            self.dead_letter(claimed, reason.to_string()).await?;
            Ok(Released::DeadLettered)
        } else {
            self.retry(claimed, Duration::ZERO, reason.to_string()).await?;
            Ok(Released::Requeued)
        }
    }

    /// Return jobs whose claimant has held them longer than `lease`.
    pub async fn reclaim_stale(&self, lease: Duration) -> Result<usize> {
        let cutoff = earlier(Utc::now(), lease);
        let stale = self.backend.stale_active(cutoff).await?;
        let mut reclaimed = 0;

        for job in stale {
            match self.release(&job, "interrupted: active lease expired").await {
                Ok(_) => reclaimed += 1,
                Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Failed to reclaim stale job"),
            }
        }
        Ok(reclaimed)
    }

    pub async fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let purged = self
            .backend
            .purge(
                earlier(now, self.settings.completed_retention),
                earlier(now, self.settings.dead_letter_retention),
            )
            .await?;
        if purged > 0 {
            tracing::debug!(purged, "Purged expired terminal jobs");
        }
        Ok(purged)
    }

    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<SynthesisJob>> {
        self.backend.list_dead(limit).await
    }

    pub async fn depth(&self) -> Result<usize> {
        self.backend.depth().await
    }

    pub async fn ping(&self) -> Result<()> {
        self.backend.ping().await
    }
}
