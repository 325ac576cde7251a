//! The engine façade: wires queue, limiter, idempotency, handlers, monitor
//! and worker pool behind one handle.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::discord::DiscordClient;
use crate::error::{Result, SynthesisError};
use crate::idempotency::{IdempotencyStore, MemoryIdempotencyStore};
use crate::job::{JobId, JobSnapshot, JobType};
use crate::key_generator::KeyGenerator;
use crate::metrics::MetricsRegistry;
use crate::monitor::BanPreventionMonitor;
use crate::mutation::MutationHandlers;
use crate::queue::{at_index, EnqueueRequest, MemoryQueue, QueueBackend, QueueSettings, RedisQueue, WorkQueue};
use crate::rate_limiter::{AtomicRateLimiter, RateLimiterSettings};
use crate::redis::{RedisClient, RedisIdempotencyStore, RedisTokenStore};
use crate::store::{MemoryTokenStore, TokenStore};
use crate::worker::{JobProcessor, PoolControl, WorkerConfig, WorkerPool};

/// A submission as callers send it: type tag, raw payload, optional key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl JobSubmission {
    pub fn into_request(self) -> Result<EnqueueRequest> {
        EnqueueRequest::from_parts(self.job_type, self.payload, self.idempotency_key)
    }
}

/// Everything the engine needs besides its collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub key_prefix: String,
    pub limiter: RateLimiterSettings,
    pub queue: QueueSettings,
    pub worker: WorkerConfig,
    #[serde(with = "humantime_serde")]
    pub idempotency_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub active_lease: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    pub auto_pause_on_global_429: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            key_prefix: "synthesis".to_string(),
            limiter: RateLimiterSettings::default(),
            queue: QueueSettings::default(),
            worker: WorkerConfig::default(),
            idempotency_ttl: Duration::from_secs(86_400),
            active_lease: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_millis(30_000),
            auto_pause_on_global_429: false,
        }
    }
}

/// Shared-state implementations injected into the engine.
#[derive(Clone)]
pub struct Backends {
    pub queue: Arc<dyn QueueBackend>,
    pub tokens: Arc<dyn TokenStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
}

impl Backends {
    /// Single-process state. Nothing survives a restart.
    pub fn in_memory(settings: &EngineSettings) -> Self {
        Self {
            queue: Arc::new(MemoryQueue::new()),
            tokens: Arc::new(MemoryTokenStore::new()),
            idempotency: Arc::new(MemoryIdempotencyStore::new(settings.idempotency_ttl)),
        }
    }

    /// State shared through Redis by every engine pointing at `redis_url`.
    pub async fn redis(redis_url: &str, settings: &EngineSettings) -> Result<Self> {
        let client = Arc::new(RedisClient::connect(redis_url).await?);
        let keys = KeyGenerator::new(&settings.key_prefix);

        Ok(Self {
            queue: Arc::new(RedisQueue::new(
                client.clone(),
                keys.clone(),
                settings.queue.completed_retention,
                settings.queue.dead_letter_retention,
            )),
            tokens: Arc::new(RedisTokenStore::new(client.clone())),
            idempotency: Arc::new(RedisIdempotencyStore::new(
                client,
                keys,
                settings.idempotency_ttl,
            )),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub queue_ok: bool,
    pub queue_depth: Option<usize>,
    pub tokens_available: Option<f64>,
    pub paused: bool,
    pub shutting_down: bool,
}

pub struct SynthesisEngine {
    queue: Arc<WorkQueue>,
    idempotency: Arc<dyn IdempotencyStore>,
    processor: Arc<JobProcessor>,
    limiter: AtomicRateLimiter,
    control: Arc<PoolControl>,
    metrics: Arc<MetricsRegistry>,
    settings: EngineSettings,
    started: AtomicBool,
    pool: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SynthesisEngine {
    pub fn new(backends: Backends, client: Arc<dyn DiscordClient>, settings: EngineSettings) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        let control = Arc::new(PoolControl::new());
        let keys = KeyGenerator::new(&settings.key_prefix);

        let queue = Arc::new(WorkQueue::new(backends.queue, settings.queue, metrics.clone()));
        let limiter = AtomicRateLimiter::new(backends.tokens, &keys, settings.limiter, metrics.clone());
        let monitor = BanPreventionMonitor::new(
            metrics.clone(),
            control.clone(),
            settings.auto_pause_on_global_429,
        );

        let processor = Arc::new(JobProcessor::new(
            queue.clone(),
            limiter.clone(),
            backends.idempotency.clone(),
            MutationHandlers::new(client),
            monitor,
            metrics.clone(),
            settings.worker.acquire_timeout,
        ));

        Self {
            queue,
            idempotency: backends.idempotency,
            processor,
            limiter,
            control,
            metrics,
            settings,
            started: AtomicBool::new(false),
            pool: Mutex::new(None),
            sweeper: Mutex::new(None),
        }
    }

    /// Spawn the worker pool and the retention/lease sweeper.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("Engine already started");
            return;
        }

        let pool = WorkerPool::new(
            self.processor.clone(),
            self.control.clone(),
            self.metrics.clone(),
            self.settings.worker,
        );
        *self.pool.lock().await = Some(tokio::spawn(pool.run()));

        let queue = self.queue.clone();
        let idempotency = self.idempotency.clone();
        let lease = self.settings.active_lease;
        let period = self.settings.sweep_interval;
        *self.sweeper.lock().await = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = queue.purge_expired().await {
                    tracing::warn!(error = %e, "Retention sweep failed");
                }
                match idempotency.purge_expired().await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!(purged = n, "Purged expired idempotency markers"),
                    Err(e) => tracing::warn!(error = %e, "Idempotency sweep failed"),
                }
                match queue.reclaim_stale(lease).await {
                    Ok(0) => {}
                    Ok(n) => tracing::warn!(reclaimed = n, "Reclaimed jobs past their active lease"),
                    Err(e) => tracing::warn!(error = %e, "Lease sweep failed"),
                }
            }
        }));

        tracing::info!(
            concurrency = self.settings.worker.concurrency,
            capacity = self.settings.limiter.capacity,
            refill_rate = self.settings.limiter.refill_rate,
            "Synthesis engine started"
        );
    }

    fn accepting(&self) -> Result<()> {
        if self.control.is_shutting_down() {
            Err(SynthesisError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    pub async fn enqueue(&self, submission: JobSubmission) -> Result<JobId> {
        self.accepting()?;
        self.queue.enqueue(submission.into_request()?).await
    }

    /// Enqueue an already typed request.
    pub async fn enqueue_request(&self, request: EnqueueRequest) -> Result<JobId> {
        self.accepting()?;
        self.queue.enqueue(request).await
    }

    pub async fn enqueue_batch(&self, submissions: Vec<JobSubmission>) -> Result<Vec<JobId>> {
        self.accepting()?;
        let requests = submissions
            .into_iter()
            .enumerate()
            .map(|(i, s)| s.into_request().map_err(|e| at_index(i, e)))
            .collect::<Result<Vec<_>>>()?;
        self.queue.enqueue_batch(requests).await
    }

    pub async fn get_job(&self, id: JobId) -> Result<JobSnapshot> {
        Ok(self.queue.get(id).await?.snapshot())
    }

    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<JobSnapshot>> {
        Ok(self
            .queue
            .list_dead_letters(limit)
            .await?
            .iter()
            .map(|job| job.snapshot())
            .collect())
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    /// Stop claiming, wait up to `grace` for in-flight jobs, then abort the
    /// rest and return them to the retry path.
    pub async fn shutdown(&self, grace: Duration) {
        tracing::info!(grace_ms = grace.as_millis() as u64, "Shutting down synthesis engine");
        self.control.request_shutdown(grace);

        if let Some(sweeper) = self.sweeper.lock().await.take() {
            sweeper.abort();
        }
        if let Some(pool) = self.pool.lock().await.take() {
            if let Err(e) = pool.await {
                tracing::error!(error = %e, "Worker pool task failed");
            }
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        self.settings.shutdown_grace
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Prometheus text with a fresh token gauge.
    pub async fn render_metrics(&self) -> String {
        if let Err(e) = self.limiter.available().await {
            tracing::debug!(error = %e, "Could not refresh token gauge");
        }
        self.metrics.render()
    }

    pub async fn health(&self) -> EngineHealth {
        let queue_ok = self.queue.ping().await.is_ok();
        EngineHealth {
            queue_ok,
            queue_depth: self.queue.depth().await.ok(),
            tokens_available: self.limiter.available().await.ok(),
            paused: self.control.is_paused(),
            shutting_down: self.control.is_shutting_down(),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }
}
