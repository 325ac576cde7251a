//! Worker pool for processing mutation jobs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::idempotency::IdempotencyStore;
use crate::job::{JobId, SynthesisJob};
use crate::metrics::MetricsRegistry;
use crate::monitor::BanPreventionMonitor;
use crate::mutation::{FailureReason, HandlerError, MutationHandlers};
use crate::queue::{Released, WorkQueue};
use crate::rate_limiter::AtomicRateLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub concurrency: usize,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(100),
            acquire_timeout: Duration::from_millis(5000),
        }
    }
}

/// Pause flag and shutdown signal shared by the pool, the monitor and the
/// admin surface.
#[derive(Debug)]
pub struct PoolControl {
    paused: AtomicBool,
    shutdown: watch::Sender<Option<Duration>>,
}

impl Default for PoolControl {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolControl {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(None);
        Self {
            paused: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("Worker pool paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("Worker pool resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Stop claiming; in-flight jobs get `grace` to finish.
    pub fn request_shutdown(&self, grace: Duration) {
        self.shutdown.send_replace(Some(grace));
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.borrow().is_some()
    }

    fn grace(&self) -> Option<Duration> {
        *self.shutdown.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<Option<Duration>> {
        self.shutdown.subscribe()
    }
}

/// How one execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Marker already present; the handler was not called.
    Skipped,
    Retrying,
    DeadLettered,
}

/// Runs one claimed job through token, idempotency, handler and outcome.
pub struct JobProcessor {
    queue: Arc<WorkQueue>,
    limiter: AtomicRateLimiter,
    idempotency: Arc<dyn IdempotencyStore>,
    handlers: MutationHandlers,
    monitor: BanPreventionMonitor,
    metrics: Arc<MetricsRegistry>,
    acquire_timeout: Duration,
}

impl JobProcessor {
    pub fn new(
        queue: Arc<WorkQueue>,
        limiter: AtomicRateLimiter,
        idempotency: Arc<dyn IdempotencyStore>,
        handlers: MutationHandlers,
        monitor: BanPreventionMonitor,
        metrics: Arc<MetricsRegistry>,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            limiter,
            idempotency,
            handlers,
            monitor,
            metrics,
            acquire_timeout,
        }
    }

    pub async fn process(&self, job: SynthesisJob) -> JobOutcome {
        let started = Instant::now();
        let job_type = job.job_type();

        match self.limiter.acquire_with_wait(self.acquire_timeout).await {
            Ok(true) => {}
            Ok(false) => {
                let err = HandlerError::transient(
                    FailureReason::TokenTimeout,
                    format!("no token within {}ms", self.acquire_timeout.as_millis()),
                );
                return self.fail(&job, err, started).await;
            }
            Err(e) => {
                let err = HandlerError::transient(FailureReason::StoreUnavailable, e.to_string());
                return self.fail(&job, err, started).await;
            }
        }

        match self.idempotency.get(&job.idempotency_key).await {
            Ok(Some(marker)) => {
                debug!(
                    job_id = %job.id,
                    job_type = %job_type,
                    idempotency_key = %job.idempotency_key,
                    "Already applied, completing without external call"
                );
                self.metrics.record_idempotent_skip(job_type);
                return self
                    .complete(&job, marker.effect_id, started, JobOutcome::Skipped)
                    .await;
            }
            Ok(None) => {}
            Err(e) => {
                let err = HandlerError::transient(FailureReason::StoreUnavailable, e.to_string());
                return self.fail(&job, err, started).await;
            }
        }

        info!(job_id = %job.id, job_type = %job_type, attempt = job.attempt, "Processing job");

        match self.handlers.execute(&job.payload).await {
            Ok(effect) => {
                if let Err(e) = self
                    .idempotency
                    .record(&job.idempotency_key, effect.effect_id.as_deref())
                    .await
                {
                    warn!(
                        job_id = %job.id,
                        idempotency_key = %job.idempotency_key,
                        error = %e,
                        "Applied but failed to record idempotency marker; a retry could repeat the effect"
                    );
                }
                self.complete(&job, effect.effect_id, started, JobOutcome::Completed)
                    .await
            }
            Err(err) => self.fail(&job, err, started).await,
        }
    }

    async fn complete(
        &self,
        job: &SynthesisJob,
        effect_id: Option<String>,
        started: Instant,
        outcome: JobOutcome,
    ) -> JobOutcome {
        match self.queue.ack(job, effect_id).await {
            Ok(_) => self.metrics.record_completed(job.job_type(), started.elapsed()),
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to ack job"),
        }
        outcome
    }

    async fn fail(&self, job: &SynthesisJob, err: HandlerError, started: Instant) -> JobOutcome {
        let job_type = job.job_type();
        self.metrics
            .record_failed(job_type, err.reason.as_str(), started.elapsed());

        if let Some(info) = &err.rate_limit {
            self.monitor.observe(job.id, job_type, info);
        }

        let policy = self.queue.retry_policy();
        if err.retryable && !policy.exhausted(job.attempt) {
            let delay = err.retry_after.unwrap_or_else(|| policy.delay(job.attempt));
            if let Err(e) = self.queue.retry(job, delay, err.describe()).await {
                error!(job_id = %job.id, error = %e, "Failed to schedule retry");
            }
            JobOutcome::Retrying
        } else {
            if let Err(e) = self.queue.dead_letter(job, err.describe()).await {
                error!(job_id = %job.id, error = %e, "Failed to dead-letter job");
            }
            JobOutcome::DeadLettered
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }
}

/// Claimed copy of each running job, kept so an interrupted one can be released.
type InFlight = Arc<Mutex<HashMap<JobId, (SynthesisJob, JoinHandle<()>)>>>;

pub struct WorkerPool {
    processor: Arc<JobProcessor>,
    control: Arc<PoolControl>,
    metrics: Arc<MetricsRegistry>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        processor: Arc<JobProcessor>,
        control: Arc<PoolControl>,
        metrics: Arc<MetricsRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            processor,
            control,
            metrics,
            config,
        }
    }

    /// Claim and process jobs until shutdown is requested, then drain.
    pub async fn run(self) {
        let concurrency = self.config.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
        let mut shutdown = self.control.subscribe();

        info!("Worker pool started with concurrency {}", concurrency);

        loop {
            if self.control.is_shutting_down() {
                break;
            }
            if self.control.is_paused() {
                idle(&mut shutdown, self.config.poll_interval).await;
                continue;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => continue,
            };

            if self.control.is_shutting_down() || self.control.is_paused() {
                continue;
            }

            let job = match self.processor.queue().claim_next().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    drop(permit);
                    idle(&mut shutdown, self.config.poll_interval).await;
                    continue;
                }
                Err(e) => {
                    error!("Queue error: {}", e);
                    drop(permit);
                    idle(&mut shutdown, Duration::from_secs(1)).await;
                    continue;
                }
            };

            let id = job.id;
            let claimed = job.clone();
            let processor = self.processor.clone();
            let registry = in_flight.clone();

            // The map lock is held across spawn so the task cannot deregister
            // before it is registered.
            let Ok(mut tasks) = in_flight.lock() else {
                error!(job_id = %id, "In-flight registry poisoned, stopping pool");
                break;
            };
            let handle = tokio::spawn(async move {
                processor.process(job).await;
                if let Ok(mut tasks) = registry.lock() {
                    tasks.remove(&id);
                }
                drop(permit);
            });
            tasks.insert(id, (claimed, handle));
        }

        self.drain(semaphore, in_flight, concurrency).await;
    }

    async fn drain(&self, semaphore: Arc<Semaphore>, in_flight: InFlight, concurrency: usize) {
        let grace = self.control.grace().unwrap_or_default();
        info!(grace_ms = grace.as_millis() as u64, "Worker pool draining");

        let drained = tokio::time::timeout(grace, semaphore.acquire_many(concurrency as u32)).await;
        if drained.is_ok() {
            info!("Worker pool stopped, all in-flight jobs finished");
            return;
        }

        let interrupted: Vec<_> = match in_flight.lock() {
            Ok(mut tasks) => tasks.drain().collect(),
            Err(_) => Vec::new(),
        };

        for (id, (job, handle)) in interrupted {
            handle.abort();
            let _ = handle.await;

            self.metrics
                .record_failed(job.job_type(), FailureReason::Interrupted.as_str(), Duration::ZERO);
            match self
                .processor
                .queue()
                .release(&job, "interrupted: shutdown grace period elapsed")
                .await
            {
                Ok(Released::Requeued) => warn!(job_id = %id, "Interrupted job returned to queue"),
                Ok(Released::DeadLettered) => warn!(job_id = %id, "Interrupted job dead-lettered"),
                Err(e) => error!(job_id = %id, error = %e, "Failed to release interrupted job"),
            }
        }
        info!("Worker pool stopped");
    }
}

async fn idle(shutdown: &mut watch::Receiver<Option<Duration>>, period: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(period) => {}
        _ = shutdown.changed() => {}
    }
}
