//! Metrics registry for the engine.
//!
//! Every update is kept in the registry (rendered at `/metrics` and readable
//! in tests) and forwarded to the `metrics` facade so an installed exporter
//! sees the same series.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::job::JobType;

const DURATION_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];
const RETRY_AFTER_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0];

#[derive(Debug, Clone)]
struct Histogram {
    bounds: &'static [f64],
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            counts: vec![0; bounds.len()],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        for (i, bound) in self.bounds.iter().enumerate() {
            if value <= *bound {
                self.counts[i] += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }

    fn render(&self, out: &mut String, name: &str, labels: &str) {
        let sep = if labels.is_empty() { "" } else { "," };
        for (bound, count) in self.bounds.iter().zip(&self.counts) {
            let _ = writeln!(out, "{name}_bucket{{{labels}{sep}le=\"{bound}\"}} {count}");
        }
        let _ = writeln!(out, "{name}_bucket{{{labels}{sep}le=\"+Inf\"}} {}", self.count);
        if labels.is_empty() {
            let _ = writeln!(out, "{name}_sum {}", self.sum);
            let _ = writeln!(out, "{name}_count {}", self.count);
        } else {
            let _ = writeln!(out, "{name}_sum{{{labels}}} {}", self.sum);
            let _ = writeln!(out, "{name}_count{{{labels}}} {}", self.count);
        }
    }
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
pub struct MetricsRegistry {
    enqueued: Mutex<BTreeMap<JobType, u64>>,
    completed: Mutex<BTreeMap<JobType, u64>>,
    failed: Mutex<BTreeMap<(JobType, &'static str), u64>>,
    dead_lettered: Mutex<BTreeMap<JobType, u64>>,
    idempotent_skips: Mutex<BTreeMap<JobType, u64>>,
    durations: Mutex<BTreeMap<JobType, Histogram>>,
    bucket_current: AtomicU64,
    bucket_exhausted: AtomicU64,
    bucket_waits: AtomicU64,
    external_429: Mutex<BTreeMap<(String, &'static str), u64>>,
    external_429_global: AtomicU64,
    retry_after: Mutex<Histogram>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            enqueued: Mutex::new(BTreeMap::new()),
            completed: Mutex::new(BTreeMap::new()),
            failed: Mutex::new(BTreeMap::new()),
            dead_lettered: Mutex::new(BTreeMap::new()),
            idempotent_skips: Mutex::new(BTreeMap::new()),
            durations: Mutex::new(BTreeMap::new()),
            bucket_current: AtomicU64::new(0f64.to_bits()),
            bucket_exhausted: AtomicU64::new(0),
            bucket_waits: AtomicU64::new(0),
            external_429: Mutex::new(BTreeMap::new()),
            external_429_global: AtomicU64::new(0),
            retry_after: Mutex::new(Histogram::new(RETRY_AFTER_BUCKETS)),
        }
    }

    pub fn record_enqueued(&self, job_type: JobType) {
        *locked(&self.enqueued).entry(job_type).or_default() += 1;
        ::metrics::counter!("synthesis_jobs_enqueued_total", "type" => job_type.as_str()).increment(1);
    }

    pub fn record_completed(&self, job_type: JobType, elapsed: Duration) {
        *locked(&self.completed).entry(job_type).or_default() += 1;
        self.observe_duration(job_type, elapsed);
        ::metrics::counter!("synthesis_jobs_completed_total", "type" => job_type.as_str()).increment(1);
    }

    /// One failed try. `reason` is the failure classification label.
    pub fn record_failed(&self, job_type: JobType, reason: &'static str, elapsed: Duration) {
        *locked(&self.failed).entry((job_type, reason)).or_default() += 1;
        self.observe_duration(job_type, elapsed);
        ::metrics::counter!(
            "synthesis_jobs_failed_total",
            "type" => job_type.as_str(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn record_dead_lettered(&self, job_type: JobType) {
        *locked(&self.dead_lettered).entry(job_type).or_default() += 1;
        ::metrics::counter!("synthesis_jobs_dead_lettered_total", "type" => job_type.as_str()).increment(1);
    }

    pub fn record_idempotent_skip(&self, job_type: JobType) {
        *locked(&self.idempotent_skips).entry(job_type).or_default() += 1;
        ::metrics::counter!("synthesis_idempotent_skips_total", "type" => job_type.as_str()).increment(1);
    }

    fn observe_duration(&self, job_type: JobType, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        locked(&self.durations)
            .entry(job_type)
            .or_insert_with(|| Histogram::new(DURATION_BUCKETS))
            .observe(secs);
        ::metrics::histogram!("synthesis_job_duration_seconds", "type" => job_type.as_str()).record(secs);
    }

    pub fn set_token_bucket_current(&self, tokens: f64) {
        self.bucket_current.store(tokens.to_bits(), Ordering::Relaxed);
        ::metrics::gauge!("synthesis_token_bucket_current").set(tokens);
    }

    pub fn record_token_bucket_exhausted(&self) {
        self.bucket_exhausted.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("synthesis_token_bucket_exhausted_total").increment(1);
    }

    pub fn record_token_bucket_wait(&self) {
        self.bucket_waits.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("synthesis_token_bucket_waits_total").increment(1);
    }

    /// Any 429 from the external API, scoped or global.
    pub fn record_external_429(&self, endpoint: &str, scope: &'static str, retry_after: Option<Duration>) {
        *locked(&self.external_429)
            .entry((endpoint.to_string(), scope))
            .or_default() += 1;
        ::metrics::counter!(
            "synthesis_external_429_total",
            "endpoint" => endpoint.to_string(),
            "scope" => scope
        )
        .increment(1);

        if let Some(delay) = retry_after {
            locked(&self.retry_after).observe(delay.as_secs_f64());
            ::metrics::histogram!("synthesis_external_429_retry_after_seconds").record(delay.as_secs_f64());
        }
    }

    pub fn record_external_429_global(&self) {
        self.external_429_global.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("synthesis_external_429_global_total").increment(1);
    }

    pub fn jobs_enqueued(&self, job_type: JobType) -> u64 {
        locked(&self.enqueued).get(&job_type).copied().unwrap_or(0)
    }

    pub fn jobs_completed(&self, job_type: JobType) -> u64 {
        locked(&self.completed).get(&job_type).copied().unwrap_or(0)
    }

    pub fn jobs_failed(&self, job_type: JobType, reason: &str) -> u64 {
        locked(&self.failed)
            .iter()
            .filter(|((t, r), _)| *t == job_type && *r == reason)
            .map(|(_, v)| *v)
            .sum()
    }

    pub fn jobs_dead_lettered(&self, job_type: JobType) -> u64 {
        locked(&self.dead_lettered).get(&job_type).copied().unwrap_or(0)
    }

    pub fn idempotent_skips(&self, job_type: JobType) -> u64 {
        locked(&self.idempotent_skips).get(&job_type).copied().unwrap_or(0)
    }

    pub fn duration_samples(&self, job_type: JobType) -> u64 {
        locked(&self.durations).get(&job_type).map(|h| h.count).unwrap_or(0)
    }

    pub fn token_bucket_current(&self) -> f64 {
        f64::from_bits(self.bucket_current.load(Ordering::Relaxed))
    }

    pub fn token_bucket_exhausted(&self) -> u64 {
        self.bucket_exhausted.load(Ordering::Relaxed)
    }

    pub fn token_bucket_waits(&self) -> u64 {
        self.bucket_waits.load(Ordering::Relaxed)
    }

    pub fn external_429(&self, endpoint: &str, scope: &str) -> u64 {
        locked(&self.external_429)
            .iter()
            .filter(|((e, s), _)| e == endpoint && *s == scope)
            .map(|(_, v)| *v)
            .sum()
    }

    /// All scoped 429s regardless of endpoint.
    pub fn external_429_total(&self) -> u64 {
        locked(&self.external_429).values().sum()
    }

    pub fn external_429_global(&self) -> u64 {
        self.external_429_global.load(Ordering::Relaxed)
    }

    pub fn retry_after_samples(&self) -> u64 {
        locked(&self.retry_after).count
    }

    /// Prometheus text exposition.
    pub fn render(&self) -> String {
        let mut out = String::new();

        header(&mut out, "synthesis_jobs_enqueued_total", "Jobs accepted by enqueue", "counter");
        for (t, v) in locked(&self.enqueued).iter() {
            let _ = writeln!(out, "synthesis_jobs_enqueued_total{{type=\"{t}\"}} {v}");
        }

        header(&mut out, "synthesis_jobs_completed_total", "Jobs completed", "counter");
        for (t, v) in locked(&self.completed).iter() {
            let _ = writeln!(out, "synthesis_jobs_completed_total{{type=\"{t}\"}} {v}");
        }

        header(&mut out, "synthesis_jobs_failed_total", "Failed job attempts", "counter");
        for ((t, r), v) in locked(&self.failed).iter() {
            let _ = writeln!(out, "synthesis_jobs_failed_total{{type=\"{t}\",reason=\"{r}\"}} {v}");
        }

        header(&mut out, "synthesis_jobs_dead_lettered_total", "Jobs moved to the dead-letter set", "counter");
        for (t, v) in locked(&self.dead_lettered).iter() {
            let _ = writeln!(out, "synthesis_jobs_dead_lettered_total{{type=\"{t}\"}} {v}");
        }

        header(&mut out, "synthesis_idempotent_skips_total", "Attempts skipped by an idempotency marker", "counter");
        for (t, v) in locked(&self.idempotent_skips).iter() {
            let _ = writeln!(out, "synthesis_idempotent_skips_total{{type=\"{t}\"}} {v}");
        }

        header(&mut out, "synthesis_job_duration_seconds", "Job attempt duration", "histogram");
        for (t, h) in locked(&self.durations).iter() {
            h.render(&mut out, "synthesis_job_duration_seconds", &format!("type=\"{t}\""));
        }

        header(&mut out, "synthesis_token_bucket_current", "Tokens left in the global bucket", "gauge");
        let _ = writeln!(out, "synthesis_token_bucket_current {}", self.token_bucket_current());

        header(&mut out, "synthesis_token_bucket_exhausted_total", "Acquire attempts against an empty bucket", "counter");
        let _ = writeln!(out, "synthesis_token_bucket_exhausted_total {}", self.token_bucket_exhausted());

        header(&mut out, "synthesis_token_bucket_waits_total", "Acquisitions that had to wait", "counter");
        let _ = writeln!(out, "synthesis_token_bucket_waits_total {}", self.token_bucket_waits());

        header(&mut out, "synthesis_external_429_total", "Rate-limit responses from the external API", "counter");
        for ((e, s), v) in locked(&self.external_429).iter() {
            let _ = writeln!(out, "synthesis_external_429_total{{endpoint=\"{e}\",scope=\"{s}\"}} {v}");
        }

        header(&mut out, "synthesis_external_429_global_total", "Global rate-limit responses (critical)", "counter");
        let _ = writeln!(out, "synthesis_external_429_global_total {}", self.external_429_global());

        header(&mut out, "synthesis_external_429_retry_after_seconds", "Server-provided retry delay", "histogram");
        locked(&self.retry_after).render(&mut out, "synthesis_external_429_retry_after_seconds", "");

        out
    }
}

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}
