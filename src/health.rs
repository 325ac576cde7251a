use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::engine::SynthesisEngine;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub paused: bool,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub queue: ServiceStatus,
    pub token_bucket: ServiceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    pub response_time_ms: u64,
    pub detail: Option<String>,
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

pub struct HealthChecker {
    engine: Arc<SynthesisEngine>,
}

impl HealthChecker {
    pub fn new(engine: Arc<SynthesisEngine>) -> Self {
        std::sync::LazyLock::force(&START_TIME);
        Self { engine }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let started = Instant::now();
        let report = self.engine.health().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let now = SystemTime::now();

        let queue = if report.queue_ok {
            ServiceStatus {
                status: "healthy".to_string(),
                response_time_ms: elapsed_ms,
                detail: report.queue_depth.map(|depth| format!("{} waiting", depth)),
            }
        } else {
            ServiceStatus {
                status: "unavailable".to_string(),
                response_time_ms: elapsed_ms,
                detail: Some("Queue backend not reachable".to_string()),
            }
        };

        let token_bucket = match report.tokens_available {
            Some(tokens) => ServiceStatus {
                status: "healthy".to_string(),
                response_time_ms: elapsed_ms,
                detail: Some(format!("{:.1} tokens available", tokens)),
            },
            None => ServiceStatus {
                status: "unavailable".to_string(),
                response_time_ms: elapsed_ms,
                detail: Some("Token store not reachable".to_string()),
            },
        };

        let overall = if report.shutting_down {
            "shutting_down"
        } else if queue.status == "healthy" && token_bucket.status == "healthy" {
            "healthy"
        } else {
            "degraded"
        };

        HealthStatus {
            status: overall.to_string(),
            timestamp: now
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: now.duration_since(*START_TIME).unwrap_or_default().as_secs(),
            paused: report.paused,
            dependencies: DependencyStatus {
                queue,
                token_bucket,
            },
        }
    }
}
