use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tower::ServiceExt;

use synthesis::discord::{DiscordClient, DiscordError, RateLimitInfo, RateLimitScope};
use synthesis::engine::{Backends, EngineSettings, JobSubmission, SynthesisEngine};
use synthesis::idempotency::MemoryIdempotencyStore;
use synthesis::job::{JobId, JobSnapshot, JobState, JobType, SynthesisJob};
use synthesis::payload::{
    AssignRole, CreateChannel, CreateRole, DeleteChannel, DeleteRole, RemoveRole, UpdatePermissions,
};
use synthesis::queue::QueueBackend;
use synthesis::store::MemoryTokenStore;
use synthesis::{create_app, SynthesisError};

const GUILD: &str = "100000000000000001";
const USER: &str = "100000000000000002";
const ROLE: &str = "100000000000000003";

/// Counts calls; `assign_role` behaves as configured.
#[derive(Default)]
struct FakeDiscord {
    calls: AtomicU32,
    assign_error: Mutex<Option<DiscordError>>,
    assign_delay: Mutex<Option<Duration>>,
}

impl FakeDiscord {
    fn failing_with(err: DiscordError) -> Self {
        let fake = Self::default();
        *fake.assign_error.lock().unwrap() = Some(err);
        fake
    }

    fn slow(delay: Duration) -> Self {
        let fake = Self::default();
        *fake.assign_delay.lock().unwrap() = Some(delay);
        fake
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiscordClient for FakeDiscord {
    async fn create_role(&self, _: &CreateRole) -> Result<Option<String>, DiscordError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some("300000000000000001".into()))
    }

    async fn delete_role(&self, _: &DeleteRole) -> Result<(), DiscordError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn assign_role(&self, _: &AssignRole) -> Result<(), DiscordError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.assign_delay.lock().unwrap();
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        match self.assign_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn remove_role(&self, _: &RemoveRole) -> Result<(), DiscordError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_channel(&self, _: &CreateChannel) -> Result<Option<String>, DiscordError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some("300000000000000002".into()))
    }

    async fn delete_channel(&self, _: &DeleteChannel) -> Result<(), DiscordError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_permissions(&self, _: &UpdatePermissions) -> Result<(), DiscordError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn fast_settings() -> EngineSettings {
    let mut settings = EngineSettings::default();
    settings.worker.poll_interval = Duration::from_millis(10);
    settings.worker.acquire_timeout = Duration::from_millis(200);
    settings.limiter.poll_interval = Duration::from_millis(10);
    settings.queue.admission_rate = 1000.0;
    settings.queue.batch_stagger = Duration::ZERO;
    settings.queue.retry.backoff_base = Duration::ZERO;
    settings
}

fn engine_with(client: Arc<FakeDiscord>, settings: EngineSettings) -> Arc<SynthesisEngine> {
    Arc::new(SynthesisEngine::new(
        Backends::in_memory(&settings),
        client,
        settings,
    ))
}

fn assign_role(key: Option<&str>) -> JobSubmission {
    JobSubmission {
        job_type: JobType::AssignRole,
        payload: json!({"guild_id": GUILD, "user_id": USER, "role_id": ROLE}),
        idempotency_key: key.map(str::to_string),
    }
}

async fn wait_for_state(engine: &SynthesisEngine, id: JobId, state: JobState) -> JobSnapshot {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let job = engine.get_job(id).await.unwrap();
        if job.state == state {
            return job;
        }
        assert!(
            Instant::now() < deadline,
            "job stuck in {} waiting for {}",
            job.state,
            state
        );
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_identical_reenqueue_completes_without_external_call() {
    let client = Arc::new(FakeDiscord::default());
    let engine = engine_with(client.clone(), fast_settings());
    engine.start().await;

    let first = engine.enqueue(assign_role(Some("g1:u1:r1"))).await.unwrap();
    wait_for_state(&engine, first, JobState::Completed).await;
    assert_eq!(client.calls(), 1);

    let second = engine.enqueue(assign_role(Some("g1:u1:r1"))).await.unwrap();
    let job = wait_for_state(&engine, second, JobState::Completed).await;

    assert_eq!(client.calls(), 1);
    assert_eq!(job.attempt, 1);
    assert_eq!(engine.metrics().idempotent_skips(JobType::AssignRole), 1);

    engine.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_retryable_failure_dead_letters_after_exactly_max_attempts() {
    let client = Arc::new(FakeDiscord::failing_with(DiscordError::ServerError {
        status: 502,
        message: "Bad Gateway".into(),
    }));
    let engine = engine_with(client.clone(), fast_settings());
    engine.start().await;

    let id = engine.enqueue(assign_role(None)).await.unwrap();
    let job = wait_for_state(&engine, id, JobState::DeadLettered).await;

    assert_eq!(job.attempt, 3);
    assert_eq!(client.calls(), 3);
    assert!(job.last_error.unwrap().contains("502"));

    let dead = engine.list_dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, id);

    engine.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_terminal_failure_dead_letters_after_one_try() {
    let client = Arc::new(FakeDiscord::failing_with(DiscordError::NotFound(
        "Unknown Member".into(),
    )));
    let engine = engine_with(client.clone(), fast_settings());
    engine.start().await;

    let id = engine.enqueue(assign_role(None)).await.unwrap();
    let job = wait_for_state(&engine, id, JobState::DeadLettered).await;

    assert_eq!(job.attempt, 1);
    assert_eq!(client.calls(), 1);
    assert_eq!(engine.metrics().jobs_failed(JobType::AssignRole, "not_found"), 1);

    engine.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_global_rate_limit_is_isolated_and_pauses_pool() {
    let client = Arc::new(FakeDiscord::failing_with(DiscordError::RateLimited(
        RateLimitInfo {
            endpoint: "PUT /guilds/:id/members/:id/roles/:id".into(),
            scope: RateLimitScope::Global,
            retry_after: Some(Duration::from_secs(60)),
            bucket: None,
        },
    )));
    let mut settings = fast_settings();
    settings.auto_pause_on_global_429 = true;
    let engine = engine_with(client.clone(), settings);
    engine.start().await;

    let id = engine.enqueue(assign_role(None)).await.unwrap();
    let job = wait_for_state(&engine, id, JobState::Failed).await;

    let metrics = engine.metrics();
    assert_eq!(metrics.external_429_global(), 1);
    assert_eq!(
        metrics.external_429("PUT /guilds/:id/members/:id/roles/:id", "global"),
        1
    );
    assert_eq!(metrics.external_429("PUT /guilds/:id/members/:id/roles/:id", "user"), 0);
    assert!(engine.is_paused());
    assert!(job.last_error.unwrap().starts_with("rate_limited"));

    engine.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_paused_pool_claims_nothing_until_resumed() {
    let client = Arc::new(FakeDiscord::default());
    let engine = engine_with(client.clone(), fast_settings());
    engine.start().await;

    engine.pause();
    sleep(Duration::from_millis(50)).await;

    let id = engine.enqueue(assign_role(None)).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.get_job(id).await.unwrap().state, JobState::Queued);
    assert_eq!(client.calls(), 0);

    engine.resume();
    wait_for_state(&engine, id, JobState::Completed).await;
    assert_eq!(client.calls(), 1);

    engine.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_jobs() {
    let client = Arc::new(FakeDiscord::slow(Duration::from_millis(150)));
    let engine = engine_with(client.clone(), fast_settings());
    engine.start().await;

    let id = engine.enqueue(assign_role(None)).await.unwrap();
    wait_for_state(&engine, id, JobState::Active).await;

    engine.shutdown(Duration::from_secs(2)).await;
    assert_eq!(engine.get_job(id).await.unwrap().state, JobState::Completed);
}

#[tokio::test]
async fn test_shutdown_returns_interrupted_jobs_to_retry() {
    let client = Arc::new(FakeDiscord::slow(Duration::from_secs(30)));
    let engine = engine_with(client.clone(), fast_settings());
    engine.start().await;

    let id = engine.enqueue(assign_role(None)).await.unwrap();
    wait_for_state(&engine, id, JobState::Active).await;

    let started = Instant::now();
    engine.shutdown(Duration::from_millis(100)).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let job = engine.get_job(id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.last_error.unwrap().contains("interrupted"));
    assert_eq!(engine.metrics().jobs_failed(JobType::AssignRole, "interrupted"), 1);

    let err = engine.enqueue(assign_role(None)).await.unwrap_err();
    assert!(matches!(err, SynthesisError::ShuttingDown));
}

#[tokio::test]
async fn test_invalid_payload_is_rejected_synchronously() {
    let engine = engine_with(Arc::new(FakeDiscord::default()), fast_settings());

    let err = engine
        .enqueue(JobSubmission {
            job_type: JobType::CreateRole,
            payload: json!({"guild_id": GUILD}),
            idempotency_key: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, SynthesisError::InvalidPayload(_)));
    assert_eq!(engine.metrics().jobs_enqueued(JobType::CreateRole), 0);
}

struct UnavailableQueue;

#[async_trait]
impl QueueBackend for UnavailableQueue {
    async fn push(&self, _: &SynthesisJob) -> synthesis::Result<()> {
        Err(SynthesisError::QueueUnavailable("connection refused".into()))
    }
    async fn claim(&self, _: DateTime<Utc>) -> synthesis::Result<Option<SynthesisJob>> {
        Err(SynthesisError::QueueUnavailable("connection refused".into()))
    }
    async fn update(&self, _: &SynthesisJob, _: JobState) -> synthesis::Result<()> {
        Err(SynthesisError::QueueUnavailable("connection refused".into()))
    }
    async fn get(&self, _: JobId) -> synthesis::Result<Option<SynthesisJob>> {
        Err(SynthesisError::QueueUnavailable("connection refused".into()))
    }
    async fn list_dead(&self, _: usize) -> synthesis::Result<Vec<SynthesisJob>> {
        Ok(Vec::new())
    }
    async fn stale_active(&self, _: DateTime<Utc>) -> synthesis::Result<Vec<SynthesisJob>> {
        Ok(Vec::new())
    }
    async fn purge(&self, _: DateTime<Utc>, _: DateTime<Utc>) -> synthesis::Result<usize> {
        Ok(0)
    }
    async fn depth(&self) -> synthesis::Result<usize> {
        Err(SynthesisError::QueueUnavailable("connection refused".into()))
    }
    async fn ping(&self) -> synthesis::Result<()> {
        Err(SynthesisError::QueueUnavailable("connection refused".into()))
    }
}

fn unavailable_engine() -> Arc<SynthesisEngine> {
    let settings = fast_settings();
    let backends = Backends {
        queue: Arc::new(UnavailableQueue),
        tokens: Arc::new(MemoryTokenStore::new()),
        idempotency: Arc::new(MemoryIdempotencyStore::default()),
    };
    Arc::new(SynthesisEngine::new(
        backends,
        Arc::new(FakeDiscord::default()),
        settings,
    ))
}

#[tokio::test]
async fn test_enqueue_fails_when_queue_is_unavailable() {
    let engine = unavailable_engine();
    let err = engine.enqueue(assign_role(None)).await.unwrap_err();
    assert!(matches!(err, SynthesisError::QueueUnavailable(_)));
}

async fn send(app: axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_http_enqueue_and_lookup() {
    let engine = engine_with(Arc::new(FakeDiscord::default()), fast_settings());
    let app = create_app(engine.clone());

    let (status, body) = send(
        app.clone(),
        "POST",
        "/jobs",
        Some(json!({
            "type": "assign_role",
            "payload": {"guild_id": GUILD, "user_id": USER, "role_id": ROLE},
            "idempotency_key": "g1:u1:r1"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["state"], "queued");

    let id = body["id"].as_str().unwrap().to_string();
    let (status, job) = send(app.clone(), "GET", &format!("/jobs/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["type"], "assign_role");
    assert_eq!(job["idempotency_key"], "g1:u1:r1");
    assert_eq!(job["attempt"], 0);

    let (status, body) = send(app, "GET", &format!("/jobs/{}", uuid::Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_http_rejects_invalid_payloads() {
    let engine = engine_with(Arc::new(FakeDiscord::default()), fast_settings());
    let app = create_app(engine);

    let (status, body) = send(
        app.clone(),
        "POST",
        "/jobs",
        Some(json!({"type": "assign_role", "payload": {"guild_id": "nope"}})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "invalid_payload");
    assert_eq!(body["code"], 422);

    let (status, body) = send(
        app.clone(),
        "POST",
        "/jobs",
        Some(json!({"type": "ban_member", "payload": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "invalid_payload");

    let (status, body) = send(
        app,
        "POST",
        "/jobs/batch",
        Some(json!({"jobs": [
            {"type": "delete_role", "payload": {"guild_id": GUILD, "role_id": ROLE}},
            {"type": "delete_role", "payload": {"guild_id": GUILD}}
        ]})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["message"].as_str().unwrap().contains("item 1"));
}

#[tokio::test]
async fn test_http_batch_and_dead_letters() {
    let engine = engine_with(Arc::new(FakeDiscord::default()), fast_settings());
    let app = create_app(engine);

    let (status, body) = send(
        app.clone(),
        "POST",
        "/jobs/batch",
        Some(json!({"jobs": [
            {"type": "delete_role", "payload": {"guild_id": GUILD, "role_id": ROLE}},
            {"type": "delete_channel", "payload": {"guild_id": GUILD, "channel_id": "100000000000000010"}}
        ]})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["count"], 2);

    let (status, body) = send(app, "GET", "/jobs/dead?limit=5", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn test_http_pool_control_and_observability() {
    let engine = engine_with(Arc::new(FakeDiscord::default()), fast_settings());
    let app = create_app(engine.clone());

    let (status, body) = send(app.clone(), "POST", "/admin/pause", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["paused"], true);
    assert!(engine.is_paused());

    let (_, body) = send(app.clone(), "POST", "/admin/resume", None).await;
    assert_eq!(body["paused"], false);

    engine.enqueue(assign_role(None)).await.unwrap();
    let response = app
        .clone()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(
        response.into_body().collect().await.unwrap().to_bytes().to_vec(),
    )
    .unwrap();
    assert!(text.contains("synthesis_jobs_enqueued_total{type=\"assign_role\"} 1"));
    assert!(text.contains("synthesis_token_bucket_current"));

    let (status, body) = send(app.clone(), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = send(app, "GET", "/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn test_http_readiness_reports_unavailable_queue() {
    let app = create_app(unavailable_engine());

    let (status, body) = send(app.clone(), "GET", "/ready", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "not_ready");

    let (status, body) = send(
        app,
        "POST",
        "/jobs",
        Some(json!({
            "type": "assign_role",
            "payload": {"guild_id": GUILD, "user_id": USER, "role_id": ROLE}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "queue_unavailable");
}
