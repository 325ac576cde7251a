use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::engine::{JobSubmission, SynthesisEngine};
use crate::error::SynthesisError;
use crate::health::HealthChecker;
use crate::queue::at_index;
use crate::response::{BatchResponse, ControlResponse, DeadLettersResponse, EnqueueResponse, ReadinessResponse};

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;
const MAX_DEAD_LETTER_LIMIT: usize = 500;

/// Shared application state
pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub engine: Arc<SynthesisEngine>,
    pub health: HealthChecker,
}

impl AppState {
    pub fn new(engine: Arc<SynthesisEngine>) -> Self {
        Self {
            health: HealthChecker::new(engine.clone()),
            engine,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub jobs: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

fn submission(body: Value) -> Result<JobSubmission, SynthesisError> {
    serde_json::from_value(body).map_err(|e| SynthesisError::InvalidPayload(e.to_string()))
}

/// Enqueue one job
pub async fn enqueue_job(
    State(state): State<SharedState>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, SynthesisError> {
    let id = state.engine.enqueue(submission(body)?).await?;
    Ok((StatusCode::CREATED, Json(EnqueueResponse::queued(id))))
}

/// Enqueue a batch; nothing is stored unless every item is valid
pub async fn enqueue_batch(
    State(state): State<SharedState>,
    Json(body): Json<BatchRequest>,
) -> Result<impl IntoResponse, SynthesisError> {
    let submissions = body
        .jobs
        .into_iter()
        .enumerate()
        .map(|(i, item)| submission(item).map_err(|e| at_index(i, e)))
        .collect::<Result<Vec<_>, _>>()?;

    let ids = state.engine.enqueue_batch(submissions).await?;
    Ok((StatusCode::CREATED, Json(BatchResponse::new(ids))))
}

pub async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, SynthesisError> {
    Ok(Json(state.engine.get_job(id).await?))
}

pub async fn list_dead_letters(
    State(state): State<SharedState>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<impl IntoResponse, SynthesisError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
        .min(MAX_DEAD_LETTER_LIMIT);
    let jobs = state.engine.list_dead_letters(limit).await?;
    Ok(Json(DeadLettersResponse::new(jobs)))
}

pub async fn pause(State(state): State<SharedState>) -> impl IntoResponse {
    state.engine.pause();
    Json(ControlResponse::new(state.engine.is_paused()))
}

pub async fn resume(State(state): State<SharedState>) -> impl IntoResponse {
    state.engine.resume();
    Json(ControlResponse::new(state.engine.is_paused()))
}

/// Prometheus text exposition
pub async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.engine.render_metrics().await,
    )
}

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.health.check_health().await)
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<SharedState>) -> impl IntoResponse {
    let report = state.engine.health().await;

    if report.shutting_down {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse::not_ready("shutting down")),
        )
    } else if !report.queue_ok {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse::not_ready("disconnected")),
        )
    } else {
        (StatusCode::OK, Json(ReadinessResponse::ready()))
    }
}
