use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::job::{JobId, JobSnapshot, JobState};

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub id: JobId,
    pub state: JobState,
}

impl EnqueueResponse {
    pub fn queued(id: JobId) -> Self {
        Self {
            id,
            state: JobState::Queued,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub ids: Vec<JobId>,
    pub count: usize,
}

impl BatchResponse {
    pub fn new(ids: Vec<JobId>) -> Self {
        Self {
            count: ids.len(),
            ids,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeadLettersResponse {
    pub jobs: Vec<JobSnapshot>,
    pub count: usize,
}

impl DeadLettersResponse {
    pub fn new(jobs: Vec<JobSnapshot>) -> Self {
        Self {
            count: jobs.len(),
            jobs,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub paused: bool,
    pub timestamp: u64,
}

impl ControlResponse {
    pub fn new(paused: bool) -> Self {
        Self {
            paused,
            timestamp: unix_now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub queue: String,
    pub timestamp: u64,
}

impl ReadinessResponse {
    pub fn ready() -> Self {
        Self {
            status: "ready".to_string(),
            queue: "connected".to_string(),
            timestamp: unix_now(),
        }
    }

    pub fn not_ready(reason: &str) -> Self {
        Self {
            status: "not_ready".to_string(),
            queue: reason.to_string(),
            timestamp: unix_now(),
        }
    }
}
