//! Job records and their lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Result, SynthesisError};
use crate::payload::JobPayload;

/// Job identifier
pub type JobId = Uuid;

/// The seven supported mutation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    CreateRole,
    DeleteRole,
    AssignRole,
    RemoveRole,
    CreateChannel,
    DeleteChannel,
    UpdatePermissions,
}

impl JobType {
    pub const ALL: [JobType; 7] = [
        JobType::CreateRole,
        JobType::DeleteRole,
        JobType::AssignRole,
        JobType::RemoveRole,
        JobType::CreateChannel,
        JobType::DeleteChannel,
        JobType::UpdatePermissions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::CreateRole => "create_role",
            JobType::DeleteRole => "delete_role",
            JobType::AssignRole => "assign_role",
            JobType::RemoveRole => "remove_role",
            JobType::CreateChannel => "create_channel",
            JobType::DeleteChannel => "delete_channel",
            JobType::UpdatePermissions => "update_permissions",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job state. `Failed` is the backoff window between a retryable failure and
/// the next claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
    DeadLettered,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::DeadLettered)
    }

    /// Whether a worker may claim a job in this state once `run_at` has passed.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::DeadLettered => "dead_lettered",
        };
        f.write_str(s)
    }
}

/// Exponential retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    pub multiplier: f64,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1000),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next try after `attempt` tries have failed (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let millis = self.backoff_base.as_millis() as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis as u64).min(self.max_backoff)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// A persisted job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisJob {
    pub id: JobId,
    pub payload: JobPayload,
    pub idempotency_key: String,
    pub attempt: u32,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub applied_effect_id: Option<String>,
}

impl SynthesisJob {
    pub fn new(payload: JobPayload, idempotency_key: String, run_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            idempotency_key,
            attempt: 0,
            state: JobState::Queued,
            enqueued_at: Utc::now(),
            run_at,
            last_attempt_at: None,
            finished_at: None,
            last_error: None,
            applied_effect_id: None,
        }
    }

    pub fn job_type(&self) -> JobType {
        self.payload.job_type()
    }

    fn guard(&self, to: JobState) -> Result<()> {
        let allowed = match to {
            JobState::Active => self.state.is_claimable(),
            JobState::Completed | JobState::Failed | JobState::DeadLettered => {
                self.state == JobState::Active
            }
            JobState::Queued => false,
        };

        if allowed {
            Ok(())
        } else {
            Err(SynthesisError::InvalidTransition {
                id: self.id,
                from: self.state,
                to,
            })
        }
    }

    /// queued/failed -> active. Counts one execution try.
    pub fn mark_active(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.guard(JobState::Active)?;
        self.state = JobState::Active;
        self.attempt += 1;
        self.last_attempt_at = Some(now);
        Ok(())
    }

    pub fn mark_completed(&mut self, effect_id: Option<String>, now: DateTime<Utc>) -> Result<()> {
        self.guard(JobState::Completed)?;
        self.state = JobState::Completed;
        self.applied_effect_id = effect_id;
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn mark_retrying(&mut self, error: String, run_at: DateTime<Utc>) -> Result<()> {
        self.guard(JobState::Failed)?;
        self.state = JobState::Failed;
        self.last_error = Some(error);
        self.run_at = run_at;
        Ok(())
    }

    pub fn mark_dead(&mut self, reason: String, now: DateTime<Utc>) -> Result<()> {
        self.guard(JobState::DeadLettered)?;
        self.state = JobState::DeadLettered;
        self.last_error = Some(reason);
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            job_type: self.job_type(),
            state: self.state,
            attempt: self.attempt,
            idempotency_key: self.idempotency_key.clone(),
            last_error: self.last_error.clone(),
            applied_effect_id: self.applied_effect_id.clone(),
            enqueued_at: self.enqueued_at,
            last_attempt_at: self.last_attempt_at,
            finished_at: self.finished_at,
        }
    }
}

/// Read model returned by `get_job`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub state: JobState,
    pub attempt: u32,
    pub idempotency_key: String,
    pub last_error: Option<String>,
    pub applied_effect_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{AssignRole, JobPayload};

    fn sample_job() -> SynthesisJob {
        let payload = JobPayload::AssignRole(AssignRole {
            guild_id: "100000000000000001".into(),
            user_id: "100000000000000002".into(),
            role_id: "100000000000000003".into(),
            reason: None,
        });
        SynthesisJob::new(payload, "g1:u1:r1".into(), Utc::now())
    }

    #[test]
    fn test_backoff_is_exponential_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(1000));
        assert_eq!(policy.delay(2), Duration::from_millis(2000));
        assert_eq!(policy.delay(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_backoff: Duration::from_secs(5),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay(10), Duration::from_secs(5));
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let mut job = sample_job();
        let now = Utc::now();
        job.mark_active(now).unwrap();
        assert_eq!(job.attempt, 1);
        job.mark_completed(Some("effect".into()), now).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.applied_effect_id.as_deref(), Some("effect"));
    }

    #[test]
    fn test_retry_then_reclaim_increments_attempt() {
        let mut job = sample_job();
        let now = Utc::now();
        job.mark_active(now).unwrap();
        job.mark_retrying("server error".into(), now).unwrap();
        assert_eq!(job.state, JobState::Failed);
        job.mark_active(now).unwrap();
        assert_eq!(job.attempt, 2);
    }

    #[test]
    fn test_terminal_states_have_no_exit() {
        let mut job = sample_job();
        let now = Utc::now();
        job.mark_active(now).unwrap();
        job.mark_dead("forbidden".into(), now).unwrap();

        assert!(job.mark_active(now).is_err());
        assert!(job.mark_completed(None, now).is_err());
        assert!(job.mark_retrying("x".into(), now).is_err());
        assert_eq!(job.state, JobState::DeadLettered);
    }

    #[test]
    fn test_cannot_complete_unclaimed_job() {
        let mut job = sample_job();
        let err = job.mark_completed(None, Utc::now()).unwrap_err();
        assert!(matches!(err, SynthesisError::InvalidTransition { .. }));
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&JobState::DeadLettered).unwrap();
        assert_eq!(json, "\"dead_lettered\"");
        assert_eq!(JobType::UpdatePermissions.to_string(), "update_permissions");
    }
}
