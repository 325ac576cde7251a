//! In-process queue backend with run-at scheduling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use tokio::sync::RwLock;

use super::QueueBackend;
use crate::error::{Result, SynthesisError};
use crate::job::{JobId, JobState, SynthesisJob};

/// Earliest `run_at` first, insertion order among equals.
#[derive(Debug, Clone, Eq, PartialEq)]
struct ReadyEntry {
    run_at: DateTime<Utc>,
    seq: u64,
    id: JobId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, SynthesisJob>,
    ready: BinaryHeap<ReadyEntry>,
    seq: u64,
}

impl State {
    fn schedule(&mut self, job: &SynthesisJob) {
        self.seq += 1;
        self.ready.push(ReadyEntry {
            run_at: job.run_at,
            seq: self.seq,
            id: job.id,
        });
    }
}

/// Jobs live only as long as the process. One lock guards both the records
/// and the schedule so a claim is atomic.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: RwLock<State>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn push(&self, job: &SynthesisJob) -> Result<()> {
        let mut state = self.state.write().await;
        state.jobs.insert(job.id, job.clone());
        state.schedule(job);
        Ok(())
    }

    async fn claim(&self, now: DateTime<Utc>) -> Result<Option<SynthesisJob>> {
        let mut state = self.state.write().await;

        while let Some(entry) = state.ready.peek() {
            if entry.run_at > now {
                break;
            }
            let Some(entry) = state.ready.pop() else {
                break;
            };

            // Entries go stale when a job is rescheduled or purged
            let Some(job) = state.jobs.get_mut(&entry.id) else {
                continue;
            };
            if !job.state.is_claimable() || job.run_at != entry.run_at {
                continue;
            }

            job.mark_active(now)?;
            return Ok(Some(job.clone()));
        }

        Ok(None)
    }

    async fn update(&self, job: &SynthesisJob, from: JobState) -> Result<()> {
        let mut state = self.state.write().await;
        let Some(stored) = state.jobs.get(&job.id) else {
            return Err(SynthesisError::JobNotFound(job.id));
        };
        if stored.state != from || stored.attempt != job.attempt {
            return Err(SynthesisError::InvalidTransition {
                id: job.id,
                from: stored.state,
                to: job.state,
            });
        }

        state.jobs.insert(job.id, job.clone());
        if job.state.is_claimable() {
            state.schedule(job);
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<SynthesisJob>> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn list_dead(&self, limit: usize) -> Result<Vec<SynthesisJob>> {
        let state = self.state.read().await;
        let mut dead: Vec<_> = state
            .jobs
            .values()
            .filter(|job| job.state == JobState::DeadLettered)
            .cloned()
            .collect();
        dead.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        dead.truncate(limit);
        Ok(dead)
    }

    async fn stale_active(&self, claimed_before: DateTime<Utc>) -> Result<Vec<SynthesisJob>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Active)
            .filter(|job| job.last_attempt_at.is_some_and(|at| at <= claimed_before))
            .cloned()
            .collect())
    }

    async fn purge(&self, completed_before: DateTime<Utc>, dead_before: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write().await;
        let before = state.jobs.len();

        state.jobs.retain(|_, job| {
            let cutoff = match job.state {
                JobState::Completed => completed_before,
                JobState::DeadLettered => dead_before,
                _ => return true,
            };
            job.finished_at.map_or(true, |at| at >= cutoff)
        });

        Ok(before - state.jobs.len())
    }

    async fn depth(&self) -> Result<usize> {
        let state = self.state.read().await;
        Ok(state.jobs.values().filter(|job| job.state.is_claimable()).count())
    }
}
