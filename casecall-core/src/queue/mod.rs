//! At-least-once job queue shared by the scheduler and the worker pool.
//!
//! Jobs carry a deterministic id; adding an id that is still pending
//! collapses into the existing job. Retry and backoff are owned by the queue,
//! configured per job through [`JobOptions`].

pub mod jobs;
pub mod memory;
pub mod redis_queue;

pub use jobs::*;
pub use memory::InMemoryJobQueue;
pub use redis_queue::{RedisConnection, RedisJobQueue};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::{CaseCallError, Result};

/// Exponential backoff: the n-th retry waits `base * 2^(n-1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Self { base }
    }

    /// Delay before the retry that follows `attempts_made` failed attempts.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent)
    }
}

/// Per-job submission options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    /// Deterministic identity; a random id is generated when absent.
    pub job_id: Option<String>,
    /// Total attempts including the first.
    pub attempts: u32,
    pub backoff: Option<Backoff>,
    /// Number of completed jobs retained for inspection.
    pub remove_on_complete: u32,
    /// Number of failed jobs retained for inspection.
    pub remove_on_fail: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            attempts: 3,
            backoff: Some(Backoff::exponential(Duration::from_millis(2_000))),
            remove_on_complete: 1_000,
            remove_on_fail: 5_000,
        }
    }
}

impl JobOptions {
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub(crate) fn backoff_ms(&self) -> u64 {
        self.backoff
            .map(|b| u64::try_from(b.base.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// A job handed to a consumer together with its lock.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub data: serde_json::Value,
    pub attempts: u32,
    /// Failed attempts before this delivery.
    pub attempts_made: u32,
    /// Creation time, unix milliseconds.
    pub timestamp_ms: i64,
}

impl Job {
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(CaseCallError::from)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Added(String),
    /// A pending job with the same id already exists.
    Duplicate(String),
}

impl AddOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            AddOutcome::Added(id) | AddOutcome::Duplicate(id) => id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, AddOutcome::Duplicate(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Scheduled for another attempt after `delay`.
    Retrying { delay: Duration },
    /// Attempts exhausted; the job moved to the failed set.
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

#[async_trait]
pub trait JobQueue: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn add(
        &self,
        name: &str,
        data: serde_json::Value,
        options: &JobOptions,
    ) -> Result<AddOutcome>;

    /// Moves the next ready job to active and locks it for `lock` under
    /// `token`. Due delayed jobs are promoted first.
    async fn fetch_next(&self, token: &str, lock: Duration) -> Result<Option<Job>>;

    /// Returns `false` when the lock is no longer held by `token`.
    async fn extend_lock(&self, job_id: &str, token: &str, lock: Duration) -> Result<bool>;

    async fn complete(&self, job: &Job, token: &str) -> Result<()>;

    async fn fail(&self, job: &Job, token: &str, reason: &str) -> Result<FailOutcome>;

    /// Returns active jobs whose lock expired to the wait list (or fails them
    /// once they stalled too often). Yields the affected job ids.
    async fn recover_stalled(&self) -> Result<Vec<String>>;

    async fn counts(&self) -> Result<QueueCounts>;

    async fn close(&self) -> Result<()>;
}

pub(crate) fn closed_error(queue: &str) -> CaseCallError {
    CaseCallError::Queue(format!("queue {queue} is closed"))
}
