//! Process-local [`JobQueue`] with the same transitions as the Redis queue.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    AddOutcome, FailOutcome, Job, JobOptions, JobQueue, QueueCounts, closed_error,
};
use crate::error::{CaseCallError, Result};

const MAX_STALLED_COUNT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Wait,
    Delayed(Instant),
    Active,
    Completed,
    Failed,
}

impl JobState {
    fn is_pending(self) -> bool {
        matches!(self, JobState::Wait | JobState::Delayed(_) | JobState::Active)
    }
}

#[derive(Debug, Clone)]
struct StoredJob {
    job: Job,
    options: JobOptions,
    state: JobState,
    lock: Option<(String, Instant)>,
    stalled_count: u32,
    failed_reason: Option<String>,
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<String, StoredJob>,
    wait: VecDeque<String>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
}

impl QueueState {
    fn promote_delayed(&mut self, now: Instant) {
        let mut due: Vec<(Instant, String)> = self
            .jobs
            .iter()
            .filter_map(|(id, stored)| match stored.state {
                JobState::Delayed(at) if at <= now => Some((at, id.clone())),
                _ => None,
            })
            .collect();
        due.sort();
        for (_, id) in due {
            if let Some(stored) = self.jobs.get_mut(&id) {
                stored.state = JobState::Wait;
                self.wait.push_back(id);
            }
        }
    }

    fn retain_finished(&mut self, failed: bool, keep: u32) {
        let list = if failed {
            &mut self.failed
        } else {
            &mut self.completed
        };
        let mut evicted = Vec::new();
        while list.len() > keep as usize {
            if let Some(id) = list.pop_front() {
                evicted.push(id);
            }
        }
        for id in evicted {
            self.jobs.remove(&id);
        }
    }

    fn take_active(&mut self, job_id: &str, token: &str) -> Result<&mut StoredJob> {
        let stored = self
            .jobs
            .get_mut(job_id)
            .filter(|stored| stored.state == JobState::Active)
            .ok_or_else(|| CaseCallError::Queue(format!("Job {job_id} is not active")))?;
        if let Some((holder, _)) = &stored.lock
            && holder != token
        {
            return Err(CaseCallError::Queue(format!(
                "Lock for job {job_id} is held by another consumer"
            )));
        }
        stored.lock = None;
        Ok(stored)
    }
}

/// In-memory queue for tests and single-process runs.
#[derive(Default)]
pub struct InMemoryJobQueue {
    name: String,
    state: Mutex<QueueState>,
    closed: AtomicBool,
    failing_adds: AtomicUsize,
}

impl fmt::Debug for InMemoryJobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryJobQueue")
            .field("name", &self.name)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl InMemoryJobQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// The next `count` calls to `add` fail with a queue error.
    pub fn fail_next_adds(&self, count: usize) {
        self.failing_adds.store(count, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Ids of jobs waiting for pickup, in pickup order.
    pub async fn waiting_ids(&self) -> Vec<String> {
        self.state.lock().await.wait.iter().cloned().collect()
    }

    pub async fn job(&self, job_id: &str) -> Option<Job> {
        self.state
            .lock()
            .await
            .jobs
            .get(job_id)
            .map(|stored| stored.job.clone())
    }

    pub async fn failed_reason(&self, job_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .jobs
            .get(job_id)
            .and_then(|stored| stored.failed_reason.clone())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(closed_error(&self.name));
        }
        Ok(())
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_adds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(
        &self,
        name: &str,
        data: serde_json::Value,
        options: &JobOptions,
    ) -> Result<AddOutcome> {
        self.ensure_open()?;
        if self.take_injected_failure() {
            return Err(CaseCallError::Queue("injected add failure".into()));
        }

        let id = options
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut state = self.state.lock().await;

        if let Some(existing) = state.jobs.get(&id) {
            if existing.state.is_pending() {
                return Ok(AddOutcome::Duplicate(id));
            }
            state.completed.retain(|other| other != &id);
            state.failed.retain(|other| other != &id);
        }

        let job = Job {
            id: id.clone(),
            name: name.to_string(),
            data,
            attempts: options.attempts.max(1),
            attempts_made: 0,
            timestamp_ms: Utc::now().timestamp_millis(),
        };
        state.jobs.insert(
            id.clone(),
            StoredJob {
                job,
                options: options.clone(),
                state: JobState::Wait,
                lock: None,
                stalled_count: 0,
                failed_reason: None,
            },
        );
        state.wait.push_back(id.clone());
        Ok(AddOutcome::Added(id))
    }

    async fn fetch_next(&self, token: &str, lock: Duration) -> Result<Option<Job>> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.promote_delayed(now);

        while let Some(id) = state.wait.pop_front() {
            if let Some(stored) = state.jobs.get_mut(&id) {
                stored.state = JobState::Active;
                stored.lock = Some((token.to_string(), now + lock));
                return Ok(Some(stored.job.clone()));
            }
        }
        Ok(None)
    }

    async fn extend_lock(&self, job_id: &str, token: &str, lock: Duration) -> Result<bool> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let Some(stored) = state.jobs.get_mut(job_id) else {
            return Ok(false);
        };
        match &mut stored.lock {
            Some((holder, expires)) if holder == token => {
                *expires = Instant::now() + lock;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, job: &Job, token: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let stored = state.take_active(&job.id, token)?;
        stored.state = JobState::Completed;
        let keep = stored.options.remove_on_complete;
        state.completed.push_back(job.id.clone());
        state.retain_finished(false, keep);
        Ok(())
    }

    async fn fail(&self, job: &Job, token: &str, reason: &str) -> Result<FailOutcome> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let stored = state.take_active(&job.id, token)?;
        stored.job.attempts_made += 1;
        stored.failed_reason = Some(reason.to_string());

        if stored.job.attempts_made < stored.job.attempts {
            let delay = stored
                .options
                .backoff
                .map(|backoff| backoff.delay_for(stored.job.attempts_made))
                .unwrap_or_default();
            if delay.is_zero() {
                stored.state = JobState::Wait;
                state.wait.push_back(job.id.clone());
            } else {
                stored.state = JobState::Delayed(now + delay);
            }
            return Ok(FailOutcome::Retrying { delay });
        }

        stored.state = JobState::Failed;
        let keep = stored.options.remove_on_fail;
        state.failed.push_back(job.id.clone());
        state.retain_finished(true, keep);
        Ok(FailOutcome::Failed)
    }

    async fn recover_stalled(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let stalled: Vec<String> = state
            .jobs
            .iter()
            .filter(|(_, stored)| {
                stored.state == JobState::Active
                    && stored.lock.as_ref().is_none_or(|(_, expires)| *expires <= now)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stalled {
            let Some(stored) = state.jobs.get_mut(id) else {
                continue;
            };
            stored.lock = None;
            stored.stalled_count += 1;
            if stored.stalled_count > MAX_STALLED_COUNT {
                stored.state = JobState::Failed;
                stored.failed_reason = Some("job stalled more than allowable limit".into());
                state.failed.push_back(id.clone());
            } else {
                stored.state = JobState::Wait;
                state.wait.push_back(id.clone());
            }
        }
        Ok(stalled)
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for stored in state.jobs.values() {
            match stored.state {
                JobState::Wait => counts.waiting += 1,
                JobState::Delayed(_) => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Backoff;
    use serde_json::json;

    fn options(id: &str) -> JobOptions {
        JobOptions {
            attempts: 2,
            backoff: Some(Backoff::exponential(Duration::from_millis(100))),
            ..JobOptions::default()
        }
        .with_job_id(id)
    }

    #[tokio::test]
    async fn pending_id_is_deduplicated_until_completed() {
        let queue = InMemoryJobQueue::new("case-actions");
        let first = queue.add("CALL_CASE", json!({}), &options("CALL_CASE-1")).await.unwrap();
        let second = queue.add("CALL_CASE", json!({}), &options("CALL_CASE-1")).await.unwrap();
        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());

        let job = queue.fetch_next("t", Duration::from_secs(30)).await.unwrap().unwrap();
        assert!(queue.add("CALL_CASE", json!({}), &options("CALL_CASE-1")).await.unwrap().is_duplicate());

        queue.complete(&job, "t").await.unwrap();
        let again = queue.add("CALL_CASE", json!({}), &options("CALL_CASE-1")).await.unwrap();
        assert!(!again.is_duplicate());
        assert_eq!(queue.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_retries_after_backoff_then_fails() {
        let queue = InMemoryJobQueue::new("q");
        queue.add("x", json!({}), &options("j")).await.unwrap();

        let job = queue.fetch_next("t", Duration::from_secs(30)).await.unwrap().unwrap();
        let outcome = queue.fail(&job, "t", "boom").await.unwrap();
        assert_eq!(outcome, FailOutcome::Retrying { delay: Duration::from_millis(100) });
        assert!(queue.fetch_next("t", Duration::from_secs(30)).await.unwrap().is_none());

        tokio::time::advance(Duration::from_millis(150)).await;
        let job = queue.fetch_next("t", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 1);
        assert_eq!(queue.fail(&job, "t", "boom").await.unwrap(), FailOutcome::Failed);
        assert_eq!(queue.counts().await.unwrap().failed, 1);
        assert_eq!(queue.failed_reason("j").await.as_deref(), Some("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_returns_job_to_wait() {
        let queue = InMemoryJobQueue::new("q");
        queue.add("x", json!({}), &options("j")).await.unwrap();
        let job = queue.fetch_next("a", Duration::from_millis(50)).await.unwrap().unwrap();

        assert!(queue.recover_stalled().await.unwrap().is_empty());
        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(queue.recover_stalled().await.unwrap(), vec!["j".to_string()]);

        let redelivered = queue.fetch_next("b", Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(redelivered.id, job.id);
        assert!(queue.complete(&job, "a").await.is_err());
        queue.complete(&redelivered, "b").await.unwrap();
    }
}
