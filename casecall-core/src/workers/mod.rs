//! Worker pool hosting one consumer group per queue.

pub mod case_actions;
pub mod pms_sync;
pub mod pool;

pub use case_actions::CaseActionsHandler;
pub use pms_sync::{PmsSyncHandler, PmsSyncListener, SyncRunner};
pub use pool::{Closeable, ConsumerConfig, ShutdownOutcome, WorkerPool};

use async_trait::async_trait;
use tracing::{error, info};

use crate::error::{CaseCallError, Result};
use crate::queue::{FailOutcome, Job};

/// Executes jobs fetched from one queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// `Ok` completes the job; `Err` hands it to the queue's retry policy.
    async fn handle(&self, job: &Job) -> Result<Option<serde_json::Value>>;
}

/// Observes job outcomes. Implementations must not fail: side effects are
/// best-effort and only logged.
#[async_trait]
pub trait JobListener: Send + Sync {
    async fn on_completed(&self, queue: &str, job: &Job, result: Option<&serde_json::Value>);

    async fn on_failed(&self, queue: &str, job: &Job, error: &CaseCallError, outcome: FailOutcome);
}

/// Logs completions at info and failures at error.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

#[async_trait]
impl JobListener for LoggingListener {
    async fn on_completed(&self, queue: &str, job: &Job, _result: Option<&serde_json::Value>) {
        info!(queue, job_id = %job.id, name = %job.name, "Job completed");
    }

    async fn on_failed(&self, queue: &str, job: &Job, error: &CaseCallError, outcome: FailOutcome) {
        error!(
            queue,
            job_id = %job.id,
            name = %job.name,
            attempt = job.attempts_made + 1,
            outcome = ?outcome,
            error = %error,
            "Job failed"
        );
    }
}
