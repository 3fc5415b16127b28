//! `pms-sync` job family. The synchronisation itself is delegated to a
//! [`SyncRunner`]; this module only adapts it to the worker pool.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{JobHandler, JobListener};
use crate::database::ports::SyncConnectionRepository;
use crate::domain::ConnectionId;
use crate::error::{CaseCallError, Result};
use crate::queue::{FailOutcome, Job, PMS_SYNC_JOB, PmsSyncPayload};

const DEFAULT_FAILURE_MESSAGE: &str = "Sync job failed";

#[async_trait]
pub trait SyncRunner: Send + Sync {
    async fn run(&self, payload: &PmsSyncPayload) -> Result<Option<serde_json::Value>>;
}

pub struct PmsSyncHandler {
    runner: Arc<dyn SyncRunner>,
}

impl std::fmt::Debug for PmsSyncHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PmsSyncHandler").finish_non_exhaustive()
    }
}

impl PmsSyncHandler {
    pub fn new(runner: Arc<dyn SyncRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl JobHandler for PmsSyncHandler {
    async fn handle(&self, job: &Job) -> Result<Option<serde_json::Value>> {
        if job.name != PMS_SYNC_JOB {
            warn!(job_id = %job.id, job_name = %job.name, "Unknown PMS sync job type");
            return Ok(None);
        }

        let payload: PmsSyncPayload = job.payload()?;
        info!(
            job_id = %job.id,
            connection_id = %payload.connection_id,
            trigger = ?payload.trigger,
            attempt = job.attempts_made + 1,
            "PMS sync job started"
        );
        self.runner.run(&payload).await
    }
}

/// Marks the connection as errored whenever one of its sync attempts fails.
pub struct PmsSyncListener {
    connections: Arc<dyn SyncConnectionRepository>,
}

impl std::fmt::Debug for PmsSyncListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PmsSyncListener").finish_non_exhaustive()
    }
}

impl PmsSyncListener {
    pub fn new(connections: Arc<dyn SyncConnectionRepository>) -> Self {
        Self { connections }
    }
}

/// Reads the connection id without requiring the rest of the payload to be
/// well formed.
fn connection_id(job: &Job) -> Option<ConnectionId> {
    job.data
        .get("connectionId")
        .and_then(|value| value.as_str())
        .and_then(|raw| raw.parse::<uuid::Uuid>().ok())
        .map(ConnectionId)
}

#[async_trait]
impl JobListener for PmsSyncListener {
    async fn on_completed(&self, _queue: &str, job: &Job, _result: Option<&serde_json::Value>) {
        info!(job_id = %job.id, name = %job.name, "PMS sync job completed");
    }

    async fn on_failed(&self, _queue: &str, job: &Job, error: &CaseCallError, outcome: FailOutcome) {
        let connection_id = connection_id(job);
        error!(
            job_id = %job.id,
            connection_id = ?connection_id,
            outcome = ?outcome,
            error = %error,
            "PMS sync job failed"
        );

        let Some(connection_id) = connection_id else {
            return;
        };
        let message = match error.to_string() {
            message if message.is_empty() => DEFAULT_FAILURE_MESSAGE.to_string(),
            message => message,
        };
        match self.connections.mark_error(connection_id, &message).await {
            Ok(()) => info!(
                connection_id = %connection_id,
                "PMS connection status reset to error after job failure"
            ),
            Err(err) => warn!(
                connection_id = %connection_id,
                error = %err,
                "Could not reset connection status to error"
            ),
        }
    }
}
