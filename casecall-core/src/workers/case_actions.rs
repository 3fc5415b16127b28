use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::JobHandler;
use crate::calling::CallCaseWorker;
use crate::error::Result;
use crate::queue::{CallCasePayload, CaseActionJob, Job};

/// Routes `case-actions` jobs by name.
#[derive(Debug, Clone)]
pub struct CaseActionsHandler {
    calls: Arc<CallCaseWorker>,
}

impl CaseActionsHandler {
    pub fn new(calls: Arc<CallCaseWorker>) -> Self {
        Self { calls }
    }
}

#[async_trait]
impl JobHandler for CaseActionsHandler {
    async fn handle(&self, job: &Job) -> Result<Option<serde_json::Value>> {
        match CaseActionJob::from_name(&job.name) {
            Some(CaseActionJob::CallCase) => {
                let payload: CallCasePayload = job.payload()?;
                let outcome = self.calls.process(payload).await?;
                Ok(Some(serde_json::to_value(outcome)?))
            }
            Some(CaseActionJob::SyncCallSummary) | None => {
                warn!(job_id = %job.id, job_name = %job.name, "Unknown job type received");
                Ok(None)
            }
        }
    }
}
