use serde::Serialize;
use tracing::{debug, error};

use crate::database::ports::DueCase;
use crate::queue::{AddOutcome, CallCasePayload, CaseActionJob, JobOptions, JobQueue};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    /// Submissions accepted by the queue, including deduplicated ones.
    pub queued: usize,
    /// Accepted submissions that collapsed into an already pending job.
    pub deduplicated: usize,
    pub failed: usize,
}

/// Submits one `CALL_CASE` job per claimed case.
///
/// A failed submission is logged and skipped; the claim it belongs to is
/// already committed, so the case simply waits out its cooldown.
pub async fn dispatch_claimed(
    queue: &dyn JobQueue,
    claimed: &[DueCase],
    options: &JobOptions,
) -> DispatchReport {
    let mut report = DispatchReport::default();

    for due in claimed {
        let payload = CallCasePayload {
            tenant_id: due.tenant_id,
            case_id: due.case_id,
        };
        let data = match serde_json::to_value(payload) {
            Ok(data) => data,
            Err(err) => {
                error!(case_id = %due.case_id, error = %err, "Failed to encode case action job");
                report.failed += 1;
                continue;
            }
        };
        let options = options
            .clone()
            .with_job_id(CaseActionJob::CallCase.job_id(due.case_id));

        match queue.add(CaseActionJob::CallCase.as_str(), data, &options).await {
            Ok(outcome) => {
                report.queued += 1;
                if let AddOutcome::Duplicate(job_id) = &outcome {
                    report.deduplicated += 1;
                    debug!(case_id = %due.case_id, job_id = %job_id, "Case action job already pending");
                }
            }
            Err(err) => {
                report.failed += 1;
                error!(
                    case_id = %due.case_id,
                    tenant_id = %due.tenant_id,
                    error = %err,
                    "Failed to enqueue case action job"
                );
            }
        }
    }

    report
}
