use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::info;

use super::dispatch::dispatch_claimed;
use crate::database::ports::{DueCase, DueCaseQuery, DueCaseRepository};
use crate::error::Result;
use crate::queue::{JobOptions, JobQueue};

pub const DEFAULT_COOLDOWN_MINUTES: i64 = 360;

#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub query: DueCaseQuery,
    /// Pushed onto `next_action_at` of every claimed case.
    pub cooldown: Duration,
    /// List what a real run would claim without mutating anything.
    pub dry_run: bool,
    pub job_options: JobOptions,
}

impl Default for ScheduleRequest {
    fn default() -> Self {
        Self {
            query: DueCaseQuery::default(),
            cooldown: Duration::minutes(DEFAULT_COOLDOWN_MINUTES),
            dry_run: false,
            job_options: JobOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleReport {
    pub dry_run: bool,
    pub found: usize,
    pub queued: usize,
    pub deduplicated: usize,
    pub failed: usize,
    /// Selected cases; only populated on dry runs.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cases: Vec<DueCase>,
}

/// One scheduler invocation over the due-case store and the case-actions
/// queue.
#[derive(Clone)]
pub struct DueCaseScheduler {
    cases: Arc<dyn DueCaseRepository>,
    queue: Arc<dyn JobQueue>,
}

impl std::fmt::Debug for DueCaseScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DueCaseScheduler")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl DueCaseScheduler {
    pub fn new(cases: Arc<dyn DueCaseRepository>, queue: Arc<dyn JobQueue>) -> Self {
        Self { cases, queue }
    }

    /// A claim error aborts the run before anything is dispatched; dispatch
    /// errors only show up in the report.
    pub async fn run(&self, request: &ScheduleRequest) -> Result<ScheduleReport> {
        let report = if request.dry_run {
            let cases = self.cases.list_due(&request.query).await?;
            ScheduleReport {
                dry_run: true,
                found: cases.len(),
                queued: 0,
                deduplicated: 0,
                failed: 0,
                cases,
            }
        } else {
            let claimed = self
                .cases
                .claim_due(&request.query, request.cooldown)
                .await?;
            let dispatch =
                dispatch_claimed(self.queue.as_ref(), &claimed, &request.job_options).await;
            ScheduleReport {
                dry_run: false,
                found: claimed.len(),
                queued: dispatch.queued,
                deduplicated: dispatch.deduplicated,
                failed: dispatch.failed,
                cases: Vec::new(),
            }
        };

        info!(
            dry_run = report.dry_run,
            found = report.found,
            queued = report.queued,
            failed = report.failed,
            limit = request.query.limit,
            per_tenant_limit = request.query.per_tenant_limit,
            cooldown_minutes = request.cooldown.num_minutes(),
            tenant_id = ?request.query.tenant_id,
            "Scheduler run completed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryCaseStore;
    use crate::domain::TenantId;
    use crate::queue::InMemoryJobQueue;
    use chrono::Utc;

    fn scheduler(store: &InMemoryCaseStore, queue: &Arc<InMemoryJobQueue>) -> DueCaseScheduler {
        DueCaseScheduler::new(Arc::new(store.clone()), queue.clone())
    }

    #[tokio::test]
    async fn dry_run_reports_without_mutating() {
        let store = InMemoryCaseStore::new();
        let queue = Arc::new(InMemoryJobQueue::new("case-actions"));
        let tenant = TenantId::new();
        let case = store.seed_case(tenant, Some("+1"), true, Utc::now()).await;

        let request = ScheduleRequest {
            dry_run: true,
            ..ScheduleRequest::default()
        };
        let report = scheduler(&store, &queue).run(&request).await.unwrap();

        assert!(report.dry_run);
        assert_eq!(report.found, 1);
        assert_eq!(report.queued, 0);
        assert_eq!(report.cases[0].case_id, case.id);
        assert_eq!(store.case(case.id).await.unwrap().next_action_at, None);
        assert!(queue.waiting_ids().await.is_empty());

        let real = scheduler(&store, &queue)
            .run(&ScheduleRequest::default())
            .await
            .unwrap();
        assert_eq!(real.found, report.found);
    }

    #[tokio::test]
    async fn failed_enqueue_leaves_case_claimed_until_cooldown() {
        let store = InMemoryCaseStore::new();
        let queue = Arc::new(InMemoryJobQueue::new("case-actions"));
        let case = store.seed_case(TenantId::new(), Some("+1"), true, Utc::now()).await;
        queue.fail_next_adds(1);

        let before = Utc::now();
        let report = scheduler(&store, &queue)
            .run(&ScheduleRequest::default())
            .await
            .unwrap();
        assert_eq!(report.found, 1);
        assert_eq!(report.queued, 0);
        assert_eq!(report.failed, 1);
        assert!(queue.waiting_ids().await.is_empty());

        let stored = store.case(case.id).await.unwrap();
        assert!(
            stored.next_action_at.unwrap()
                >= before + Duration::minutes(DEFAULT_COOLDOWN_MINUTES)
        );

        let query = DueCaseQuery::default();
        assert!(store.list_due(&query).await.unwrap().is_empty());

        let rerun = scheduler(&store, &queue)
            .run(&ScheduleRequest::default())
            .await
            .unwrap();
        assert_eq!(rerun.found, 0);
        assert!(queue.waiting_ids().await.is_empty());
    }

    #[tokio::test]
    async fn claim_failure_dispatches_nothing() {
        let store = InMemoryCaseStore::new();
        let queue = Arc::new(InMemoryJobQueue::new("case-actions"));
        store.seed_case(TenantId::new(), Some("+1"), true, Utc::now()).await;
        store.fail_writes(true);

        let result = scheduler(&store, &queue).run(&ScheduleRequest::default()).await;
        assert!(result.is_err());
        assert!(queue.waiting_ids().await.is_empty());
    }
}
