//! Scheduler run feeding the worker pool, end to end on the in-memory
//! adapters.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use casecall_core::calling::{CallCaseWorker, ContextSigner, SignedContextParams};
use casecall_core::database::InMemoryCaseStore;
use casecall_core::database::ports::DueCaseQuery;
use casecall_core::domain::{
    CaseStatus, InteractionStatus, META_LAST_CALL_ERROR_MESSAGE, OUTCOME_FAILED, TenantId,
};
use casecall_core::error::CaseCallError;
use casecall_core::providers::{CallProvider, CallRequest};
use casecall_core::queue::{
    CASE_ACTIONS_QUEUE, FailOutcome, InMemoryJobQueue, Job, JobQueue,
};
use casecall_core::scheduling::{DueCaseScheduler, ScheduleRequest};
use casecall_core::workers::{
    CaseActionsHandler, ConsumerConfig, JobListener, ShutdownOutcome, WorkerPool,
};
use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use url::Url;

const VOICE_URL: &str = "https://voice.example.test/twilio/voice";

/// Accepts every call except those to numbers listed in `reject`.
#[derive(Default)]
struct RecordingProvider {
    requests: Mutex<Vec<CallRequest>>,
    reject: Vec<String>,
    placed: AtomicUsize,
}

#[async_trait]
impl CallProvider for RecordingProvider {
    async fn place_call(&self, request: &CallRequest) -> casecall_core::Result<String> {
        self.requests.lock().await.push(request.clone());
        if self.reject.contains(&request.to) {
            return Err(CaseCallError::CallProvider {
                status: 400,
                body: "invalid destination".into(),
            });
        }
        let n = self.placed.fetch_add(1, Ordering::SeqCst);
        Ok(format!("CA{n:04}"))
    }
}

struct CompletionListener(mpsc::UnboundedSender<Result<String, String>>);

#[async_trait]
impl JobListener for CompletionListener {
    async fn on_completed(&self, _queue: &str, job: &Job, _result: Option<&serde_json::Value>) {
        let _ = self.0.send(Ok(job.id.clone()));
    }

    async fn on_failed(&self, _queue: &str, job: &Job, error: &CaseCallError, _outcome: FailOutcome) {
        let _ = self.0.send(Err(format!("{}: {error}", job.id)));
    }
}

struct Harness {
    store: InMemoryCaseStore,
    queue: Arc<InMemoryJobQueue>,
    provider: Arc<RecordingProvider>,
    signer: Arc<ContextSigner>,
}

impl Harness {
    fn new(provider: RecordingProvider) -> Result<Self> {
        Ok(Self {
            store: InMemoryCaseStore::new(),
            queue: Arc::new(InMemoryJobQueue::new(CASE_ACTIONS_QUEUE)),
            provider: Arc::new(provider),
            signer: Arc::new(ContextSigner::new(
                "integration-secret",
                chrono::Duration::minutes(10),
                "1",
            )?),
        })
    }

    fn scheduler(&self) -> DueCaseScheduler {
        DueCaseScheduler::new(Arc::new(self.store.clone()), self.queue.clone())
    }

    fn pool(&self) -> (WorkerPool, mpsc::UnboundedReceiver<Result<String, String>>) {
        let worker = CallCaseWorker::new(
            Arc::new(self.store.clone()),
            self.provider.clone(),
            self.signer.clone(),
            VOICE_URL,
            chrono::Duration::minutes(360),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::new();
        pool.register(
            self.queue.clone(),
            Arc::new(CaseActionsHandler::new(Arc::new(worker))),
            Arc::new(CompletionListener(tx)),
            ConsumerConfig {
                concurrency: 3,
                poll_interval: Duration::from_millis(10),
                ..ConsumerConfig::default()
            },
        );
        (pool, rx)
    }
}

async fn drain_events(
    rx: &mut mpsc::UnboundedReceiver<Result<String, String>>,
    expected: usize,
) -> Vec<Result<String, String>> {
    let mut events = Vec::with_capacity(expected);
    tokio::time::timeout(Duration::from_secs(5), async {
        while events.len() < expected {
            match rx.recv().await {
                Some(event) => events.push(event),
                None => break,
            }
        }
    })
    .await
    .ok();
    events
}

#[tokio::test]
async fn scheduled_cases_are_called_once_each() -> Result<()> {
    let harness = Harness::new(RecordingProvider::default())?;
    let tenant = TenantId::new();
    let base = Utc::now() - chrono::Duration::hours(1);
    let mut cases = Vec::new();
    for i in 0..3 {
        let phone = format!("+1555000000{i}");
        cases.push(
            harness
                .store
                .seed_case(tenant, Some(&phone), true, base + chrono::Duration::seconds(i))
                .await,
        );
    }

    let report = harness.scheduler().run(&ScheduleRequest::default()).await?;
    assert_eq!(report.found, 3);
    assert_eq!(report.queued, 3);

    // A second run inside the cooldown finds nothing to claim.
    let again = harness.scheduler().run(&ScheduleRequest::default()).await?;
    assert_eq!(again.found, 0);

    let (pool, mut events) = harness.pool();
    pool.start().await;
    let events = drain_events(&mut events, 3).await;
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(Result::is_ok), "{events:?}");

    let outcome = pool.shutdown(Duration::from_secs(5), std::future::pending()).await;
    assert_eq!(outcome, ShutdownOutcome::Drained);

    let requests = harness.provider.requests.lock().await.clone();
    assert_eq!(requests.len(), 3);
    for case in &cases {
        let stored = harness.store.case(case.id).await.expect("case exists");
        assert_eq!(stored.status, CaseStatus::InProgress);
        assert!(stored.last_contacted_at.is_some());

        let interactions = harness.store.interactions_for(case.id).await;
        assert_eq!(interactions.len(), 1);
        let interaction = &interactions[0];
        assert_eq!(interaction.status, InteractionStatus::InProgress);
        assert!(interaction.provider_ref.as_deref().is_some_and(|r| r.starts_with("CA")));

        let request = requests
            .iter()
            .find(|r| r.callback_url.contains(&interaction.id.to_string()))
            .expect("callback url carries the interaction id");
        let url = Url::parse(&request.callback_url)?;
        let params = SignedContextParams::from_url(&url)?;
        harness
            .signer
            .verify(&params, interaction.tenant_id, case.id, Utc::now())?;
    }
    Ok(())
}

#[tokio::test]
async fn missing_phone_and_rejected_call_end_in_their_terminal_records() -> Result<()> {
    let harness = Harness::new(RecordingProvider {
        reject: vec!["+15550009999".into()],
        ..RecordingProvider::default()
    })?;
    let tenant = TenantId::new();
    let now = Utc::now();
    let no_phone = harness.store.seed_case(tenant, None, true, now).await;
    let rejected = harness
        .store
        .seed_case(tenant, Some("+15550009999"), true, now)
        .await;

    let report = harness.scheduler().run(&ScheduleRequest::default()).await?;
    assert_eq!(report.queued, 2);

    let (pool, mut events) = harness.pool();
    pool.start().await;
    let events = drain_events(&mut events, 2).await;
    assert!(events.iter().all(Result::is_ok), "{events:?}");
    pool.shutdown(Duration::from_secs(5), std::future::pending()).await;

    let invalid = harness.store.case(no_phone.id).await.expect("case exists");
    assert_eq!(invalid.status, CaseStatus::InvalidContact);
    assert_eq!(invalid.next_action_at, None);
    let invalid_log = harness.store.interactions_for(no_phone.id).await;
    assert_eq!(invalid_log.len(), 1);
    assert_eq!(invalid_log[0].status, InteractionStatus::Failed);

    let failed = harness.store.case(rejected.id).await.expect("case exists");
    assert_eq!(failed.status, CaseStatus::InProgress);
    assert!(failed.next_action_at.is_some_and(|at| at > Utc::now()));
    assert!(failed.meta.get(META_LAST_CALL_ERROR_MESSAGE).is_some());
    let failed_log = harness.store.interactions_for(rejected.id).await;
    assert_eq!(failed_log.len(), 1);
    assert_eq!(failed_log[0].status, InteractionStatus::Failed);
    assert_eq!(failed_log[0].outcome.as_deref(), Some(OUTCOME_FAILED));

    assert_eq!(harness.provider.requests.lock().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn dry_run_reports_cases_without_claiming_or_enqueueing() -> Result<()> {
    let harness = Harness::new(RecordingProvider::default())?;
    let tenant = TenantId::new();
    let case = harness
        .store
        .seed_case(tenant, Some("+15550000001"), true, Utc::now())
        .await;

    let request = ScheduleRequest {
        dry_run: true,
        ..ScheduleRequest::default()
    };
    let report = harness.scheduler().run(&request).await?;
    assert!(report.dry_run);
    assert_eq!(report.found, 1);
    assert_eq!(report.queued, 0);
    assert_eq!(report.cases[0].case_id, case.id);

    assert!(harness.queue.waiting_ids().await.is_empty());
    let stored = harness.store.case(case.id).await.expect("case exists");
    assert_eq!(stored.next_action_at, None);
    Ok(())
}

#[tokio::test]
async fn tenant_scope_and_per_tenant_cap_bound_each_run() -> Result<()> {
    let harness = Harness::new(RecordingProvider::default())?;
    let busy = TenantId::new();
    let quiet = TenantId::new();
    let now = Utc::now();
    for i in 0..4 {
        harness
            .store
            .seed_case(busy, Some("+15550000001"), true, now + chrono::Duration::seconds(i))
            .await;
    }
    harness
        .store
        .seed_case(quiet, Some("+15550000002"), true, now)
        .await;

    let capped = ScheduleRequest {
        query: DueCaseQuery {
            per_tenant_limit: 2,
            ..DueCaseQuery::default()
        },
        dry_run: true,
        ..ScheduleRequest::default()
    };
    let report = harness.scheduler().run(&capped).await?;
    assert_eq!(report.found, 3);
    assert_eq!(report.cases.iter().filter(|c| c.tenant_id == busy).count(), 2);

    let scoped = ScheduleRequest {
        query: DueCaseQuery {
            tenant_id: Some(busy),
            limit: 3,
            per_tenant_limit: 1,
            ..DueCaseQuery::default()
        },
        ..ScheduleRequest::default()
    };
    let report = harness.scheduler().run(&scoped).await?;
    assert_eq!(report.queued, 3);

    let waiting = harness.queue.waiting_ids().await;
    assert_eq!(waiting.len(), 3);
    assert!(waiting.iter().all(|id| id.starts_with("CALL_CASE-")));
    Ok(())
}

#[tokio::test]
async fn duplicate_job_ids_are_not_enqueued_twice() -> Result<()> {
    let harness = Harness::new(RecordingProvider::default())?;
    let tenant = TenantId::new();
    let case = harness
        .store
        .seed_case(tenant, Some("+15550000001"), true, Utc::now())
        .await;

    let report = harness.scheduler().run(&ScheduleRequest::default()).await?;
    assert_eq!(report.queued, 1);

    // Make the case due again while its job is still waiting.
    harness
        .store
        .update_case(case.id, |c| c.next_action_at = None)
        .await;
    let report = harness.scheduler().run(&ScheduleRequest::default()).await?;
    assert_eq!(report.found, 1);
    assert_eq!(report.queued, 0);
    assert_eq!(report.deduplicated, 1);

    assert_eq!(harness.queue.waiting_ids().await.len(), 1);
    assert_eq!(harness.queue.counts().await?.waiting, 1);
    Ok(())
}
