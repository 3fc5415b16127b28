use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{JobHandler, JobListener};
use crate::error::Result;
use crate::queue::{Job, JobQueue};

/// A shared resource closed once the consumers have stopped.
#[async_trait]
pub trait Closeable: Send + Sync {
    fn resource_name(&self) -> &str;

    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Jobs processed at the same time.
    pub concurrency: usize,
    /// Idle delay between fetches when the queue is empty.
    pub poll_interval: Duration,
    /// Lock held on an active job; renewed at half this period.
    pub lock_duration: Duration,
    /// Interval between stalled-job checks.
    pub stalled_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(1_000),
            lock_duration: Duration::from_millis(30_000),
            stalled_interval: Duration::from_millis(120_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight job finished before the deadline.
    Drained,
    /// The deadline passed; remaining consumers were aborted.
    TimedOut,
    /// A second shutdown request aborted the drain.
    Forced,
}

#[derive(Clone)]
struct Consumer {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    listener: Arc<dyn JobListener>,
    config: ConsumerConfig,
}

/// Owns the consumer loops of every registered queue and their shutdown.
///
/// Draining stops job pickup; jobs already running are never interrupted
/// except by a forced or timed-out shutdown, after which their locks expire
/// and the stalled check hands them to another consumer.
pub struct WorkerPool {
    consumers: Vec<Consumer>,
    resources: Vec<Arc<dyn Closeable>>,
    drain: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    worker_id: String,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queues: Vec<&str> = self.consumers.iter().map(|c| c.queue.name()).collect();
        let resources: Vec<&str> = self.resources.iter().map(|r| r.resource_name()).collect();
        let worker_handle_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("WorkerPool")
            .field("worker_id", &self.worker_id)
            .field("queues", &queues)
            .field("resources", &resources)
            .field("worker_handle_count", &worker_handle_count)
            .field("draining", &self.drain.is_cancelled())
            .finish()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            consumers: Vec::new(),
            resources: Vec::new(),
            drain: CancellationToken::new(),
            worker_handles: Mutex::new(Vec::new()),
            worker_id: format!("{}-{}", std::process::id(), Uuid::new_v4().simple()),
        }
    }

    pub fn register(
        &mut self,
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        listener: Arc<dyn JobListener>,
        config: ConsumerConfig,
    ) -> &mut Self {
        self.consumers.push(Consumer {
            queue,
            handler,
            listener,
            config,
        });
        self
    }

    /// Closed after the queues, in registration order.
    pub fn add_resource(&mut self, resource: Arc<dyn Closeable>) -> &mut Self {
        self.resources.push(resource);
        self
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    pub async fn start(&self) {
        let mut handles = self.worker_handles.lock().await;
        for consumer in &self.consumers {
            let queue_name = consumer.queue.name().to_string();
            for slot in 0..consumer.config.concurrency.max(1) {
                let token = format!("{}:{}:{}", self.worker_id, queue_name, slot);
                handles.push(tokio::spawn(run_slot(
                    consumer.clone(),
                    token,
                    self.drain.clone(),
                )));
            }
            handles.push(tokio::spawn(run_stalled_checker(
                consumer.queue.clone(),
                consumer.config.stalled_interval,
                self.drain.clone(),
            )));
            info!(
                queue = %queue_name,
                concurrency = consumer.config.concurrency.max(1),
                "Worker started"
            );
        }
    }

    /// Stops pickup and waits for in-flight jobs until `timeout` elapses or
    /// `force` resolves, whichever comes first, then closes every queue and
    /// resource. Close errors are logged and never returned.
    pub async fn shutdown<F>(&self, timeout: Duration, force: F) -> ShutdownOutcome
    where
        F: Future<Output = ()>,
    {
        info!("Shutdown requested. Waiting for current job(s) to finish");
        self.drain.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        let drained = async {
            for result in join_all(handles).await {
                if let Err(err) = result
                    && !err.is_cancelled()
                {
                    warn!(error = %err, "Worker task failed");
                }
            }
        };

        let outcome = tokio::select! {
            _ = drained => ShutdownOutcome::Drained,
            _ = tokio::time::sleep(timeout) => {
                warn!("Shutdown timeout reached, closing workers");
                ShutdownOutcome::TimedOut
            }
            _ = force => {
                warn!("Forcing exit");
                ShutdownOutcome::Forced
            }
        };

        if outcome != ShutdownOutcome::Drained {
            for abort in aborts {
                abort.abort();
            }
        }

        self.close_all().await;
        if outcome == ShutdownOutcome::Drained {
            info!("Worker shut down cleanly");
        }
        outcome
    }

    async fn close_all(&self) {
        for consumer in &self.consumers {
            if let Err(err) = consumer.queue.close().await {
                warn!(queue = %consumer.queue.name(), error = %err, "Error closing worker queue");
            }
        }
        for resource in &self.resources {
            if let Err(err) = resource.close().await {
                warn!(resource = %resource.resource_name(), error = %err, "Error closing resource");
            }
        }
    }
}

async fn run_slot(consumer: Consumer, token: String, drain: CancellationToken) {
    let queue_name = consumer.queue.name().to_string();
    loop {
        if drain.is_cancelled() {
            break;
        }

        match consumer
            .queue
            .fetch_next(&token, consumer.config.lock_duration)
            .await
        {
            Ok(Some(job)) => process_job(&consumer, &token, job).await,
            Ok(None) => {
                tokio::select! {
                    _ = drain.cancelled() => break,
                    _ = tokio::time::sleep(consumer.config.poll_interval) => {}
                }
            }
            Err(err) => {
                warn!(queue = %queue_name, error = %err, "Failed to fetch next job");
                tokio::select! {
                    _ = drain.cancelled() => break,
                    _ = tokio::time::sleep(consumer.config.poll_interval) => {}
                }
            }
        }
    }
    debug!(queue = %queue_name, worker = %token, "Worker slot stopped");
}

async fn process_job(consumer: &Consumer, token: &str, job: Job) {
    let queue = consumer.queue.name();
    let result = handle_with_lock_renewal(consumer, token, &job).await;

    match result {
        Ok(value) => match consumer.queue.complete(&job, token).await {
            Ok(()) => {
                consumer
                    .listener
                    .on_completed(queue, &job, value.as_ref())
                    .await
            }
            Err(err) => warn!(queue, job_id = %job.id, error = %err, "Failed to mark job completed"),
        },
        Err(error) => match consumer.queue.fail(&job, token, &error.to_string()).await {
            Ok(outcome) => consumer.listener.on_failed(queue, &job, &error, outcome).await,
            Err(err) => warn!(queue, job_id = %job.id, error = %err, "Failed to mark job failed"),
        },
    }
}

/// Runs the handler while extending the job lock every half lock period.
async fn handle_with_lock_renewal(
    consumer: &Consumer,
    token: &str,
    job: &Job,
) -> Result<Option<serde_json::Value>> {
    let lock = consumer.config.lock_duration;
    let period = (lock / 2).max(Duration::from_millis(10));
    let handler = consumer.handler.handle(job);
    tokio::pin!(handler);
    let mut lock_held = true;

    loop {
        tokio::select! {
            result = &mut handler => return result,
            _ = tokio::time::sleep(period), if lock_held => {
                match consumer.queue.extend_lock(&job.id, token, lock).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(queue = %consumer.queue.name(), job_id = %job.id, "Job lock lost");
                        lock_held = false;
                    }
                    Err(err) => warn!(
                        queue = %consumer.queue.name(),
                        job_id = %job.id,
                        error = %err,
                        "Failed to extend job lock"
                    ),
                }
            }
        }
    }
}

async fn run_stalled_checker(
    queue: Arc<dyn JobQueue>,
    interval: Duration,
    drain: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = drain.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if let Err(err) = queue.recover_stalled().await {
            warn!(queue = %queue.name(), error = %err, "Stalled job check failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CaseCallError;
    use crate::queue::{FailOutcome, InMemoryJobQueue, JobOptions};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{Notify, mpsc};

    #[derive(Debug)]
    enum Event {
        Completed(String),
        Failed(String, FailOutcome),
    }

    struct ChannelListener(mpsc::UnboundedSender<Event>);

    #[async_trait]
    impl JobListener for ChannelListener {
        async fn on_completed(&self, _queue: &str, job: &Job, _result: Option<&serde_json::Value>) {
            let _ = self.0.send(Event::Completed(job.id.clone()));
        }

        async fn on_failed(&self, _queue: &str, job: &Job, _error: &CaseCallError, outcome: FailOutcome) {
            let _ = self.0.send(Event::Failed(job.id.clone(), outcome));
        }
    }

    /// Fails jobs named `fail`, blocks jobs named `block` until released.
    struct ScriptedHandler {
        release: Arc<Notify>,
        started: Arc<Notify>,
        calls: AtomicUsize,
    }

    impl ScriptedHandler {
        fn new() -> Self {
            Self {
                release: Arc::new(Notify::new()),
                started: Arc::new(Notify::new()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, job: &Job) -> Result<Option<serde_json::Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match job.name.as_str() {
                "fail" => Err(CaseCallError::Internal("scripted failure".into())),
                "block" => {
                    self.started.notify_one();
                    self.release.notified().await;
                    Ok(None)
                }
                _ => Ok(Some(json!({ "ok": true }))),
            }
        }
    }

    struct FlagResource(Arc<AtomicUsize>);

    #[async_trait]
    impl Closeable for FlagResource {
        fn resource_name(&self) -> &str {
            "flag"
        }

        async fn close(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(CaseCallError::Internal("close errors are only logged".into()))
        }
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            concurrency: 2,
            poll_interval: Duration::from_millis(10),
            lock_duration: Duration::from_secs(30),
            stalled_interval: Duration::from_secs(120),
        }
    }

    fn options(id: &str, attempts: u32) -> JobOptions {
        JobOptions {
            attempts,
            backoff: None,
            ..JobOptions::default()
        }
        .with_job_id(id)
    }

    fn pool_with(
        queue: &Arc<InMemoryJobQueue>,
        handler: &Arc<ScriptedHandler>,
    ) -> (WorkerPool, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::new();
        pool.register(
            queue.clone(),
            handler.clone(),
            Arc::new(ChannelListener(tx)),
            config(),
        );
        (pool, rx)
    }

    #[tokio::test]
    async fn completes_jobs_and_retries_failures_until_exhausted() {
        let queue = Arc::new(InMemoryJobQueue::new("case-actions"));
        let handler = Arc::new(ScriptedHandler::new());
        queue.add("ok", json!({}), &options("a", 1)).await.unwrap();
        queue.add("fail", json!({}), &options("b", 2)).await.unwrap();

        let (pool, mut events) = pool_with(&queue, &handler);
        pool.start().await;

        let mut completed = Vec::new();
        let mut failures = Vec::new();
        while completed.len() + failures.len() < 3 {
            match events.recv().await.unwrap() {
                Event::Completed(id) => completed.push(id),
                Event::Failed(id, outcome) => failures.push((id, outcome)),
            }
        }

        assert_eq!(completed, vec!["a".to_string()]);
        assert_eq!(failures.len(), 2);
        assert!(matches!(failures[0].1, FailOutcome::Retrying { .. }));
        assert_eq!(failures[1].1, FailOutcome::Failed);

        let outcome = pool.shutdown(Duration::from_secs(5), std::future::pending()).await;
        assert_eq!(outcome, ShutdownOutcome::Drained);
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_job() {
        let queue = Arc::new(InMemoryJobQueue::new("case-actions"));
        let handler = Arc::new(ScriptedHandler::new());
        queue.add("block", json!({}), &options("slow", 1)).await.unwrap();

        let (pool, mut events) = pool_with(&queue, &handler);
        pool.start().await;
        handler.started.notified().await;

        let release = handler.release.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            release.notify_one();
        });

        let outcome = pool.shutdown(Duration::from_secs(5), std::future::pending()).await;
        assert_eq!(outcome, ShutdownOutcome::Drained);
        assert!(matches!(events.recv().await, Some(Event::Completed(id)) if id == "slow"));
    }

    #[tokio::test]
    async fn draining_pool_picks_up_no_new_jobs() {
        let queue = Arc::new(InMemoryJobQueue::new("case-actions"));
        let handler = Arc::new(ScriptedHandler::new());
        let (pool, _events) = pool_with(&queue, &handler);
        pool.start().await;

        let outcome = pool.shutdown(Duration::from_secs(5), std::future::pending()).await;
        assert_eq!(outcome, ShutdownOutcome::Drained);
        assert!(queue.add("ok", json!({}), &options("late", 1)).await.is_err());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_aborts_stuck_jobs_and_closes_resources() {
        let queue = Arc::new(InMemoryJobQueue::new("case-actions"));
        let handler = Arc::new(ScriptedHandler::new());
        queue.add("block", json!({}), &options("stuck", 1)).await.unwrap();

        let closed = Arc::new(AtomicUsize::new(0));
        let (mut pool, _events) = pool_with(&queue, &handler);
        pool.add_resource(Arc::new(FlagResource(closed.clone())));
        pool.start().await;
        handler.started.notified().await;

        let outcome = pool
            .shutdown(Duration::from_millis(200), std::future::pending())
            .await;
        assert_eq!(outcome, ShutdownOutcome::TimedOut);
        assert!(queue.is_closed());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_request_forces_shutdown() {
        let queue = Arc::new(InMemoryJobQueue::new("case-actions"));
        let handler = Arc::new(ScriptedHandler::new());
        queue.add("block", json!({}), &options("stuck", 1)).await.unwrap();

        let (pool, _events) = pool_with(&queue, &handler);
        pool.start().await;
        handler.started.notified().await;

        let force = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        let outcome = pool.shutdown(Duration::from_secs(60), force).await;
        assert_eq!(outcome, ShutdownOutcome::Forced);
        assert!(queue.is_closed());
    }
}
