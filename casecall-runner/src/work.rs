use std::sync::Arc;

use anyhow::Context;
use casecall_config::CaseCallConfig;
use casecall_core::calling::{CallCaseWorker, ContextSigner};
use casecall_core::providers::{TwilioCallProvider, TwilioCredentials, WebhookSyncRunner};
use casecall_core::queue::{CASE_ACTIONS_QUEUE, PMS_SYNC_QUEUE, RedisConnection};
use casecall_core::workers::{
    CaseActionsHandler, ConsumerConfig, LoggingListener, PmsSyncHandler, PmsSyncListener,
    ShutdownOutcome, WorkerPool,
};
use tracing::{info, warn};

use crate::signals::ShutdownSignals;

pub(crate) async fn run(config: &CaseCallConfig) -> anyhow::Result<()> {
    let secrets = config
        .worker_secrets()
        .context("worker configuration is incomplete")?;

    let signer = ContextSigner::new(
        secrets.hmac_secret.as_bytes(),
        chrono::Duration::from_std(config.call_context.ttl).context("context TTL out of range")?,
        config.call_context.signature_version.clone(),
    )
    .context("invalid call context signing configuration")?;

    let provider = TwilioCallProvider::new(
        TwilioCredentials {
            account_sid: secrets.account_sid.clone(),
            auth_token: secrets.auth_token.clone(),
            from_number: secrets.from_number.clone(),
        },
        Some(&config.twilio_api_base),
    )
    .context("failed to build call provider")?;

    let db = crate::connect_database(config).await?;
    let redis = RedisConnection::connect(&config.queue.redis_url)
        .await
        .context("failed to connect to Redis")?;
    let case_actions = Arc::new(redis.queue(&config.queue.prefix, CASE_ACTIONS_QUEUE));

    let calls = CallCaseWorker::new(
        Arc::new(db.call_cases().clone()),
        Arc::new(provider),
        Arc::new(signer),
        secrets.voice_url.as_str(),
        chrono::Duration::from_std(config.worker.cooldown).context("cooldown out of range")?,
    );

    let consumer = ConsumerConfig {
        concurrency: config.worker.concurrency,
        poll_interval: config.worker.poll_interval,
        lock_duration: config.worker.lock_duration,
        stalled_interval: config.worker.stalled_interval,
    };

    let mut pool = WorkerPool::new();
    pool.register(
        case_actions,
        Arc::new(CaseActionsHandler::new(Arc::new(calls))),
        Arc::new(LoggingListener),
        consumer,
    );

    match &config.pms_sync.webhook_url {
        Some(url) => {
            let pms_sync = Arc::new(redis.queue(&config.queue.prefix, PMS_SYNC_QUEUE));
            let runner = WebhookSyncRunner::new(url.as_str(), config.pms_sync.timeout)
                .context("failed to build sync webhook client")?;
            pool.register(
                pms_sync,
                Arc::new(PmsSyncHandler::new(Arc::new(runner))),
                Arc::new(PmsSyncListener::new(Arc::new(db.sync_connections().clone()))),
                ConsumerConfig {
                    concurrency: config.pms_sync.concurrency,
                    ..consumer
                },
            );
        }
        None => info!("PMS_SYNC_WEBHOOK_URL not set, pms-sync consumer disabled"),
    }

    pool.add_resource(db);
    pool.add_resource(redis);

    let mut signals = ShutdownSignals::install().context("failed to install signal handlers")?;
    pool.start().await;

    let signal = signals.first().await;
    info!(signal, "Shutdown signal received");

    match pool
        .shutdown(config.worker.shutdown_timeout, signals.force())
        .await
    {
        ShutdownOutcome::Drained => {}
        outcome => warn!(?outcome, "Worker exited without draining in-flight jobs"),
    }
    Ok(())
}
