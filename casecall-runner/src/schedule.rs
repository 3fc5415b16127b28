use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use casecall_config::CaseCallConfig;
use casecall_core::database::ports::DueCaseQuery;
use casecall_core::domain::TenantId;
use casecall_core::queue::{Backoff, CASE_ACTIONS_QUEUE, JobOptions, JobQueue, RedisJobQueue};
use casecall_core::scheduling::{DueCaseScheduler, ScheduleRequest};
use casecall_core::workers::Closeable;
use tracing::{error, info};

use crate::ScheduleArgs;

/// Merges CLI overrides over the environment settings.
pub(crate) fn build_request(
    config: &CaseCallConfig,
    args: &ScheduleArgs,
) -> anyhow::Result<ScheduleRequest> {
    let scheduler = &config.scheduler;
    let cooldown = args
        .cooldown_minutes
        .filter(|minutes| *minutes > 0)
        .map(|minutes| Duration::from_secs(minutes * 60))
        .unwrap_or(scheduler.cooldown);

    Ok(ScheduleRequest {
        query: DueCaseQuery {
            tenant_id: args.tenant.or(scheduler.tenant_id).map(TenantId),
            limit: args.limit.filter(|n| *n > 0).unwrap_or(scheduler.limit),
            per_tenant_limit: args
                .per_tenant_limit
                .filter(|n| *n > 0)
                .unwrap_or(scheduler.per_tenant_limit),
            include_demo: scheduler.include_demo_cases,
        },
        cooldown: chrono::Duration::from_std(cooldown).context("cooldown out of range")?,
        dry_run: args.dry_run,
        job_options: JobOptions {
            job_id: None,
            attempts: config.jobs.attempts,
            backoff: Some(Backoff::exponential(config.jobs.backoff)),
            remove_on_complete: config.jobs.remove_on_complete,
            remove_on_fail: config.jobs.remove_on_fail,
        },
    })
}

pub(crate) async fn run(config: &CaseCallConfig, args: &ScheduleArgs) -> anyhow::Result<()> {
    let request = build_request(config, args)?;

    let db = crate::connect_database(config).await?;
    let queue = Arc::new(
        RedisJobQueue::connect(&config.queue.redis_url, &config.queue.prefix, CASE_ACTIONS_QUEUE)
            .await
            .context("failed to connect to Redis")?,
    );

    let scheduler = DueCaseScheduler::new(Arc::new(db.due_cases().clone()), queue.clone());
    let result = scheduler.run(&request).await;

    if let Err(err) = queue.close().await {
        error!(error = %err, "Scheduler cleanup failed");
    }
    if let Err(err) = db.close().await {
        error!(error = %err, "Scheduler cleanup failed");
    }

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            error!(error = %err, "Scheduler run failed");
            return Err(err).context("scheduler run failed");
        }
    };

    info!(
        limit = request.query.limit,
        per_tenant_limit = request.query.per_tenant_limit,
        cooldown_minutes = request.cooldown.num_minutes(),
        tenant_id = ?request.query.tenant_id,
        "Scheduler finished"
    );
    if report.dry_run {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to render report")?
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> CaseCallConfig {
        let mut map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        map.insert("DATABASE_URL".into(), "postgres://localhost/casecall".into());
        CaseCallConfig::from_lookup(move |name| map.get(name).cloned()).unwrap()
    }

    #[test]
    fn cli_flags_override_environment() {
        let config = config(&[
            ("SCHEDULER_LIMIT", "100"),
            ("SCHEDULER_PER_TENANT_LIMIT", "4"),
            ("SCHEDULER_COOLDOWN_MINUTES", "30"),
        ]);
        let tenant = uuid::Uuid::new_v4();
        let args = ScheduleArgs {
            dry_run: true,
            tenant: Some(tenant),
            limit: Some(20),
            per_tenant_limit: None,
            cooldown_minutes: Some(5),
        };

        let request = build_request(&config, &args).unwrap();
        assert!(request.dry_run);
        assert_eq!(request.query.tenant_id, Some(TenantId(tenant)));
        assert_eq!(request.query.limit, 20);
        assert_eq!(request.query.per_tenant_limit, 4);
        assert_eq!(request.cooldown, chrono::Duration::minutes(5));
    }

    #[test]
    fn job_options_follow_worker_settings() {
        let config = config(&[("WORKER_ATTEMPTS", "5"), ("WORKER_BACKOFF_MS", "500")]);
        let request = build_request(&config, &ScheduleArgs::default()).unwrap();

        assert_eq!(request.job_options.attempts, 5);
        assert_eq!(
            request.job_options.backoff,
            Some(Backoff::exponential(Duration::from_millis(500)))
        );
        assert_eq!(request.cooldown, chrono::Duration::minutes(360));
        assert_eq!(request.query.limit, 500);
    }
}
