use crate::util::non_blank;

/// Raw environment values, captured once and parsed by
/// [`CaseCallConfig::from_sources`](crate::CaseCallConfig::from_sources).
#[derive(Default, Clone)]
pub struct EnvConfig {
    pub database_url: Option<String>,
    pub database_max_connections: Option<String>,
    pub redis_url: Option<String>,
    pub queue_prefix: Option<String>,

    pub scheduler_limit: Option<String>,
    pub scheduler_per_tenant_limit: Option<String>,
    pub scheduler_cooldown_minutes: Option<String>,
    pub scheduler_tenant_id: Option<String>,
    pub scheduler_include_demo_cases: Option<String>,

    pub worker_attempts: Option<String>,
    pub worker_backoff_ms: Option<String>,
    pub worker_remove_on_complete: Option<String>,
    pub worker_remove_on_fail: Option<String>,
    pub worker_concurrency: Option<String>,
    pub worker_cooldown_minutes: Option<String>,
    pub worker_shutdown_timeout_ms: Option<String>,
    pub worker_stalled_interval_ms: Option<String>,
    pub worker_lock_duration_ms: Option<String>,
    pub worker_poll_interval_ms: Option<String>,

    pub pms_sync_concurrency: Option<String>,
    pub pms_sync_webhook_url: Option<String>,
    pub pms_sync_timeout_ms: Option<String>,

    pub call_context_signature_version: Option<String>,
    pub call_context_ttl_seconds: Option<String>,
    pub call_context_hmac_secret: Option<String>,

    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub twilio_from_number: Option<String>,
    pub twilio_voice_url: Option<String>,
    pub twilio_api_base: Option<String>,
}

impl std::fmt::Debug for EnvConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "<set>"))
            .field("redis_url", &self.redis_url.as_ref().map(|_| "<set>"))
            .field("queue_prefix", &self.queue_prefix)
            .field("scheduler_tenant_id", &self.scheduler_tenant_id)
            .field("pms_sync_webhook_url", &self.pms_sync_webhook_url)
            .field("twilio_account_sid", &self.twilio_account_sid)
            .field("twilio_voice_url", &self.twilio_voice_url)
            .finish_non_exhaustive()
    }
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Blank values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| non_blank(lookup(name));
        Self {
            database_url: var("DATABASE_URL"),
            database_max_connections: var("DATABASE_MAX_CONNECTIONS"),
            redis_url: var("REDIS_URL"),
            queue_prefix: var("QUEUE_PREFIX"),

            scheduler_limit: var("SCHEDULER_LIMIT"),
            scheduler_per_tenant_limit: var("SCHEDULER_PER_TENANT_LIMIT"),
            scheduler_cooldown_minutes: var("SCHEDULER_COOLDOWN_MINUTES"),
            scheduler_tenant_id: var("SCHEDULER_TENANT_ID"),
            scheduler_include_demo_cases: var("SCHEDULER_INCLUDE_DEMO_CASES"),

            worker_attempts: var("WORKER_ATTEMPTS"),
            worker_backoff_ms: var("WORKER_BACKOFF_MS"),
            worker_remove_on_complete: var("WORKER_REMOVE_ON_COMPLETE"),
            worker_remove_on_fail: var("WORKER_REMOVE_ON_FAIL"),
            worker_concurrency: var("WORKER_CONCURRENCY"),
            worker_cooldown_minutes: var("WORKER_COOLDOWN_MINUTES"),
            worker_shutdown_timeout_ms: var("WORKER_SHUTDOWN_TIMEOUT_MS"),
            worker_stalled_interval_ms: var("WORKER_STALLED_INTERVAL_MS"),
            worker_lock_duration_ms: var("WORKER_LOCK_DURATION_MS"),
            worker_poll_interval_ms: var("WORKER_POLL_INTERVAL_MS"),

            pms_sync_concurrency: var("PMS_SYNC_CONCURRENCY"),
            pms_sync_webhook_url: var("PMS_SYNC_WEBHOOK_URL"),
            pms_sync_timeout_ms: var("PMS_SYNC_TIMEOUT_MS"),

            call_context_signature_version: var("CALL_CONTEXT_SIGNATURE_VERSION"),
            call_context_ttl_seconds: var("CALL_CONTEXT_TTL_SECONDS"),
            call_context_hmac_secret: var("CALL_CONTEXT_HMAC_SECRET"),

            twilio_account_sid: var("TWILIO_ACCOUNT_SID"),
            twilio_auth_token: var("TWILIO_AUTH_TOKEN"),
            twilio_from_number: var("TWILIO_FROM_NUMBER"),
            twilio_voice_url: var("TWILIO_VOICE_URL"),
            twilio_api_base: var("TWILIO_API_BASE"),
        }
    }
}
