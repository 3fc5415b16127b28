use std::fmt;
use std::time::Duration;

use tracing::debug;
use url::Url;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::ConfigError;
use crate::sources::EnvConfig;
use crate::util::{parse_bool, positive_or};

pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_QUEUE_PREFIX: &str = "casecall";
pub const DEFAULT_SCHEDULER_LIMIT: u32 = 500;
pub const DEFAULT_SCHEDULER_PER_TENANT_LIMIT: u32 = 10;
pub const DEFAULT_COOLDOWN_MINUTES: u64 = 360;
pub const DEFAULT_JOB_ATTEMPTS: u32 = 3;
pub const DEFAULT_JOB_BACKOFF_MS: u64 = 2_000;
pub const DEFAULT_REMOVE_ON_COMPLETE: u32 = 1_000;
pub const DEFAULT_REMOVE_ON_FAIL: u32 = 5_000;
pub const DEFAULT_WORKER_CONCURRENCY: usize = 5;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 90_000;
pub const DEFAULT_STALLED_INTERVAL_MS: u64 = 120_000;
pub const DEFAULT_LOCK_DURATION_MS: u64 = 30_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_PMS_SYNC_CONCURRENCY: usize = 1;
pub const DEFAULT_PMS_SYNC_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_SIGNATURE_VERSION: &str = "1";
pub const DEFAULT_CONTEXT_TTL_SECONDS: u64 = 600;
pub const DEFAULT_TWILIO_API_BASE: &str = "https://api.twilio.com";

#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: Zeroizing<String>,
    pub max_connections: u32,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub redis_url: String,
    /// Namespace prepended to every queue key.
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub limit: u32,
    pub per_tenant_limit: u32,
    pub cooldown: Duration,
    pub tenant_id: Option<Uuid>,
    pub include_demo_cases: bool,
}

/// Options stamped onto every job the scheduler enqueues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefaults {
    pub attempts: u32,
    pub backoff: Duration,
    pub remove_on_complete: u32,
    pub remove_on_fail: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub cooldown: Duration,
    pub shutdown_timeout: Duration,
    pub stalled_interval: Duration,
    pub lock_duration: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmsSyncConfig {
    pub concurrency: usize,
    /// When unset no `pms-sync` consumer is started.
    pub webhook_url: Option<Url>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContextConfig {
    pub signature_version: String,
    pub ttl: Duration,
}

/// Everything except the worker-only credentials.
#[derive(Debug, Clone)]
pub struct CaseCallConfig {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub jobs: JobDefaults,
    pub worker: WorkerConfig,
    pub pms_sync: PmsSyncConfig,
    pub call_context: CallContextConfig,
    pub twilio_api_base: String,
    secrets: RawSecrets,
}

#[derive(Clone, Default)]
struct RawSecrets {
    hmac_secret: Option<Zeroizing<String>>,
    account_sid: Option<String>,
    auth_token: Option<Zeroizing<String>>,
    from_number: Option<String>,
    voice_url: Option<String>,
}

impl fmt::Debug for RawSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSecrets")
            .field("hmac_secret", &self.hmac_secret.as_ref().map(|_| "<redacted>"))
            .field("account_sid", &self.account_sid)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("from_number", &self.from_number)
            .field("voice_url", &self.voice_url)
            .finish()
    }
}

/// Credentials the `work` command cannot start without.
#[derive(Clone)]
pub struct WorkerSecrets {
    pub hmac_secret: Zeroizing<String>,
    pub account_sid: String,
    pub auth_token: Zeroizing<String>,
    pub from_number: String,
    pub voice_url: Url,
}

impl fmt::Debug for WorkerSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSecrets")
            .field("hmac_secret", &"<redacted>")
            .field("account_sid", &self.account_sid)
            .field("auth_token", &"<redacted>")
            .field("from_number", &self.from_number)
            .field("voice_url", &self.voice_url.as_str())
            .finish()
    }
}

impl CaseCallConfig {
    /// Loads `.env` when present, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => debug!(path = %path.display(), "Loaded .env file"),
            Err(err) if err.not_found() => {}
            Err(err) => return Err(err.into()),
        }
        Self::from_sources(EnvConfig::gather())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::from_sources(EnvConfig::from_lookup(lookup))
    }

    pub fn from_sources(env: EnvConfig) -> Result<Self, ConfigError> {
        let database_url = env
            .database_url
            .ok_or_else(|| ConfigError::Missing(vec!["DATABASE_URL"]))?;

        let tenant_id = env
            .scheduler_tenant_id
            .as_deref()
            .map(|raw| {
                Uuid::parse_str(raw).map_err(|e| ConfigError::Invalid {
                    name: "SCHEDULER_TENANT_ID",
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        let webhook_url = env
            .pms_sync_webhook_url
            .as_deref()
            .map(|raw| parse_url("PMS_SYNC_WEBHOOK_URL", raw))
            .transpose()?;

        let ms = |raw: &Option<String>, default: u64| {
            Duration::from_millis(positive_or(raw.as_deref(), default))
        };
        let minutes = |raw: &Option<String>| {
            Duration::from_secs(60 * positive_or(raw.as_deref(), DEFAULT_COOLDOWN_MINUTES))
        };

        Ok(Self {
            database: DatabaseConfig {
                url: Zeroizing::new(database_url),
                max_connections: positive_or(
                    env.database_max_connections.as_deref(),
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
            },
            queue: QueueConfig {
                redis_url: env
                    .redis_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
                prefix: env
                    .queue_prefix
                    .clone()
                    .unwrap_or_else(|| DEFAULT_QUEUE_PREFIX.to_string()),
            },
            scheduler: SchedulerConfig {
                limit: positive_or(env.scheduler_limit.as_deref(), DEFAULT_SCHEDULER_LIMIT),
                per_tenant_limit: positive_or(
                    env.scheduler_per_tenant_limit.as_deref(),
                    DEFAULT_SCHEDULER_PER_TENANT_LIMIT,
                ),
                cooldown: minutes(&env.scheduler_cooldown_minutes),
                tenant_id,
                include_demo_cases: env
                    .scheduler_include_demo_cases
                    .as_deref()
                    .and_then(parse_bool)
                    .unwrap_or(false),
            },
            jobs: JobDefaults {
                attempts: positive_or(env.worker_attempts.as_deref(), DEFAULT_JOB_ATTEMPTS),
                backoff: ms(&env.worker_backoff_ms, DEFAULT_JOB_BACKOFF_MS),
                remove_on_complete: positive_or(
                    env.worker_remove_on_complete.as_deref(),
                    DEFAULT_REMOVE_ON_COMPLETE,
                ),
                remove_on_fail: positive_or(
                    env.worker_remove_on_fail.as_deref(),
                    DEFAULT_REMOVE_ON_FAIL,
                ),
            },
            worker: WorkerConfig {
                concurrency: positive_or(
                    env.worker_concurrency.as_deref(),
                    DEFAULT_WORKER_CONCURRENCY,
                ),
                cooldown: minutes(&env.worker_cooldown_minutes),
                shutdown_timeout: ms(&env.worker_shutdown_timeout_ms, DEFAULT_SHUTDOWN_TIMEOUT_MS),
                stalled_interval: ms(&env.worker_stalled_interval_ms, DEFAULT_STALLED_INTERVAL_MS),
                lock_duration: ms(&env.worker_lock_duration_ms, DEFAULT_LOCK_DURATION_MS),
                poll_interval: ms(&env.worker_poll_interval_ms, DEFAULT_POLL_INTERVAL_MS),
            },
            pms_sync: PmsSyncConfig {
                concurrency: positive_or(
                    env.pms_sync_concurrency.as_deref(),
                    DEFAULT_PMS_SYNC_CONCURRENCY,
                ),
                webhook_url,
                timeout: ms(&env.pms_sync_timeout_ms, DEFAULT_PMS_SYNC_TIMEOUT_MS),
            },
            call_context: CallContextConfig {
                signature_version: env
                    .call_context_signature_version
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SIGNATURE_VERSION.to_string()),
                ttl: Duration::from_secs(positive_or(
                    env.call_context_ttl_seconds.as_deref(),
                    DEFAULT_CONTEXT_TTL_SECONDS,
                )),
            },
            twilio_api_base: env
                .twilio_api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_TWILIO_API_BASE.to_string()),
            secrets: RawSecrets {
                hmac_secret: env.call_context_hmac_secret.map(Zeroizing::new),
                account_sid: env.twilio_account_sid,
                auth_token: env.twilio_auth_token.map(Zeroizing::new),
                from_number: env.twilio_from_number,
                voice_url: env.twilio_voice_url,
            },
        })
    }

    /// Validates the worker credentials, reporting every missing one at once.
    pub fn worker_secrets(&self) -> Result<WorkerSecrets, ConfigError> {
        let secrets = &self.secrets;
        let mut missing = Vec::new();
        if secrets.account_sid.is_none() {
            missing.push("TWILIO_ACCOUNT_SID");
        }
        if secrets.auth_token.is_none() {
            missing.push("TWILIO_AUTH_TOKEN");
        }
        if secrets.from_number.is_none() {
            missing.push("TWILIO_FROM_NUMBER");
        }
        if secrets.voice_url.is_none() {
            missing.push("TWILIO_VOICE_URL");
        }
        if secrets.hmac_secret.is_none() {
            missing.push("CALL_CONTEXT_HMAC_SECRET");
        }

        match (
            &secrets.hmac_secret,
            &secrets.account_sid,
            &secrets.auth_token,
            &secrets.from_number,
            &secrets.voice_url,
        ) {
            (Some(hmac), Some(sid), Some(token), Some(from), Some(voice)) => Ok(WorkerSecrets {
                hmac_secret: hmac.clone(),
                account_sid: sid.clone(),
                auth_token: token.clone(),
                from_number: from.clone(),
                voice_url: parse_url("TWILIO_VOICE_URL", voice)?,
            }),
            _ => Err(ConfigError::Missing(missing)),
        }
    }
}

fn parse_url(name: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })
}
