//! Redis-backed [`JobQueue`].
//!
//! Layout under `{prefix}:{queue}:`: `wait` and `active` lists, `delayed`,
//! `completed` and `failed` sorted sets, one `job:{id}` hash per job and a
//! `lock:{id}` key (PX) per active job. Every state transition is a single
//! Lua script so concurrent consumers never observe a half-moved job.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AddOutcome, FailOutcome, Job, JobOptions, JobQueue, QueueCounts, closed_error,
};
use crate::error::{CaseCallError, Result};
use crate::workers::Closeable;

/// Active jobs recovered more often than this are failed instead of retried.
const MAX_STALLED_COUNT: u32 = 1;

mod scripts {
    use redis::Script;

    /// KEYS: job, wait, completed, failed
    /// ARGV: id, name, data, attempts, backoff_ms, keep_completed, keep_failed, now
    pub fn add() -> Script {
        Script::new(
            r#"
            local state = redis.call('HGET', KEYS[1], 'state')
            if state == 'wait' or state == 'delayed' or state == 'active' then
                return 0
            end
            if state then
                redis.call('ZREM', KEYS[3], ARGV[1])
                redis.call('ZREM', KEYS[4], ARGV[1])
                redis.call('DEL', KEYS[1])
            end
            redis.call('HSET', KEYS[1],
                'name', ARGV[2],
                'data', ARGV[3],
                'attempts', ARGV[4],
                'attempts_made', 0,
                'backoff_ms', ARGV[5],
                'remove_on_complete', ARGV[6],
                'remove_on_fail', ARGV[7],
                'timestamp', ARGV[8],
                'state', 'wait')
            redis.call('RPUSH', KEYS[2], ARGV[1])
            return 1
            "#,
        )
    }

    /// KEYS: wait, active, delayed
    /// ARGV: now, token, lock_ms, key_prefix
    pub fn fetch_next() -> Script {
        Script::new(
            r#"
            local due = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])
            for _, id in ipairs(due) do
                redis.call('ZREM', KEYS[3], id)
                redis.call('HSET', ARGV[4] .. 'job:' .. id, 'state', 'wait')
                redis.call('RPUSH', KEYS[1], id)
            end

            while true do
                local id = redis.call('LPOP', KEYS[1])
                if not id then
                    return false
                end
                local jobKey = ARGV[4] .. 'job:' .. id
                local fields = redis.call('HMGET', jobKey,
                    'name', 'data', 'attempts', 'attempts_made', 'timestamp')
                if fields[1] then
                    redis.call('RPUSH', KEYS[2], id)
                    redis.call('HSET', jobKey, 'state', 'active', 'processed_on', ARGV[1])
                    redis.call('SET', ARGV[4] .. 'lock:' .. id, ARGV[2], 'PX', ARGV[3])
                    return {id, fields[1], fields[2], fields[3], fields[4], fields[5]}
                end
            end
            "#,
        )
    }

    /// KEYS: lock
    /// ARGV: token, lock_ms
    pub fn extend_lock() -> Script {
        Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                redis.call('PEXPIRE', KEYS[1], ARGV[2])
                return 1
            end
            return 0
            "#,
        )
    }

    /// KEYS: job, active, completed, lock
    /// ARGV: id, token, now, key_prefix
    ///
    /// Returns 1, or -1 when another consumer holds the lock, or -2 when the
    /// job is not active.
    pub fn complete() -> Script {
        Script::new(
            r#"
            local holder = redis.call('GET', KEYS[4])
            if holder and holder ~= ARGV[2] then
                return -1
            end
            if redis.call('LREM', KEYS[2], 0, ARGV[1]) == 0 then
                return -2
            end
            redis.call('DEL', KEYS[4])
            redis.call('HSET', KEYS[1], 'state', 'completed', 'finished_on', ARGV[3])
            redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])

            local keep = tonumber(redis.call('HGET', KEYS[1], 'remove_on_complete') or '0')
            local excess = redis.call('ZCARD', KEYS[3]) - keep
            if excess > 0 then
                local old = redis.call('ZRANGE', KEYS[3], 0, excess - 1)
                for _, oldId in ipairs(old) do
                    redis.call('DEL', ARGV[4] .. 'job:' .. oldId)
                end
                redis.call('ZREMRANGEBYRANK', KEYS[3], 0, excess - 1)
            end
            return 1
            "#,
        )
    }

    /// KEYS: job, active, delayed, failed, lock, wait
    /// ARGV: id, token, now, reason, key_prefix
    ///
    /// Returns the retry delay in ms (>= 0), -1/-2 as for `complete`, or -3
    /// when attempts are exhausted.
    pub fn fail() -> Script {
        Script::new(
            r#"
            local holder = redis.call('GET', KEYS[5])
            if holder and holder ~= ARGV[2] then
                return -1
            end
            if redis.call('LREM', KEYS[2], 0, ARGV[1]) == 0 then
                return -2
            end
            redis.call('DEL', KEYS[5])

            local made = redis.call('HINCRBY', KEYS[1], 'attempts_made', 1)
            local attempts = tonumber(redis.call('HGET', KEYS[1], 'attempts') or '1')
            local backoff = tonumber(redis.call('HGET', KEYS[1], 'backoff_ms') or '0')
            redis.call('HSET', KEYS[1], 'failed_reason', ARGV[4])

            if made < attempts then
                local delay = math.floor(backoff * (2 ^ (made - 1)))
                if delay > 0 then
                    redis.call('HSET', KEYS[1], 'state', 'delayed')
                    redis.call('ZADD', KEYS[3], tonumber(ARGV[3]) + delay, ARGV[1])
                else
                    redis.call('HSET', KEYS[1], 'state', 'wait')
                    redis.call('RPUSH', KEYS[6], ARGV[1])
                end
                return delay
            end

            redis.call('HSET', KEYS[1], 'state', 'failed', 'finished_on', ARGV[3])
            redis.call('ZADD', KEYS[4], ARGV[3], ARGV[1])
            local keep = tonumber(redis.call('HGET', KEYS[1], 'remove_on_fail') or '0')
            local excess = redis.call('ZCARD', KEYS[4]) - keep
            if excess > 0 then
                local old = redis.call('ZRANGE', KEYS[4], 0, excess - 1)
                for _, oldId in ipairs(old) do
                    redis.call('DEL', ARGV[5] .. 'job:' .. oldId)
                end
                redis.call('ZREMRANGEBYRANK', KEYS[4], 0, excess - 1)
            end
            return -3
            "#,
        )
    }

    /// KEYS: active, wait, failed
    /// ARGV: key_prefix, now, max_stalled
    pub fn recover_stalled() -> Script {
        Script::new(
            r#"
            local ids = redis.call('LRANGE', KEYS[1], 0, -1)
            local recovered = {}
            for _, id in ipairs(ids) do
                if redis.call('EXISTS', ARGV[1] .. 'lock:' .. id) == 0 then
                    redis.call('LREM', KEYS[1], 0, id)
                    local jobKey = ARGV[1] .. 'job:' .. id
                    local stalled = redis.call('HINCRBY', jobKey, 'stalled_count', 1)
                    if stalled > tonumber(ARGV[3]) then
                        redis.call('HSET', jobKey,
                            'state', 'failed',
                            'failed_reason', 'job stalled more than allowable limit',
                            'finished_on', ARGV[2])
                        redis.call('ZADD', KEYS[3], ARGV[2], id)
                    else
                        redis.call('HSET', jobKey, 'state', 'wait')
                        redis.call('RPUSH', KEYS[2], id)
                    end
                    table.insert(recovered, id)
                end
            end
            return recovered
            "#,
        )
    }
}

/// One managed Redis connection shared by every queue in the process.
///
/// `ConnectionManager` multiplexes commands over a single socket, so all
/// consumers and the stalled checkers go through it. Closing the handle
/// refuses further commands; the socket is released when the last queue
/// holding it is dropped.
pub struct RedisConnection {
    conn: ConnectionManager,
    closed: AtomicBool,
}

impl fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConnection")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RedisConnection {
    pub async fn connect(redis_url: &str) -> Result<Arc<Self>> {
        let client = redis::Client::open(redis_url)
            .map_err(queue_err("Invalid Redis URL"))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(queue_err("Failed to connect to Redis"))?;
        info!("Redis connected");
        Ok(Arc::new(Self {
            conn,
            closed: AtomicBool::new(false),
        }))
    }

    /// A queue named `name` under `prefix` using this connection.
    pub fn queue(self: &Arc<Self>, prefix: &str, name: &str) -> RedisJobQueue {
        RedisJobQueue::with_connection(Arc::clone(self), prefix, name)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn handle(&self) -> Result<ConnectionManager> {
        if self.is_closed() {
            return Err(CaseCallError::Queue("Redis connection is closed".into()));
        }
        Ok(self.conn.clone())
    }
}

#[async_trait]
impl Closeable for RedisConnection {
    fn resource_name(&self) -> &str {
        "redis"
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Redis connection closed");
        }
        Ok(())
    }
}

pub struct RedisJobQueue {
    shared: Arc<RedisConnection>,
    name: String,
    key_prefix: String,
    closed: AtomicBool,
    add_script: Script,
    fetch_script: Script,
    extend_script: Script,
    complete_script: Script,
    fail_script: Script,
    stalled_script: Script,
}

impl fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisJobQueue")
            .field("name", &self.name)
            .field("key_prefix", &self.key_prefix)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

fn queue_err(context: &'static str) -> impl FnOnce(redis::RedisError) -> CaseCallError {
    move |e| CaseCallError::Queue(format!("{context}: {e}"))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl RedisJobQueue {
    /// Opens a dedicated connection for a single queue.
    pub async fn connect(redis_url: &str, prefix: &str, name: &str) -> Result<Self> {
        Ok(RedisConnection::connect(redis_url).await?.queue(prefix, name))
    }

    pub fn with_connection(shared: Arc<RedisConnection>, prefix: &str, name: &str) -> Self {
        Self {
            shared,
            name: name.to_string(),
            key_prefix: format!("{prefix}:{name}:"),
            closed: AtomicBool::new(false),
            add_script: scripts::add(),
            fetch_script: scripts::fetch_next(),
            extend_script: scripts::extend_lock(),
            complete_script: scripts::complete(),
            fail_script: scripts::fail(),
            stalled_script: scripts::recover_stalled(),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.key_prefix, suffix)
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}job:{}", self.key_prefix, id)
    }

    fn lock_key(&self, id: &str) -> String {
        format!("{}lock:{}", self.key_prefix, id)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error(&self.name));
        }
        Ok(())
    }

    fn parse_job(fields: Vec<String>) -> Result<Job> {
        let [id, name, data, attempts, attempts_made, timestamp]: [String; 6] =
            fields.try_into().map_err(|fields: Vec<String>| {
                CaseCallError::Queue(format!(
                    "Unexpected job reply with {} fields",
                    fields.len()
                ))
            })?;

        let number = |field: &str, value: &str| {
            value.parse::<i64>().map_err(|e| {
                CaseCallError::Queue(format!("Invalid job field {field}={value}: {e}"))
            })
        };

        Ok(Job {
            data: serde_json::from_str(&data)?,
            attempts: u32::try_from(number("attempts", &attempts)?).unwrap_or(1),
            attempts_made: u32::try_from(number("attempts_made", &attempts_made)?)
                .unwrap_or(0),
            timestamp_ms: number("timestamp", &timestamp)?,
            id,
            name,
        })
    }

    fn lock_reply(&self, job: &Job, code: i64) -> Result<()> {
        match code {
            -1 => Err(CaseCallError::Queue(format!(
                "Lock for job {} in {} is held by another consumer",
                job.id, self.name
            ))),
            -2 => Err(CaseCallError::Queue(format!(
                "Job {} is not active in {}",
                job.id, self.name
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(
        &self,
        name: &str,
        data: serde_json::Value,
        options: &JobOptions,
    ) -> Result<AddOutcome> {
        self.ensure_open()?;
        let id = options
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let data = serde_json::to_string(&data)?;

        let mut conn = self.shared.handle()?;
        let added: i64 = self
            .add_script
            .key(self.job_key(&id))
            .key(self.key("wait"))
            .key(self.key("completed"))
            .key(self.key("failed"))
            .arg(&id)
            .arg(name)
            .arg(data)
            .arg(options.attempts.max(1))
            .arg(options.backoff_ms())
            .arg(options.remove_on_complete)
            .arg(options.remove_on_fail)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(queue_err("Failed to add job"))?;

        if added == 1 {
            debug!(queue = %self.name, job_id = %id, "Job added");
            Ok(AddOutcome::Added(id))
        } else {
            debug!(queue = %self.name, job_id = %id, "Job already pending");
            Ok(AddOutcome::Duplicate(id))
        }
    }

    async fn fetch_next(&self, token: &str, lock: Duration) -> Result<Option<Job>> {
        self.ensure_open()?;
        let mut conn = self.shared.handle()?;
        let reply: Option<Vec<String>> = self
            .fetch_script
            .key(self.key("wait"))
            .key(self.key("active"))
            .key(self.key("delayed"))
            .arg(Utc::now().timestamp_millis())
            .arg(token)
            .arg(millis(lock))
            .arg(&self.key_prefix)
            .invoke_async(&mut conn)
            .await
            .map_err(queue_err("Failed to fetch next job"))?;

        reply.map(Self::parse_job).transpose()
    }

    async fn extend_lock(&self, job_id: &str, token: &str, lock: Duration) -> Result<bool> {
        self.ensure_open()?;
        let mut conn = self.shared.handle()?;
        let extended: i64 = self
            .extend_script
            .key(self.lock_key(job_id))
            .arg(token)
            .arg(millis(lock))
            .invoke_async(&mut conn)
            .await
            .map_err(queue_err("Failed to extend job lock"))?;
        Ok(extended == 1)
    }

    async fn complete(&self, job: &Job, token: &str) -> Result<()> {
        self.ensure_open()?;
        let mut conn = self.shared.handle()?;
        let code: i64 = self
            .complete_script
            .key(self.job_key(&job.id))
            .key(self.key("active"))
            .key(self.key("completed"))
            .key(self.lock_key(&job.id))
            .arg(&job.id)
            .arg(token)
            .arg(Utc::now().timestamp_millis())
            .arg(&self.key_prefix)
            .invoke_async(&mut conn)
            .await
            .map_err(queue_err("Failed to complete job"))?;
        self.lock_reply(job, code)
    }

    async fn fail(&self, job: &Job, token: &str, reason: &str) -> Result<FailOutcome> {
        self.ensure_open()?;
        let mut conn = self.shared.handle()?;
        let code: i64 = self
            .fail_script
            .key(self.job_key(&job.id))
            .key(self.key("active"))
            .key(self.key("delayed"))
            .key(self.key("failed"))
            .key(self.lock_key(&job.id))
            .key(self.key("wait"))
            .arg(&job.id)
            .arg(token)
            .arg(Utc::now().timestamp_millis())
            .arg(reason)
            .arg(&self.key_prefix)
            .invoke_async(&mut conn)
            .await
            .map_err(queue_err("Failed to fail job"))?;

        self.lock_reply(job, code)?;
        if code == -3 {
            Ok(FailOutcome::Failed)
        } else {
            Ok(FailOutcome::Retrying {
                delay: Duration::from_millis(u64::try_from(code).unwrap_or(0)),
            })
        }
    }

    async fn recover_stalled(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut conn = self.shared.handle()?;
        let recovered: Vec<String> = self
            .stalled_script
            .key(self.key("active"))
            .key(self.key("wait"))
            .key(self.key("failed"))
            .arg(&self.key_prefix)
            .arg(Utc::now().timestamp_millis())
            .arg(MAX_STALLED_COUNT)
            .invoke_async(&mut conn)
            .await
            .map_err(queue_err("Failed to recover stalled jobs"))?;

        if !recovered.is_empty() {
            warn!(queue = %self.name, count = recovered.len(), "Recovered stalled jobs");
        }
        Ok(recovered)
    }

    async fn counts(&self) -> Result<QueueCounts> {
        self.ensure_open()?;
        let mut conn = self.shared.handle()?;
        let waiting: u64 = conn
            .llen(self.key("wait"))
            .await
            .map_err(queue_err("Failed to count waiting jobs"))?;
        let active: u64 = conn
            .llen(self.key("active"))
            .await
            .map_err(queue_err("Failed to count active jobs"))?;
        let delayed: u64 = conn
            .zcard(self.key("delayed"))
            .await
            .map_err(queue_err("Failed to count delayed jobs"))?;
        let completed: u64 = conn
            .zcard(self.key("completed"))
            .await
            .map_err(queue_err("Failed to count completed jobs"))?;
        let failed: u64 = conn
            .zcard(self.key("failed"))
            .await
            .map_err(queue_err("Failed to count failed jobs"))?;

        Ok(QueueCounts {
            waiting,
            active,
            delayed,
            completed,
            failed,
        })
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(queue = %self.name, "Queue closed");
        }
        Ok(())
    }
}
