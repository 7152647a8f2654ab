//! Redis 分发队列
//!
//! 键布局（`{q}` 为带 hash tag 的队列名，保证集群下同槽）：
//!
//! - `{q}:jobs`               hash，任务 id -> 任务 JSON
//! - `{q}:wait:{channel}`     list，等待执行的任务 id
//! - `{q}:delayed:{channel}`  zset，score 为可执行时间（毫秒）
//! - `{q}:active:{channel}`   zset，score 为租约到期时间（毫秒）
//! - `{q}:leases`             hash，任务 id -> 当前租约令牌
//! - `{q}:completed` / `{q}:failed`  zset，score 为进入时间
//!
//! 所有跨键的状态移动都在 Lua 脚本中原子完成。

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use notify_shared::config::QueueConfig;
use notify_shared::error::Result;
use notify_shared::events::Channel;
use notify_shared::redis_pool::RedisPool;
use redis::Script;
use redis::aio::MultiplexedConnection;
use tracing::debug;

use super::{
    DispatchJob, DispatchQueue, FailDisposition, JobOptions, LeasedJob, Retention, StoredJob,
    new_lease_token,
};

/// KEYS: jobs, wait  ARGV: id, payload
const ENQUEUE_LUA: &str = r#"
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then
  return 0
end
redis.call('RPUSH', KEYS[2], ARGV[1])
return 1
"#;

/// KEYS: wait, delayed, active, jobs, leases  ARGV: now_ms, lease_deadline_ms, token
const LEASE_LUA: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('RPUSH', KEYS[1], id)
end
local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[3], id)
  redis.call('HDEL', KEYS[5], id)
  redis.call('RPUSH', KEYS[1], id)
end
while true do
  local id = redis.call('LPOP', KEYS[1])
  if not id then
    return nil
  end
  local payload = redis.call('HGET', KEYS[4], id)
  if payload then
    redis.call('ZADD', KEYS[3], ARGV[2], id)
    redis.call('HSET', KEYS[5], id, ARGV[3])
    return {id, payload}
  end
end
"#;

/// KEYS: active, leases  ARGV: id, token, lease_deadline_ms
const EXTEND_LUA: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
return 1
"#;

/// KEYS: active, completed, jobs, leases  ARGV: id, now_ms, cutoff_ms, keep_count, token
const COMPLETE_LUA: &str = r#"
if redis.call('HGET', KEYS[4], ARGV[1]) ~= ARGV[5] then
  return -1
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
if redis.call('HEXISTS', KEYS[3], ARGV[1]) == 0 then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
local old = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', '(' .. ARGV[3])
for _, id in ipairs(old) do
  redis.call('HDEL', KEYS[3], id)
end
redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', '(' .. ARGV[3])
local excess = redis.call('ZCARD', KEYS[2]) - tonumber(ARGV[4])
if excess > 0 then
  local trimmed = redis.call('ZRANGE', KEYS[2], 0, excess - 1)
  for _, id in ipairs(trimmed) do
    redis.call('HDEL', KEYS[3], id)
  end
  redis.call('ZREMRANGEBYRANK', KEYS[2], 0, excess - 1)
end
return 1
"#;

/// KEYS: active, delayed, jobs, leases  ARGV: id, run_at_ms, payload, token
const RETRY_LUA: &str = r#"
if redis.call('HGET', KEYS[4], ARGV[1]) ~= ARGV[4] then
  return -1
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
"#;

/// KEYS: active, failed, jobs, leases  ARGV: id, now_ms, cutoff_ms, payload, token
const FAIL_LUA: &str = r#"
if redis.call('HGET', KEYS[4], ARGV[1]) ~= ARGV[5] then
  return -1
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[4])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
local old = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', '(' .. ARGV[3])
for _, id in ipairs(old) do
  redis.call('HDEL', KEYS[3], id)
end
redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', '(' .. ARGV[3])
return 1
"#;

/// 确认脚本返回 -1 表示租约已不属于调用方
const LEASE_LOST: i32 = -1;

/// 队列键名
#[derive(Debug, Clone)]
struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    fn new(name: &str) -> Self {
        Self {
            prefix: format!("{{{name}}}"),
        }
    }

    fn jobs(&self) -> String {
        format!("{}:jobs", self.prefix)
    }

    fn wait(&self, channel: Channel) -> String {
        format!("{}:wait:{}", self.prefix, channel)
    }

    fn delayed(&self, channel: Channel) -> String {
        format!("{}:delayed:{}", self.prefix, channel)
    }

    fn active(&self, channel: Channel) -> String {
        format!("{}:active:{}", self.prefix, channel)
    }

    fn leases(&self) -> String {
        format!("{}:leases", self.prefix)
    }

    fn completed(&self) -> String {
        format!("{}:completed", self.prefix)
    }

    fn failed(&self) -> String {
        format!("{}:failed", self.prefix)
    }
}

struct Scripts {
    enqueue: Script,
    lease: Script,
    extend: Script,
    complete: Script,
    retry: Script,
    fail: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE_LUA),
            lease: Script::new(LEASE_LUA),
            extend: Script::new(EXTEND_LUA),
            complete: Script::new(COMPLETE_LUA),
            retry: Script::new(RETRY_LUA),
            fail: Script::new(FAIL_LUA),
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

/// 基于 Redis 的分发队列
pub struct RedisDispatchQueue {
    conn: MultiplexedConnection,
    keys: QueueKeys,
    scripts: Scripts,
    lease_timeout: Duration,
    retention: Retention,
}

impl RedisDispatchQueue {
    pub fn new(pool: &RedisPool, config: &QueueConfig) -> Self {
        Self {
            conn: pool.connection(),
            keys: QueueKeys::new(&config.name),
            scripts: Scripts::new(),
            lease_timeout: config.lease_timeout(),
            retention: Retention::from_config(config),
        }
    }

    async fn move_to_failed(&self, job: &LeasedJob, error: &str) -> Result<bool> {
        let mut stored = StoredJob::new(job.job.clone(), &job.options);
        stored.last_error = Some(error.to_string());
        let payload = serde_json::to_string(&stored)?;
        let now = now_ms();

        let mut conn = self.conn.clone();
        let moved: i32 = self
            .scripts
            .fail
            .key(self.keys.active(job.job.channel))
            .key(self.keys.failed())
            .key(self.keys.jobs())
            .key(self.keys.leases())
            .arg(job.id())
            .arg(now)
            .arg(now - millis(self.retention.failed_age))
            .arg(payload)
            .arg(&job.lease_token)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved != LEASE_LOST)
    }
}

#[async_trait]
impl DispatchQueue for RedisDispatchQueue {
    async fn enqueue(&self, job: DispatchJob, options: JobOptions) -> Result<bool> {
        let id = job.job_id();
        let channel = job.channel;
        let payload = serde_json::to_string(&StoredJob::new(job, &options))?;

        let mut conn = self.conn.clone();
        let added: i32 = self
            .scripts
            .enqueue
            .key(self.keys.jobs())
            .key(self.keys.wait(channel))
            .arg(&id)
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;

        debug!(job_id = %id, %channel, added = added == 1, "任务入队");
        Ok(added == 1)
    }

    async fn lease(&self, channel: Channel) -> Result<Option<LeasedJob>> {
        let now = now_ms();
        let token = new_lease_token();
        let mut conn = self.conn.clone();
        let leased: Option<(String, String)> = self
            .scripts
            .lease
            .key(self.keys.wait(channel))
            .key(self.keys.delayed(channel))
            .key(self.keys.active(channel))
            .key(self.keys.jobs())
            .key(self.keys.leases())
            .arg(now)
            .arg(now + millis(self.lease_timeout))
            .arg(&token)
            .invoke_async(&mut conn)
            .await?;

        let Some((_, payload)) = leased else {
            return Ok(None);
        };
        let stored: StoredJob = serde_json::from_str(&payload)?;
        Ok(Some(stored.into_leased(token)))
    }

    fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    async fn extend_lease(&self, job: &LeasedJob) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i32 = self
            .scripts
            .extend
            .key(self.keys.active(job.job.channel))
            .key(self.keys.leases())
            .arg(job.id())
            .arg(&job.lease_token)
            .arg(now_ms() + millis(self.lease_timeout))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn complete(&self, job: &LeasedJob) -> Result<bool> {
        let now = now_ms();
        let mut conn = self.conn.clone();
        let completed: i32 = self
            .scripts
            .complete
            .key(self.keys.active(job.job.channel))
            .key(self.keys.completed())
            .key(self.keys.jobs())
            .key(self.keys.leases())
            .arg(job.id())
            .arg(now)
            .arg(now - millis(self.retention.completed_age))
            .arg(self.retention.completed_count)
            .arg(&job.lease_token)
            .invoke_async(&mut conn)
            .await?;
        Ok(completed != LEASE_LOST)
    }

    async fn retry_or_fail(&self, job: &LeasedJob, error: &str) -> Result<FailDisposition> {
        let disposition = job.next_disposition();

        match disposition {
            FailDisposition::Retrying { attempt, delay } => {
                let mut next = job.job.clone();
                next.attempt = attempt;
                let mut stored = StoredJob::new(next, &job.options);
                stored.last_error = Some(error.to_string());
                let payload = serde_json::to_string(&stored)?;

                let mut conn = self.conn.clone();
                let scheduled: i32 = self
                    .scripts
                    .retry
                    .key(self.keys.active(job.job.channel))
                    .key(self.keys.delayed(job.job.channel))
                    .key(self.keys.jobs())
                    .key(self.keys.leases())
                    .arg(job.id())
                    .arg(now_ms() + millis(delay))
                    .arg(payload)
                    .arg(&job.lease_token)
                    .invoke_async(&mut conn)
                    .await?;
                if scheduled == LEASE_LOST {
                    return Ok(FailDisposition::LeaseLost);
                }
            }
            FailDisposition::Exhausted => {
                if !self.move_to_failed(job, error).await? {
                    return Ok(FailDisposition::LeaseLost);
                }
            }
            FailDisposition::LeaseLost => {}
        }
        Ok(disposition)
    }

    async fn fail(&self, job: &LeasedJob, error: &str) -> Result<bool> {
        self.move_to_failed(job, error).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_shared::config::RedisConfig;
    use notify_shared::models::{Content, Recipient};
    use uuid::Uuid;

    #[test]
    fn test_keys_share_hash_tag() {
        let keys = QueueKeys::new("notifications");
        assert_eq!(keys.jobs(), "{notifications}:jobs");
        assert_eq!(keys.wait(Channel::Sms), "{notifications}:wait:sms");
        assert_eq!(keys.delayed(Channel::Email), "{notifications}:delayed:email");
        assert_eq!(keys.active(Channel::Whatsapp), "{notifications}:active:whatsapp");
        assert_eq!(keys.leases(), "{notifications}:leases");
        assert_eq!(keys.completed(), "{notifications}:completed");
        assert_eq!(keys.failed(), "{notifications}:failed");
    }

    #[tokio::test]
    #[ignore] // 需要 Redis
    async fn test_redis_queue_lifecycle() {
        let redis_config = RedisConfig {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| RedisConfig::default().url),
        };
        let pool = RedisPool::connect(&redis_config).await.unwrap();
        let config = QueueConfig {
            name: format!("test-{}", Uuid::now_v7()),
            ..Default::default()
        };
        let queue = RedisDispatchQueue::new(&pool, &config);

        let job = DispatchJob {
            notification_id: Uuid::now_v7(),
            client_id: Uuid::now_v7(),
            channel: Channel::Sms,
            recipient: Recipient::phone("+14155550100"),
            content: Content::body("hi"),
            attempt: 1,
        };

        assert!(queue.enqueue(job.clone(), JobOptions::default()).await.unwrap());
        assert!(!queue.enqueue(job.clone(), JobOptions::default()).await.unwrap());
        assert!(queue.lease(Channel::Email).await.unwrap().is_none());

        let leased = queue.lease(Channel::Sms).await.unwrap().unwrap();
        assert_eq!(leased.job, job);

        assert!(queue.extend_lease(&leased).await.unwrap());
        let stale = LeasedJob {
            lease_token: new_lease_token(),
            ..leased.clone()
        };
        assert!(!queue.extend_lease(&stale).await.unwrap());
        assert!(!queue.complete(&stale).await.unwrap());

        let disposition = queue.retry_or_fail(&leased, "HTTP 503").await.unwrap();
        assert_eq!(
            disposition,
            FailDisposition::Retrying {
                attempt: 2,
                delay: Duration::from_secs(2)
            }
        );
        assert!(queue.lease(Channel::Sms).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(2100)).await;
        let retried = queue.lease(Channel::Sms).await.unwrap().unwrap();
        assert_eq!(retried.job.attempt, 2);
        assert!(queue.complete(&retried).await.unwrap());
        assert!(queue.lease(Channel::Sms).await.unwrap().is_none());
    }
}
