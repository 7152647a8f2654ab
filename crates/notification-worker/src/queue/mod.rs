//! 分发队列
//!
//! 桥接消费者按渠道入队，各渠道工作池租约式取出任务。任务在被确认
//! （完成、重试或失败）之前一直归队列所有；持有租约的进程崩溃后，
//! 租约超时的任务会重新回到等待队列。
//!
//! 每次租用生成新的租约令牌。处理中的任务定期续约；确认时令牌不匹配
//! （租约已超时并被重新租出）则确认不生效，不会影响新的持有者。

pub mod memory;
pub mod redis_queue;

use std::time::Duration;

use async_trait::async_trait;
use notify_shared::config::QueueConfig;
use notify_shared::error::Result;
use notify_shared::events::{Channel, NotificationCreatedEvent};
use notify_shared::models::{Content, Recipient};
use notify_shared::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use memory::InMemoryDispatchQueue;
pub use redis_queue::RedisDispatchQueue;

/// 单条通知的分发任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchJob {
    pub notification_id: Uuid,
    pub client_id: Uuid,
    pub channel: Channel,
    pub recipient: Recipient,
    pub content: Content,
    /// 当前是第几次投递，从 1 开始
    pub attempt: u32,
}

impl DispatchJob {
    pub fn from_event(event: &NotificationCreatedEvent) -> Self {
        Self {
            notification_id: event.id,
            client_id: event.client_id,
            channel: event.channel,
            recipient: event.recipient.clone(),
            content: event.content.clone(),
            attempt: 1,
        }
    }

    /// 任务 id 即通知 id，同一通知同时最多只有一个存活任务
    pub fn job_id(&self) -> String {
        self.notification_id.to_string()
    }
}

/// 入队参数
#[derive(Debug, Clone, PartialEq)]
pub struct JobOptions {
    pub max_attempts: u32,
    pub backoff: RetryPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl JobOptions {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: RetryPolicy::exponential(
                config.max_attempts,
                Duration::from_millis(config.backoff_delay_ms),
            ),
        }
    }
}

/// 已租出的任务
///
/// 工作池必须用同一个 LeasedJob 调用 complete / retry_or_fail / fail 之一。
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedJob {
    pub job: DispatchJob,
    pub options: JobOptions,
    /// 本次租约的令牌，续约与确认都以它为准
    pub lease_token: String,
}

impl LeasedJob {
    pub fn id(&self) -> String {
        self.job.job_id()
    }

    /// 本次失败之后的去向
    pub fn next_disposition(&self) -> FailDisposition {
        if self.options.backoff.should_retry(self.job.attempt) {
            FailDisposition::Retrying {
                attempt: self.job.attempt + 1,
                delay: self.options.backoff.backoff_after(self.job.attempt),
            }
        } else {
            FailDisposition::Exhausted
        }
    }
}

/// retry_or_fail 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// 已放入延迟集合，`delay` 后以第 `attempt` 次投递重新可见
    Retrying { attempt: u32, delay: Duration },
    /// 投递次数耗尽，进入失败集合
    Exhausted,
    /// 租约已不属于调用方，确认未生效
    LeaseLost,
}

pub(crate) fn new_lease_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// 队列中任务的持久化形态
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoredJob {
    pub job: DispatchJob,
    pub max_attempts: u32,
    pub backoff_delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StoredJob {
    pub fn new(job: DispatchJob, options: &JobOptions) -> Self {
        Self {
            job,
            max_attempts: options.max_attempts,
            backoff_delay_ms: options.backoff.initial_delay.as_millis() as u64,
            last_error: None,
        }
    }

    pub fn into_leased(self, lease_token: String) -> LeasedJob {
        LeasedJob {
            lease_token,
            options: JobOptions {
                max_attempts: self.max_attempts,
                backoff: RetryPolicy::exponential(
                    self.max_attempts,
                    Duration::from_millis(self.backoff_delay_ms),
                ),
            },
            job: self.job,
        }
    }
}

/// 完成/失败任务的保留策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub completed_age: Duration,
    pub completed_count: usize,
    pub failed_age: Duration,
}

impl Retention {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            completed_age: Duration::from_secs(config.completed_retention_secs),
            completed_count: config.completed_retention_count as usize,
            failed_age: Duration::from_secs(config.failed_retention_secs),
        }
    }
}

impl Default for Retention {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// 分发队列接口
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// 入队；同 id 的任务已存在时不重复入队，返回 false
    async fn enqueue(&self, job: DispatchJob, options: JobOptions) -> Result<bool>;

    /// 取出该渠道下一个可执行的任务并加租约
    async fn lease(&self, channel: Channel) -> Result<Option<LeasedJob>>;

    /// 租约时长，处理中的任务需要在到期前续约
    fn lease_timeout(&self) -> Duration;

    /// 续约；租约已不属于调用方时返回 false
    async fn extend_lease(&self, job: &LeasedJob) -> Result<bool>;

    /// 成功或跳过，移入完成集合；租约已不属于调用方时不做任何修改并返回 false
    async fn complete(&self, job: &LeasedJob) -> Result<bool>;

    /// 可重试失败：未达上限则延迟重投，否则移入失败集合
    async fn retry_or_fail(&self, job: &LeasedJob, error: &str) -> Result<FailDisposition>;

    /// 不可重试失败，直接移入失败集合；租约已不属于调用方时返回 false
    async fn fail(&self, job: &LeasedJob, error: &str) -> Result<bool>;
}
