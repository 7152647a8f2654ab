//! 通知状态存储
//!
//! 通知记录是投递状态的唯一事实来源。所有状态迁移都是以通知 id 为键的
//! 条件更新，并发的桥接消费者和工作池之间不需要额外加锁。

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify_shared::error::Result;
use notify_shared::events::Channel;
use notify_shared::models::{Client, Notification, NotificationStatus};
use uuid::Uuid;

pub use memory::{InMemoryClientRepository, InMemoryNotificationRepository};
pub use postgres::{PgClientRepository, PgNotificationRepository};

/// 列表查询条件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationFilter {
    pub channel: Option<Channel>,
    pub status: Option<NotificationStatus>,
    /// 从 1 开始
    pub page: u32,
    pub limit: u32,
}

impl Default for NotificationFilter {
    fn default() -> Self {
        Self {
            channel: None,
            status: None,
            page: 1,
            limit: 50,
        }
    }
}

impl NotificationFilter {
    pub fn page(&self) -> u32 {
        self.page.max(1)
    }

    pub fn limit(&self) -> u32 {
        self.limit.max(1)
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page() - 1) * u64::from(self.limit())
    }

    pub fn matches(&self, notification: &Notification) -> bool {
        self.channel.is_none_or(|c| c == notification.channel)
            && self.status.is_none_or(|s| s == notification.status)
    }
}

/// 工作池开始一次投递尝试的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStart {
    /// 通知已处于 PROCESSING，可以发送；附带此前失败次数
    Started { retry_count: i32 },
    /// 已经 SENT，重复任务
    AlreadySent,
    /// FAILED 且重试次数已达上限
    Exhausted { retry_count: i32 },
    /// 仍是 PENDING，桥接消费者尚未接手
    NotClaimed,
    NotFound,
}

/// 通知仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn create(&self, notification: &Notification) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Notification>>;
    /// 只返回属于该接入方的通知
    async fn get_for_client(&self, client_id: Uuid, id: Uuid) -> Result<Option<Notification>>;
    /// 按 created_at 倒序分页，返回 (当前页, 总数)
    async fn list(
        &self,
        client_id: Uuid,
        filter: &NotificationFilter,
    ) -> Result<(Vec<Notification>, u64)>;

    /// PENDING → PROCESSING；已不是 PENDING 时保持原状
    ///
    /// 返回调用结束时的状态，通知不存在时返回 None。
    async fn mark_processing(&self, id: Uuid) -> Result<Option<NotificationStatus>>;

    /// PROCESSING 保持不变，FAILED 在 retry_count < max_attempts 时回到 PROCESSING
    async fn begin_attempt(&self, id: Uuid, max_attempts: u32) -> Result<AttemptStart>;

    /// PROCESSING → SENT 并写入 sent_at；返回本次调用是否完成了迁移
    async fn mark_sent(&self, id: Uuid, sent_at: DateTime<Utc>) -> Result<bool>;

    /// PROCESSING → FAILED，写入错误信息并 retry_count + 1；返回新的 retry_count
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<Option<i32>>;

    /// 只记录错误信息，不改变状态
    async fn record_error(&self, id: Uuid, error: &str) -> Result<()>;
}

/// 接入方仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClientRepository: Send + Sync {
    async fn create(&self, client: &Client) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Client>>;
    /// 渠道成功投递计数 + 1
    async fn increment_usage(&self, client_id: Uuid, channel: Channel) -> Result<()>;
}
