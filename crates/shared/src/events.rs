//! 事件模型
//!
//! 定义投递渠道枚举和 `notification.created` 事件信封。
//! 事件由接入层在通知落库后发布到 Kafka，桥接消费者据此生成分发任务。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NotifyError;
use crate::models::{Content, Notification, NotificationStatus, Recipient};

/// 事件类型，写入 Kafka 消息头 `event-type`
pub const NOTIFICATION_CREATED: &str = "notification.created";

// ---------------------------------------------------------------------------
// Channel — 投递渠道
// ---------------------------------------------------------------------------

/// 投递渠道
///
/// 每个渠道有独立的发送器实现和限流配置。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
    Whatsapp,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Email, Channel::Sms, Channel::Whatsapp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Whatsapp => "whatsapp",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Self::Email),
            "sms" => Ok(Self::Sms),
            "whatsapp" => Ok(Self::Whatsapp),
            other => Err(NotifyError::InvalidArgument {
                field: "channel".to_string(),
                message: format!("不支持的渠道 {other}，可选值: email, sms, whatsapp"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// NotificationCreatedEvent — 通知创建事件
// ---------------------------------------------------------------------------

/// 通知创建事件
///
/// JSON 形如 `{id, clientId, channel, recipient, content, status, createdAt}`，
/// 以 `id` 作为 Kafka 消息 key，保证同一通知的所有事件落在同一分区。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationCreatedEvent {
    pub id: Uuid,
    pub client_id: Uuid,
    pub channel: Channel,
    pub recipient: Recipient,
    pub content: Content,
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
}

impl NotificationCreatedEvent {
    /// 分区键
    pub fn key(&self) -> String {
        self.id.to_string()
    }
}

impl From<&Notification> for NotificationCreatedEvent {
    fn from(notification: &Notification) -> Self {
        Self {
            id: notification.id,
            client_id: notification.client_id,
            channel: notification.channel,
            recipient: notification.recipient.clone(),
            content: notification.content.clone(),
            status: notification.status,
            created_at: notification.created_at,
        }
    }
}
