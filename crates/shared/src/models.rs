//! 通知领域模型
//!
//! 通知记录是投递状态的唯一事实来源，状态只能沿
//! PENDING → PROCESSING → {SENT | FAILED} 推进，FAILED 在重试次数耗尽前
//! 可以回到 PROCESSING。

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NotifyError;
use crate::events::Channel;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("邮箱正则无效"));

/// E.164，允许省略前导 +
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[1-9][0-9]{6,14}$").expect("手机号正则无效"));

// ---------------------------------------------------------------------------
// NotificationStatus
// ---------------------------------------------------------------------------

/// 通知投递状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    /// 已落库，等待桥接消费者处理
    #[default]
    Pending,
    /// 已进入分发队列或正在投递
    Processing,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
        }
    }

    /// 状态机允许的迁移
    ///
    /// FAILED → PROCESSING 只表示重试，调用方还需检查 retry_count 是否已达上限。
    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Sent)
                | (Processing, Failed)
                | (Failed, Processing)
        )
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NotificationStatus {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "SENT" => Ok(Self::Sent),
            "FAILED" => Ok(Self::Failed),
            other => Err(NotifyError::InvalidArgument {
                field: "status".to_string(),
                message: format!("未知状态 {other}"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Recipient / Content
// ---------------------------------------------------------------------------

/// 收件人，邮件渠道使用 email，短信与 WhatsApp 使用 phone
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl Recipient {
    pub fn email(address: impl Into<String>) -> Self {
        Self {
            email: Some(address.into()),
            phone: None,
        }
    }

    pub fn phone(number: impl Into<String>) -> Self {
        Self {
            email: None,
            phone: Some(number.into()),
        }
    }

    /// 取出与渠道匹配的地址并校验格式
    pub fn address_for(&self, channel: Channel) -> Result<&str, NotifyError> {
        match channel {
            Channel::Email => {
                let email = self.email.as_deref().ok_or_else(|| NotifyError::InvalidArgument {
                    field: "recipient.email".to_string(),
                    message: "邮件渠道必须提供邮箱地址".to_string(),
                })?;
                if !EMAIL_RE.is_match(email) {
                    return Err(NotifyError::InvalidArgument {
                        field: "recipient.email".to_string(),
                        message: format!("邮箱格式无效: {email}"),
                    });
                }
                Ok(email)
            }
            Channel::Sms | Channel::Whatsapp => {
                let phone = self.phone.as_deref().ok_or_else(|| NotifyError::InvalidArgument {
                    field: "recipient.phone".to_string(),
                    message: "短信/WhatsApp 渠道必须提供手机号".to_string(),
                })?;
                if !PHONE_RE.is_match(phone) {
                    return Err(NotifyError::InvalidArgument {
                        field: "recipient.phone".to_string(),
                        message: format!("手机号格式无效: {phone}"),
                    });
                }
                Ok(phone)
            }
        }
    }
}

/// 通知内容
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    /// 邮件主题
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// 正文；邮件渠道视为 HTML
    pub body: String,
    /// 邮件纯文本版本，缺省时由 body 去除标签得到
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// WhatsApp 模板名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
}

impl Content {
    pub fn body(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), NotifyError> {
        if self.body.trim().is_empty() {
            return Err(NotifyError::InvalidArgument {
                field: "content.body".to_string(),
                message: "正文不能为空".to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// 通知记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    pub client_id: Uuid,
    pub channel: Channel,
    pub recipient: Recipient,
    pub content: Content,
    pub status: NotificationStatus,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    /// 创建 PENDING 状态的新通知，id 使用 UUID v7 以保持时间有序
    pub fn new(client_id: Uuid, channel: Channel, recipient: Recipient, content: Content) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            client_id,
            channel,
            recipient,
            content,
            status: NotificationStatus::Pending,
            retry_count: 0,
            error_message: None,
            sent_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 校验渠道、收件人与正文是否匹配
    pub fn validate(&self) -> Result<(), NotifyError> {
        self.recipient.address_for(self.channel)?;
        self.content.validate()
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// 各渠道成功投递计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub emails_sent: i64,
    pub sms_sent: i64,
    pub whatsapp_sent: i64,
}

impl UsageStats {
    pub fn get(&self, channel: Channel) -> i64 {
        match channel {
            Channel::Email => self.emails_sent,
            Channel::Sms => self.sms_sent,
            Channel::Whatsapp => self.whatsapp_sent,
        }
    }

    pub fn increment(&mut self, channel: Channel) {
        match channel {
            Channel::Email => self.emails_sent += 1,
            Channel::Sms => self.sms_sent += 1,
            Channel::Whatsapp => self.whatsapp_sent += 1,
        }
    }
}

/// 接入方
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    /// API key 的哈希，鉴权层负责生成与校验
    #[serde(skip_serializing, default)]
    pub api_key_hash: String,
    pub is_active: bool,
    pub usage_stats: UsageStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Client {
    pub fn new(name: impl Into<String>, email: impl Into<String>, api_key_hash: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            email: email.into().trim().to_lowercase(),
            api_key_hash: api_key_hash.into(),
            is_active: true,
            usage_stats: UsageStats::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use NotificationStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Sent));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Processing));

        // 不允许跳过 PROCESSING
        assert!(!Pending.can_transition_to(Sent));
        assert!(!Pending.can_transition_to(Failed));
        // SENT 是终态
        assert!(!Sent.can_transition_to(Processing));
        assert!(!Sent.can_transition_to(Failed));
    }

    #[test]
    fn test_recipient_must_match_channel() {
        let email = Recipient::email("a@b.com");
        assert_eq!(email.address_for(Channel::Email).unwrap(), "a@b.com");
        assert!(email.address_for(Channel::Sms).is_err());

        let phone = Recipient::phone("+14155550100");
        assert_eq!(phone.address_for(Channel::Whatsapp).unwrap(), "+14155550100");
        assert!(phone.address_for(Channel::Email).is_err());
    }

    #[test]
    fn test_recipient_format_validation() {
        assert!(Recipient::email("not-an-email").address_for(Channel::Email).is_err());
        assert!(Recipient::phone("12ab").address_for(Channel::Sms).is_err());
        assert!(Recipient::phone("919876543210").address_for(Channel::Sms).is_ok());
    }

    #[test]
    fn test_new_notification_is_pending() {
        let n = Notification::new(
            Uuid::now_v7(),
            Channel::Email,
            Recipient::email("a@b.com"),
            Content::body("hi"),
        );
        assert_eq!(n.status, NotificationStatus::Pending);
        assert_eq!(n.retry_count, 0);
        assert!(n.sent_at.is_none());
        assert!(n.validate().is_ok());
    }

    #[test]
    fn test_empty_body_rejected() {
        let n = Notification::new(
            Uuid::now_v7(),
            Channel::Sms,
            Recipient::phone("+14155550100"),
            Content::body("   "),
        );
        assert!(n.validate().is_err());
    }


    #[test]
    fn test_usage_stats_increment() {
        let mut stats = UsageStats::default();
        stats.increment(Channel::Email);
        stats.increment(Channel::Email);
        stats.increment(Channel::Whatsapp);
        assert_eq!(stats.get(Channel::Email), 2);
        assert_eq!(stats.get(Channel::Sms), 0);
        assert_eq!(stats.get(Channel::Whatsapp), 1);
    }

    #[test]
    fn test_client_email_normalized_and_hash_hidden() {
        let client = Client::new("Acme", "  Ops@Acme.COM ", "hash");
        assert_eq!(client.email, "ops@acme.com");
        let json = serde_json::to_value(&client).unwrap();
        assert!(json.get("apiKeyHash").is_none());
        assert_eq!(json["usageStats"]["emailsSent"], 0);
    }
}
