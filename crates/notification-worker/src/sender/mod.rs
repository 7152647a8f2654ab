//! 渠道发送器
//!
//! 通过 `ChannelSender` trait 抽象各渠道的投递行为，工作池只依赖该 trait。
//! 服务商错误统一归为临时错误（可重试）与永久错误（重试也不会成功）。

pub mod email;
pub mod sms;
pub mod whatsapp;

use std::sync::Arc;

use async_trait::async_trait;
use notify_shared::config::ProvidersConfig;
use notify_shared::error::NotifyError;
use notify_shared::events::Channel;
use notify_shared::models::{Content, Recipient};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub use email::EmailSender;
pub use sms::{Msg91SmsSender, TwilioSmsSender};
pub use whatsapp::WhatsappSender;

/// 投递回执
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub success: bool,
    /// 服务商返回的消息标识，用于追踪投递状态
    pub provider_message_id: Option<String>,
}

impl DeliveryReceipt {
    pub fn delivered(provider_message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            provider_message_id: Some(provider_message_id.into()),
        }
    }
}

/// 服务商错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// 网络错误、超时、限流、服务端 5xx、SMTP 4xx 应答
    #[error("服务商临时错误: {provider} - {message}")]
    Transient { provider: String, message: String },

    /// 请求被拒绝、收件人无效、SMTP 5xx 应答
    #[error("服务商拒绝投递: {provider} - {message}")]
    Permanent { provider: String, message: String },
}

impl ProviderError {
    pub fn transient(provider: &str, message: impl Into<String>) -> Self {
        Self::Transient {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn permanent(provider: &str, message: impl Into<String>) -> Self {
        Self::Permanent {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// 按 HTTP 状态码分类：429 与 5xx 可重试，其余 4xx 不可重试
    pub fn from_status(provider: &str, status: StatusCode, detail: &str) -> Self {
        let message = format!("HTTP {}: {}", status.as_u16(), detail);
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Self::transient(provider, message)
        } else {
            Self::permanent(provider, message)
        }
    }

    /// 请求未得到应答（连接失败、超时等）视为临时错误，请求本身构造失败视为永久错误
    pub fn from_request(provider: &str, err: &reqwest::Error) -> Self {
        if err.is_builder() {
            Self::permanent(provider, err.to_string())
        } else {
            Self::transient(provider, err.to_string())
        }
    }
}

/// 渠道发送器
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// 该发送器负责的渠道
    fn channel(&self) -> Channel;

    async fn send(
        &self,
        recipient: &Recipient,
        content: &Content,
    ) -> Result<DeliveryReceipt, ProviderError>;
}

/// 取出与渠道匹配的收件地址，格式不合法视为永久错误
pub(crate) fn recipient_address<'a>(
    provider: &str,
    channel: Channel,
    recipient: &'a Recipient,
) -> Result<&'a str, ProviderError> {
    recipient
        .address_for(channel)
        .map_err(|e| ProviderError::permanent(provider, e.to_string()))
}

/// 服务商接口要求的号码不带前导 +
pub(crate) fn digits_only(phone: &str) -> &str {
    phone.trim_start_matches('+')
}

// ---------------------------------------------------------------------------
// 日志发送器
// ---------------------------------------------------------------------------

/// 只记录日志、不发起网络请求的发送器，用于开发环境
pub struct LogSender {
    channel: Channel,
}

impl LogSender {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ChannelSender for LogSender {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(
        &self,
        recipient: &Recipient,
        content: &Content,
    ) -> Result<DeliveryReceipt, ProviderError> {
        let to = recipient_address("log", self.channel, recipient)?;
        let message_id = format!("mock_{}", Uuid::now_v7());

        info!(
            channel = %self.channel,
            to,
            message_id = %message_id,
            body_len = content.body.len(),
            "模拟发送通知"
        );

        Ok(DeliveryReceipt::delivered(message_id))
    }
}

/// 按配置创建三个渠道的发送器
pub fn build_senders(config: &ProvidersConfig) -> Result<Vec<Arc<dyn ChannelSender>>, NotifyError> {
    Ok(vec![
        Arc::new(EmailSender::new(&config.smtp)?),
        sms::from_config(&config.sms)?,
        Arc::new(WhatsappSender::new(&config.whatsapp)?),
    ])
}
