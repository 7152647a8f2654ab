//! 通知服务错误类型
//!
//! 区分收件人/内容问题、事件反序列化问题、服务商错误与基础设施错误，
//! 便于上层根据错误类型决定重试、失败还是直接确认丢弃。

use notify_shared::error::NotifyError;
use thiserror::Error;

use crate::sender::ProviderError;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("收件人无效: {0}")]
    InvalidRecipient(String),

    #[error("通知反序列化失败: {0}")]
    DeserializationFailed(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Shared(#[from] NotifyError),
}

pub type Result<T> = std::result::Result<T, NotificationError>;

impl NotificationError {
    /// 是否值得重试
    ///
    /// 服务商临时错误和存储/队列连接错误可以重试，其余重试也不会成功。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidRecipient(_) | Self::DeserializationFailed(_) => false,
            Self::Provider(e) => e.is_transient(),
            Self::Shared(e) => e.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NotificationError::InvalidRecipient("缺少手机号".to_string());
        assert_eq!(err.to_string(), "收件人无效: 缺少手机号");

        let err = NotificationError::DeserializationFailed("invalid JSON".to_string());
        assert_eq!(err.to_string(), "通知反序列化失败: invalid JSON");
    }

    #[test]
    fn test_retry_classification() {
        assert!(!NotificationError::InvalidRecipient("x".to_string()).is_retryable());
        assert!(!NotificationError::DeserializationFailed("x".to_string()).is_retryable());

        let transient = NotificationError::from(ProviderError::transient("twilio", "HTTP 503"));
        assert!(transient.is_retryable());

        let permanent = NotificationError::from(ProviderError::permanent("twilio", "HTTP 400"));
        assert!(!permanent.is_retryable());

        let kafka = NotificationError::from(NotifyError::Kafka("broker down".to_string()));
        assert!(kafka.is_retryable());

        let not_found = NotificationError::from(NotifyError::not_found("Notification", "n-1"));
        assert!(!not_found.is_retryable());
    }
}
