//! 事件总线
//!
//! `notification.created` 事件按通知 id 分区写入有序日志，订阅方至少收到一次。
//! 只有 handler 返回 Ok 后消费位点才会前进；handler 返回 Err 时同一事件
//! 在传输层退避重投，直到成功或进程关闭。

pub mod kafka;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use notify_shared::error::Result;
use notify_shared::events::{NOTIFICATION_CREATED, NotificationCreatedEvent};
use notify_shared::observability::metrics;
use tokio::sync::watch;
use tracing::warn;

pub use self::kafka::KafkaEventBus;
pub use memory::InMemoryEventBus;

/// 事件处理器
///
/// 返回 Err 表示稍后重投同一事件，因此只应对可重试的基础设施错误返回 Err。
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: NotificationCreatedEvent) -> Result<()>;
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// 以通知 id 为分区键发布事件
    async fn publish(&self, event: &NotificationCreatedEvent) -> Result<()>;

    /// 持续消费并交给 handler，直到收到关闭信号
    async fn subscribe(
        &self,
        handler: Arc<dyn EventHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>;
}

/// 解码一条原始消息
///
/// 事件类型不符或负载无法解析时返回 None，调用方直接确认该消息。
pub(crate) fn decode_event(
    payload: &[u8],
    event_type: Option<&str>,
) -> Option<NotificationCreatedEvent> {
    if let Some(event_type) = event_type
        && event_type != NOTIFICATION_CREATED
    {
        warn!(event_type, "忽略未知类型的事件");
        metrics::record_bridge_event("dropped");
        return None;
    }

    match serde_json::from_slice(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, payload_len = payload.len(), "事件负载无法解析，已丢弃");
            metrics::record_bridge_event("dropped");
            None
        }
    }
}

/// 解码后交给 handler；无法解码的消息视为已处理
pub(crate) async fn dispatch(
    handler: &dyn EventHandler,
    payload: &[u8],
    event_type: Option<&str>,
) -> Result<()> {
    match decode_event(payload, event_type) {
        Some(event) => handler.handle(event).await,
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use notify_shared::events::Channel;
    use notify_shared::models::{Content, NotificationStatus, Recipient};
    use uuid::Uuid;

    fn event() -> NotificationCreatedEvent {
        NotificationCreatedEvent {
            id: Uuid::now_v7(),
            client_id: Uuid::now_v7(),
            channel: Channel::Email,
            recipient: Recipient::email("a@b.com"),
            content: Content::body("hi"),
            status: NotificationStatus::Pending,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_decode_event() {
        let e = event();
        let payload = serde_json::to_vec(&e).unwrap();

        assert_eq!(decode_event(&payload, Some(NOTIFICATION_CREATED)), Some(e.clone()));
        // 缺少消息头时按负载解析
        assert_eq!(decode_event(&payload, None), Some(e));
        assert!(decode_event(&payload, Some("notification.deleted")).is_none());
        assert!(decode_event(b"{not json", Some(NOTIFICATION_CREATED)).is_none());
        assert!(decode_event(br#"{"id":"x"}"#, None).is_none());
    }
}
