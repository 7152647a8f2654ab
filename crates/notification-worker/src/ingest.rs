//! 通知接入
//!
//! 校验请求、落库 PENDING 记录并发布 `notification.created` 事件。
//! 事件发布失败时记录保持 PENDING，错误信息写入 error_message 供排查。

use std::sync::Arc;

use notify_shared::events::{Channel, NotificationCreatedEvent};
use notify_shared::models::{Content, Notification, Recipient};
use notify_shared::observability::metrics;
use serde::Deserialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::error::{NotificationError, Result};
use crate::store::NotificationRepository;

/// 发送通知请求
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub channel: Channel,
    pub recipient: Recipient,
    pub content: Content,
}

pub struct IngestionGateway {
    notifications: Arc<dyn NotificationRepository>,
    bus: Arc<dyn EventBus>,
}

impl IngestionGateway {
    pub fn new(notifications: Arc<dyn NotificationRepository>, bus: Arc<dyn EventBus>) -> Self {
        Self { notifications, bus }
    }

    pub async fn submit(&self, client_id: Uuid, request: SubmitRequest) -> Result<Notification> {
        let notification =
            Notification::new(client_id, request.channel, request.recipient, request.content);

        if let Err(e) = notification.recipient.address_for(notification.channel) {
            return Err(NotificationError::InvalidRecipient(e.to_string()));
        }
        notification.content.validate()?;

        self.notifications.create(&notification).await?;

        let event = NotificationCreatedEvent::from(&notification);
        if let Err(e) = self.bus.publish(&event).await {
            error!(
                notification_id = %notification.id,
                error = %e,
                "通知事件发布失败，记录保持 PENDING"
            );
            let message = format!("event publish failed: {e}");
            if let Err(store_err) = self.notifications.record_error(notification.id, &message).await {
                error!(notification_id = %notification.id, error = %store_err, "写入发布失败信息失败");
            }
            return Err(e.into());
        }

        metrics::record_ingested(notification.channel.as_str());
        info!(
            notification_id = %notification.id,
            client_id = %client_id,
            channel = %notification.channel,
            "通知已接收"
        );
        Ok(notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventHandler, InMemoryEventBus};
    use crate::store::InMemoryNotificationRepository;
    use async_trait::async_trait;
    use notify_shared::error::NotifyError;
    use notify_shared::models::NotificationStatus;
    use tokio::sync::watch;

    struct DownBus;

    #[async_trait]
    impl EventBus for DownBus {
        async fn publish(&self, _event: &NotificationCreatedEvent) -> notify_shared::error::Result<()> {
            Err(NotifyError::Kafka("broker transport failure".to_string()))
        }

        async fn subscribe(
            &self,
            _handler: Arc<dyn EventHandler>,
            _shutdown: watch::Receiver<bool>,
        ) -> notify_shared::error::Result<()> {
            Ok(())
        }
    }

    fn sms_request(phone: &str, body: &str) -> SubmitRequest {
        SubmitRequest {
            channel: Channel::Sms,
            recipient: Recipient::phone(phone),
            content: Content::body(body),
        }
    }

    #[tokio::test]
    async fn test_submit_persists_and_publishes() {
        let store = Arc::new(InMemoryNotificationRepository::new());
        let bus = Arc::new(InMemoryEventBus::new(1));
        let gateway = IngestionGateway::new(store.clone(), bus.clone());

        let n = gateway
            .submit(Uuid::now_v7(), sms_request("+14155550100", "code 1234"))
            .await
            .unwrap();

        assert_eq!(n.status, NotificationStatus::Pending);
        assert_eq!(store.len(), 1);
        assert_eq!(bus.pending(), 1);
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected_before_storing() {
        let store = Arc::new(InMemoryNotificationRepository::new());
        let bus = Arc::new(InMemoryEventBus::new(1));
        let gateway = IngestionGateway::new(store.clone(), bus.clone());

        let err = gateway
            .submit(
                Uuid::now_v7(),
                SubmitRequest {
                    channel: Channel::Email,
                    recipient: Recipient::phone("+14155550100"),
                    content: Content::body("hi"),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::InvalidRecipient(_)));

        let err = gateway
            .submit(Uuid::now_v7(), sms_request("+14155550100", "  "))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());

        assert!(store.is_empty());
        assert_eq!(bus.pending(), 0);
    }

    #[test]
    fn test_request_wire_format() {
        let request: SubmitRequest = serde_json::from_str(
            r#"{"channel":"whatsapp","recipient":{"phone":"+14155550100"},"content":{"body":"hi","templateName":"otp"}}"#,
        )
        .unwrap();
        assert_eq!(request.channel, Channel::Whatsapp);
        assert_eq!(request.content.template_name.as_deref(), Some("otp"));
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_record_pending() {
        let store = Arc::new(InMemoryNotificationRepository::new());
        let gateway = IngestionGateway::new(store.clone(), Arc::new(DownBus));
        let client_id = Uuid::now_v7();

        let err = gateway
            .submit(client_id, sms_request("+14155550100", "code 1234"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let (items, total) = store.list(client_id, &Default::default()).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].status, NotificationStatus::Pending);
        assert!(
            items[0]
                .error_message
                .as_deref()
                .unwrap()
                .starts_with("event publish failed:")
        );
    }
}
