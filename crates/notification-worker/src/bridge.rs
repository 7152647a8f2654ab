//! 桥接消费者
//!
//! 订阅 `notification.created` 事件，把通知从 PENDING 推进到 PROCESSING，
//! 并为其生成第一次投递的分发任务。
//!
//! 处理顺序是先迁移状态再入队：入队失败时事件会被重投，
//! 届时状态已是 PROCESSING，再次入队即可；任务 id 等于通知 id，重复入队是空操作。

use std::sync::Arc;

use async_trait::async_trait;
use notify_shared::error::{NotifyError, Result};
use notify_shared::events::NotificationCreatedEvent;
use notify_shared::models::NotificationStatus;
use notify_shared::observability::metrics;
use tracing::{debug, info, warn};

use crate::bus::EventHandler;
use crate::queue::{DispatchJob, DispatchQueue, JobOptions};
use crate::store::NotificationRepository;

pub struct BridgeConsumer {
    notifications: Arc<dyn NotificationRepository>,
    queue: Arc<dyn DispatchQueue>,
    options: JobOptions,
}

impl BridgeConsumer {
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        queue: Arc<dyn DispatchQueue>,
        options: JobOptions,
    ) -> Self {
        Self {
            notifications,
            queue,
            options,
        }
    }

    /// 基础设施错误返回 Err 让事件重投，其余错误记录后确认
    fn retry_or_ack(event: &NotificationCreatedEvent, stage: &str, err: NotifyError) -> Result<()> {
        if err.is_retryable() {
            warn!(notification_id = %event.id, stage, code = err.code(), error = %err, "桥接处理失败，等待事件重投");
            metrics::record_bridge_event("error");
            return Err(err);
        }

        warn!(notification_id = %event.id, stage, code = err.code(), error = %err, "桥接处理失败且不可重试，确认事件");
        metrics::record_bridge_event("dropped");
        Ok(())
    }
}

#[async_trait]
impl EventHandler for BridgeConsumer {
    async fn handle(&self, event: NotificationCreatedEvent) -> Result<()> {
        if let Err(e) = event
            .recipient
            .address_for(event.channel)
            .and_then(|_| event.content.validate())
        {
            warn!(
                notification_id = %event.id,
                channel = %event.channel,
                error = %e,
                "事件内容无效，已丢弃"
            );
            metrics::record_bridge_event("dropped");
            return Ok(());
        }

        let status = match self.notifications.mark_processing(event.id).await {
            Ok(status) => status,
            Err(e) => return Self::retry_or_ack(&event, "mark_processing", e),
        };

        match status {
            None => {
                warn!(notification_id = %event.id, "通知不存在，事件已丢弃");
                metrics::record_bridge_event("dropped");
                return Ok(());
            }
            Some(status @ (NotificationStatus::Sent | NotificationStatus::Failed)) => {
                debug!(notification_id = %event.id, %status, "通知已有投递结果，不再入队");
                metrics::record_bridge_event("terminal");
                return Ok(());
            }
            Some(_) => {}
        }

        let job = DispatchJob::from_event(&event);
        match self.queue.enqueue(job, self.options.clone()).await {
            Ok(true) => {
                info!(
                    notification_id = %event.id,
                    channel = %event.channel,
                    "通知已进入分发队列"
                );
                metrics::record_bridge_event("enqueued");
                Ok(())
            }
            Ok(false) => {
                debug!(notification_id = %event.id, "分发任务已存在，忽略重复事件");
                metrics::record_bridge_event("duplicate");
                Ok(())
            }
            Err(e) => Self::retry_or_ack(&event, "enqueue", e),
        }
    }
}
