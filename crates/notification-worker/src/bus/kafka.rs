//! Kafka 事件总线
//!
//! 生产端以通知 id 为 key、附带 `event-type` 消息头写入 topic；
//! 消费端复用共享库的 KafkaConsumer，handler 成功后才保存位点。

use std::sync::Arc;

use async_trait::async_trait;
use notify_shared::config::KafkaConfig;
use notify_shared::error::{NotifyError, Result};
use notify_shared::events::{NOTIFICATION_CREATED, NotificationCreatedEvent};
use notify_shared::kafka::{EVENT_TYPE_HEADER, KafkaConsumer, KafkaProducer};
use tokio::sync::watch;
use tracing::{debug, info};

use super::{EventBus, EventHandler, dispatch};

pub struct KafkaEventBus {
    producer: KafkaProducer,
    consumer: Option<KafkaConsumer>,
    topic: String,
}

impl KafkaEventBus {
    /// 只发布不消费（接入层使用）
    pub fn publisher(config: &KafkaConfig) -> Result<Self> {
        Ok(Self {
            producer: KafkaProducer::new(config)?,
            consumer: None,
            topic: config.topic.clone(),
        })
    }

    /// 发布并消费（桥接消费者使用）
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        Ok(Self {
            producer: KafkaProducer::new(config)?,
            consumer: Some(KafkaConsumer::new(config)?),
            topic: config.topic.clone(),
        })
    }

    pub fn producer(&self) -> &KafkaProducer {
        &self.producer
    }
}

#[async_trait]
impl EventBus for KafkaEventBus {
    async fn publish(&self, event: &NotificationCreatedEvent) -> Result<()> {
        let (partition, offset) = self
            .producer
            .send_json(&self.topic, &event.key(), NOTIFICATION_CREATED, event)
            .await?;

        debug!(
            notification_id = %event.id,
            partition,
            offset,
            "通知事件已发布"
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        handler: Arc<dyn EventHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| NotifyError::Kafka("该事件总线未配置消费者".to_string()))?;
        consumer.subscribe(&[self.topic.as_str()])?;

        consumer
            .start(shutdown, |msg| {
                let handler = handler.clone();
                async move {
                    dispatch(
                        handler.as_ref(),
                        &msg.payload,
                        msg.header(EVENT_TYPE_HEADER),
                    )
                    .await
                }
            })
            .await;

        info!(topic = %self.topic, "事件订阅已停止");
        Ok(())
    }
}
