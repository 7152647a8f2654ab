//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为业务友好的 Producer/Consumer 抽象，
//! 统一消息序列化、错误映射和优雅关闭语义。
//!
//! 消费端采用"处理成功后才保存位点"的至少一次语义：
//! 关闭 `enable.auto.offset.store`，handler 返回 Ok 后手动 store，
//! 由自动提交线程把已保存的位点刷到 broker。

use std::collections::HashMap;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::NotifyError;
use crate::retry::RetryPolicy;

/// 事件类型消息头
pub const EVENT_TYPE_HEADER: &str = "event-type";

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp: msg.timestamp().to_millis(),
            headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, NotifyError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| NotifyError::Kafka(format!("负载反序列化失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 生产者
///
/// `FutureProducer` 内部是 Arc 包装的，Clone 开销很小。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    ///
    /// 开启幂等写入，broker 重试不会在分区内产生重复消息。
    pub fn new(config: &KafkaConfig) -> Result<Self, NotifyError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("message.timeout.ms", "30000")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| NotifyError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self { producer })
    }

    /// 发送原始字节消息，返回 (partition, offset)
    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
        event_type: Option<&str>,
    ) -> Result<(i32, i64), NotifyError> {
        let mut record = FutureRecord::to(topic).key(key).payload(payload);
        if let Some(event_type) = event_type {
            record = record.headers(OwnedHeaders::new().insert(Header {
                key: EVENT_TYPE_HEADER,
                value: Some(event_type),
            }));
        }

        let delivery = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| NotifyError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 将值序列化为 JSON 后发送
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        event_type: &str,
        value: &T,
    ) -> Result<(i32, i64), NotifyError> {
        let payload = serde_json::to_vec(value)?;
        self.send(topic, key, &payload, Some(event_type)).await
    }

    /// 刷新尚未确认的消息，进程退出前调用
    pub fn flush(&self, timeout: Duration) -> Result<(), NotifyError> {
        self.producer
            .flush(timeout)
            .map_err(|e| NotifyError::Kafka(format!("刷新生产者失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 消费者
///
/// 封装 `StreamConsumer` 并提供基于 `watch` channel 的优雅关闭语义。
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    /// handler 失败后重新处理同一条消息的退避策略
    redelivery: RetryPolicy,
}

impl KafkaConsumer {
    pub fn new(config: &KafkaConfig) -> Result<Self, NotifyError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.consumer_group)
            .set("client.id", &config.client_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .create()
            .map_err(|e| NotifyError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(
            brokers = %config.brokers,
            group_id = %config.consumer_group,
            "Kafka 消费者已初始化"
        );
        Ok(Self {
            consumer,
            redelivery: RetryPolicy::redelivery(),
        })
    }

    pub fn with_redelivery_policy(mut self, policy: RetryPolicy) -> Self {
        self.redelivery = policy;
        self
    }

    pub fn subscribe(&self, topics: &[&str]) -> Result<(), NotifyError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| NotifyError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 启动消费循环
    ///
    /// - handler 返回 Ok 后保存 `offset + 1`，位点只在处理成功后前进；
    /// - handler 返回 Err 时按退避策略重新处理同一条消息，直到成功或收到关闭信号，
    ///   关闭时不保存位点，重启后该消息会被重新投递；
    /// - 关闭信号只在两条消息之间生效，正在执行的 handler 会自然完成。
    pub async fn start<F, Fut>(&self, mut shutdown: watch::Receiver<bool>, handler: F)
    where
        F: Fn(ConsumerMessage) -> Fut,
        Fut: std::future::Future<Output = Result<(), NotifyError>>,
    {
        use futures::StreamExt;

        let stream = self.consumer.stream();
        futures::pin_mut!(stream);

        info!("Kafka 消费循环已启动");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到关闭信号，Kafka 消费循环退出");
                        break;
                    }
                }

                msg_result = stream.next() => {
                    let Some(msg_result) = msg_result else {
                        warn!("Kafka 消息流意外结束");
                        break;
                    };

                    let msg = match msg_result {
                        Ok(borrowed_msg) => ConsumerMessage::from_borrowed(&borrowed_msg),
                        Err(e) => {
                            error!(error = %e, "接收 Kafka 消息出错");
                            continue;
                        }
                    };

                    debug!(
                        topic = %msg.topic,
                        partition = msg.partition,
                        offset = msg.offset,
                        "收到 Kafka 消息"
                    );

                    if !self.process_until_acked(&msg, &handler, &mut shutdown).await {
                        info!(
                            partition = msg.partition,
                            offset = msg.offset,
                            "关闭时消息尚未处理成功，位点保持不变"
                        );
                        break;
                    }
                }
            }
        }
    }

    /// 反复调用 handler 直到成功；返回 false 表示因关闭信号放弃
    async fn process_until_acked<F, Fut>(
        &self,
        msg: &ConsumerMessage,
        handler: &F,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool
    where
        F: Fn(ConsumerMessage) -> Fut,
        Fut: std::future::Future<Output = Result<(), NotifyError>>,
    {
        let mut attempt: u32 = 0;

        loop {
            match handler(msg.clone()).await {
                Ok(()) => {
                    if let Err(e) =
                        self.consumer
                            .store_offset(&msg.topic, msg.partition, msg.offset + 1)
                    {
                        // 位点保存失败只会导致重复消费，下游处理是幂等的
                        warn!(
                            error = %e,
                            partition = msg.partition,
                            offset = msg.offset,
                            "保存消费位点失败"
                        );
                    }
                    return true;
                }
                Err(e) => {
                    let delay = self.redelivery.delay_for_attempt(attempt);
                    warn!(
                        error = %e,
                        partition = msg.partition,
                        offset = msg.offset,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "处理 Kafka 消息失败，位点不前进，退避后重试"
                    );
                    attempt = attempt.saturating_add(1);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return false;
                            }
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
