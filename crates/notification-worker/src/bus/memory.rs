//! 内存事件总线
//!
//! 按 key 哈希分区的有序日志，每个分区维护已确认位点。
//! 语义与 Kafka 实现一致：handler 成功后位点才前进，失败的事件会被重投。

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use notify_shared::error::Result;
use notify_shared::events::{NOTIFICATION_CREATED, NotificationCreatedEvent};
use notify_shared::retry::RetryPolicy;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tracing::{info, warn};

use super::{EventBus, EventHandler, dispatch};

#[derive(Debug, Clone)]
struct Record {
    payload: Vec<u8>,
    event_type: Option<String>,
}

#[derive(Default)]
struct Partition {
    log: Vec<Record>,
    committed: usize,
}

pub struct InMemoryEventBus {
    partitions: Vec<Mutex<Partition>>,
    published: Notify,
    redelivery: RetryPolicy,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(3)
    }
}

impl InMemoryEventBus {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| Mutex::default()).collect(),
            published: Notify::new(),
            redelivery: RetryPolicy::redelivery(),
        }
    }

    pub fn with_redelivery_policy(mut self, policy: RetryPolicy) -> Self {
        self.redelivery = policy;
        self
    }

    pub fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as usize
    }

    /// 直接写入原始负载，可用于模拟其他生产者写入的消息
    pub fn publish_raw(&self, key: &str, payload: Vec<u8>, event_type: Option<&str>) {
        let partition = self.partition_for(key);
        self.partitions[partition].lock().log.push(Record {
            payload,
            event_type: event_type.map(String::from),
        });
        self.published.notify_one();
    }

    /// 所有分区中尚未确认的消息数
    pub fn pending(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| {
                let p = p.lock();
                p.log.len() - p.committed
            })
            .sum()
    }

    pub fn committed_offset(&self, partition: usize) -> usize {
        self.partitions[partition].lock().committed
    }

    fn next_record(&self, partition: usize) -> Option<(usize, Record)> {
        let p = self.partitions[partition].lock();
        p.log.get(p.committed).map(|r| (p.committed, r.clone()))
    }

    fn commit(&self, partition: usize, offset: usize) {
        let mut p = self.partitions[partition].lock();
        if p.committed == offset {
            p.committed = offset + 1;
        }
    }

    /// 依次处理各分区中所有未确认的消息
    ///
    /// 某条消息处理失败时该分区停在这条消息上，位点不变，下次调用会重新投递；
    /// 其余分区照常处理。任一分区失败时返回第一个错误，否则返回本次确认的消息数。
    pub async fn poll_once(&self, handler: &dyn EventHandler) -> Result<usize> {
        let mut acked = 0;
        let mut first_error = None;
        for partition in 0..self.partitions.len() {
            while let Some((offset, record)) = self.next_record(partition) {
                if let Err(e) = dispatch(handler, &record.payload, record.event_type.as_deref()).await {
                    warn!(partition, offset, error = %e, "事件处理失败，分区暂停在该位点");
                    first_error.get_or_insert(e);
                    break;
                }
                self.commit(partition, offset);
                acked += 1;
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(acked),
        }
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: &NotificationCreatedEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        self.publish_raw(&event.key(), payload, Some(NOTIFICATION_CREATED));
        Ok(())
    }

    async fn subscribe(
        &self,
        handler: Arc<dyn EventHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.poll_once(handler.as_ref()).await {
                Ok(_) => failures = 0,
                Err(e) => {
                    let delay = self.redelivery.delay_for_attempt(failures);
                    failures = failures.saturating_add(1);
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "事件处理失败，退避后重投");

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        res = shutdown.changed() => {
                            if res.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                    continue;
                }
            }

            tokio::select! {
                _ = self.published.notified() => {}
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(pending = self.pending(), "内存事件订阅已停止");
        Ok(())
    }
}
