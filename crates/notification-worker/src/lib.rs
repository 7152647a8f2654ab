//! 通知分发服务
//!
//! 接入层落库并发布 `notification.created` 事件，桥接消费者把事件转换为
//! 按渠道划分的分发任务，各渠道工作池限流、限并发地调用服务商发送，
//! 最终结果写回通知状态表。

pub mod bridge;
pub mod bus;
pub mod error;
pub mod ingest;
pub mod query;
pub mod queue;
pub mod sender;
pub mod store;
pub mod worker;
