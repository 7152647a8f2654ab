//! Redis 连接管理
//!
//! 分发队列的唯一后端。多路复用连接本身可以并发使用，
//! 这里只负责建立、检查和向各组件发放连接句柄。

use redis::Client;
use redis::aio::MultiplexedConnection;
use tracing::info;

use crate::config::RedisConfig;
use crate::error::{NotifyError, Result};

/// Redis 连接池
///
/// 启动时建立一条多路复用连接，之后 `connection()` 返回的是它的廉价克隆。
#[derive(Clone)]
pub struct RedisPool {
    conn: MultiplexedConnection,
}

impl RedisPool {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Redis 连接已建立");
        Ok(Self { conn })
    }

    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(NotifyError::from)
    }
}
