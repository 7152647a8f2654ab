//! 事件桥接进程
//!
//! 消费 Kafka 中的 `notification.created` 事件，推进通知状态并写入分发队列。

use std::sync::Arc;

use anyhow::Result;
use notify_shared::{
    config::AppConfig, database::Database, observability, redis_pool::RedisPool,
};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use notification_worker::{
    bridge::BridgeConsumer,
    bus::{EventBus, KafkaEventBus},
    queue::{JobOptions, RedisDispatchQueue},
    store::PgNotificationRepository,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置
    let config = AppConfig::load("notification-bridge").unwrap_or_else(|e| {
        eprintln!("加载配置失败，使用默认配置: {e}");
        AppConfig::default()
    });

    // 2. 初始化日志与指标
    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    info!(
        environment = %config.environment,
        topic = %config.kafka.topic,
        group_id = %config.kafka.consumer_group,
        "事件桥接进程启动中"
    );

    // 3. 初始化存储与队列
    let db = Database::connect(&config.database).await?;
    db.run_migrations().await?;
    let redis = RedisPool::connect(&config.redis).await?;
    redis.health_check().await?;

    let bridge = Arc::new(BridgeConsumer::new(
        Arc::new(PgNotificationRepository::new(db.pool().clone())),
        Arc::new(RedisDispatchQueue::new(&redis, &config.queue)),
        JobOptions::from_config(&config.queue),
    ));

    // 4. 创建 Kafka 事件总线
    let bus = KafkaEventBus::new(&config.kafka)?;

    // 5. 注册关闭信号
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "监听关闭信号失败");
        }
        info!("收到关闭信号，停止消费事件");
        let _ = shutdown_tx.send(true);
    });

    // 6. 消费直到关闭
    bus.subscribe(bridge, shutdown_rx).await?;

    db.close().await;
    info!("事件桥接进程已停止");
    Ok(())
}
