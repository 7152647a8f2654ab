//! 通知投递工作进程
//!
//! 为 email / sms / whatsapp 三个渠道各启动一个工作池，
//! 从 Redis 分发队列租用任务并调用对应服务商发送。

use std::sync::Arc;

use anyhow::Result;
use notify_shared::{
    config::AppConfig, database::Database, observability, redis_pool::RedisPool,
};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use notification_worker::{
    queue::{DispatchQueue, RedisDispatchQueue},
    sender::build_senders,
    store::{ClientRepository, NotificationRepository, PgClientRepository, PgNotificationRepository},
    worker::WorkerPool,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置，失败时使用默认值
    let config = AppConfig::load("notification-worker").unwrap_or_else(|e| {
        eprintln!("加载配置失败，使用默认配置: {e}");
        AppConfig::default()
    });
    config.validate()?;

    // 2. 初始化日志与指标
    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    info!(environment = %config.environment, "通知投递工作进程启动中");

    // 3. 初始化数据库并执行迁移
    let db = Database::connect(&config.database).await?;
    db.run_migrations().await?;
    let pool = db.pool().clone();

    // 4. 初始化 Redis 分发队列
    let redis = RedisPool::connect(&config.redis).await?;
    redis.health_check().await?;
    let queue: Arc<dyn DispatchQueue> = Arc::new(RedisDispatchQueue::new(&redis, &config.queue));
    info!(queue = %config.queue.name, "分发队列已连接");

    // 5. 创建仓储与发送器
    let notifications: Arc<dyn NotificationRepository> =
        Arc::new(PgNotificationRepository::new(pool.clone()));
    let clients: Arc<dyn ClientRepository> = Arc::new(PgClientRepository::new(pool));
    let senders = build_senders(&config.providers)?;

    // 6. 注册关闭信号
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "监听关闭信号失败");
        }
        info!("收到关闭信号，停止租用新任务");
        let _ = shutdown_tx.send(true);
    });

    // 7. 每个渠道启动一个工作池
    let mut handles = Vec::with_capacity(senders.len());
    for sender in senders {
        let channel = sender.channel();
        let pool = Arc::new(
            WorkerPool::new(
                sender,
                notifications.clone(),
                clients.clone(),
                queue.clone(),
                config.workers.for_channel(channel).clone(),
            )
            .with_poll_interval(config.queue.poll_interval()),
        );
        handles.push((channel, tokio::spawn(pool.run(shutdown_rx.clone()))));
    }
    info!(pools = handles.len(), "工作池已全部启动");

    // 8. 等待工作池排空后退出
    for (channel, handle) in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(%channel, error = %e, "工作池异常退出"),
            Err(e) => error!(%channel, error = %e, "工作池任务崩溃"),
        }
    }

    db.close().await;
    info!("通知投递工作进程已停止");
    Ok(())
}
