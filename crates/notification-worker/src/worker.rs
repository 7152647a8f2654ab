//! 渠道工作池
//!
//! 每个渠道一个工作池，持有该渠道的发送器。工作池从分发队列租用任务，
//! 按"开始尝试 → 发送 → 写回状态"的协议处理，再把结果映射为队列确认：
//!
//! | 结果 | 队列操作 |
//! |---|---|
//! | Completed / Skipped | `complete` |
//! | RetryableFailure | `retry_or_fail` |
//! | PermanentFailure | `fail` |
//!
//! 处理期间按租约超时的三分之一定期续约，慢速发送不会被重复投递。
//!
//! 并发由信号量限制，吞吐由 governor GCRA 限流：每 W/N 放行一个任务，
//! 不允许突发，任意长度为 W 的窗口内最多 N 个。限流器的时钟取自
//! `tokio::time`，暂停时钟的测试里同样生效。收到关闭信号后停止租用，
//! 等待进行中的任务全部确认后返回。

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use governor::clock::Clock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use notify_shared::config::WorkerPoolConfig;
use notify_shared::error::Result;
use notify_shared::events::Channel;
use notify_shared::observability::metrics;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::queue::{DispatchQueue, FailDisposition, LeasedJob};
use crate::sender::{ChannelSender, DeliveryReceipt, ProviderError};
use crate::store::{AttemptStart, ClientRepository, NotificationRepository};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<Instant>>;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(100);

/// 以 `tokio::time::Instant` 计时的 governor 时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    type Instant = Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// 单个任务的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// 已投递并写回 SENT
    Completed,
    /// 渠道不符、重复任务或通知已终结，未做任何投递
    Skipped,
    RetryableFailure(String),
    PermanentFailure(String),
}

pub struct WorkerPool {
    channel: Channel,
    sender: Arc<dyn ChannelSender>,
    notifications: Arc<dyn NotificationRepository>,
    clients: Arc<dyn ClientRepository>,
    queue: Arc<dyn DispatchQueue>,
    config: WorkerPoolConfig,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        sender: Arc<dyn ChannelSender>,
        notifications: Arc<dyn NotificationRepository>,
        clients: Arc<dyn ClientRepository>,
        queue: Arc<dyn DispatchQueue>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            channel: sender.channel(),
            sender,
            notifications,
            clients,
            queue,
            config,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// 队列为空时的轮询间隔
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// 处理单个任务，不做队列确认
    pub async fn process_job(&self, leased: &LeasedJob) -> JobOutcome {
        let job = &leased.job;
        let id = job.notification_id;

        if job.channel != self.channel {
            warn!(
                notification_id = %id,
                job_channel = %job.channel,
                pool_channel = %self.channel,
                "任务渠道与工作池不符，跳过"
            );
            metrics::record_job_skipped(self.channel.as_str(), "channel_mismatch");
            return JobOutcome::Skipped;
        }

        match self.notifications.begin_attempt(id, leased.options.max_attempts).await {
            Ok(AttemptStart::Started { retry_count }) => {
                debug!(notification_id = %id, attempt = job.attempt, retry_count, "开始投递");
            }
            Ok(AttemptStart::AlreadySent) => {
                debug!(notification_id = %id, "通知已发送，跳过重复任务");
                metrics::record_job_skipped(self.channel.as_str(), "already_sent");
                return JobOutcome::Skipped;
            }
            Ok(AttemptStart::Exhausted { retry_count }) => {
                warn!(notification_id = %id, retry_count, "通知重试次数已耗尽，跳过");
                metrics::record_job_skipped(self.channel.as_str(), "exhausted");
                return JobOutcome::Skipped;
            }
            Ok(AttemptStart::NotClaimed) => {
                warn!(notification_id = %id, "通知仍为 PENDING，跳过");
                metrics::record_job_skipped(self.channel.as_str(), "not_claimed");
                return JobOutcome::Skipped;
            }
            Ok(AttemptStart::NotFound) => {
                warn!(notification_id = %id, "通知不存在，跳过");
                metrics::record_job_skipped(self.channel.as_str(), "not_found");
                return JobOutcome::Skipped;
            }
            Err(e) => {
                error!(notification_id = %id, error = %e, "读取通知状态失败");
                return JobOutcome::RetryableFailure(format!("status store error: {e}"));
            }
        }

        let started = Instant::now();
        match self.sender.send(&job.recipient, &job.content).await {
            Ok(receipt) => self.on_delivered(leased, receipt, started).await,
            Err(e) => self.on_send_failed(leased, e, started).await,
        }
    }

    async fn on_delivered(
        &self,
        leased: &LeasedJob,
        receipt: DeliveryReceipt,
        started: Instant,
    ) -> JobOutcome {
        let job = &leased.job;
        let id = job.notification_id;

        match self.notifications.mark_sent(id, Utc::now()).await {
            Ok(true) => {
                // 只有完成 SENT 迁移的那一次调用负责计数
                if let Err(e) = self.clients.increment_usage(job.client_id, self.channel).await {
                    error!(
                        notification_id = %id,
                        client_id = %job.client_id,
                        error = %e,
                        "更新接入方用量计数失败，计数未补偿"
                    );
                }
            }
            Ok(false) => {
                warn!(notification_id = %id, "通知已不在 PROCESSING 状态，跳过用量计数");
            }
            Err(e) => {
                error!(notification_id = %id, error = %e, "发送成功但写回 SENT 失败");
                metrics::record_delivery(
                    self.channel.as_str(),
                    "retry",
                    started.elapsed().as_secs_f64(),
                );
                return JobOutcome::RetryableFailure(format!("status update failed: {e}"));
            }
        }

        metrics::record_delivery(self.channel.as_str(), "sent", started.elapsed().as_secs_f64());
        info!(
            notification_id = %id,
            channel = %self.channel,
            attempt = job.attempt,
            provider_message_id = ?receipt.provider_message_id,
            "通知已发送"
        );
        JobOutcome::Completed
    }

    async fn on_send_failed(
        &self,
        leased: &LeasedJob,
        err: ProviderError,
        started: Instant,
    ) -> JobOutcome {
        let id = leased.job.notification_id;
        let message = err.to_string();
        let elapsed = started.elapsed().as_secs_f64();

        match self.notifications.mark_failed(id, &message).await {
            Ok(Some(retry_count)) => {
                warn!(
                    notification_id = %id,
                    attempt = leased.job.attempt,
                    retry_count,
                    transient = err.is_transient(),
                    error = %message,
                    "通知投递失败"
                );
            }
            Ok(None) => {
                warn!(notification_id = %id, error = %message, "通知已不在 PROCESSING 状态，失败未记录");
            }
            Err(e) => {
                error!(notification_id = %id, error = %e, "写回 FAILED 失败");
                metrics::record_delivery(self.channel.as_str(), "retry", elapsed);
                return JobOutcome::RetryableFailure(format!("{message}; status update failed: {e}"));
            }
        }

        if err.is_transient() {
            metrics::record_delivery(self.channel.as_str(), "retry", elapsed);
            JobOutcome::RetryableFailure(message)
        } else {
            metrics::record_delivery(self.channel.as_str(), "failed", elapsed);
            JobOutcome::PermanentFailure(message)
        }
    }

    /// 处理任务，期间定期续约
    async fn process_with_lease(&self, leased: &LeasedJob) -> JobOutcome {
        let every = (self.queue.lease_timeout() / 3).max(MIN_RENEW_INTERVAL);
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        let work = self.process_job(leased);
        tokio::pin!(work);

        loop {
            tokio::select! {
                outcome = &mut work => return outcome,
                _ = renew.tick() => match self.queue.extend_lease(leased).await {
                    Ok(true) => debug!(notification_id = %leased.job.notification_id, "租约已续期"),
                    Ok(false) => warn!(
                        notification_id = %leased.job.notification_id,
                        "租约已失效，任务可能已被重新投递"
                    ),
                    Err(e) => warn!(
                        notification_id = %leased.job.notification_id,
                        error = %e,
                        "续约失败"
                    ),
                },
            }
        }
    }

    /// 任务耗尽时通知可能仍停留在 PROCESSING（例如每次读取状态都失败），尽力标记为 FAILED
    async fn settle_exhausted(&self, id: Uuid, error: &str) {
        match self.notifications.mark_failed(id, error).await {
            Ok(Some(retry_count)) => {
                warn!(notification_id = %id, retry_count, "通知停留在 PROCESSING，已标记为 FAILED");
            }
            Ok(None) => {}
            Err(e) => {
                error!(notification_id = %id, error = %e, "标记 FAILED 失败，通知停留在 PROCESSING");
            }
        }
    }

    /// 处理任务并按结果确认队列
    ///
    /// 租约已失效时确认不生效，任务归新的持有者处理。
    pub async fn handle(&self, leased: LeasedJob) -> Result<JobOutcome> {
        let outcome = self.process_with_lease(&leased).await;
        let id = leased.job.notification_id;

        match &outcome {
            JobOutcome::Completed | JobOutcome::Skipped => {
                if !self.queue.complete(&leased).await? {
                    warn!(notification_id = %id, "租约已失效，完成确认未生效");
                }
            }
            JobOutcome::RetryableFailure(error) => {
                match self.queue.retry_or_fail(&leased, error).await? {
                    FailDisposition::Retrying { attempt, delay } => {
                        metrics::record_job_retry(self.channel.as_str(), attempt);
                        info!(
                            notification_id = %id,
                            next_attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            "任务将延迟重试"
                        );
                    }
                    FailDisposition::Exhausted => {
                        metrics::record_job_exhausted(self.channel.as_str());
                        warn!(notification_id = %id, attempts = leased.job.attempt, "投递次数耗尽，任务进入失败集合");
                        self.settle_exhausted(id, error).await;
                    }
                    FailDisposition::LeaseLost => {
                        warn!(notification_id = %id, "租约已失效，重试确认未生效");
                    }
                }
            }
            JobOutcome::PermanentFailure(error) => {
                if self.queue.fail(&leased, error).await? {
                    metrics::record_job_exhausted(self.channel.as_str());
                    warn!(notification_id = %id, error = %error, "不可重试的失败，任务进入失败集合");
                } else {
                    warn!(notification_id = %id, "租约已失效，失败确认未生效");
                }
            }
        }

        Ok(outcome)
    }

    /// 运行工作池直到收到关闭信号
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let concurrency = self.config.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let limiter = rate_limiter(&self.config);
        let channel = self.channel.as_str();

        info!(
            channel,
            concurrency,
            rate_limit_max = self.config.rate_limit_max,
            rate_limit_window_secs = self.config.rate_limit_window_secs,
            "工作池已启动"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                    continue;
                }
            };

            tokio::select! {
                _ = acquire_slot(&limiter) => {}
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let leased = loop {
                match self.queue.lease(self.channel).await {
                    Ok(Some(leased)) => break Some(leased),
                    Ok(None) => {}
                    Err(e) => warn!(channel, error = %e, "租用任务失败"),
                }

                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break None;
                        }
                    }
                }
            };
            let Some(leased) = leased else {
                break;
            };

            let pool = self.clone();
            let in_flight = semaphore.clone();
            metrics::set_in_flight(channel, (concurrency - in_flight.available_permits()) as f64);

            tokio::spawn(async move {
                let notification_id = leased.job.notification_id;
                if let Err(e) = pool.handle(leased).await {
                    // 未确认的任务在租约超时后会被重新投递
                    error!(
                        notification_id = %notification_id,
                        error = %e,
                        "确认任务失败，等待租约超时后重投"
                    );
                }
                drop(permit);
                metrics::set_in_flight(
                    pool.channel.as_str(),
                    (concurrency - in_flight.available_permits()) as f64,
                );
            });
        }

        info!(channel, "停止租用任务，等待进行中的任务完成");
        let _drained = semaphore.acquire_many(concurrency as u32).await;
        metrics::set_in_flight(channel, 0.0);
        info!(channel, "工作池已停止");
        Ok(())
    }
}

/// 窗口 W 内最多 N 个任务：每 W/N 放行一个，突发为 1
fn rate_quota(config: &WorkerPoolConfig) -> Quota {
    let max = NonZeroU32::new(config.rate_limit_max).unwrap_or(NonZeroU32::MIN);
    Quota::with_period(config.rate_limit_window() / max.get())
        .unwrap_or_else(|| Quota::per_second(max))
        .allow_burst(NonZeroU32::MIN)
}

fn rate_limiter(config: &WorkerPoolConfig) -> DirectLimiter {
    RateLimiter::direct_with_clock(rate_quota(config), &TokioClock)
}

/// 等到限流器放行
async fn acquire_slot(limiter: &DirectLimiter) {
    while let Err(not_until) = limiter.check() {
        tokio::time::sleep(not_until.wait_time_from(TokioClock.now())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{DispatchJob, InMemoryDispatchQueue, JobOptions, new_lease_token};
    use crate::sender::MockChannelSender;
    use async_trait::async_trait;
    use governor::clock::FakeRelativeClock;
    use notify_shared::config::QueueConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::store::{
        InMemoryClientRepository, InMemoryNotificationRepository, MockClientRepository,
        MockNotificationRepository,
    };
    use notify_shared::error::NotifyError;
    use notify_shared::models::{Client, Content, Notification, NotificationStatus, Recipient};
    use uuid::Uuid;

    fn sms_sender(result: std::result::Result<DeliveryReceipt, ProviderError>) -> MockChannelSender {
        let mut sender = MockChannelSender::new();
        sender.expect_channel().return_const(Channel::Sms);
        sender
            .expect_send()
            .returning(move |_, _| result.clone());
        sender
    }

    fn leased(n: &Notification, attempt: u32) -> LeasedJob {
        LeasedJob {
            job: DispatchJob {
                notification_id: n.id,
                client_id: n.client_id,
                channel: n.channel,
                recipient: n.recipient.clone(),
                content: n.content.clone(),
                attempt,
            },
            options: JobOptions::default(),
            lease_token: new_lease_token(),
        }
    }

    /// 每次发送耗时固定的发送器
    struct SlowSender {
        delay: Duration,
        calls: AtomicUsize,
    }

    impl SlowSender {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChannelSender for SlowSender {
        fn channel(&self) -> Channel {
            Channel::Sms
        }

        async fn send(
            &self,
            _recipient: &Recipient,
            _content: &Content,
        ) -> std::result::Result<DeliveryReceipt, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(DeliveryReceipt::delivered("SM-slow"))
        }
    }

    struct Fixture {
        store: Arc<InMemoryNotificationRepository>,
        clients: Arc<InMemoryClientRepository>,
        queue: Arc<InMemoryDispatchQueue>,
        client: Client,
        notification: Notification,
    }

    async fn fixture(status: NotificationStatus) -> Fixture {
        let store = Arc::new(InMemoryNotificationRepository::new());
        let clients = Arc::new(InMemoryClientRepository::new());
        let client = Client::new("Acme", "ops@acme.com", "hash");
        clients.create(&client).await.unwrap();

        let mut notification = Notification::new(
            client.id,
            Channel::Sms,
            Recipient::phone("+14155550100"),
            Content::body("code 1234"),
        );
        notification.status = status;
        store.create(&notification).await.unwrap();

        Fixture {
            store,
            clients,
            queue: Arc::new(InMemoryDispatchQueue::default()),
            client,
            notification,
        }
    }

    fn pool(f: &Fixture, sender: MockChannelSender) -> WorkerPool {
        WorkerPool::new(
            Arc::new(sender),
            f.store.clone(),
            f.clients.clone(),
            f.queue.clone(),
            WorkerPoolConfig::new(2, 1000, 60),
        )
    }

    #[tokio::test]
    async fn test_success_marks_sent_and_counts_once() {
        let f = fixture(NotificationStatus::Processing).await;
        let pool = pool(&f, sms_sender(Ok(DeliveryReceipt::delivered("SM1"))));

        let outcome = pool.process_job(&leased(&f.notification, 1)).await;
        assert_eq!(outcome, JobOutcome::Completed);

        let n = f.store.get(f.notification.id).await.unwrap().unwrap();
        assert_eq!(n.status, NotificationStatus::Sent);
        assert!(n.sent_at.is_some());

        // 重复任务被跳过，计数不变
        let outcome = pool.process_job(&leased(&f.notification, 1)).await;
        assert_eq!(outcome, JobOutcome::Skipped);

        let client = f.clients.get(f.client.id).await.unwrap().unwrap();
        assert_eq!(client.usage_stats.sms_sent, 1);
    }

    #[tokio::test]
    async fn test_channel_mismatch_leaves_store_untouched() {
        let mut sender = MockChannelSender::new();
        sender.expect_channel().return_const(Channel::Email);
        sender.expect_send().never();

        let mut store = MockNotificationRepository::new();
        store.expect_begin_attempt().never();

        let pool = WorkerPool::new(
            Arc::new(sender),
            Arc::new(store),
            Arc::new(MockClientRepository::new()),
            Arc::new(InMemoryDispatchQueue::default()),
            WorkerPoolConfig::new(1, 10, 60),
        );

        let n = Notification::new(
            Uuid::now_v7(),
            Channel::Sms,
            Recipient::phone("+14155550100"),
            Content::body("hi"),
        );
        assert_eq!(pool.process_job(&leased(&n, 1)).await, JobOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_transient_failure_marks_failed_and_is_retryable() {
        let f = fixture(NotificationStatus::Processing).await;
        let pool = pool(
            &f,
            sms_sender(Err(ProviderError::transient("twilio", "HTTP 503"))),
        );

        let outcome = pool.process_job(&leased(&f.notification, 1)).await;
        assert!(matches!(outcome, JobOutcome::RetryableFailure(_)));

        let n = f.store.get(f.notification.id).await.unwrap().unwrap();
        assert_eq!(n.status, NotificationStatus::Failed);
        assert_eq!(n.retry_count, 1);
        assert!(n.error_message.unwrap().contains("HTTP 503"));
    }

    #[tokio::test]
    async fn test_retry_attempt_resumes_from_failed() {
        let f = fixture(NotificationStatus::Processing).await;
        f.store.mark_failed(f.notification.id, "HTTP 503").await.unwrap();

        let pool = pool(&f, sms_sender(Ok(DeliveryReceipt::delivered("SM2"))));
        let outcome = pool.process_job(&leased(&f.notification, 2)).await;
        assert_eq!(outcome, JobOutcome::Completed);

        let n = f.store.get(f.notification.id).await.unwrap().unwrap();
        assert_eq!(n.status, NotificationStatus::Sent);
        assert_eq!(n.retry_count, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure() {
        let f = fixture(NotificationStatus::Processing).await;
        let pool = pool(
            &f,
            sms_sender(Err(ProviderError::permanent("twilio", "HTTP 400: invalid number"))),
        );

        let outcome = pool.process_job(&leased(&f.notification, 1)).await;
        assert!(matches!(outcome, JobOutcome::PermanentFailure(_)));
    }

    #[tokio::test]
    async fn test_counter_failure_after_sent_is_not_retried() {
        let f = fixture(NotificationStatus::Processing).await;

        let mut clients = MockClientRepository::new();
        clients
            .expect_increment_usage()
            .times(1)
            .returning(|_, _| Err(NotifyError::Database(sqlx::Error::PoolTimedOut)));

        let pool = WorkerPool::new(
            Arc::new(sms_sender(Ok(DeliveryReceipt::delivered("SM3")))),
            f.store.clone(),
            Arc::new(clients),
            f.queue.clone(),
            WorkerPoolConfig::new(1, 10, 60),
        );

        let outcome = pool.process_job(&leased(&f.notification, 1)).await;
        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(
            f.store.get(f.notification.id).await.unwrap().unwrap().status,
            NotificationStatus::Sent
        );
    }

    #[tokio::test]
    async fn test_store_error_is_retryable() {
        let mut store = MockNotificationRepository::new();
        store
            .expect_begin_attempt()
            .returning(|_, _| Err(NotifyError::Database(sqlx::Error::PoolTimedOut)));

        let mut sender = MockChannelSender::new();
        sender.expect_channel().return_const(Channel::Sms);
        sender.expect_send().never();

        let pool = WorkerPool::new(
            Arc::new(sender),
            Arc::new(store),
            Arc::new(MockClientRepository::new()),
            Arc::new(InMemoryDispatchQueue::default()),
            WorkerPoolConfig::new(1, 10, 60),
        );
        let n = Notification::new(
            Uuid::now_v7(),
            Channel::Sms,
            Recipient::phone("+14155550100"),
            Content::body("hi"),
        );

        assert!(matches!(
            pool.process_job(&leased(&n, 1)).await,
            JobOutcome::RetryableFailure(_)
        ));
    }

    #[tokio::test]
    async fn test_mark_sent_store_error_is_retryable() {
        let mut store = MockNotificationRepository::new();
        store
            .expect_begin_attempt()
            .returning(|_, _| Ok(AttemptStart::Started { retry_count: 0 }));
        store
            .expect_mark_sent()
            .returning(|_, _| Err(NotifyError::Database(sqlx::Error::PoolTimedOut)));

        let mut clients = MockClientRepository::new();
        clients.expect_increment_usage().never();

        let pool = WorkerPool::new(
            Arc::new(sms_sender(Ok(DeliveryReceipt::delivered("SM4")))),
            Arc::new(store),
            Arc::new(clients),
            Arc::new(InMemoryDispatchQueue::default()),
            WorkerPoolConfig::new(1, 10, 60),
        );
        let n = Notification::new(
            Uuid::now_v7(),
            Channel::Sms,
            Recipient::phone("+14155550100"),
            Content::body("hi"),
        );

        assert!(matches!(
            pool.process_job(&leased(&n, 1)).await,
            JobOutcome::RetryableFailure(_)
        ));
    }

    #[tokio::test]
    async fn test_handle_maps_outcomes_to_queue() {
        let f = fixture(NotificationStatus::Processing).await;
        f.queue
            .enqueue(leased(&f.notification, 1).job, JobOptions::default())
            .await
            .unwrap();
        let pool = pool(
            &f,
            sms_sender(Err(ProviderError::permanent("msg91", "invalid route"))),
        );

        let job = f.queue.lease(Channel::Sms).await.unwrap().unwrap();
        let outcome = pool.handle(job).await.unwrap();

        assert!(matches!(outcome, JobOutcome::PermanentFailure(_)));
        assert_eq!(f.queue.failed_ids(), vec![f.notification.id.to_string()]);
        assert_eq!(f.queue.delayed_len(), 0);
    }

    #[tokio::test]
    async fn test_handle_schedules_retry() {
        let f = fixture(NotificationStatus::Processing).await;
        f.queue
            .enqueue(leased(&f.notification, 1).job, JobOptions::default())
            .await
            .unwrap();
        let pool = pool(
            &f,
            sms_sender(Err(ProviderError::transient("twilio", "timeout"))),
        );

        let job = f.queue.lease(Channel::Sms).await.unwrap().unwrap();
        pool.handle(job).await.unwrap();

        assert_eq!(f.queue.delayed_len(), 1);
        assert!(f.queue.failed_ids().is_empty());
        assert_eq!(f.queue.job(&f.notification.id.to_string()).unwrap().attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_queue_and_stops_on_shutdown() {
        let f = fixture(NotificationStatus::Processing).await;
        f.queue
            .enqueue(leased(&f.notification, 1).job, JobOptions::default())
            .await
            .unwrap();

        let pool = Arc::new(
            pool(&f, sms_sender(Ok(DeliveryReceipt::delivered("SM5"))))
                .with_poll_interval(Duration::from_millis(50)),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(pool.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.queue.completed_ids(), vec![f.notification.id.to_string()]);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_send_renews_lease_and_is_sent_once() {
        let f = fixture(NotificationStatus::Processing).await;
        let queue = Arc::new(InMemoryDispatchQueue::new(&QueueConfig {
            lease_timeout_secs: 30,
            ..Default::default()
        }));
        queue
            .enqueue(leased(&f.notification, 1).job, JobOptions::default())
            .await
            .unwrap();

        let sender = Arc::new(SlowSender::new(Duration::from_secs(31)));
        let pool = Arc::new(
            WorkerPool::new(
                sender.clone(),
                f.store.clone(),
                f.clients.clone(),
                queue.clone(),
                WorkerPoolConfig::new(2, 1000, 60),
            )
            .with_poll_interval(Duration::from_millis(50)),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(pool.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(sender.calls(), 1);
        assert_eq!(queue.completed_ids(), vec![f.notification.id.to_string()]);
        assert_eq!(queue.active_len(), 0);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_after_lease_lost_does_not_touch_new_holder() {
        let f = fixture(NotificationStatus::Processing).await;
        f.queue
            .enqueue(leased(&f.notification, 1).job, JobOptions::default())
            .await
            .unwrap();
        let pool = pool(&f, sms_sender(Ok(DeliveryReceipt::delivered("SM6"))));

        let stale = f.queue.lease(Channel::Sms).await.unwrap().unwrap();
        tokio::time::advance(f.queue.lease_timeout()).await;
        let current = f.queue.lease(Channel::Sms).await.unwrap().unwrap();
        assert_ne!(stale.lease_token, current.lease_token);

        assert_eq!(pool.handle(stale).await.unwrap(), JobOutcome::Completed);
        assert!(f.queue.completed_ids().is_empty());
        assert_eq!(f.queue.active_len(), 1);

        assert!(f.queue.complete(&current).await.unwrap());
        assert_eq!(f.queue.completed_ids(), vec![f.notification.id.to_string()]);
    }

    #[tokio::test]
    async fn test_exhausted_job_settles_notification_left_processing() {
        let mut store = MockNotificationRepository::new();
        store
            .expect_begin_attempt()
            .returning(|_, _| Err(NotifyError::Database(sqlx::Error::PoolTimedOut)));
        store
            .expect_mark_failed()
            .withf(|_, error| error.contains("status store error"))
            .times(1)
            .returning(|_, _| Ok(Some(1)));

        let mut sender = MockChannelSender::new();
        sender.expect_channel().return_const(Channel::Sms);
        sender.expect_send().never();

        let queue = Arc::new(InMemoryDispatchQueue::default());
        let pool = WorkerPool::new(
            Arc::new(sender),
            Arc::new(store),
            Arc::new(MockClientRepository::new()),
            queue.clone(),
            WorkerPoolConfig::new(1, 10, 60),
        );

        let n = Notification::new(
            Uuid::now_v7(),
            Channel::Sms,
            Recipient::phone("+14155550100"),
            Content::body("hi"),
        );
        let options = JobOptions::from_config(&QueueConfig {
            max_attempts: 1,
            ..Default::default()
        });
        queue.enqueue(leased(&n, 1).job, options).await.unwrap();

        let job = queue.lease(Channel::Sms).await.unwrap().unwrap();
        let outcome = pool.handle(job).await.unwrap();

        assert!(matches!(outcome, JobOutcome::RetryableFailure(_)));
        assert_eq!(queue.failed_ids(), vec![n.id.to_string()]);
    }

    #[test]
    fn test_rate_limiter_admits_at_most_quota_per_window() {
        let clock = FakeRelativeClock::default();
        let limiter = RateLimiter::direct_with_clock(rate_quota(&WorkerPoolConfig::new(1, 3, 1)), &clock);

        let step = Duration::from_millis(5);
        let mut admitted: Vec<Duration> = Vec::new();
        let mut elapsed = Duration::ZERO;
        while elapsed < Duration::from_secs(3) {
            if limiter.check().is_ok() {
                admitted.push(elapsed);
            }
            clock.advance(step);
            elapsed += step;
        }

        let window = Duration::from_secs(1);
        assert_eq!(admitted.iter().filter(|at| **at < window).count(), 3);
        for start in &admitted {
            let in_window = admitted
                .iter()
                .filter(|at| **at >= *start && **at < *start + window)
                .count();
            assert!(in_window <= 3, "窗口 {start:?} 内放行了 {in_window} 个");
        }
        assert_eq!(admitted.len(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_slot_spaces_jobs_evenly() {
        let limiter = rate_limiter(&WorkerPoolConfig::new(1, 3, 3));
        let started = tokio::time::Instant::now();

        for _ in 0..4 {
            acquire_slot(&limiter).await;
        }

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(4), "{elapsed:?}");
    }
}
