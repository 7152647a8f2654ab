//! 退避策略
//!
//! 分发队列的任务重试、Kafka 消息重新处理都基于同一个指数退避模型：
//! 第 n 次重试等待 `initial_delay * multiplier^(n-1)`，不超过 `max_delay`。

use std::time::Duration;

/// 重试策略配置
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 最大投递次数（含首次执行）
    pub max_attempts: u32,
    /// 首次重试前的等待时间
    pub initial_delay: Duration,
    /// 退避时间上限
    pub max_delay: Duration,
    /// 每次重试的退避倍数
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 分发任务默认策略：共 3 次投递，2s 起步指数翻倍（2s、4s、8s...）
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 指数退避，`base_delay * 2^(n-1)`
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: base_delay,
            ..Self::default()
        }
    }

    /// Kafka 消息重新处理策略：不限次数，300ms 起步，封顶 30s
    pub fn redelivery() -> Self {
        Self {
            max_attempts: u32::MAX,
            initial_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    /// 计算第 N 次退避的等待时间（attempt 从 0 开始）
    ///
    /// 公式: initial_delay * multiplier^attempt，结果不超过 max_delay。
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = base_ms * self.multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// 第 `attempts_made` 次投递失败后到下一次投递之间的等待时间
    ///
    /// attempts_made 从 1 开始：第 1 次失败等 2s，第 2 次失败等 4s。
    pub fn backoff_after(&self, attempts_made: u32) -> Duration {
        self.delay_for_attempt(attempts_made.saturating_sub(1))
    }

    /// 已投递 attempts_made 次后是否还能再投递
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
