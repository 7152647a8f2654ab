//! 内存分发队列
//!
//! 与 Redis 实现语义一致的进程内队列，用于测试和本地运行。
//! 时间取自 `tokio::time::Instant`，测试中可以用暂停时钟验证退避间隔。

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use notify_shared::config::QueueConfig;
use notify_shared::error::Result;
use notify_shared::events::Channel;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{
    DispatchJob, DispatchQueue, FailDisposition, JobOptions, LeasedJob, Retention, StoredJob,
    new_lease_token,
};

struct ActiveLease {
    deadline: Instant,
    token: String,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, StoredJob>,
    waiting: HashMap<Channel, VecDeque<String>>,
    /// (可执行时间, 任务 id)
    delayed: Vec<(Instant, String)>,
    active: HashMap<String, ActiveLease>,
    completed: VecDeque<(Instant, String)>,
    failed: VecDeque<(Instant, String)>,
}

impl QueueState {
    fn channel_of(&self, id: &str) -> Option<Channel> {
        self.jobs.get(id).map(|j| j.job.channel)
    }

    fn holds_lease(&self, job: &LeasedJob) -> bool {
        self.active
            .get(&job.id())
            .is_some_and(|lease| lease.token == job.lease_token)
    }

    /// 到期的延迟任务和租约超时的任务回到等待队列
    fn promote(&mut self, channel: Channel, now: Instant) {
        let mut due: Vec<(Instant, String)> = Vec::new();
        let mut i = 0;
        while i < self.delayed.len() {
            let (at, id) = &self.delayed[i];
            if *at <= now && self.channel_of(id) == Some(channel) {
                due.push(self.delayed.swap_remove(i));
            } else {
                i += 1;
            }
        }
        due.sort_by_key(|(at, _)| *at);

        let expired: Vec<String> = self
            .active
            .iter()
            .filter(|(id, lease)| lease.deadline <= now && self.channel_of(id) == Some(channel))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.active.remove(id);
            debug!(job_id = %id, "租约超时，任务重新入队");
        }

        let queue = self.waiting.entry(channel).or_default();
        queue.extend(due.into_iter().map(|(_, id)| id));
        queue.extend(expired);
    }

    fn prune_completed(&mut self, retention: &Retention, now: Instant) {
        while let Some((at, _)) = self.completed.front() {
            let too_old = now.saturating_duration_since(*at) > retention.completed_age;
            if !too_old && self.completed.len() <= retention.completed_count {
                break;
            }
            if let Some((_, id)) = self.completed.pop_front() {
                self.jobs.remove(&id);
            }
        }
    }

    fn prune_failed(&mut self, retention: &Retention, now: Instant) {
        while let Some((at, _)) = self.failed.front() {
            if now.saturating_duration_since(*at) <= retention.failed_age {
                break;
            }
            if let Some((_, id)) = self.failed.pop_front() {
                self.jobs.remove(&id);
            }
        }
    }

    fn move_to_failed(&mut self, id: &str, error: &str, retention: &Retention, now: Instant) {
        self.active.remove(id);
        if let Some(stored) = self.jobs.get_mut(id) {
            stored.last_error = Some(error.to_string());
        }
        self.failed.retain(|(_, existing)| existing != id);
        self.failed.push_back((now, id.to_string()));
        self.prune_failed(retention, now);
    }
}

/// 进程内分发队列
pub struct InMemoryDispatchQueue {
    state: Mutex<QueueState>,
    lease_timeout: Duration,
    retention: Retention,
}

impl Default for InMemoryDispatchQueue {
    fn default() -> Self {
        Self::new(&QueueConfig::default())
    }
}

impl InMemoryDispatchQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            lease_timeout: config.lease_timeout(),
            retention: Retention::from_config(config),
        }
    }

    // ==================== 观测接口 ====================

    pub fn waiting_len(&self, channel: Channel) -> usize {
        self.state.lock().waiting.get(&channel).map_or(0, VecDeque::len)
    }

    pub fn delayed_len(&self) -> usize {
        self.state.lock().delayed.len()
    }

    pub fn active_len(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn completed_ids(&self) -> Vec<String> {
        self.state.lock().completed.iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn failed_ids(&self) -> Vec<String> {
        self.state.lock().failed.iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn job(&self, id: &str) -> Option<DispatchJob> {
        self.state.lock().jobs.get(id).map(|s| s.job.clone())
    }

    pub fn last_error(&self, id: &str) -> Option<String> {
        self.state.lock().jobs.get(id).and_then(|s| s.last_error.clone())
    }
}

#[async_trait]
impl DispatchQueue for InMemoryDispatchQueue {
    async fn enqueue(&self, job: DispatchJob, options: JobOptions) -> Result<bool> {
        let id = job.job_id();
        let channel = job.channel;
        let mut state = self.state.lock();

        if state.jobs.contains_key(&id) {
            return Ok(false);
        }
        state.jobs.insert(id.clone(), StoredJob::new(job, &options));
        state.waiting.entry(channel).or_default().push_back(id);
        Ok(true)
    }

    async fn lease(&self, channel: Channel) -> Result<Option<LeasedJob>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.promote(channel, now);

        while let Some(id) = state.waiting.get_mut(&channel).and_then(VecDeque::pop_front) {
            let Some(stored) = state.jobs.get(&id).cloned() else {
                continue;
            };
            let token = new_lease_token();
            state.active.insert(
                id,
                ActiveLease {
                    deadline: now + self.lease_timeout,
                    token: token.clone(),
                },
            );
            return Ok(Some(stored.into_leased(token)));
        }
        Ok(None)
    }

    fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    async fn extend_lease(&self, job: &LeasedJob) -> Result<bool> {
        let deadline = Instant::now() + self.lease_timeout;
        let mut state = self.state.lock();
        match state.active.get_mut(&job.id()) {
            Some(lease) if lease.token == job.lease_token => {
                lease.deadline = deadline;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, job: &LeasedJob) -> Result<bool> {
        let id = job.id();
        let now = Instant::now();
        let mut state = self.state.lock();

        if !state.holds_lease(job) {
            return Ok(false);
        }
        state.active.remove(&id);
        if !state.jobs.contains_key(&id) {
            return Ok(true);
        }
        state.completed.retain(|(_, existing)| *existing != id);
        state.completed.push_back((now, id));
        state.prune_completed(&self.retention, now);
        Ok(true)
    }

    async fn retry_or_fail(&self, job: &LeasedJob, error: &str) -> Result<FailDisposition> {
        let id = job.id();
        let now = Instant::now();
        let disposition = job.next_disposition();
        let mut state = self.state.lock();

        if !state.holds_lease(job) {
            return Ok(FailDisposition::LeaseLost);
        }

        match disposition {
            FailDisposition::Retrying { attempt, delay } => {
                state.active.remove(&id);
                if let Some(stored) = state.jobs.get_mut(&id) {
                    stored.job.attempt = attempt;
                    stored.last_error = Some(error.to_string());
                }
                state.delayed.push((now + delay, id));
            }
            FailDisposition::Exhausted => {
                state.move_to_failed(&id, error, &self.retention, now);
            }
            FailDisposition::LeaseLost => {}
        }
        Ok(disposition)
    }

    async fn fail(&self, job: &LeasedJob, error: &str) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if !state.holds_lease(job) {
            return Ok(false);
        }
        state.move_to_failed(&job.id(), error, &self.retention, now);
        Ok(true)
    }
}
