// ==========================================
// 智能工厂MES - 失败事件重试队列
// ==========================================
// 职责: 暂存发布/解码失败的事件，供定时扫描重试
// 语义: 近似 FIFO（到期条目间允许重排），条目不丢失、不静默复制
// ==========================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// 失败事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEvent {
    /// 事件类型
    pub event_type: String,
    /// 序列化后的原始消息
    pub message: String,
    /// 最近一次失败原因
    pub exception: String,
    /// 首次失败时间
    pub failed_at: DateTime<Utc>,
    /// 已重试次数
    pub retry_count: u32,
    /// 下次重试时间
    pub next_retry_at: DateTime<Utc>,
}

impl FailedEvent {
    /// 创建新的失败事件（retry_count = 0）
    pub fn new(
        event_type: impl Into<String>,
        message: String,
        exception: String,
        retry_interval: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            event_type: event_type.into(),
            message,
            exception,
            failed_at: now,
            retry_count: 0,
            next_retry_at: now + retry_interval,
        }
    }

    /// 创建已耗尽重试额度的失败事件
    ///
    /// 用于解码失败等重放无意义的场景：入队后由扫描直接转入死信，
    /// 避免毒消息在队列中无限循环。
    pub fn exhausted_now(
        event_type: impl Into<String>,
        message: String,
        exception: String,
        max_retry_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            event_type: event_type.into(),
            message,
            exception,
            failed_at: now,
            retry_count: max_retry_attempts,
            next_retry_at: now,
        }
    }

    /// 重试失败后重新排期
    pub fn reschedule(&mut self, retry_interval: chrono::Duration) {
        self.retry_count += 1;
        self.next_retry_at = Utc::now() + retry_interval;
    }

    /// 是否已耗尽重试额度
    pub fn exhausted(&self, max_retry_attempts: u32) -> bool {
        self.retry_count >= max_retry_attempts
    }
}

/// 重试队列
#[derive(Default)]
pub struct RetryQueue {
    queue: Mutex<VecDeque<FailedEvent>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队
    pub fn enqueue(&self, failed: FailedEvent) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(failed);
    }

    /// 取出到期条目（最多 limit 条），未到期条目保留在队列中
    pub fn take_due(&self, now: DateTime<Utc>, limit: usize) -> Vec<FailedEvent> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());

        let mut due = Vec::new();
        let mut rest = VecDeque::with_capacity(queue.len());
        while let Some(item) = queue.pop_front() {
            if due.len() < limit && item.next_retry_at <= now {
                due.push(item);
            } else {
                rest.push_back(item);
            }
        }
        *queue = rest;
        due
    }

    /// 队列深度
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
