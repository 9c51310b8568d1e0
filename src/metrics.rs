// ==========================================
// 智能工厂MES - 事件指标采集
// ==========================================
// 职责: 按 (事件类型, 动作) 维度的单调计数器、
//       分钟级时间桶、各处理阶段的延迟样本
// 消费方: 外部驾驶舱/看板（仅读快照）
// ==========================================

use crate::domain::BusAction;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// 指标键格式: "{event_type}:{action}"
fn counter_key(event_type: &str, action: BusAction) -> String {
    format!("{}:{}", event_type, action.as_str())
}

/// 事件指标采集器
///
/// 全部为内存态，进程重启即归零；历史回溯走事件存储。
pub struct EventMetrics {
    /// 单调计数器
    counters: DashMap<String, AtomicU64>,
    /// 分钟桶时间线: 键 → (分钟时间戳 → 次数)
    timeline: DashMap<String, Mutex<BTreeMap<i64, u64>>>,
    /// 各阶段延迟样本（毫秒），有界保留最近 N 条
    latencies: DashMap<String, Mutex<VecDeque<u64>>>,
    /// 系统量规（重试队列深度、活跃订阅数等）
    gauges: DashMap<String, AtomicU64>,
    latency_capacity: usize,
}

impl EventMetrics {
    pub fn new(latency_capacity: usize) -> Self {
        Self {
            counters: DashMap::new(),
            timeline: DashMap::new(),
            latencies: DashMap::new(),
            gauges: DashMap::new(),
            latency_capacity: latency_capacity.max(1),
        }
    }

    /// 记录一次事件动作（计数器 + 时间桶）
    pub fn record(&self, event_type: &str, action: BusAction) {
        let key = counter_key(event_type, action);

        self.counters
            .entry(key.clone())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);

        let bucket = Utc::now().timestamp() / 60;
        let entry = self.timeline.entry(key).or_insert_with(|| Mutex::new(BTreeMap::new()));
        let mut buckets = entry.lock().unwrap_or_else(|e| e.into_inner());
        *buckets.entry(bucket).or_insert(0) += 1;
    }

    /// 读取计数器当前值
    pub fn counter(&self, event_type: &str, action: BusAction) -> u64 {
        self.counters
            .get(&counter_key(event_type, action))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// 统计某时刻之后的事件次数（按分钟桶）
    pub fn count_since(&self, event_type: &str, action: BusAction, since: DateTime<Utc>) -> u64 {
        let since_bucket = since.timestamp() / 60;
        self.timeline
            .get(&counter_key(event_type, action))
            .map(|entry| {
                let buckets = entry.lock().unwrap_or_else(|e| e.into_inner());
                buckets.range(since_bucket..).map(|(_, n)| *n).sum()
            })
            .unwrap_or(0)
    }

    /// 记录一次阶段延迟样本（毫秒）
    pub fn record_latency(&self, stage: &str, elapsed_ms: u64) {
        let entry = self
            .latencies
            .entry(stage.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut samples = entry.lock().unwrap_or_else(|e| e.into_inner());
        if samples.len() >= self.latency_capacity {
            samples.pop_front();
        }
        samples.push_back(elapsed_ms);
    }

    /// 某阶段延迟样本快照
    pub fn latency_samples(&self, stage: &str) -> Vec<u64> {
        self.latencies
            .get(stage)
            .map(|entry| {
                let samples = entry.lock().unwrap_or_else(|e| e.into_inner());
                samples.iter().copied().collect()
            })
            .unwrap_or_default()
    }

    /// 设置量规值
    pub fn set_gauge(&self, name: &str, value: u64) {
        self.gauges
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(value, Ordering::Relaxed);
    }

    /// 读取量规值
    pub fn gauge(&self, name: &str) -> u64 {
        self.gauges
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// 全量计数器快照（供看板拉取）
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        let gauges = self
            .gauges
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        MetricsSnapshot {
            taken_at: Utc::now(),
            counters,
            gauges,
        }
    }
}

/// 指标快照
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, u64>,
}

/// 阶段计时 Guard：Drop 时记录延迟样本并输出结构化日志
///
/// 使用方式：
/// ```ignore
/// let _timer = StageTimer::new(metrics.clone(), "dispatch");
/// // do work...
/// ```
pub struct StageTimer {
    metrics: Arc<EventMetrics>,
    stage: &'static str,
    start: Instant,
}

impl StageTimer {
    pub fn new(metrics: Arc<EventMetrics>, stage: &'static str) -> Self {
        Self {
            metrics,
            stage,
            start: Instant::now(),
        }
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        let elapsed_ms = self.start.elapsed().as_millis() as u64;
        self.metrics.record_latency(self.stage, elapsed_ms);
        tracing::debug!(
            target: "perf",
            stage = self.stage,
            elapsed_ms,
            "done"
        );
    }
}
