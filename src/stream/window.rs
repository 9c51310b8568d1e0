// ==========================================
// 智能工厂MES - 参数滑动窗口
// ==========================================
// 职责: 按 (工序, 参数) 键维护时间窗口内的样本序列，
//       在线统计与 Z-score 异常检测
// 不变式: 窗口内所有样本满足 timestamp >= now - window_size；
//         过期样本在每次写入时惰性清理，另有定时淘汰扫描
// 并发: 每窗口独立互斥锁，绝不使用全局锁——
//       不同参数的写入互不阻塞
// ==========================================

use crate::domain::{AggregatedData, ParameterValue};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// 窗口键: (工序, 参数名)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub process_id: String,
    pub parameter_name: String,
}

impl WindowKey {
    pub fn new(process_id: impl Into<String>, parameter_name: impl Into<String>) -> Self {
        Self {
            process_id: process_id.into(),
            parameter_name: parameter_name.into(),
        }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.process_id, self.parameter_name)
    }
}

/// 异常信号
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalySignal {
    pub value: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub z_score: f64,
}

/// 参数滑动窗口
#[derive(Debug)]
pub struct ParameterWindow {
    pub window_start_time: DateTime<Utc>,
    values: Vec<ParameterValue>,
}

impl ParameterWindow {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            window_start_time: now,
            values: Vec::new(),
        }
    }

    /// 清理窗口长度之外的过期样本
    pub fn purge(&mut self, window_size: chrono::Duration, now: DateTime<Utc>) {
        let cutoff = now - window_size;
        self.values.retain(|v| v.timestamp >= cutoff);
    }

    /// 追加样本（调用方保证已先 purge）
    pub fn append(&mut self, value: ParameterValue) {
        self.values.push(value);
    }

    /// 对新到样本做 Z-score 异常检测
    ///
    /// 基线为窗口内最近 sample_count 条既有样本（不含新到样本）；
    /// 样本不足时跳过本次检测。常量序列（标准差为 0）不产生信号，
    /// 避免除零传播 NaN/∞。
    pub fn detect_anomaly(
        &self,
        incoming_value: f64,
        sample_count: usize,
        threshold: f64,
    ) -> Option<AnomalySignal> {
        if sample_count == 0 || self.values.len() < sample_count {
            return None;
        }

        let recent: Vec<f64> = self.values[self.values.len() - sample_count..]
            .iter()
            .map(|v| v.value)
            .collect();
        let mean = recent.iter().sum::<f64>() / recent.len() as f64;
        let std_dev = sample_std_dev(&recent, mean);
        if std_dev <= f64::EPSILON {
            return None;
        }

        let z_score = (incoming_value - mean).abs() / std_dev;
        if z_score > threshold {
            Some(AnomalySignal {
                value: incoming_value,
                mean,
                std_dev,
                z_score,
            })
        } else {
            None
        }
    }

    /// 聚合窗口当前内容（空窗口返回 None，不产出事件）
    ///
    /// 窗口为滚动视图，聚合不清空内容。
    pub fn aggregate(&self, key: &WindowKey, now: DateTime<Utc>) -> Option<AggregatedData> {
        if self.values.is_empty() {
            return None;
        }

        let count = self.values.len();
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut qualified_count = 0usize;
        for v in &self.values {
            min = min.min(v.value);
            max = max.max(v.value);
            sum += v.value;
            if v.is_qualified {
                qualified_count += 1;
            }
        }
        let mean = sum / count as f64;
        let raw: Vec<f64> = self.values.iter().map(|v| v.value).collect();
        let std_dev = sample_std_dev(&raw, mean);
        // 合格率: 百分比保留两位小数
        let qualification_rate =
            (qualified_count as f64 / count as f64 * 100.0 * 100.0).round() / 100.0;

        Some(AggregatedData {
            process_id: key.process_id.clone(),
            parameter_name: key.parameter_name.clone(),
            count,
            min,
            max,
            mean,
            std_dev,
            qualified_count,
            qualification_rate,
            window_start: self
                .values
                .first()
                .map(|v| v.timestamp)
                .unwrap_or(self.window_start_time),
            window_end: now,
        })
    }

    /// 最近一条样本的时间（空窗口为 None）
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.values.last().map(|v| v.timestamp)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[ParameterValue] {
        &self.values
    }
}

/// 样本标准差（n-1 分母；样本数不足 2 时为 0）
fn sample_std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let variance = values
        .iter()
        .map(|v| (v - mean) * (v - mean))
        .sum::<f64>()
        / (values.len() - 1) as f64;
    variance.sqrt()
}

/// 窗口表
///
/// 窗口按需创建，支持并发插入；淘汰扫描清除空闲窗口。
#[derive(Default)]
pub struct WindowMap {
    windows: DashMap<WindowKey, Arc<Mutex<ParameterWindow>>>,
}

impl WindowMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取得（或创建）键对应的窗口
    pub fn get_or_create(&self, key: &WindowKey, now: DateTime<Utc>) -> Arc<Mutex<ParameterWindow>> {
        self.windows
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::debug!("参数窗口已创建: key={}", key);
                Arc::new(Mutex::new(ParameterWindow::new(now)))
            })
            .clone()
    }

    /// 活跃窗口快照（供聚合遍历）
    pub fn snapshot(&self) -> Vec<(WindowKey, Arc<Mutex<ParameterWindow>>)> {
        self.windows
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// 淘汰空闲窗口，返回淘汰数量
    ///
    /// 空闲判定: 最近样本时间（无样本时取窗口创建时间）早于 now - idle_timeout。
    pub fn evict_idle(&self, idle_timeout: chrono::Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - idle_timeout;
        let before = self.windows.len();
        self.windows.retain(|key, window| {
            let window = window.lock().unwrap_or_else(|e| e.into_inner());
            let last_active = window.last_timestamp().unwrap_or(window.window_start_time);
            let keep = last_active >= cutoff;
            if !keep {
                tracing::info!("参数窗口已淘汰(空闲超时): key={}", key);
            }
            keep
        });
        before - self.windows.len()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_at(value: f64, offset_minutes: i64, qualified: bool) -> ParameterValue {
        ParameterValue {
            value,
            timestamp: Utc::now() + chrono::Duration::minutes(offset_minutes),
            is_qualified: qualified,
            equipment_code: None,
            batch_number: None,
        }
    }

    #[test]
    fn test_purge_drops_expired_entries() {
        let now = Utc::now();
        let mut window = ParameterWindow::new(now);
        window.append(value_at(1.0, -15, true));
        window.append(value_at(2.0, -9, true));
        window.append(value_at(3.0, -1, true));

        window.purge(chrono::Duration::minutes(10), now);
        window.append(value_at(4.0, 0, true));

        assert_eq!(window.len(), 3);
        let values: Vec<f64> = window.values().iter().map(|v| v.value).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_anomaly_detection_triggers_above_threshold() {
        let now = Utc::now();
        let mut window = ParameterWindow::new(now);
        // 均值 100、样本标准差约 5.27 的 10 条基线
        for v in [95.0, 105.0, 95.0, 105.0, 95.0, 105.0, 95.0, 105.0, 95.0, 105.0] {
            window.append(value_at(v, -1, true));
        }

        let signal = window.detect_anomaly(115.0, 10, 2.0);
        let signal = signal.expect("偏离近 3 个标准差应触发异常");
        assert!((signal.mean - 100.0).abs() < 1e-9);
        assert!((signal.std_dev - (250.0f64 / 9.0).sqrt()).abs() < 1e-9);
        assert!(signal.z_score > 2.0);

        // z 远小于阈值的正常样本
        assert!(window.detect_anomaly(102.0, 10, 2.0).is_none());
    }

    #[test]
    fn test_anomaly_detection_skipped_with_few_samples() {
        let now = Utc::now();
        let mut window = ParameterWindow::new(now);
        for v in [100.0, 101.0, 99.0] {
            window.append(value_at(v, -1, true));
        }

        // 样本不足 10 条，跳过检测
        assert!(window.detect_anomaly(500.0, 10, 2.0).is_none());
    }

    #[test]
    fn test_constant_series_never_flags() {
        let now = Utc::now();
        let mut window = ParameterWindow::new(now);
        for _ in 0..10 {
            window.append(value_at(5.0, -1, true));
        }

        // 标准差为 0: 无论新值多离谱都不产生信号，也不得 panic
        assert!(window.detect_anomaly(5.0, 10, 2.0).is_none());
        assert!(window.detect_anomaly(1e9, 10, 2.0).is_none());
    }

    #[test]
    fn test_aggregate_statistics() {
        let now = Utc::now();
        let key = WindowKey::new("P1", "temp");
        let mut window = ParameterWindow::new(now);
        window.append(value_at(10.0, -3, true));
        window.append(value_at(20.0, -2, true));
        window.append(value_at(30.0, -1, false));

        let data = window.aggregate(&key, now).unwrap();
        assert_eq!(data.count, 3);
        assert_eq!(data.min, 10.0);
        assert_eq!(data.max, 30.0);
        assert_eq!(data.mean, 20.0);
        assert_eq!(data.qualified_count, 2);
        assert_eq!(data.qualification_rate, 66.67);
        assert!((data.std_dev - 10.0).abs() < 1e-9);
        // 聚合不清空窗口
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_aggregate_empty_window_skipped() {
        let now = Utc::now();
        let key = WindowKey::new("P1", "temp");
        let window = ParameterWindow::new(now);
        assert!(window.aggregate(&key, now).is_none());
    }

    #[test]
    fn test_window_map_eviction() {
        let map = WindowMap::new();
        let now = Utc::now();

        let stale_key = WindowKey::new("P1", "temp");
        let stale = map.get_or_create(&stale_key, now);
        {
            let mut w = stale.lock().unwrap();
            w.append(value_at(1.0, -120, true));
        }

        let fresh_key = WindowKey::new("P2", "pressure");
        let fresh = map.get_or_create(&fresh_key, now);
        {
            let mut w = fresh.lock().unwrap();
            w.append(value_at(1.0, -1, true));
        }

        let evicted = map.evict_idle(chrono::Duration::minutes(60), now);
        assert_eq!(evicted, 1);
        assert_eq!(map.len(), 1);
    }
}
