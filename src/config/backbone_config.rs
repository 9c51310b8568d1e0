// ==========================================
// 智能工厂MES - 骨干运行配置
// ==========================================
// 说明: 异常检测样本数与告警不合格阈值属于领域调参项，
//       一律走配置而非硬编码常量
// ==========================================

use serde::{Deserialize, Serialize};

/// 事件骨干运行配置
///
/// 由 ConfigManager 从 config_kv 表加载，缺省值即生产缺省。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackboneConfig {
    // ===== 事件总线 =====
    /// 最大重试次数
    pub max_retry_attempts: u32,
    /// 重试扫描间隔（秒）
    pub retry_interval_seconds: u64,
    /// 死信保留天数
    pub dead_letter_retention_days: i64,
    /// 单事件类型死信上限
    pub dead_letter_max_per_type: usize,
    /// 批量发布分块大小
    pub batch_size: usize,
    /// 指标扫描间隔（分钟）
    pub metrics_interval_minutes: u64,

    // ===== 参数流处理 =====
    /// 聚合间隔（秒）
    pub aggregation_interval_seconds: u64,
    /// 告警检查间隔（秒）
    pub alert_check_interval_seconds: u64,
    /// 告警回看区间（分钟）
    pub alert_lookback_minutes: i64,
    /// 告警触发所需不合格样本数
    pub alert_unqualified_count: usize,
    /// 滑动窗口长度（分钟）
    pub window_size_minutes: i64,
    /// 窗口空闲淘汰超时（分钟）
    pub window_idle_timeout_minutes: i64,
    /// 窗口淘汰扫描间隔（分钟）
    pub eviction_interval_minutes: u64,
    /// 异常判定 Z-score 阈值
    pub anomaly_threshold: f64,
    /// 异常检测基线样本数
    pub anomaly_sample_count: usize,
    /// 最新值缓存 TTL（秒）
    pub latest_value_ttl_seconds: u64,

    // ===== 指标与传输 =====
    /// 单阶段延迟样本保留条数
    pub latency_sample_capacity: usize,
    /// 传输通道缓冲容量
    pub channel_capacity: usize,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            retry_interval_seconds: 30,
            dead_letter_retention_days: 7,
            dead_letter_max_per_type: 1000,
            batch_size: 10,
            metrics_interval_minutes: 5,
            aggregation_interval_seconds: 30,
            alert_check_interval_seconds: 60,
            alert_lookback_minutes: 5,
            alert_unqualified_count: 3,
            window_size_minutes: 10,
            window_idle_timeout_minutes: 60,
            eviction_interval_minutes: 5,
            anomaly_threshold: 2.0,
            anomaly_sample_count: 10,
            latest_value_ttl_seconds: 30,
            latency_sample_capacity: 1000,
            channel_capacity: 1024,
        }
    }
}

impl BackboneConfig {
    /// 重试间隔（chrono Duration）
    pub fn retry_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retry_interval_seconds as i64)
    }

    /// 窗口长度（chrono Duration）
    pub fn window_size(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.window_size_minutes)
    }

    /// 窗口空闲淘汰超时（chrono Duration）
    pub fn window_idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.window_idle_timeout_minutes)
    }

    /// 告警回看区间（chrono Duration）
    pub fn alert_lookback(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.alert_lookback_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = BackboneConfig::default();
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.retry_interval_seconds, 30);
        assert_eq!(config.dead_letter_retention_days, 7);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.aggregation_interval_seconds, 30);
        assert_eq!(config.alert_check_interval_seconds, 60);
        assert_eq!(config.window_size_minutes, 10);
        assert_eq!(config.anomaly_threshold, 2.0);
        assert_eq!(config.anomaly_sample_count, 10);
        assert_eq!(config.alert_unqualified_count, 3);
    }
}
