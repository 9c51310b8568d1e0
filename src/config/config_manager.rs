// ==========================================
// 智能工厂MES - 配置管理器
// ==========================================
// 职责: 配置加载、查询、覆写管理
// 存储: config_kv 表 (key-value + scope)
// ==========================================

use crate::config::backbone_config::BackboneConfig;
use crate::error::{BusError, BusResult};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

// ==========================================
// 配置键全集
// ==========================================
pub const KEY_MAX_RETRY_ATTEMPTS: &str = "event_bus/max_retry_attempts";
pub const KEY_RETRY_INTERVAL_SECONDS: &str = "event_bus/retry_interval_seconds";
pub const KEY_DEAD_LETTER_RETENTION_DAYS: &str = "event_bus/dead_letter_retention_days";
pub const KEY_DEAD_LETTER_MAX_PER_TYPE: &str = "event_bus/dead_letter_max_per_type";
pub const KEY_BATCH_SIZE: &str = "event_bus/batch_size";
pub const KEY_METRICS_INTERVAL_MINUTES: &str = "event_bus/metrics_interval_minutes";
pub const KEY_AGGREGATION_INTERVAL_SECONDS: &str = "stream/aggregation_interval_seconds";
pub const KEY_ALERT_CHECK_INTERVAL_SECONDS: &str = "stream/alert_check_interval_seconds";
pub const KEY_ALERT_LOOKBACK_MINUTES: &str = "stream/alert_lookback_minutes";
pub const KEY_ALERT_UNQUALIFIED_COUNT: &str = "stream/alert_unqualified_count";
pub const KEY_WINDOW_SIZE_MINUTES: &str = "stream/window_size_minutes";
pub const KEY_WINDOW_IDLE_TIMEOUT_MINUTES: &str = "stream/window_idle_timeout_minutes";
pub const KEY_EVICTION_INTERVAL_MINUTES: &str = "stream/eviction_interval_minutes";
pub const KEY_ANOMALY_THRESHOLD: &str = "stream/anomaly_threshold";
pub const KEY_ANOMALY_SAMPLE_COUNT: &str = "stream/anomaly_sample_count";
pub const KEY_LATEST_VALUE_TTL_SECONDS: &str = "stream/latest_value_ttl_seconds";
pub const KEY_LATENCY_SAMPLE_CAPACITY: &str = "metrics/latency_sample_capacity";
pub const KEY_CHANNEL_CAPACITY: &str = "transport/channel_capacity";

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 从已有连接创建 ConfigManager，并确保 config_kv 表存在
    pub fn new(conn: Arc<Mutex<Connection>>) -> BusResult<Self> {
        let manager = Self { conn };
        manager.ensure_config_table()?;
        Ok(manager)
    }

    /// 确保 config_kv 表存在
    fn ensure_config_table(&self) -> BusResult<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS config_kv (
                scope_id TEXT NOT NULL DEFAULT 'global',
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (scope_id, key)
            );
            "#,
        )
        .map_err(|e| BusError::Config(format!("建表失败: {}", e)))?;
        Ok(())
    }

    fn lock_conn(&self) -> BusResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| BusError::Config(format!("锁获取失败: {}", e)))
    }

    /// 从 config_kv 表读取配置值（scope_id='global'）
    fn get_config_value(&self, key: &str) -> BusResult<Option<String>> {
        let conn = self.lock_conn()?;

        let result = conn.query_row(
            "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(BusError::Config(e.to_string())),
        }
    }

    /// 写入/覆写配置值（scope_id='global'）
    pub fn set_config_value(&self, key: &str, value: &str) -> BusResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"
            INSERT INTO config_kv (scope_id, key, value, updated_at)
            VALUES ('global', ?1, ?2, datetime('now'))
            ON CONFLICT (scope_id, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value],
        )
        .map_err(|e| BusError::Config(e.to_string()))?;
        Ok(())
    }

    /// 读取并解析配置值；缺失或解析失败时回落到默认值
    ///
    /// 解析失败属于配置录入错误，记告警日志而非中断启动。
    fn get_parsed_or<T: FromStr + Copy>(&self, key: &str, default: T) -> BusResult<T> {
        match self.get_config_value(key)? {
            Some(raw) => match raw.trim().parse::<T>() {
                Ok(v) => Ok(v),
                Err(_) => {
                    tracing::warn!("配置值解析失败，使用默认值: key={}, value={}", key, raw);
                    Ok(default)
                }
            },
            None => Ok(default),
        }
    }

    /// 加载骨干运行配置（缺失项取默认值）
    pub fn load_backbone_config(&self) -> BusResult<BackboneConfig> {
        let d = BackboneConfig::default();
        Ok(BackboneConfig {
            max_retry_attempts: self.get_parsed_or(KEY_MAX_RETRY_ATTEMPTS, d.max_retry_attempts)?,
            retry_interval_seconds: self
                .get_parsed_or(KEY_RETRY_INTERVAL_SECONDS, d.retry_interval_seconds)?,
            dead_letter_retention_days: self
                .get_parsed_or(KEY_DEAD_LETTER_RETENTION_DAYS, d.dead_letter_retention_days)?,
            dead_letter_max_per_type: self
                .get_parsed_or(KEY_DEAD_LETTER_MAX_PER_TYPE, d.dead_letter_max_per_type)?,
            batch_size: self.get_parsed_or(KEY_BATCH_SIZE, d.batch_size)?,
            metrics_interval_minutes: self
                .get_parsed_or(KEY_METRICS_INTERVAL_MINUTES, d.metrics_interval_minutes)?,
            aggregation_interval_seconds: self
                .get_parsed_or(KEY_AGGREGATION_INTERVAL_SECONDS, d.aggregation_interval_seconds)?,
            alert_check_interval_seconds: self
                .get_parsed_or(KEY_ALERT_CHECK_INTERVAL_SECONDS, d.alert_check_interval_seconds)?,
            alert_lookback_minutes: self
                .get_parsed_or(KEY_ALERT_LOOKBACK_MINUTES, d.alert_lookback_minutes)?,
            alert_unqualified_count: self
                .get_parsed_or(KEY_ALERT_UNQUALIFIED_COUNT, d.alert_unqualified_count)?,
            window_size_minutes: self
                .get_parsed_or(KEY_WINDOW_SIZE_MINUTES, d.window_size_minutes)?,
            window_idle_timeout_minutes: self
                .get_parsed_or(KEY_WINDOW_IDLE_TIMEOUT_MINUTES, d.window_idle_timeout_minutes)?,
            eviction_interval_minutes: self
                .get_parsed_or(KEY_EVICTION_INTERVAL_MINUTES, d.eviction_interval_minutes)?,
            anomaly_threshold: self.get_parsed_or(KEY_ANOMALY_THRESHOLD, d.anomaly_threshold)?,
            anomaly_sample_count: self
                .get_parsed_or(KEY_ANOMALY_SAMPLE_COUNT, d.anomaly_sample_count)?,
            latest_value_ttl_seconds: self
                .get_parsed_or(KEY_LATEST_VALUE_TTL_SECONDS, d.latest_value_ttl_seconds)?,
            latency_sample_capacity: self
                .get_parsed_or(KEY_LATENCY_SAMPLE_CAPACITY, d.latency_sample_capacity)?,
            channel_capacity: self.get_parsed_or(KEY_CHANNEL_CAPACITY, d.channel_capacity)?,
        })
    }

    /// 获取所有配置的快照（JSON格式）
    ///
    /// # 用途
    /// - 故障排查时记录当前生效配置
    pub fn get_config_snapshot(&self) -> BusResult<String> {
        let conn = self.lock_conn()?;

        let mut stmt = conn
            .prepare("SELECT key, value FROM config_kv WHERE scope_id = 'global' ORDER BY key")
            .map_err(|e| BusError::Config(e.to_string()))?;

        let mut config_map: HashMap<String, String> = HashMap::new();
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| BusError::Config(e.to_string()))?;

        for row in rows {
            let (key, value) = row.map_err(|e| BusError::Config(e.to_string()))?;
            config_map.insert(key, value);
        }

        serde_json::to_string(&config_map).map_err(BusError::Serialization)
    }
}
