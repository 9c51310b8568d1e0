// ==========================================
// 智能工厂MES - 死信存储
// ==========================================
// 职责: 收纳重试额度耗尽的事件，供人工排障与补偿
// 约束: 按事件类型分列，单类型条数有界 + 保留期 TTL，
//       超限时最旧条目先出
// ==========================================

use crate::bus::retry::FailedEvent;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// 转入死信的标准原因: 超过最大重试次数
pub const REASON_MAX_RETRIES: &str = "max retries exceeded";

/// 死信记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub event_type: String,
    pub message: String,
    pub exception: String,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
    pub dead_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterRecord {
    /// 由失败事件生成死信记录
    pub fn from_failed(failed: &FailedEvent, reason: &str) -> Self {
        Self {
            event_type: failed.event_type.clone(),
            message: failed.message.clone(),
            exception: failed.exception.clone(),
            failed_at: failed.failed_at,
            retry_count: failed.retry_count,
            dead_at: Utc::now(),
            reason: reason.to_string(),
        }
    }
}

/// 死信存储
pub struct DeadLetterStore {
    entries: DashMap<String, VecDeque<DeadLetterRecord>>,
    max_per_type: usize,
    retention: chrono::Duration,
}

impl DeadLetterStore {
    /// # 参数
    /// - max_per_type: 单事件类型保留条数上限
    /// - retention_days: 保留天数，过期条目在写入与扫描时清理
    pub fn new(max_per_type: usize, retention_days: i64) -> Self {
        Self {
            entries: DashMap::new(),
            max_per_type: max_per_type.max(1),
            retention: chrono::Duration::days(retention_days.max(1)),
        }
    }

    /// 写入一条死信记录
    pub fn push(&self, record: DeadLetterRecord) {
        tracing::warn!(
            "事件转入死信存储: event_type={}, reason={}, retry_count={}",
            record.event_type,
            record.reason,
            record.retry_count
        );

        let mut list = self.entries.entry(record.event_type.clone()).or_default();

        // 条目按 dead_at 升序排列，过期与超限都从队首清理
        let cutoff = Utc::now() - self.retention;
        while let Some(front) = list.front() {
            if front.dead_at < cutoff || list.len() >= self.max_per_type {
                list.pop_front();
            } else {
                break;
            }
        }
        list.push_back(record);
    }

    /// 某事件类型的死信快照
    pub fn records(&self, event_type: &str) -> Vec<DeadLetterRecord> {
        self.entries
            .get(event_type)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 某事件类型的死信条数
    pub fn count(&self, event_type: &str) -> usize {
        self.entries.get(event_type).map(|l| l.len()).unwrap_or(0)
    }

    /// 全部死信条数
    pub fn total(&self) -> usize {
        self.entries.iter().map(|e| e.len()).sum()
    }

    /// 清理过期条目，返回清理数量
    pub fn purge_expired(&self) -> usize {
        let cutoff = Utc::now() - self.retention;
        let mut removed = 0;
        for mut entry in self.entries.iter_mut() {
            let before = entry.len();
            entry.retain(|r| r.dead_at >= cutoff);
            removed += before - entry.len();
        }
        if removed > 0 {
            tracing::info!("死信存储清理完成: 清理 {} 条过期记录", removed);
        }
        removed
    }
}
