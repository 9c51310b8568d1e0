// ==========================================
// 智能工厂MES - 参数告警检查
// ==========================================
// 职责: 回查近期参数采集记录，按 (工序, 参数) 分组统计
//       不合格样本数，达到阈值即发布告警事件
// 说明: 与逐样本异常检测互补——这是更粗粒度的质量信号，
//       数据来源为事件存储而非内存窗口
// ==========================================

use crate::bus::EventBus;
use crate::domain::types::event_types;
use crate::domain::DomainEvent;
use crate::stream::window::WindowKey;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;

/// 分组统计
struct GroupStats {
    unqualified_count: usize,
    last_unqualified_at: Option<DateTime<Utc>>,
}

/// 一轮告警检查
///
/// 回查最近 lookback 区间内的 ParameterCollected 事件；
/// 不合格样本数达到 unqualified_threshold 的分组各发布一条告警事件。
/// 存储查询失败视为本轮无信号，仅记日志。
pub async fn alert_check(
    bus: &EventBus,
    lookback: chrono::Duration,
    unqualified_threshold: usize,
) {
    let to = Utc::now();
    let from = to - lookback;

    let events = match bus
        .store()
        .find_by_type_in_range(event_types::PARAMETER_COLLECTED, from, to)
        .await
    {
        Ok(events) => events,
        Err(e) => {
            tracing::warn!("告警检查回查失败，本轮跳过: error={}", e);
            return;
        }
    };
    if events.is_empty() {
        return;
    }

    let mut groups: HashMap<WindowKey, GroupStats> = HashMap::new();
    for event in &events {
        let (Some(process_id), Some(parameter_name)) = (
            event.payload_str("processId"),
            event.payload_str("parameterName"),
        ) else {
            continue;
        };
        // 缺省视为合格，与采集消息约定一致
        if event.payload_bool("isQualified").unwrap_or(true) {
            continue;
        }

        let sample_at = event
            .payload_str("timestamp")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(event.occurred_on);

        let stats = groups
            .entry(WindowKey::new(process_id, parameter_name))
            .or_insert(GroupStats {
                unqualified_count: 0,
                last_unqualified_at: None,
            });
        stats.unqualified_count += 1;
        if stats.last_unqualified_at.map_or(true, |t| sample_at > t) {
            stats.last_unqualified_at = Some(sample_at);
        }
    }

    for (key, stats) in groups {
        if stats.unqualified_count < unqualified_threshold {
            continue;
        }

        tracing::warn!(
            "参数告警触发: key={}, 不合格样本数={}, 回看区间={}min",
            key,
            stats.unqualified_count,
            lookback.num_minutes()
        );

        let event = DomainEvent::new(event_types::ALERT_TRIGGERED, &key.process_id)
            .with_payload("processId", json!(key.process_id))
            .with_payload("parameterName", json!(key.parameter_name))
            .with_payload("unqualifiedCount", json!(stats.unqualified_count))
            .with_payload(
                "lastUnqualifiedAt",
                json!(stats.last_unqualified_at.map(|t| t.to_rfc3339())),
            )
            .with_payload("lookbackMinutes", json!(lookback.num_minutes()));

        if let Err(e) = bus.publish(event).await {
            tracing::error!("告警事件发布失败: key={}, error={}", key, e);
        }
    }
}
