// ==========================================
// 智能工厂MES - 领域事件信封
// ==========================================
// 职责: 定义跨模块分发的事件统一结构
// 约定: 线上格式为 camelCase JSON，payload 字段平铺在信封顶层，
//       未知字段收入 payload（向前兼容）
// 不变式: 发布后 event_id 与 payload 不再变更；
//         metadata 仅允许发布时追加注记（发布时间、来源主机）
// ==========================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// 事件 schema 版本默认值
fn default_schema_version() -> String {
    "v1".to_string()
}

/// 领域事件
///
/// 事件是已经发生的事实，一经发布不可变更。
/// `aggregate_id` 标识事件所属业务实体（如批次号），允许为空，
/// 但为空时发布方会收到告警日志。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    /// 事件唯一标识
    pub event_id: Uuid,
    /// 事件类型标识（PascalCase 字符串）
    pub event_type: String,
    /// 聚合根标识（可为空）
    #[serde(default)]
    pub aggregate_id: String,
    /// 业务发生时间（UTC）
    pub occurred_on: DateTime<Utc>,
    /// schema 版本标记
    #[serde(default = "default_schema_version")]
    pub version: String,
    /// 操作人标识
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// 开放元数据（发布时会追加 publishedAt / originHost）
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// 类型特定载荷，线上平铺；未知字段也归入此处
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl DomainEvent {
    /// 创建新事件
    ///
    /// # 参数
    /// - event_type: 事件类型标识
    /// - aggregate_id: 聚合根标识（允许空字符串）
    pub fn new(event_type: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            aggregate_id: aggregate_id.into(),
            occurred_on: Utc::now(),
            version: default_schema_version(),
            user_id: None,
            metadata: HashMap::new(),
            payload: serde_json::Map::new(),
        }
    }

    /// 追加一个载荷字段
    pub fn with_payload(mut self, key: &str, value: serde_json::Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    /// 合并一个 JSON 对象到载荷（非对象值忽略）
    pub fn with_payload_object(mut self, value: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = value {
            self.payload.extend(map);
        }
        self
    }

    /// 设置操作人
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// 追加元数据（仅限发布前的业务注记）
    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// 读取载荷中的浮点字段
    pub fn payload_f64(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(|v| v.as_f64())
    }

    /// 读取载荷中的字符串字段
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// 读取载荷中的布尔字段
    pub fn payload_bool(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(|v| v.as_bool())
    }

    /// 序列化为线上 JSON
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 从线上 JSON 还原
    pub fn from_wire(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// 发布时注记：发布时间与来源主机
    ///
    /// 仅由事件总线在发布瞬间调用，业务字段不得经由此处进入 metadata。
    pub(crate) fn stamp_publish_metadata(&mut self) {
        self.metadata.insert(
            "publishedAt".to_string(),
            serde_json::Value::String(Utc::now().to_rfc3339()),
        );
        self.metadata.insert(
            "originHost".to_string(),
            serde_json::Value::String(origin_host()),
        );
    }
}

/// 来源主机名（取不到时降级为 unknown）
fn origin_host() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
