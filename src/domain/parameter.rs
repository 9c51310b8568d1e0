// ==========================================
// 智能工厂MES - 工艺参数流模型
// ==========================================
// 职责: 参数采集消息、窗口内样本、窗口聚合快照
// 约定: 线上格式 camelCase JSON（与事件信封一致）
// ==========================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn default_qualified() -> bool {
    true
}

/// 参数采集消息
///
/// 采集端发布在 `parameter-collected` 通道上的原始消息，
/// 键为 (process_id, parameter_name)。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterMessage {
    /// 工序标识
    pub process_id: String,
    /// 参数名（如 furnace_temp）
    pub parameter_name: String,
    /// 采集值
    pub value: f64,
    /// 采样时间（UTC）
    pub timestamp: DateTime<Utc>,
    /// 是否合格（缺省视为合格）
    #[serde(default = "default_qualified")]
    pub is_qualified: bool,
    /// 采集设备编码
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipment_code: Option<String>,
    /// 关联批次号
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_number: Option<String>,
}

/// 滑动窗口内的单个样本
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterValue {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub is_qualified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipment_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_number: Option<String>,
}

impl From<&ParameterMessage> for ParameterValue {
    fn from(msg: &ParameterMessage) -> Self {
        Self {
            value: msg.value,
            timestamp: msg.timestamp,
            is_qualified: msg.is_qualified,
            equipment_code: msg.equipment_code.clone(),
            batch_number: msg.batch_number.clone(),
        }
    }
}

/// 窗口聚合快照
///
/// 聚合时刻对窗口内容的只读快照，产出后不再变更。
/// qualification_rate 为百分比，保留两位小数。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedData {
    pub process_id: String,
    pub parameter_name: String,
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub qualified_count: usize,
    pub qualification_rate: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}
