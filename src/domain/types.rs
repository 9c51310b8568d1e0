// ==========================================
// 智能工厂MES - 领域类型定义
// ==========================================
// 约定: 事件类型标识使用 PascalCase 字符串，
//       与事件存储、传输通道命名保持一致
// ==========================================

use std::fmt;

// ==========================================
// 内置事件类型标识
// ==========================================
// 业务模块可自由发布任意类型，此处仅收录骨干自身
// 产生或依赖的事件类型，避免散落的魔法字符串
pub mod event_types {
    /// 批次创建
    pub const BATCH_CREATED: &str = "BatchCreated";
    /// 质检不合格
    pub const QUALITY_FAILED: &str = "QualityFailed";
    /// 设备故障
    pub const EQUIPMENT_FAULTED: &str = "EquipmentFaulted";
    /// 工艺参数采集
    pub const PARAMETER_COLLECTED: &str = "ParameterCollected";
    /// 参数异常检出（Z-score 超限）
    pub const ANOMALY_DETECTED: &str = "AnomalyDetected";
    /// 参数告警触发（不合格样本数超限）
    pub const ALERT_TRIGGERED: &str = "AlertTriggered";
    /// 窗口聚合完成
    pub const AGGREGATION_COMPLETED: &str = "AggregationCompleted";
}

// ==========================================
// 指标动作 (Bus Action)
// ==========================================
// 每个事件类型按动作维度分别计数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusAction {
    /// 已发布
    Published,
    /// 已分发处理
    Processed,
    /// 处理失败
    Failed,
    /// 已重试
    Retried,
    /// 已转入死信
    DeadLetter,
}

impl BusAction {
    /// 转换为指标键片段（小写）
    pub fn as_str(&self) -> &str {
        match self {
            BusAction::Published => "published",
            BusAction::Processed => "processed",
            BusAction::Failed => "failed",
            BusAction::Retried => "retried",
            BusAction::DeadLetter => "deadletter",
        }
    }
}

impl fmt::Display for BusAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
