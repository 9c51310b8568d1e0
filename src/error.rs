// ==========================================
// 智能工厂MES - 事件骨干错误类型
// ==========================================
// 工具: thiserror 派生宏
// 约定: 仅发布/存储路径错误向调用方传播，
//       订阅分发路径错误全部就地隔离（日志+指标+死信）
// ==========================================

use thiserror::Error;

/// 事件骨干统一错误类型
#[derive(Error, Debug)]
pub enum BusError {
    // ===== 发布路径错误 =====
    #[error("事件类型为空")]
    EmptyEventType,

    #[error("事件序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("传输层发布失败: channel={channel}, message={message}")]
    Transport { channel: String, message: String },

    // ===== 存储错误 =====
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    // ===== 订阅/分发路径错误 =====
    #[error("事件反序列化失败: event_type={event_type}, message={message}")]
    Deserialization {
        event_type: String,
        message: String,
    },

    #[error("订阅不存在: {0}")]
    SubscriptionNotFound(String),

    // ===== 配置错误 =====
    #[error("配置读取失败: {0}")]
    Config(String),

    // ===== 通用错误 =====
    #[error("内部错误: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type BusResult<T> = Result<T, BusError>;
