// ==========================================
// 智能工厂MES - 事件消息骨干核心库
// ==========================================
// 技术栈: Tokio + Rust + SQLite
// 系统定位: 工厂级制造执行系统的事件分发与参数流处理骨干
// 投递语义: at-least-once，消费方必须幂等；
//           可靠历史仅存在于事件存储，传输层为尽力投递
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 事件信封与参数流模型
pub mod domain;

// 事件总线层 - 发布/订阅、重试、死信
pub mod bus;

// 事件存储层 - 持久化追加与回查
pub mod store;

// 参数流处理层 - 滑动窗口、异常检测、聚合、告警
pub mod stream;

// 配置层 - 运行参数
pub mod config;

// 指标采集
pub mod metrics;

// 数据库基础设施（连接初始化/PRAGMA 统一）
pub mod db;

// 日志系统
pub mod logging;

// 错误类型
pub mod error;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::{event_types, AggregatedData, BusAction, DomainEvent, ParameterMessage, ParameterValue};

// 事件总线
pub use bus::{
    BroadcastTransport, DeadLetterRecord, DeadLetterStore, EventBus, EventHandler, FailedEvent,
    HandlerRegistry, MessageTransport, RetryQueue, PARAMETER_CHANNEL,
};

// 存储
pub use store::{EventStore, SqliteEventStore, StoreError};

// 参数流
pub use stream::{ParameterStreamProcessor, WindowKey, WindowMap};

// 配置与指标
pub use config::{BackboneConfig, ConfigManager};
pub use metrics::{EventMetrics, MetricsSnapshot};

// 错误
pub use error::{BusError, BusResult};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "智能工厂MES事件骨干";
