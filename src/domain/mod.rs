// ==========================================
// 智能工厂MES - 领域层
// ==========================================
// 职责: 事件信封、参数流模型、领域类型定义
// ==========================================

pub mod event;
pub mod parameter;
pub mod types;

pub use event::DomainEvent;
pub use parameter::{AggregatedData, ParameterMessage, ParameterValue};
pub use types::{event_types, BusAction};
