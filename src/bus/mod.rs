// ==========================================
// 智能工厂MES - 事件总线层
// ==========================================
// 职责: 事件的发布/订阅编排、失败重试与死信升级
// ==========================================

pub mod dead_letter;
pub mod event_bus;
pub mod handler;
pub mod retry;
pub mod transport;

pub use dead_letter::{DeadLetterRecord, DeadLetterStore, REASON_MAX_RETRIES};
pub use event_bus::EventBus;
pub use handler::{DecoderRegistry, EventHandler, HandlerRegistry};
pub use retry::{FailedEvent, RetryQueue};
pub use transport::{
    event_channel, BroadcastTransport, MessageTransport, TransportSubscription,
    EVENT_CHANNEL_PREFIX, PARAMETER_CHANNEL,
};
