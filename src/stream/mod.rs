// ==========================================
// 智能工厂MES - 实时参数流处理层
// ==========================================
// 职责: 滑动窗口维护、异常检测、周期聚合与告警
// ==========================================

pub mod alert;
pub mod processor;
pub mod window;

pub use processor::{LatestValueCache, ParameterStreamProcessor};
pub use window::{AnomalySignal, ParameterWindow, WindowKey, WindowMap};
