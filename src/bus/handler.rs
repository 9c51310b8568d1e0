// ==========================================
// 智能工厂MES - 处理器与解码器注册表
// ==========================================
// 职责: 事件类型 → 处理器多重映射、事件类型 → 解码函数映射
// 说明: 解码器注册表显式替代“按类型名动态还原”——
//       未注册类型走缺省信封解码
// ==========================================

use crate::domain::DomainEvent;
use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// 事件处理器
///
/// 业务模块实现此 trait 并注册到总线；处理失败只影响自身，
/// 不影响同事件的其他处理器。
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理器名称（日志与排障用）
    fn name(&self) -> &str;

    /// 处理一条已解码事件
    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()>;
}

/// 处理器注册表
///
/// 线程安全多重映射；读取返回快照副本，避免遍历期间被并发修改。
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器（追加）
    pub fn register(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        let mut entry = self.handlers.entry(event_type.to_string()).or_default();
        tracing::info!(
            "事件处理器已注册: event_type={}, handler={}, 总数={}",
            event_type,
            handler.name(),
            entry.len() + 1
        );
        entry.push(handler);
    }

    /// 某事件类型的处理器快照
    pub fn handlers_for(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .get(event_type)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// 某事件类型的处理器数量
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers.get(event_type).map(|e| e.len()).unwrap_or(0)
    }

    /// 已注册处理器的事件类型列表
    pub fn event_types(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }
}

/// 解码函数类型
pub type DecodeFn = dyn Fn(&str) -> BusResult<DomainEvent> + Send + Sync;

/// 解码器注册表
///
/// 事件类型 → 解码函数。未注册类型使用缺省信封解码。
#[derive(Default)]
pub struct DecoderRegistry {
    decoders: DashMap<String, Arc<DecodeFn>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册自定义解码函数（同类型覆盖）
    pub fn register<F>(&self, event_type: &str, decoder: F)
    where
        F: Fn(&str) -> BusResult<DomainEvent> + Send + Sync + 'static,
    {
        self.decoders
            .insert(event_type.to_string(), Arc::new(decoder));
        tracing::info!("事件解码器已注册: event_type={}", event_type);
    }

    /// 解码一条原始消息
    pub fn decode(&self, event_type: &str, raw: &str) -> BusResult<DomainEvent> {
        if let Some(decoder) = self.decoders.get(event_type) {
            return decoder(raw);
        }

        DomainEvent::from_wire(raw).map_err(|e| BusError::Deserialization {
            event_type: event_type.to_string(),
            message: e.to_string(),
        })
    }
}
