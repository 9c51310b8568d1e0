// ==========================================
// 智能工厂MES - 事件总线核心
// ==========================================
// 职责: 发布(序列化→传输扇出→持久化→指标)、
//       订阅(解码→并发分发处理器→指标)、
//       重试扫描与死信升级、指标扫描
// 语义: at-least-once，消费方必须幂等；
//       存储失败只上抛不阻断传输投递
// ==========================================

use crate::bus::dead_letter::{DeadLetterRecord, DeadLetterStore, REASON_MAX_RETRIES};
use crate::bus::handler::{DecoderRegistry, EventHandler, HandlerRegistry};
use crate::bus::retry::{FailedEvent, RetryQueue};
use crate::bus::transport::{event_channel, MessageTransport};
use crate::config::BackboneConfig;
use crate::domain::{BusAction, DomainEvent};
use crate::error::{BusError, BusResult};
use crate::metrics::EventMetrics;
use crate::store::EventStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// 订阅句柄
///
/// 每个事件类型至多一个投递循环；后续 Subscribe 调用只追加临时处理器。
struct SubscriptionHandle {
    cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
    ad_hoc: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

/// 后台扫描任务句柄
struct SweeperHandle {
    name: &'static str,
    cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// 分发上下文（投递循环持有的共享资源快照）
#[derive(Clone)]
struct DispatchContext {
    handlers: Arc<HandlerRegistry>,
    decoders: Arc<DecoderRegistry>,
    retry_queue: Arc<RetryQueue>,
    metrics: Arc<EventMetrics>,
    max_retry_attempts: u32,
}

/// 事件总线
pub struct EventBus {
    transport: Arc<dyn MessageTransport>,
    store: Arc<dyn EventStore>,
    handlers: Arc<HandlerRegistry>,
    decoders: Arc<DecoderRegistry>,
    retry_queue: Arc<RetryQueue>,
    dead_letters: Arc<DeadLetterStore>,
    metrics: Arc<EventMetrics>,
    config: BackboneConfig,
    subscriptions: Arc<DashMap<String, SubscriptionHandle>>,
    sweepers: Mutex<Vec<SweeperHandle>>,
}

impl EventBus {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        store: Arc<dyn EventStore>,
        metrics: Arc<EventMetrics>,
        config: BackboneConfig,
    ) -> Self {
        Self {
            transport,
            store,
            handlers: Arc::new(HandlerRegistry::new()),
            decoders: Arc::new(DecoderRegistry::new()),
            retry_queue: Arc::new(RetryQueue::new()),
            dead_letters: Arc::new(DeadLetterStore::new(
                config.dead_letter_max_per_type,
                config.dead_letter_retention_days,
            )),
            metrics,
            config,
            subscriptions: Arc::new(DashMap::new()),
            sweepers: Mutex::new(Vec::new()),
        }
    }

    // ==========================================
    // 发布
    // ==========================================

    /// 发布单条事件
    ///
    /// 传输扇出与存储追加并发执行；传输失败的事件进入重试队列后上抛，
    /// 存储失败仅上抛（投递已尽力完成）。
    pub async fn publish(&self, mut event: DomainEvent) -> BusResult<()> {
        if event.event_type.trim().is_empty() {
            return Err(BusError::EmptyEventType);
        }
        if event.aggregate_id.is_empty() {
            tracing::warn!(
                "事件缺少聚合ID: event_type={}, event_id={}",
                event.event_type,
                event.event_id
            );
        }

        event.stamp_publish_metadata();
        let raw = event.to_wire()?;
        let channel = event_channel(&event.event_type);
        let start = Instant::now();

        let (transport_result, store_result) = tokio::join!(
            self.transport.publish(&channel, raw.clone()),
            self.store.append(&event, &raw)
        );

        if let Err(e) = transport_result {
            tracing::error!(
                "传输层发布失败，事件进入重试队列: event_type={}, error={}",
                event.event_type,
                e
            );
            self.retry_queue.enqueue(FailedEvent::new(
                &event.event_type,
                raw,
                e.to_string(),
                self.config.retry_interval(),
            ));
            self.metrics.record(&event.event_type, BusAction::Failed);
            return Err(e);
        }

        self.metrics.record(&event.event_type, BusAction::Published);
        self.metrics
            .record_latency("publish", start.elapsed().as_millis() as u64);
        tracing::debug!(
            "事件已发布: event_type={}, event_id={}, channel={}",
            event.event_type,
            event.event_id,
            channel
        );

        if let Err(e) = store_result {
            tracing::error!(
                "事件持久化失败(传输投递已完成): event_type={}, event_id={}, error={}",
                event.event_type,
                event.event_id,
                e
            );
            return Err(BusError::Store(e));
        }

        Ok(())
    }

    /// 批量发布
    ///
    /// 按配置分块；块内事件并发发布，单块失败不影响其余块。
    pub async fn publish_many(&self, events: Vec<DomainEvent>) -> BusResult<()> {
        let chunk_size = self.config.batch_size.max(1);
        let total = events.len();
        let mut failed = 0usize;

        for chunk in events.chunks(chunk_size) {
            let results =
                futures::future::join_all(chunk.iter().cloned().map(|e| self.publish(e))).await;
            for result in results {
                if let Err(e) = result {
                    failed += 1;
                    tracing::error!("批量发布中单条失败(块内隔离): {}", e);
                }
            }
        }

        if failed > 0 {
            tracing::warn!("批量发布完成: total={}, failed={}", total, failed);
        }
        Ok(())
    }

    // ==========================================
    // 订阅
    // ==========================================

    /// 订阅事件类型
    ///
    /// 首次订阅建立传输监听循环；同类型再次订阅仅追加临时处理器。
    /// 注册表中的处理器（register_handler）无需订阅前注册，
    /// 分发时实时读取快照。
    pub fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> BusResult<()> {
        if event_type.trim().is_empty() {
            return Err(BusError::EmptyEventType);
        }

        match self.subscriptions.entry(event_type.to_string()) {
            Entry::Occupied(entry) => {
                let mut ad_hoc = entry
                    .get()
                    .ad_hoc
                    .write()
                    .unwrap_or_else(|e| e.into_inner());
                ad_hoc.push(handler);
                tracing::info!(
                    "订阅已追加处理器: event_type={}, 临时处理器数={}",
                    event_type,
                    ad_hoc.len()
                );
            }
            Entry::Vacant(entry) => {
                let ad_hoc = Arc::new(RwLock::new(vec![handler]));
                let (cancel_tx, cancel_rx) = watch::channel(false);
                let join =
                    self.spawn_delivery_loop(event_type.to_string(), Arc::clone(&ad_hoc), cancel_rx);
                entry.insert(SubscriptionHandle {
                    cancel: cancel_tx,
                    join,
                    ad_hoc,
                });
            }
        }
        Ok(())
    }

    /// 取消订阅
    ///
    /// 投递循环在一个接收周期内退出；在途处理器任务自然完成。
    pub fn unsubscribe(&self, event_type: &str) -> BusResult<()> {
        match self.subscriptions.remove(event_type) {
            Some((_, handle)) => {
                let _ = handle.cancel.send(true);
                handle.join.abort();
                self.transport.unsubscribe(&event_channel(event_type));
                tracing::info!("订阅已取消: event_type={}", event_type);
                Ok(())
            }
            None => Err(BusError::SubscriptionNotFound(event_type.to_string())),
        }
    }

    /// 注册处理器到注册表（所有订阅了该类型的投递循环均会调用）
    pub fn register_handler(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        self.handlers.register(event_type, handler);
    }

    /// 注册自定义解码函数
    pub fn register_decoder<F>(&self, event_type: &str, decoder: F)
    where
        F: Fn(&str) -> BusResult<DomainEvent> + Send + Sync + 'static,
    {
        self.decoders.register(event_type, decoder);
    }

    fn dispatch_context(&self) -> DispatchContext {
        DispatchContext {
            handlers: Arc::clone(&self.handlers),
            decoders: Arc::clone(&self.decoders),
            retry_queue: Arc::clone(&self.retry_queue),
            metrics: Arc::clone(&self.metrics),
            max_retry_attempts: self.config.max_retry_attempts,
        }
    }

    fn spawn_delivery_loop(
        &self,
        event_type: String,
        ad_hoc: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let channel = event_channel(&event_type);
        let mut subscription = self.transport.subscribe(&channel);
        let ctx = self.dispatch_context();

        tokio::spawn(async move {
            tracing::info!("订阅投递循环已启动: channel={}", channel);
            loop {
                tokio::select! {
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            break;
                        }
                    }
                    received = subscription.recv() => {
                        match received {
                            Ok(raw) => dispatch_message(&ctx, &event_type, &ad_hoc, raw).await,
                            Err(_) => break,
                        }
                    }
                }
            }
            tracing::info!("订阅投递循环已退出: channel={}", channel);
        })
    }

    // ==========================================
    // 后台扫描
    // ==========================================

    /// 启动后台扫描（重试 + 指标）
    pub fn start(&self) {
        let mut sweepers = self.sweepers.lock().unwrap_or_else(|e| e.into_inner());
        if !sweepers.is_empty() {
            tracing::warn!("后台扫描已在运行，忽略重复启动");
            return;
        }

        sweepers.push(self.spawn_retry_sweeper());
        sweepers.push(self.spawn_metrics_sweeper());
        tracing::info!(
            "事件总线后台扫描已启动: retry_interval={}s, metrics_interval={}min",
            self.config.retry_interval_seconds,
            self.config.metrics_interval_minutes
        );
    }

    fn spawn_retry_sweeper(&self) -> SweeperHandle {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let transport = Arc::clone(&self.transport);
        let retry_queue = Arc::clone(&self.retry_queue);
        let dead_letters = Arc::clone(&self.dead_letters);
        let metrics = Arc::clone(&self.metrics);
        let config = self.config.clone();
        let period = Duration::from_secs(self.config.retry_interval_seconds.max(1));

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval 的首个 tick 立即完成，丢弃以保证真正的周期行为
            ticker.tick().await;
            loop {
                tokio::select! {
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        retry_sweep(&transport, &retry_queue, &dead_letters, &metrics, &config).await;
                    }
                }
            }
        });

        SweeperHandle {
            name: "retry",
            cancel: cancel_tx,
            join,
        }
    }

    fn spawn_metrics_sweeper(&self) -> SweeperHandle {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let retry_queue = Arc::clone(&self.retry_queue);
        let dead_letters = Arc::clone(&self.dead_letters);
        let metrics = Arc::clone(&self.metrics);
        let subscriptions = Arc::clone(&self.subscriptions);
        let period = Duration::from_secs(self.config.metrics_interval_minutes.max(1) * 60);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        metrics_sweep(&retry_queue, &dead_letters, &metrics, subscriptions.len());
                    }
                }
            }
        });

        SweeperHandle {
            name: "metrics",
            cancel: cancel_tx,
            join,
        }
    }

    /// 手工执行一轮重试扫描（运维与测试入口，语义与定时扫描一致）
    pub async fn run_retry_sweep_once(&self) {
        retry_sweep(
            &self.transport,
            &self.retry_queue,
            &self.dead_letters,
            &self.metrics,
            &self.config,
        )
        .await;
    }

    /// 手工执行一轮指标扫描
    pub fn run_metrics_sweep_once(&self) {
        metrics_sweep(
            &self.retry_queue,
            &self.dead_letters,
            &self.metrics,
            self.subscriptions.len(),
        );
    }

    /// 停机：取消全部订阅与后台扫描并等待其退出
    pub async fn shutdown(&self) {
        tracing::info!("事件总线停机中...");

        let keys: Vec<String> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, handle)) = self.subscriptions.remove(&key) {
                let _ = handle.cancel.send(true);
                let _ = handle.join.await;
            }
        }

        let handles: Vec<SweeperHandle> = {
            let mut sweepers = self.sweepers.lock().unwrap_or_else(|e| e.into_inner());
            sweepers.drain(..).collect()
        };
        for sweeper in handles {
            let _ = sweeper.cancel.send(true);
            let _ = sweeper.join.await;
            tracing::debug!("后台扫描已退出: {}", sweeper.name);
        }

        tracing::info!("事件总线已停机");
    }

    // ==========================================
    // 访问器
    // ==========================================

    pub fn transport(&self) -> Arc<dyn MessageTransport> {
        Arc::clone(&self.transport)
    }

    pub fn store(&self) -> Arc<dyn EventStore> {
        Arc::clone(&self.store)
    }

    pub fn metrics(&self) -> Arc<EventMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn retry_queue(&self) -> Arc<RetryQueue> {
        Arc::clone(&self.retry_queue)
    }

    pub fn dead_letters(&self) -> Arc<DeadLetterStore> {
        Arc::clone(&self.dead_letters)
    }

    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }

    /// 活跃订阅数
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

/// 分发一条已接收消息
///
/// 处理器各自隔离运行：单个失败（含 panic）只记日志与指标，
/// 不影响其余处理器，也不影响消息在传输层的确认。
async fn dispatch_message(
    ctx: &DispatchContext,
    event_type: &str,
    ad_hoc: &Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
    raw: String,
) {
    let start = Instant::now();

    let event = match ctx.decoders.decode(event_type, &raw) {
        Ok(event) => Arc::new(event),
        Err(e) => {
            // 解码失败的消息无法按类型处理，以已耗尽额度入队，
            // 由重试扫描直接升级为死信，避免毒消息循环
            tracing::error!(
                "事件反序列化失败，原始消息转入重试队列: event_type={}, error={}",
                event_type,
                e
            );
            ctx.retry_queue.enqueue(FailedEvent::exhausted_now(
                event_type,
                raw,
                e.to_string(),
                ctx.max_retry_attempts,
            ));
            ctx.metrics.record(event_type, BusAction::Failed);
            return;
        }
    };

    let mut handlers = {
        let ad_hoc = ad_hoc.read().unwrap_or_else(|e| e.into_inner());
        ad_hoc.clone()
    };
    handlers.extend(ctx.handlers.handlers_for(event_type));

    let tasks: Vec<JoinHandle<()>> = handlers
        .into_iter()
        .map(|handler| {
            let event = Arc::clone(&event);
            let metrics = Arc::clone(&ctx.metrics);
            let event_type = event_type.to_string();
            tokio::spawn(async move {
                if let Err(e) = handler.handle(&event).await {
                    tracing::error!(
                        "事件处理器执行失败(已隔离): event_type={}, handler={}, error={:#}",
                        event_type,
                        handler.name(),
                        e
                    );
                    metrics.record(&event_type, BusAction::Failed);
                }
            })
        })
        .collect();

    for task in futures::future::join_all(tasks).await {
        if let Err(e) = task {
            tracing::error!(
                "事件处理器任务异常退出(已隔离): event_type={}, error={}",
                event_type,
                e
            );
            ctx.metrics.record(event_type, BusAction::Failed);
        }
    }

    ctx.metrics.record(event_type, BusAction::Processed);
    ctx.metrics
        .record_latency("dispatch", start.elapsed().as_millis() as u64);
}

/// 一轮重试扫描
///
/// 取出到期条目（单轮上限为批量大小）：额度耗尽的转入死信，
/// 其余在传输层原样重发；重发失败则顺延重新入队。
async fn retry_sweep(
    transport: &Arc<dyn MessageTransport>,
    retry_queue: &Arc<RetryQueue>,
    dead_letters: &Arc<DeadLetterStore>,
    metrics: &Arc<EventMetrics>,
    config: &BackboneConfig,
) {
    let due = retry_queue.take_due(chrono::Utc::now(), config.batch_size.max(1));
    if due.is_empty() {
        return;
    }
    tracing::info!(
        "重试扫描开始: due={}, 队列剩余={}",
        due.len(),
        retry_queue.len()
    );

    for mut failed in due {
        if failed.exhausted(config.max_retry_attempts) {
            dead_letters.push(DeadLetterRecord::from_failed(&failed, REASON_MAX_RETRIES));
            metrics.record(&failed.event_type, BusAction::DeadLetter);
            continue;
        }

        let channel = event_channel(&failed.event_type);
        match transport.publish(&channel, failed.message.clone()).await {
            Ok(_) => {
                metrics.record(&failed.event_type, BusAction::Retried);
                tracing::info!(
                    "事件重试成功: event_type={}, retry_count={}",
                    failed.event_type,
                    failed.retry_count
                );
            }
            Err(e) => {
                failed.exception = e.to_string();
                failed.reschedule(config.retry_interval());
                tracing::warn!(
                    "事件重试失败，重新入队: event_type={}, retry_count={}, error={}",
                    failed.event_type,
                    failed.retry_count,
                    e
                );
                retry_queue.enqueue(failed);
            }
        }
    }
}

/// 一轮指标扫描：快照系统量规并清理过期死信
fn metrics_sweep(
    retry_queue: &Arc<RetryQueue>,
    dead_letters: &Arc<DeadLetterStore>,
    metrics: &Arc<EventMetrics>,
    active_subscriptions: usize,
) {
    let retry_depth = retry_queue.len();
    dead_letters.purge_expired();

    metrics.set_gauge("retry_queue_depth", retry_depth as u64);
    metrics.set_gauge("active_subscriptions", active_subscriptions as u64);
    metrics.set_gauge("dead_letter_total", dead_letters.total() as u64);

    tracing::info!(
        target: "metrics",
        retry_queue_depth = retry_depth,
        active_subscriptions,
        dead_letter_total = dead_letters.total(),
        "系统指标快照"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::transport::BroadcastTransport;
    use crate::db::open_in_memory_connection;
    use crate::store::SqliteEventStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        count: AtomicUsize,
    }

    impl Probe {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                count: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EventHandler for Probe {
        fn name(&self) -> &str {
            "probe"
        }

        async fn handle(&self, _event: &DomainEvent) -> anyhow::Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn build_bus() -> EventBus {
        let conn = Arc::new(Mutex::new(open_in_memory_connection().unwrap()));
        let store = Arc::new(SqliteEventStore::new(conn).unwrap());
        let transport = Arc::new(BroadcastTransport::new(64));
        let metrics = Arc::new(EventMetrics::new(100));
        EventBus::new(transport, store, metrics, BackboneConfig::default())
    }

    #[tokio::test]
    async fn test_publish_rejects_empty_event_type() {
        let bus = build_bus();
        let event = DomainEvent::new("", "B001");
        assert!(matches!(
            bus.publish(event).await,
            Err(BusError::EmptyEventType)
        ));
    }

    #[tokio::test]
    async fn test_publish_stores_and_counts() {
        let bus = build_bus();
        let event = DomainEvent::new("BatchCreated", "B001");
        let aggregate_id = event.aggregate_id.clone();

        bus.publish(event).await.unwrap();

        assert_eq!(bus.metrics().counter("BatchCreated", BusAction::Published), 1);
        let stored = bus.store().find_by_aggregate(&aggregate_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        // 发布注记已写入
        assert!(stored[0].metadata.contains_key("publishedAt"));
    }

    #[tokio::test]
    async fn test_subscribe_dispatch_roundtrip() {
        let bus = build_bus();
        let probe = Probe::new();
        bus.subscribe("BatchCreated", probe.clone()).unwrap();

        bus.publish(DomainEvent::new("BatchCreated", "B001"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(probe.count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.metrics().counter("BatchCreated", BusAction::Processed), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_type() {
        let bus = build_bus();
        assert!(matches!(
            bus.unsubscribe("Nope"),
            Err(BusError::SubscriptionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_message_goes_to_retry_queue() {
        let bus = build_bus();
        let probe = Probe::new();
        bus.subscribe("BatchCreated", probe.clone()).unwrap();

        // 绕过总线直接在通道上投递坏消息
        bus.transport()
            .publish(&event_channel("BatchCreated"), "不是JSON".to_string())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(probe.count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.retry_queue().len(), 1);

        // 下一轮扫描直接升级为死信
        bus.run_retry_sweep_once().await;
        assert_eq!(bus.retry_queue().len(), 0);
        assert_eq!(bus.dead_letters().count("BatchCreated"), 1);
    }
}
