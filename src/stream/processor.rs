// ==========================================
// 智能工厂MES - 实时参数流处理器
// ==========================================
// 职责: 订阅 parameter-collected 通道，维护滑动窗口，
//       在线异常检测、周期聚合、告警检查、空闲窗口淘汰
// 说明: 各定时任务为独立可取消的周期任务，
//       慢扫描不阻塞其他扫描；派生事件回流同一总线
// ==========================================

use crate::bus::transport::PARAMETER_CHANNEL;
use crate::bus::EventBus;
use crate::config::BackboneConfig;
use crate::domain::types::event_types;
use crate::domain::{DomainEvent, ParameterMessage, ParameterValue};
use crate::metrics::StageTimer;
use crate::stream::alert::alert_check;
use crate::stream::window::{WindowKey, WindowMap};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// 最新值缓存条目
struct CachedValue {
    value: ParameterValue,
    cached_at: Instant,
}

/// 最新值缓存
///
/// 短 TTL，供实时看板读取当前参数值，过期即失效。
pub struct LatestValueCache {
    entries: DashMap<WindowKey, CachedValue>,
    ttl: Duration,
}

impl LatestValueCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn put(&self, key: WindowKey, value: ParameterValue) {
        self.entries.insert(
            key,
            CachedValue {
                value,
                cached_at: Instant::now(),
            },
        );
    }

    /// 读取未过期的最新值（过期条目顺带移除）
    pub fn get(&self, key: &WindowKey) -> Option<ParameterValue> {
        if let Some(entry) = self.entries.get(key) {
            if entry.cached_at.elapsed() <= self.ttl {
                return Some(entry.value.clone());
            }
        }
        self.entries
            .remove_if(key, |_, cached| cached.cached_at.elapsed() > self.ttl);
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 周期任务句柄
struct TickerHandle {
    name: &'static str,
    cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// 处理器共享内核（接收循环与各周期任务共同持有）
struct ProcessorCore {
    bus: Arc<EventBus>,
    windows: Arc<WindowMap>,
    latest_cache: Arc<LatestValueCache>,
    config: BackboneConfig,
}

impl ProcessorCore {
    /// 处理一条原始参数消息
    async fn handle_raw_message(&self, raw: &str) {
        match serde_json::from_str::<ParameterMessage>(raw) {
            Ok(msg) => self.on_parameter_message(msg).await,
            Err(e) => {
                tracing::warn!("参数消息解析失败，已丢弃: error={}, raw={}", e, raw);
            }
        }
    }

    /// 处理一条参数采集消息
    ///
    /// 窗口写入与异常检测在窗口锁内完成；派生事件发布在锁外，
    /// 避免处理慢时阻塞同窗口后续样本。
    async fn on_parameter_message(&self, msg: ParameterMessage) {
        let key = WindowKey::new(&msg.process_id, &msg.parameter_name);
        let now = Utc::now();
        let window = self.windows.get_or_create(&key, now);

        let signal = {
            let mut window = window.lock().unwrap_or_else(|e| e.into_inner());
            window.purge(self.config.window_size(), now);
            let signal = window.detect_anomaly(
                msg.value,
                self.config.anomaly_sample_count,
                self.config.anomaly_threshold,
            );
            window.append(ParameterValue::from(&msg));
            signal
        };

        self.latest_cache.put(key.clone(), ParameterValue::from(&msg));

        if let Some(signal) = signal {
            tracing::warn!(
                "检测到参数异常: key={}, value={}, mean={:.4}, std_dev={:.4}, z={:.2}",
                key,
                signal.value,
                signal.mean,
                signal.std_dev,
                signal.z_score
            );

            let event = DomainEvent::new(event_types::ANOMALY_DETECTED, &msg.process_id)
                .with_payload("processId", json!(msg.process_id))
                .with_payload("parameterName", json!(msg.parameter_name))
                .with_payload("value", json!(signal.value))
                .with_payload("mean", json!(signal.mean))
                .with_payload("stdDev", json!(signal.std_dev))
                .with_payload("zScore", json!(signal.z_score))
                .with_payload("equipmentCode", json!(msg.equipment_code))
                .with_payload("batchNumber", json!(msg.batch_number));

            if let Err(e) = self.bus.publish(event).await {
                tracing::error!("异常事件发布失败: key={}, error={}", key, e);
            }
        }
    }

    /// 一轮窗口聚合
    async fn run_aggregation_once(&self) {
        let _timer = StageTimer::new(self.bus.metrics(), "aggregation");
        let now = Utc::now();
        let snapshot = self.windows.snapshot();
        let mut emitted = 0usize;

        for (key, window) in snapshot {
            let data = {
                let window = window.lock().unwrap_or_else(|e| e.into_inner());
                window.aggregate(&key, now)
            };

            let Some(data) = data else { continue };
            let process_id = data.process_id.clone();

            let event = match serde_json::to_value(&data) {
                Ok(payload) => DomainEvent::new(event_types::AGGREGATION_COMPLETED, &process_id)
                    .with_payload_object(payload),
                Err(e) => {
                    tracing::error!("聚合结果序列化失败: key={}, error={}", key, e);
                    continue;
                }
            };

            if let Err(e) = self.bus.publish(event).await {
                tracing::error!("聚合事件发布失败: key={}, error={}", key, e);
            } else {
                emitted += 1;
            }
        }

        if emitted > 0 {
            tracing::debug!("窗口聚合完成: 产出 {} 条聚合事件", emitted);
        }
    }

    /// 一轮告警检查
    async fn run_alert_check_once(&self) {
        alert_check(
            &self.bus,
            self.config.alert_lookback(),
            self.config.alert_unqualified_count,
        )
        .await;
    }

    /// 一轮空闲窗口淘汰
    fn run_eviction_once(&self) {
        let evicted = self
            .windows
            .evict_idle(self.config.window_idle_timeout(), Utc::now());
        if evicted > 0 {
            tracing::info!("空闲窗口淘汰完成: 淘汰 {} 个窗口", evicted);
        }
    }
}

/// 生成一个可取消的周期任务
fn spawn_ticker<F, Fut>(
    core: Arc<ProcessorCore>,
    name: &'static str,
    period: Duration,
    tick: F,
) -> TickerHandle
where
    F: Fn(Arc<ProcessorCore>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

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
                    tick(Arc::clone(&core)).await;
                }
            }
        }
    });

    TickerHandle {
        name,
        cancel: cancel_tx,
        join,
    }
}

/// 实时参数流处理器
pub struct ParameterStreamProcessor {
    core: Arc<ProcessorCore>,
    tickers: Mutex<Vec<TickerHandle>>,
}

impl ParameterStreamProcessor {
    pub fn new(bus: Arc<EventBus>, config: BackboneConfig) -> Self {
        let latest_cache = Arc::new(LatestValueCache::new(Duration::from_secs(
            config.latest_value_ttl_seconds.max(1),
        )));
        Self {
            core: Arc::new(ProcessorCore {
                bus,
                windows: Arc::new(WindowMap::new()),
                latest_cache,
                config,
            }),
            tickers: Mutex::new(Vec::new()),
        }
    }

    /// 启动处理器: 参数流接收循环 + 聚合/告警/淘汰三个周期任务
    pub fn start(&self) {
        let mut tickers = self.tickers.lock().unwrap_or_else(|e| e.into_inner());
        if !tickers.is_empty() {
            tracing::warn!("参数流处理器已在运行，忽略重复启动");
            return;
        }

        let config = &self.core.config;
        tickers.push(self.spawn_intake_loop());
        tickers.push(spawn_ticker(
            Arc::clone(&self.core),
            "aggregation",
            Duration::from_secs(config.aggregation_interval_seconds.max(1)),
            |core| async move { core.run_aggregation_once().await },
        ));
        tickers.push(spawn_ticker(
            Arc::clone(&self.core),
            "alert-check",
            Duration::from_secs(config.alert_check_interval_seconds.max(1)),
            |core| async move { core.run_alert_check_once().await },
        ));
        tickers.push(spawn_ticker(
            Arc::clone(&self.core),
            "eviction",
            Duration::from_secs(config.eviction_interval_minutes.max(1) * 60),
            |core| async move { core.run_eviction_once() },
        ));

        tracing::info!(
            "参数流处理器已启动: window={}min, aggregation={}s, alert={}s, eviction={}min",
            config.window_size_minutes,
            config.aggregation_interval_seconds,
            config.alert_check_interval_seconds,
            config.eviction_interval_minutes
        );
    }

    fn spawn_intake_loop(&self) -> TickerHandle {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let core = Arc::clone(&self.core);
        let mut subscription = self.core.bus.transport().subscribe(PARAMETER_CHANNEL);

        let join = tokio::spawn(async move {
            tracing::info!("参数流接收循环已启动: channel={}", PARAMETER_CHANNEL);
            loop {
                tokio::select! {
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            break;
                        }
                    }
                    received = subscription.recv() => {
                        match received {
                            Ok(raw) => core.handle_raw_message(&raw).await,
                            Err(_) => break,
                        }
                    }
                }
            }
            tracing::info!("参数流接收循环已退出");
        });

        TickerHandle {
            name: "intake",
            cancel: cancel_tx,
            join,
        }
    }

    /// 处理一条参数采集消息（库接口直连入口，语义与通道接收一致）
    pub async fn on_parameter_message(&self, msg: ParameterMessage) {
        self.core.on_parameter_message(msg).await;
    }

    /// 一轮窗口聚合（运维与测试入口，语义与定时聚合一致）
    pub async fn run_aggregation_once(&self) {
        self.core.run_aggregation_once().await;
    }

    /// 一轮告警检查
    pub async fn run_alert_check_once(&self) {
        self.core.run_alert_check_once().await;
    }

    /// 一轮空闲窗口淘汰
    pub fn run_eviction_once(&self) {
        self.core.run_eviction_once();
    }

    /// 停机: 取消接收循环与全部周期任务并等待退出
    pub async fn shutdown(&self) {
        tracing::info!("参数流处理器停机中...");
        let handles: Vec<TickerHandle> = {
            let mut tickers = self.tickers.lock().unwrap_or_else(|e| e.into_inner());
            tickers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.cancel.send(true);
            let _ = handle.join.await;
            tracing::debug!("周期任务已退出: {}", handle.name);
        }
        tracing::info!("参数流处理器已停机");
    }

    // ==========================================
    // 访问器
    // ==========================================

    pub fn windows(&self) -> Arc<WindowMap> {
        Arc::clone(&self.core.windows)
    }

    /// 读取某键的最新值（供看板查询）
    pub fn latest_value(&self, key: &WindowKey) -> Option<ParameterValue> {
        self.core.latest_cache.get(key)
    }
}
