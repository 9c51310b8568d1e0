// ==========================================
// 智能工厂MES - 事件骨干服务入口
// ==========================================
// 技术栈: Tokio + Rust + SQLite
// 系统定位: 无界面常驻服务，业务模块经由库接口接入
// ==========================================

use smart_mes_backbone::bus::BroadcastTransport;
use smart_mes_backbone::config::ConfigManager;
use smart_mes_backbone::metrics::EventMetrics;
use smart_mes_backbone::store::SqliteEventStore;
use smart_mes_backbone::stream::ParameterStreamProcessor;
use smart_mes_backbone::{db, logging, EventBus};
use std::sync::{Arc, Mutex};

/// 默认数据库路径: {数据目录}/smart-mes-backbone/backbone.db
fn default_db_path() -> anyhow::Result<String> {
    let base = dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("无法确定系统数据目录"))?
        .join("smart-mes-backbone");
    std::fs::create_dir_all(&base)?;
    let path = base.join("backbone.db");
    Ok(path.to_string_lossy().to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统
    logging::init();

    tracing::info!("==================================================");
    tracing::info!("{}", smart_mes_backbone::APP_NAME);
    tracing::info!("系统版本: {}", smart_mes_backbone::VERSION);
    tracing::info!("==================================================");

    // 数据库
    let db_path = default_db_path()?;
    tracing::info!("使用数据库: {}", db_path);
    let conn = Arc::new(Mutex::new(db::open_sqlite_connection(&db_path)?));

    // 配置
    let config_manager = ConfigManager::new(Arc::clone(&conn))?;
    let config = config_manager.load_backbone_config()?;
    tracing::info!(
        "配置已加载: max_retry={}, retry_interval={}s, window={}min, anomaly_threshold={}",
        config.max_retry_attempts,
        config.retry_interval_seconds,
        config.window_size_minutes,
        config.anomaly_threshold
    );

    // 组装骨干
    let store = Arc::new(SqliteEventStore::new(Arc::clone(&conn))?);
    let transport = Arc::new(BroadcastTransport::new(config.channel_capacity));
    let metrics = Arc::new(EventMetrics::new(config.latency_sample_capacity));
    let bus = Arc::new(EventBus::new(transport, store, metrics, config.clone()));
    bus.start();

    let processor = Arc::new(ParameterStreamProcessor::new(Arc::clone(&bus), config));
    processor.start();

    tracing::info!("事件消息骨干已启动，Ctrl-C 退出");
    tokio::signal::ctrl_c().await?;

    // 优雅停机: 先停参数流，再停总线
    tracing::info!("收到退出信号，开始停机");
    processor.shutdown().await;
    bus.shutdown().await;
    tracing::info!("事件消息骨干已退出");

    Ok(())
}
