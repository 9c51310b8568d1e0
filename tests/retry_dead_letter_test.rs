// ==========================================
// 重试与死信集成测试
// ==========================================
// 测试目标: 传输失败 → 重试队列 → 额度耗尽 → 死信存储的完整生命周期
// ==========================================


use smart_mes_backbone::bus::REASON_MAX_RETRIES;
use smart_mes_backbone::config::BackboneConfig;
use smart_mes_backbone::domain::{BusAction, DomainEvent};
use test_helpers::{build_bus, build_bus_with_failing_transport};

#[tokio::test]
async fn test_transport_failure_enqueues_retry() {
    let bus = build_bus_with_failing_transport(BackboneConfig::default());

    let result = bus.publish(DomainEvent::new("BatchCreated", "B001")).await;
    assert!(result.is_err());

    // 事件进入重试队列而非丢失
    assert_eq!(bus.retry_queue().len(), 1);
    assert_eq!(bus.metrics().counter("BatchCreated", BusAction::Failed), 1);

    // 存储追加与传输投递并发执行，传输失败不影响持久化
    let stored = bus.store().find_by_aggregate("B001").await.unwrap();
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn test_retry_until_dead_letter() {
    let mut config = BackboneConfig::default();
    // 让重试条目立即到期，扫描一轮即处理一轮
    config.retry_interval_seconds = 0;
    let bus = build_bus_with_failing_transport(config);

    let publish_result = bus.publish(DomainEvent::new("BatchCreated", "B001")).await;
    assert!(publish_result.is_err());
    assert_eq!(bus.retry_queue().len(), 1);

    // 三轮扫描: 每轮重发失败，retry_count 递增并重新入队
    for expected_count in 1..=3u32 {
        bus.run_retry_sweep_once().await;
        assert_eq!(bus.retry_queue().len(), 1, "第 {} 轮后仍应在队列中", expected_count);
        assert_eq!(bus.dead_letters().count("BatchCreated"), 0);
    }
    assert_eq!(bus.metrics().counter("BatchCreated", BusAction::Retried), 0);

    // 第四轮: 额度已耗尽(3 >= 3)，直接转入死信
    bus.run_retry_sweep_once().await;
    assert_eq!(bus.retry_queue().len(), 0);
    assert_eq!(bus.dead_letters().count("BatchCreated"), 1);
    assert_eq!(
        bus.metrics().counter("BatchCreated", BusAction::DeadLetter),
        1
    );

    let records = bus.dead_letters().records("BatchCreated");
    assert_eq!(records[0].reason, REASON_MAX_RETRIES);
    assert_eq!(records[0].retry_count, 3);
    assert!(!records[0].message.is_empty());
    assert!(!records[0].exception.is_empty());

    // 死信事件不再回到重试队列
    bus.run_retry_sweep_once().await;
    assert_eq!(bus.retry_queue().len(), 0);
    assert_eq!(bus.dead_letters().count("BatchCreated"), 1);
}

#[tokio::test]
async fn test_sweep_respects_batch_size() {
    let mut config = BackboneConfig::default();
    config.retry_interval_seconds = 0;
    config.batch_size = 2;
    let bus = build_bus_with_failing_transport(config);

    for i in 0..5 {
        let _ = bus
            .publish(DomainEvent::new("BatchCreated", format!("B{:03}", i)))
            .await;
    }
    assert_eq!(bus.retry_queue().len(), 5);

    // 单轮扫描只处理批量大小内的条目（重发失败全部重新入队）
    bus.run_retry_sweep_once().await;
    assert_eq!(bus.retry_queue().len(), 5);

    // 传输恢复场景: 成功重发的条目离开队列
    let healthy = build_bus(BackboneConfig {
        retry_interval_seconds: 0,
        batch_size: 2,
        ..BackboneConfig::default()
    });
    let failing = bus.retry_queue();
    // 把失败总线中的条目搬到健康总线验证重发成功路径
    for failed in failing.take_due(chrono::Utc::now(), 10) {
        healthy.retry_queue().enqueue(failed);
    }
    assert_eq!(healthy.retry_queue().len(), 5);

    healthy.run_retry_sweep_once().await;
    assert_eq!(healthy.retry_queue().len(), 3);
    healthy.run_retry_sweep_once().await;
    healthy.run_retry_sweep_once().await;
    assert_eq!(healthy.retry_queue().len(), 0);
    assert_eq!(
        healthy.metrics().counter("BatchCreated", BusAction::Retried),
        5
    );
    assert_eq!(healthy.dead_letters().count("BatchCreated"), 0);
}

#[tokio::test]
async fn test_metrics_sweep_snapshots_gauges() {
    let mut config = BackboneConfig::default();
    config.retry_interval_seconds = 3600;
    let bus = build_bus_with_failing_transport(config);

    let _ = bus.publish(DomainEvent::new("BatchCreated", "B001")).await;
    let _ = bus.publish(DomainEvent::new("QualityFailed", "B002")).await;

    bus.run_metrics_sweep_once();
    assert_eq!(bus.metrics().gauge("retry_queue_depth"), 2);
    assert_eq!(bus.metrics().gauge("active_subscriptions"), 0);
}
