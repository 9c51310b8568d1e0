// ==========================================
// 事件存储集成测试
// ==========================================
// 测试目标: 磁盘库上的追加/回查（聚合ID、类型+时间区间）
// ==========================================

use chrono::Utc;
use smart_mes_backbone::db::open_sqlite_connection;
use smart_mes_backbone::domain::DomainEvent;
use smart_mes_backbone::store::{EventStore, SqliteEventStore};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

/// 创建磁盘临时库上的事件存储
///
/// 临时文件需保持存活，随测试结束自动清理。
fn create_disk_store() -> (NamedTempFile, SqliteEventStore) {
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file.path().to_str().unwrap().to_string();
    let conn = Arc::new(Mutex::new(open_sqlite_connection(&db_path).unwrap()));
    let store = SqliteEventStore::new(conn).unwrap();
    (temp_file, store)
}

fn event_with_payload(event_type: &str, aggregate_id: &str, seq: i64) -> (DomainEvent, String) {
    let event = DomainEvent::new(event_type, aggregate_id)
        .with_payload("seq", serde_json::json!(seq));
    let raw = event.to_wire().unwrap();
    (event, raw)
}

#[tokio::test]
async fn test_append_survives_reopen() {
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file.path().to_str().unwrap().to_string();

    {
        let conn = Arc::new(Mutex::new(open_sqlite_connection(&db_path).unwrap()));
        let store = SqliteEventStore::new(conn).unwrap();
        let (event, raw) = event_with_payload("BatchCreated", "B001", 1);
        store.append(&event, &raw).await.unwrap();
    }

    // 重新打开连接: 事件仍在（真正的持久化，而非传输层缓冲）
    let conn = Arc::new(Mutex::new(open_sqlite_connection(&db_path).unwrap()));
    let store = SqliteEventStore::new(conn).unwrap();
    let events = store.find_by_aggregate("B001").await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload_f64("seq"), Some(1.0));
}

#[tokio::test]
async fn test_aggregate_history_in_occurrence_order() {
    let (_temp_file, store) = create_disk_store();

    // 乱序写入，occurred_on 各不相同
    let mut e2 = DomainEvent::new("QualityFailed", "B001");
    e2.occurred_on = Utc::now() - chrono::Duration::minutes(5);
    let mut e1 = DomainEvent::new("BatchCreated", "B001");
    e1.occurred_on = Utc::now() - chrono::Duration::minutes(10);
    let e3 = DomainEvent::new("EquipmentFaulted", "B001");

    for event in [&e2, &e1, &e3] {
        let raw = event.to_wire().unwrap();
        store.append(event, &raw).await.unwrap();
    }

    let history = store.find_by_aggregate("B001").await.unwrap();
    let types: Vec<&str> = history.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec!["BatchCreated", "QualityFailed", "EquipmentFaulted"]
    );
}

#[tokio::test]
async fn test_type_time_range_query_boundaries() {
    let (_temp_file, store) = create_disk_store();
    let now = Utc::now();

    for (offset, seq) in [(-30i64, 1i64), (-3, 2), (-1, 3)] {
        let mut event = DomainEvent::new("ParameterCollected", "P1")
            .with_payload("seq", serde_json::json!(seq));
        event.occurred_on = now + chrono::Duration::minutes(offset);
        let raw = event.to_wire().unwrap();
        store.append(&event, &raw).await.unwrap();
    }
    // 其他类型不纳入
    let (other, other_raw) = event_with_payload("BatchCreated", "P1", 99);
    store.append(&other, &other_raw).await.unwrap();

    let from = now - chrono::Duration::minutes(5);
    let to = now + chrono::Duration::minutes(1);
    let events = store
        .find_by_type_in_range("ParameterCollected", from, to)
        .await
        .unwrap();

    let seqs: Vec<f64> = events.iter().filter_map(|e| e.payload_f64("seq")).collect();
    assert_eq!(seqs, vec![2.0, 3.0]);
}

#[tokio::test]
async fn test_empty_aggregate_returns_empty() {
    let (_temp_file, store) = create_disk_store();
    let events = store.find_by_aggregate("不存在").await.unwrap();
    assert!(events.is_empty());
}
