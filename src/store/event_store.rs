// ==========================================
// 智能工厂MES - 事件存储适配器
// ==========================================
// 职责: 事件追加写入 event_store 表，按聚合ID / 类型+时间区间回查
// 说明: 总线在发布路径调用 append；告警检测按类型+时间区间回查。
//       存储失败不阻断传输投递，仅向发布方上抛。
// ==========================================

use crate::domain::DomainEvent;
use crate::store::error::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};

/// 时间列统一格式: 定长微秒 + Z 后缀，保证字典序即时间序
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// 事件存储接口
///
/// 窄契约：追加 + 两种回查。实体 CRUD、报表等均不经由此接口。
#[async_trait]
pub trait EventStore: Send + Sync {
    /// 追加一条事件记录
    ///
    /// # 参数
    /// - event: 已盖发布注记的事件
    /// - raw: 总线产出的规范化 JSON（与传输层投递内容一致）
    async fn append(&self, event: &DomainEvent, raw: &str) -> StoreResult<()>;

    /// 按聚合ID回查（按发生时间升序）
    async fn find_by_aggregate(&self, aggregate_id: &str) -> StoreResult<Vec<DomainEvent>>;

    /// 按事件类型 + 时间区间回查（左闭右开，按发生时间升序）
    async fn find_by_type_in_range(
        &self,
        event_type: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<DomainEvent>>;
}

/// SQLite 事件存储
pub struct SqliteEventStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEventStore {
    /// 创建事件存储并确保表结构存在
    pub fn new(conn: Arc<Mutex<Connection>>) -> StoreResult<Self> {
        let store = Self { conn };
        store.ensure_event_table()?;
        Ok(store)
    }

    /// 确保事件表存在
    fn ensure_event_table(&self) -> StoreResult<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::LockError(format!("锁获取失败: {}", e)))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS event_store (
                event_id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                aggregate_id TEXT,
                occurred_on TEXT NOT NULL,
                user_id TEXT,
                message TEXT NOT NULL,
                stored_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_event_store_aggregate
              ON event_store(aggregate_id, occurred_on);

            CREATE INDEX IF NOT EXISTS idx_event_store_type_time
              ON event_store(event_type, occurred_on);
            "#,
        )?;
        Ok(())
    }

    /// 查询结果行还原为事件
    fn parse_rows(rows: Vec<String>) -> StoreResult<Vec<DomainEvent>> {
        let mut events = Vec::with_capacity(rows.len());
        for raw in rows {
            let event = DomainEvent::from_wire(&raw)
                .map_err(|e| StoreError::CorruptedRecord(e.to_string()))?;
            events.push(event);
        }
        Ok(events)
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append(&self, event: &DomainEvent, raw: &str) -> StoreResult<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::LockError(format!("锁获取失败: {}", e)))?;

        conn.execute(
            r#"
            INSERT INTO event_store (
                event_id, event_type, aggregate_id, occurred_on, user_id, message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                event.event_id.to_string(),
                event.event_type,
                event.aggregate_id,
                ts(&event.occurred_on),
                event.user_id,
                raw,
            ],
        )?;

        tracing::debug!(
            "事件已持久化: event_type={}, event_id={}",
            event.event_type,
            event.event_id
        );
        Ok(())
    }

    async fn find_by_aggregate(&self, aggregate_id: &str) -> StoreResult<Vec<DomainEvent>> {
        let rows = {
            let conn = self
                .conn
                .lock()
                .map_err(|e| StoreError::LockError(format!("锁获取失败: {}", e)))?;

            let mut stmt = conn.prepare(
                "SELECT message FROM event_store
                 WHERE aggregate_id = ?1
                 ORDER BY occurred_on ASC",
            )?;
            let mapped = stmt.query_map(params![aggregate_id], |row| row.get::<_, String>(0))?;

            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row?);
            }
            rows
        };

        Self::parse_rows(rows)
    }

    async fn find_by_type_in_range(
        &self,
        event_type: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<DomainEvent>> {
        let rows = {
            let conn = self
                .conn
                .lock()
                .map_err(|e| StoreError::LockError(format!("锁获取失败: {}", e)))?;

            let mut stmt = conn.prepare(
                "SELECT message FROM event_store
                 WHERE event_type = ?1 AND occurred_on >= ?2 AND occurred_on < ?3
                 ORDER BY occurred_on ASC",
            )?;
            let mapped = stmt.query_map(
                params![event_type, ts(&from), ts(&to)],
                |row| row.get::<_, String>(0),
            )?;

            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row?);
            }
            rows
        };

        Self::parse_rows(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory_connection;

    fn setup_store() -> SqliteEventStore {
        let conn = Arc::new(Mutex::new(open_in_memory_connection().unwrap()));
        SqliteEventStore::new(conn).unwrap()
    }

    fn sample_event(event_type: &str, aggregate_id: &str) -> (DomainEvent, String) {
        let event = DomainEvent::new(event_type, aggregate_id)
            .with_payload("value", serde_json::json!(1.0));
        let raw = event.to_wire().unwrap();
        (event, raw)
    }

    #[tokio::test]
    async fn test_append_and_find_by_aggregate() {
        let store = setup_store();

        let (e1, raw1) = sample_event("BatchCreated", "B001");
        let (e2, raw2) = sample_event("QualityFailed", "B001");
        let (e3, raw3) = sample_event("BatchCreated", "B002");
        store.append(&e1, &raw1).await.unwrap();
        store.append(&e2, &raw2).await.unwrap();
        store.append(&e3, &raw3).await.unwrap();

        let events = store.find_by_aggregate("B001").await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.aggregate_id == "B001"));
    }

    #[tokio::test]
    async fn test_find_by_type_in_range() {
        let store = setup_store();

        let mut old = DomainEvent::new("ParameterCollected", "P1");
        old.occurred_on = Utc::now() - chrono::Duration::minutes(30);
        let raw_old = old.to_wire().unwrap();
        store.append(&old, &raw_old).await.unwrap();

        let (recent, raw_recent) = sample_event("ParameterCollected", "P1");
        store.append(&recent, &raw_recent).await.unwrap();

        let from = Utc::now() - chrono::Duration::minutes(5);
        let to = Utc::now() + chrono::Duration::minutes(1);
        let events = store
            .find_by_type_in_range("ParameterCollected", from, to)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, recent.event_id);
    }

    #[tokio::test]
    async fn test_duplicate_event_id_rejected() {
        let store = setup_store();
        let (event, raw) = sample_event("BatchCreated", "B001");

        store.append(&event, &raw).await.unwrap();
        let result = store.append(&event, &raw).await;
        assert!(result.is_err());
    }
}
