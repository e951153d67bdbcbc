//! Repository for the durable sync queue and its dead-letter table.
//!
//! Queue ids come from AUTOINCREMENT, so draining by ascending id
//! replays mutations in the exact order they were made.

use serde_json::{Map, Value};
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::StoreError;
use crate::models::{now_millis, DeadLetter, EntityKind, QueueEntry, SyncAction};

pub struct SyncQueue {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: i64,
    kind: String,
    action: String,
    record_key: String,
    fields: String,
    row_index: Option<i64>,
    queued_at: i64,
    retries: i64,
}

impl QueueRow {
    fn hydrate(self) -> Result<QueueEntry, StoreError> {
        let kind = EntityKind::parse(&self.kind)
            .ok_or_else(|| StoreError::InvalidData(format!("unknown entity kind '{}'", self.kind)))?;
        let action: SyncAction = self
            .action
            .parse()
            .map_err(StoreError::InvalidData)?;
        let fields: Map<String, Value> = serde_json::from_str(&self.fields)?;
        Ok(QueueEntry {
            id: self.id,
            kind,
            action,
            key: self.record_key,
            fields,
            row_index: self.row_index,
            queued_at: self.queued_at,
            retries: self.retries,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    queue_id: i64,
    kind: String,
    action: String,
    record_key: String,
    fields: String,
    retries: i64,
    abandoned_at: i64,
}

impl DeadLetterRow {
    fn hydrate(self) -> Result<DeadLetter, StoreError> {
        let kind = EntityKind::parse(&self.kind)
            .ok_or_else(|| StoreError::InvalidData(format!("unknown entity kind '{}'", self.kind)))?;
        let action: SyncAction = self
            .action
            .parse()
            .map_err(StoreError::InvalidData)?;
        let fields: Map<String, Value> = serde_json::from_str(&self.fields)?;
        Ok(DeadLetter {
            queue_id: self.queue_id,
            kind,
            action,
            key: self.record_key,
            fields,
            retries: self.retries,
            abandoned_at: self.abandoned_at,
        })
    }
}

impl SyncQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a mutation to the tail of the queue. Returns its id.
    pub async fn enqueue(
        &self,
        kind: EntityKind,
        action: SyncAction,
        key: &str,
        fields: &Map<String, Value>,
        row_index: Option<i64>,
    ) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::enqueue_in(&mut conn, kind, action, key, fields, row_index).await
    }

    /// Transaction-scoped variant of [`SyncQueue::enqueue`].
    pub async fn enqueue_in(
        conn: &mut SqliteConnection,
        kind: EntityKind,
        action: SyncAction,
        key: &str,
        fields: &Map<String, Value>,
        row_index: Option<i64>,
    ) -> Result<i64, StoreError> {
        let fields = serde_json::to_string(fields)?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sync_queue (kind, action, record_key, fields, row_index, queued_at, retries)
            VALUES (?, ?, ?, ?, ?, ?, 0)
            RETURNING id
            "#,
        )
        .bind(kind.to_string())
        .bind(action.to_string())
        .bind(key)
        .bind(&fields)
        .bind(row_index)
        .bind(now_millis())
        .fetch_one(conn)
        .await?;
        Ok(id)
    }

    /// Every pending entry in enqueue order.
    pub async fn drain_order(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let rows: Vec<QueueRow> = sqlx::query_as(
            "SELECT id, kind, action, record_key, fields, row_index, queued_at, retries
             FROM sync_queue ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(QueueRow::hydrate).collect()
    }

    pub async fn remove(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn increment_retries(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE sync_queue SET retries = retries + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn len(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    /// Move an exhausted entry out of the queue into the dead-letter
    /// table, in one transaction so the entry cannot exist in both.
    pub async fn move_to_dead_letters(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        let fields = serde_json::to_string(&entry.fields)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO dead_letters
                (queue_id, kind, action, record_key, fields, retries, abandoned_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id)
        .bind(entry.kind.to_string())
        .bind(entry.action.to_string())
        .bind(&entry.key)
        .bind(&fields)
        .bind(entry.retries)
        .bind(now_millis())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(entry.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError> {
        let rows: Vec<DeadLetterRow> = sqlx::query_as(
            "SELECT queue_id, kind, action, record_key, fields, retries, abandoned_at
             FROM dead_letters ORDER BY abandoned_at ASC, queue_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DeadLetterRow::hydrate).collect()
    }

    pub async fn dead_letter_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use serde_json::json;
    use tempfile::TempDir;

    struct TestContext {
        queue: SyncQueue,
        _temp_dir: TempDir,
    }

    async fn setup() -> TestContext {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let pool = init_db(&db_path).await.unwrap();
        TestContext {
            queue: SyncQueue::new(pool),
            _temp_dir: temp_dir,
        }
    }

    fn fields(date: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("date".to_string(), json!(date));
        map.insert("weight_kg".to_string(), json!(71.0));
        map
    }

    #[tokio::test]
    async fn test_drain_order_is_fifo() {
        let ctx = setup().await;
        let f = fields("2026-03-01");

        ctx.queue
            .enqueue(EntityKind::Health, SyncAction::Append, "1", &f, None)
            .await
            .unwrap();
        ctx.queue
            .enqueue(EntityKind::Water, SyncAction::Append, "1", &f, None)
            .await
            .unwrap();
        ctx.queue
            .enqueue(EntityKind::Health, SyncAction::Update, "1", &f, Some(3))
            .await
            .unwrap();

        let entries = ctx.queue.drain_order().await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, EntityKind::Health);
        assert_eq!(entries[0].action, SyncAction::Append);
        assert_eq!(entries[1].kind, EntityKind::Water);
        assert_eq!(entries[2].action, SyncAction::Update);
        assert_eq!(entries[2].row_index, Some(3));
        assert!(entries[0].id < entries[1].id && entries[1].id < entries[2].id);
    }

    #[tokio::test]
    async fn test_remove_and_len() {
        let ctx = setup().await;
        let f = fields("2026-03-01");

        let id = ctx
            .queue
            .enqueue(EntityKind::Health, SyncAction::Append, "1", &f, None)
            .await
            .unwrap();
        assert_eq!(ctx.queue.len().await.unwrap(), 1);

        ctx.queue.remove(id).await.unwrap();
        assert!(ctx.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_increment_retries() {
        let ctx = setup().await;
        let f = fields("2026-03-01");
        let id = ctx
            .queue
            .enqueue(EntityKind::Health, SyncAction::Append, "1", &f, None)
            .await
            .unwrap();

        ctx.queue.increment_retries(id).await.unwrap();
        ctx.queue.increment_retries(id).await.unwrap();

        let entries = ctx.queue.drain_order().await.unwrap();
        assert_eq!(entries[0].retries, 2);
    }

    #[tokio::test]
    async fn test_move_to_dead_letters() {
        let ctx = setup().await;
        let f = fields("2026-03-01");
        ctx.queue
            .enqueue(EntityKind::Health, SyncAction::Append, "1", &f, None)
            .await
            .unwrap();

        let entry = ctx.queue.drain_order().await.unwrap().remove(0);
        ctx.queue.move_to_dead_letters(&entry).await.unwrap();

        assert!(ctx.queue.is_empty().await.unwrap());
        let dead = ctx.queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].queue_id, entry.id);
        assert_eq!(dead[0].kind, EntityKind::Health);
        assert_eq!(dead[0].key, "1");
        assert_eq!(ctx.queue.dead_letter_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ids_are_not_reused_after_removal() {
        let ctx = setup().await;
        let f = fields("2026-03-01");

        let first = ctx
            .queue
            .enqueue(EntityKind::Health, SyncAction::Append, "1", &f, None)
            .await
            .unwrap();
        ctx.queue.remove(first).await.unwrap();
        let second = ctx
            .queue
            .enqueue(EntityKind::Health, SyncAction::Append, "2", &f, None)
            .await
            .unwrap();

        assert!(second > first);
    }
}
