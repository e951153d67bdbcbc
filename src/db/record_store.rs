//! Repository for the per-kind record tables.
//!
//! Every kind stores the same shape: a key, the JSON field map and the
//! sync metadata columns. The `date` column is denormalized out of the
//! field map so date-indexed kinds can range-scan without decoding.

use serde_json::{Map, Value};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};

use crate::error::StoreError;
use crate::models::{EntityKind, Record, RecordQuery};

pub struct RecordStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    key: String,
    fields: String,
    synced: bool,
    modified: i64,
    deleted: bool,
    row_index: Option<i64>,
}

impl RecordRow {
    fn hydrate(self) -> Result<Record, StoreError> {
        let fields: Map<String, Value> = serde_json::from_str(&self.fields)?;
        Ok(Record {
            key: self.key,
            fields,
            synced: self.synced,
            modified: self.modified,
            deleted: self.deleted,
            row_index: self.row_index,
        })
    }
}

impl RecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a record under its key.
    pub async fn put(&self, kind: EntityKind, record: &Record) -> Result<(), StoreError> {
        put_record(&self.pool, kind, record).await
    }

    /// Transaction-scoped variant of [`RecordStore::put`].
    pub async fn put_in(
        conn: &mut SqliteConnection,
        kind: EntityKind,
        record: &Record,
    ) -> Result<(), StoreError> {
        put_record(conn, kind, record).await
    }

    pub async fn get_by_key(
        &self,
        kind: EntityKind,
        key: &str,
    ) -> Result<Option<Record>, StoreError> {
        let sql = format!(
            "SELECT key, fields, synced, modified, deleted, row_index FROM {} WHERE key = ?",
            kind.table()
        );
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(RecordRow::hydrate).transpose()
    }

    /// Live records matching the query, in date order (insertion order
    /// for undated kinds). Tombstones are never returned here.
    pub async fn read_all(
        &self,
        kind: EntityKind,
        query: &RecordQuery,
    ) -> Result<Vec<Record>, StoreError> {
        let mut sql = format!(
            "SELECT key, fields, synced, modified, deleted, row_index FROM {} WHERE deleted = 0",
            kind.table()
        );
        let mut binds: Vec<String> = Vec::new();

        if let Some(date) = query.date {
            sql.push_str(" AND date = ?");
            binds.push(date.to_string());
        } else {
            if let Some(from) = query.from {
                sql.push_str(" AND date >= ?");
                binds.push(from.to_string());
            }
            if let Some(to) = query.to {
                sql.push_str(" AND date <= ?");
                binds.push(to.to_string());
            }
        }

        if kind.is_date_indexed() {
            sql.push_str(" ORDER BY date ASC, rowid ASC");
        } else {
            sql.push_str(" ORDER BY rowid ASC");
        }

        let mut q = sqlx::query_as::<Sqlite, RecordRow>(&sql);
        for bind in &binds {
            q = q.bind(bind);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut records = rows
            .into_iter()
            .map(RecordRow::hydrate)
            .collect::<Result<Vec<_>, _>>()?;

        // Limit keeps the most recent records, so trim from the front.
        if let Some(limit) = query.limit {
            let excess = records.len().saturating_sub(limit as usize);
            records.drain(..excess);
        }

        Ok(records)
    }

    /// Every stored record of the kind, tombstones included.
    pub async fn scan_all(&self, kind: EntityKind) -> Result<Vec<Record>, StoreError> {
        let sql = format!(
            "SELECT key, fields, synced, modified, deleted, row_index FROM {} ORDER BY rowid ASC",
            kind.table()
        );
        let rows: Vec<RecordRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(RecordRow::hydrate).collect()
    }

    /// Physically remove a record. Used to purge confirmed tombstones.
    pub async fn delete_by_key(&self, kind: EntityKind, key: &str) -> Result<(), StoreError> {
        let sql = format!("DELETE FROM {} WHERE key = ?", kind.table());
        sqlx::query(&sql).bind(key).execute(&self.pool).await?;
        Ok(())
    }

    /// Flag a record as accepted by the backend, recording the row
    /// position when the backend reported one.
    pub async fn mark_synced(
        &self,
        kind: EntityKind,
        key: &str,
        row_index: Option<i64>,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET synced = 1, row_index = COALESCE(?, row_index) WHERE key = ?",
            kind.table()
        );
        sqlx::query(&sql)
            .bind(row_index)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Next value of the kind's key counter, as a string key. Counters
    /// only move forward; keys are never reused.
    pub async fn allocate_key(&self, kind: EntityKind) -> Result<String, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::allocate_key_in(&mut conn, kind).await
    }

    /// Transaction-scoped variant of [`RecordStore::allocate_key`].
    pub async fn allocate_key_in(
        conn: &mut SqliteConnection,
        kind: EntityKind,
    ) -> Result<String, StoreError> {
        let next: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO key_counters (kind, next_key) VALUES (?, 1)
            ON CONFLICT(kind) DO UPDATE SET next_key = next_key + 1
            RETURNING next_key
            "#,
        )
        .bind(kind.to_string())
        .fetch_one(conn)
        .await?;
        Ok(next.to_string())
    }
}

async fn put_record<'e, E>(exec: E, kind: EntityKind, record: &Record) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let fields = serde_json::to_string(&record.fields)?;
    let date = record.fields.get("date").and_then(Value::as_str);
    let sql = format!(
        r#"
        INSERT OR REPLACE INTO {} (key, fields, date, synced, modified, deleted, row_index)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
        kind.table()
    );
    sqlx::query(&sql)
        .bind(&record.key)
        .bind(&fields)
        .bind(date)
        .bind(record.synced)
        .bind(record.modified)
        .bind(record.deleted)
        .bind(record.row_index)
        .execute(exec)
        .await?;
    Ok(())
}
