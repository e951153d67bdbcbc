mod queue;
mod record_store;

pub use queue::SyncQueue;
pub use record_store::RecordStore;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::models::EntityKind;

/// Initialize the database connection pool and create the schema.
pub async fn init_db(db_path: &Path) -> Result<SqlitePool, sqlx::Error> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;

    Ok(pool)
}

/// Create any missing tables. The schema is derived from the entity
/// catalog, so adding a kind there is enough to get its table.
async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for kind in EntityKind::ALL {
        let table = kind.table();
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                key TEXT PRIMARY KEY,
                fields TEXT NOT NULL,
                date TEXT,
                synced INTEGER NOT NULL DEFAULT 0,
                modified INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                row_index INTEGER
            )
            "#
        ))
        .execute(pool)
        .await?;

        if kind.is_date_indexed() {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_date ON {table} (date)"
            ))
            .execute(pool)
            .await?;
        }
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            action TEXT NOT NULL,
            record_key TEXT NOT NULL,
            fields TEXT NOT NULL,
            row_index INTEGER,
            queued_at INTEGER NOT NULL,
            retries INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dead_letters (
            queue_id INTEGER PRIMARY KEY,
            kind TEXT NOT NULL,
            action TEXT NOT NULL,
            record_key TEXT NOT NULL,
            fields TEXT NOT NULL,
            retries INTEGER NOT NULL,
            abandoned_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS key_counters (
            kind TEXT PRIMARY KEY,
            next_key INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Drop every stored row: records, queue, dead letters and counters.
pub async fn wipe_all(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for kind in EntityKind::ALL {
        sqlx::query(&format!("DELETE FROM {}", kind.table()))
            .execute(pool)
            .await?;
    }
    for table in ["sync_queue", "dead_letters", "key_counters"] {
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(pool)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_init_db_creates_tables() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let pool = init_db(&db_path).await.unwrap();

        // Verify tables exist
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert!(table_names.contains(&"records_health"));
        assert!(table_names.contains(&"records_profile"));
        assert!(table_names.contains(&"sync_queue"));
        assert!(table_names.contains(&"dead_letters"));
        assert!(table_names.contains(&"key_counters"));
    }

    #[tokio::test]
    async fn test_init_db_is_idempotent() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let pool = init_db(&db_path).await.unwrap();
        drop(pool);
        init_db(&db_path).await.unwrap();
    }

    #[tokio::test]
    async fn test_date_index_only_on_dated_kinds() {
        let temp_dir = tempdir().unwrap();
        let pool = init_db(&temp_dir.path().join("test.db")).await.unwrap();

        let indexes: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%'",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        let names: Vec<&str> = indexes.iter().map(|i| i.0.as_str()).collect();
        assert!(names.contains(&"idx_records_health_date"));
        assert!(!names.contains(&"idx_records_profile_date"));
        assert!(!names.contains(&"idx_records_goals_date"));
    }
}
