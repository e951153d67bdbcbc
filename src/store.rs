//! Public store facade.
//!
//! Reads and writes always hit local storage first and never wait on
//! the network. Every mutation lands in the record store and the sync
//! queue in one transaction, then opportunistically kicks the engine;
//! reads schedule a background pull when their range has gone stale.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{self, RecordStore, SyncQueue};
use crate::error::StoreError;
use crate::models::{
    now_millis, DeadLetter, EntityKind, KeyMode, Record, RecordQuery, SyncAction,
};
use crate::sync::{Gateway, HttpGateway, SyncEngine, SyncOutcome, SYNC_INTERVAL};

/// A pulled range counts as fresh for this long; reads within the
/// window do not schedule another pull.
pub const PULL_STALENESS: Duration = Duration::from_secs(300);

/// Queue depth and connectivity, for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub pending: u64,
    pub dead_letters: u64,
    pub online: bool,
    pub configured: bool,
    pub last_outcome: Option<SyncOutcome>,
}

/// Full dump of local data for backups, keyed by sheet name.
#[derive(Debug, Serialize)]
pub struct ExportData {
    pub exported_at: String,
    pub entities: BTreeMap<&'static str, Vec<Record>>,
}

pub struct HealthStore<G> {
    pool: SqlitePool,
    records: RecordStore,
    queue: SyncQueue,
    engine: Arc<SyncEngine<G>>,
    last_pull: Mutex<HashMap<String, Instant>>,
}

impl HealthStore<HttpGateway> {
    /// Open the store described by the configuration.
    pub async fn open(config: &Config) -> Result<Self, StoreError> {
        let pool = db::init_db(&config.database_path.value).await?;
        let gateway = config.sync.script_url.clone().map(HttpGateway::new);
        Ok(Self::with_gateway(pool, gateway))
    }
}

impl<G: Gateway> HealthStore<G> {
    /// Wire a store over an already-open pool. `None` leaves the store
    /// local-only; sync operations become no-ops.
    pub fn with_gateway(pool: SqlitePool, gateway: Option<G>) -> Self {
        let engine = Arc::new(SyncEngine::new(pool.clone(), gateway));
        Self {
            records: RecordStore::new(pool.clone()),
            queue: SyncQueue::new(pool.clone()),
            pool,
            engine,
            last_pull: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine<G>> {
        &self.engine
    }

    /// Read records from local storage. Never blocks on the network; a
    /// stale range schedules a background pull as a side effect.
    pub async fn get(
        &self,
        kind: EntityKind,
        query: &RecordQuery,
    ) -> Result<Vec<Record>, StoreError> {
        let records = self.records.read_all(kind, query).await?;
        self.maybe_schedule_pull(kind, query);
        Ok(records)
    }

    pub async fn get_by_key(
        &self,
        kind: EntityKind,
        key: &str,
    ) -> Result<Option<Record>, StoreError> {
        Ok(self
            .records
            .get_by_key(kind, key)
            .await?
            .filter(|r| !r.deleted))
    }

    /// Persist a new record and queue it for the backend, in one
    /// transaction. Succeeds locally no matter the connectivity.
    pub async fn save(
        &self,
        kind: EntityKind,
        mut fields: Map<String, Value>,
    ) -> Result<Record, StoreError> {
        let mut tx = self.pool.begin().await?;
        let key = match kind.key_mode() {
            KeyMode::Auto => RecordStore::allocate_key_in(&mut tx, kind).await?,
            KeyMode::Generated(field) => match field_string(&fields, field) {
                Some(id) => id,
                None => {
                    let id = Uuid::new_v4().to_string();
                    fields.insert(field.to_string(), Value::String(id.clone()));
                    id
                }
            },
            KeyMode::Semantic(field) => {
                field_string(&fields, field).ok_or(StoreError::MissingKeyField { kind, field })?
            }
        };

        let record = Record::new(key, fields);
        // Key-value kinds are pushed as a full-sheet replace, so their
        // inserts queue as updates.
        let action = if kind.is_key_value() {
            SyncAction::Update
        } else {
            SyncAction::Append
        };
        RecordStore::put_in(&mut tx, kind, &record).await?;
        SyncQueue::enqueue_in(
            &mut tx,
            kind,
            action,
            &record.key,
            &record.fields,
            record.row_index,
        )
        .await?;
        tx.commit().await?;

        debug!(kind = %kind, key = %record.key, "record saved");
        self.engine.request_cycle();
        Ok(record)
    }

    /// Merge a partial field patch into an existing record and queue
    /// the update. Returns `None` when the key does not exist locally
    /// (tombstones count as absent).
    pub async fn update(
        &self,
        kind: EntityKind,
        key: &str,
        patch: Map<String, Value>,
    ) -> Result<Option<Record>, StoreError> {
        let Some(mut record) = self.records.get_by_key(kind, key).await? else {
            return Ok(None);
        };
        if record.deleted {
            return Ok(None);
        }

        for (name, value) in patch {
            record.fields.insert(name, value);
        }
        record.modified = now_millis();
        record.synced = false;

        let mut tx = self.pool.begin().await?;
        RecordStore::put_in(&mut tx, kind, &record).await?;
        SyncQueue::enqueue_in(
            &mut tx,
            kind,
            SyncAction::Update,
            key,
            &record.fields,
            record.row_index,
        )
        .await?;
        tx.commit().await?;

        debug!(kind = %kind, key = %key, "record updated");
        self.engine.request_cycle();
        Ok(Some(record))
    }

    /// Soft-delete: the record becomes a tombstone, invisible to
    /// reads, and is purged once the backend confirms the deletion.
    pub async fn delete(&self, kind: EntityKind, key: &str) -> Result<bool, StoreError> {
        let Some(mut record) = self.records.get_by_key(kind, key).await? else {
            return Ok(false);
        };
        if record.deleted {
            return Ok(false);
        }

        record.deleted = true;
        record.synced = false;
        record.modified = now_millis();

        let mut tx = self.pool.begin().await?;
        RecordStore::put_in(&mut tx, kind, &record).await?;
        SyncQueue::enqueue_in(
            &mut tx,
            kind,
            SyncAction::Delete,
            key,
            &record.fields,
            record.row_index,
        )
        .await?;
        tx.commit().await?;

        debug!(kind = %kind, key = %key, "record deleted");
        self.engine.request_cycle();
        Ok(true)
    }

    /// Value of one profile entry, if set.
    pub async fn profile_value(&self, name: &str) -> Result<Option<Value>, StoreError> {
        let record = self.records.get_by_key(EntityKind::Profile, name).await?;
        Ok(record
            .filter(|r| !r.deleted)
            .and_then(|r| r.fields.get("value").cloned())
            .filter(|v| !v.is_null()))
    }

    /// Upsert one profile entry, keeping any known sheet position so
    /// the next full-sheet push lands on the same rows.
    pub async fn set_profile_value(
        &self,
        name: &str,
        value: Value,
    ) -> Result<Record, StoreError> {
        let existing = self.records.get_by_key(EntityKind::Profile, name).await?;

        let mut fields = Map::new();
        fields.insert("key".to_string(), Value::String(name.to_string()));
        fields.insert("value".to_string(), value);
        let mut record = Record::new(name, fields);
        if let Some(prev) = existing {
            record.row_index = prev.row_index;
        }

        let mut tx = self.pool.begin().await?;
        RecordStore::put_in(&mut tx, EntityKind::Profile, &record).await?;
        SyncQueue::enqueue_in(
            &mut tx,
            EntityKind::Profile,
            SyncAction::Update,
            &record.key,
            &record.fields,
            record.row_index,
        )
        .await?;
        tx.commit().await?;

        self.engine.request_cycle();
        Ok(record)
    }

    /// Run one full sync cycle and wait for its outcome. Returns zero
    /// counters when unconfigured or offline.
    pub async fn sync_now(&self) -> Result<SyncOutcome, StoreError> {
        self.engine.sync_now().await
    }

    pub async fn status(&self) -> Result<StoreStatus, StoreError> {
        Ok(StoreStatus {
            pending: self.queue.len().await?,
            dead_letters: self.queue.dead_letter_count().await?,
            online: self.engine.is_online(),
            configured: self.engine.is_configured(),
            last_outcome: self.engine.last_outcome(),
        })
    }

    /// Mutations abandoned after exhausting their retries.
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError> {
        self.queue.dead_letters().await
    }

    /// Receiver of sync-cycle outcomes, for refresh hooks.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncOutcome> {
        self.engine.subscribe()
    }

    /// Everything stored locally, tombstones included.
    pub async fn export(&self) -> Result<ExportData, StoreError> {
        let mut entities = BTreeMap::new();
        for kind in EntityKind::ALL {
            entities.insert(kind.sheet_name(), self.records.scan_all(kind).await?);
        }
        Ok(ExportData {
            exported_at: chrono::Utc::now().to_rfc3339(),
            entities,
        })
    }

    /// Wipe all local data: records, queue, dead letters and key
    /// counters. The backend is left untouched.
    pub async fn clear(&self) -> Result<(), StoreError> {
        db::wipe_all(&self.pool).await?;
        if let Ok(mut stamps) = self.last_pull.lock() {
            stamps.clear();
        }
        Ok(())
    }

    /// Spawn the periodic sync loop; it runs until the handle is
    /// dropped by process exit or aborted.
    pub fn start_background_sync(&self) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(engine.run_timer(SYNC_INTERVAL))
    }

    fn maybe_schedule_pull(&self, kind: EntityKind, query: &RecordQuery) {
        if !self.engine.is_configured() || !self.engine.is_online() {
            return;
        }
        let range_key = format!("{kind}|{}", query.cache_key());
        {
            let Ok(mut stamps) = self.last_pull.lock() else {
                return;
            };
            if let Some(pulled_at) = stamps.get(&range_key) {
                if pulled_at.elapsed() < PULL_STALENESS {
                    return;
                }
            }
            // Stamp before the pull resolves so concurrent reads of the
            // same range cannot schedule duplicates.
            stamps.insert(range_key, Instant::now());
        }

        let engine = Arc::clone(&self.engine);
        let query = query.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.pull(kind, query).await {
                warn!(kind = %kind, "scheduled pull failed: {e}");
            }
        });
    }
}

fn field_string(fields: &Map<String, Value>, field: &str) -> Option<String> {
    fields
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::sync::testing::{Call, MockGateway};
    use serde_json::json;
    use tempfile::TempDir;

    struct TestContext {
        store: HealthStore<MockGateway>,
        gateway: MockGateway,
        _temp_dir: TempDir,
    }

    /// Store with a healthy scripted backend.
    async fn setup() -> TestContext {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_db(&temp_dir.path().join("test.db")).await.unwrap();
        let gateway = MockGateway::new();
        TestContext {
            store: HealthStore::with_gateway(pool, Some(gateway.clone())),
            gateway,
            _temp_dir: temp_dir,
        }
    }

    /// Store with no backend configured, so nothing races the queue.
    async fn setup_local() -> (HealthStore<MockGateway>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_db(&temp_dir.path().join("test.db")).await.unwrap();
        (HealthStore::with_gateway(pool, None), temp_dir)
    }

    fn weight_fields(date: &str, weight: f64) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("date".to_string(), json!(date));
        fields.insert("weight_kg".to_string(), json!(weight));
        fields
    }

    #[tokio::test]
    async fn test_save_assigns_sequential_keys_and_queues_append() {
        let (store, _dir) = setup_local().await;

        let first = store
            .save(EntityKind::Health, weight_fields("2026-03-01", 71.2))
            .await
            .unwrap();
        let second = store
            .save(EntityKind::Health, weight_fields("2026-03-02", 70.9))
            .await
            .unwrap();

        assert_eq!(first.key, "1");
        assert_eq!(second.key, "2");
        assert!(!first.synced);

        let entries = store.queue.drain_order().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.action == SyncAction::Append));
        assert_eq!(entries[0].key, "1");
    }

    #[tokio::test]
    async fn test_read_after_write_sees_unsynced_record() {
        let (store, _dir) = setup_local().await;
        store
            .save(EntityKind::Health, weight_fields("2026-03-01", 71.2))
            .await
            .unwrap();

        let on_date = store
            .get(
                EntityKind::Health,
                &RecordQuery::on("2026-03-01".parse().unwrap()),
            )
            .await
            .unwrap();
        assert_eq!(on_date.len(), 1);
        assert_eq!(on_date[0].fields["weight_kg"], json!(71.2));
        assert!(!on_date[0].synced);
    }

    #[tokio::test]
    async fn test_save_generates_uuid_key_when_id_absent() {
        let (store, _dir) = setup_local().await;
        let mut fields = Map::new();
        fields.insert("name".to_string(), json!("stretch"));
        fields.insert("frequency".to_string(), json!("daily"));

        let record = store.save(EntityKind::HabitDefs, fields).await.unwrap();

        assert_eq!(record.fields["id"], json!(record.key.clone()));
        assert!(Uuid::parse_str(&record.key).is_ok());
    }

    #[tokio::test]
    async fn test_save_profile_without_key_field_fails() {
        let (store, _dir) = setup_local().await;
        let mut fields = Map::new();
        fields.insert("value".to_string(), json!("Ada"));

        let err = store.save(EntityKind::Profile, fields).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::MissingKeyField {
                kind: EntityKind::Profile,
                field: "key"
            }
        ));
    }

    #[tokio::test]
    async fn test_update_patches_fields_and_restamps() {
        let (store, _dir) = setup_local().await;
        let saved = store
            .save(EntityKind::Health, weight_fields("2026-03-01", 71.2))
            .await
            .unwrap();

        let mut patch = Map::new();
        patch.insert("weight_kg".to_string(), json!(70.5));
        patch.insert("notes".to_string(), json!("after run"));
        let updated = store
            .update(EntityKind::Health, &saved.key, patch)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.fields["weight_kg"], json!(70.5));
        assert_eq!(updated.fields["date"], json!("2026-03-01"));
        assert!(!updated.synced);
        assert!(updated.modified >= saved.modified);

        let entries = store.queue.drain_order().await.unwrap();
        assert_eq!(entries.last().unwrap().action, SyncAction::Update);

        let missing = store
            .update(EntityKind::Health, "99", Map::new())
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_delete_is_soft_until_confirmed() {
        let (store, _dir) = setup_local().await;
        let saved = store
            .save(EntityKind::Health, weight_fields("2026-03-01", 71.2))
            .await
            .unwrap();

        assert!(store.delete(EntityKind::Health, &saved.key).await.unwrap());

        let visible = store
            .get(EntityKind::Health, &RecordQuery::all())
            .await
            .unwrap();
        assert!(visible.is_empty());

        let raw = store.records.scan_all(EntityKind::Health).await.unwrap();
        assert_eq!(raw.len(), 1);
        assert!(raw[0].deleted);

        // A tombstone reads as absent, so repeated deletes are no-ops.
        assert!(!store.delete(EntityKind::Health, &saved.key).await.unwrap());
        assert!(store
            .update(EntityKind::Health, &saved.key, Map::new())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_profile_value_roundtrip() {
        let (store, _dir) = setup_local().await;
        assert!(store.profile_value("name").await.unwrap().is_none());

        store
            .set_profile_value("name", json!("Ada"))
            .await
            .unwrap();
        assert_eq!(
            store.profile_value("name").await.unwrap(),
            Some(json!("Ada"))
        );

        store
            .set_profile_value("name", json!("Grace"))
            .await
            .unwrap();
        assert_eq!(
            store.profile_value("name").await.unwrap(),
            Some(json!("Grace"))
        );

        let entries = store.queue.drain_order().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.action == SyncAction::Update));
    }

    #[tokio::test]
    async fn test_sync_now_unconfigured_returns_zeros() {
        let (store, _dir) = setup_local().await;
        store
            .save(EntityKind::Health, weight_fields("2026-03-01", 71.2))
            .await
            .unwrap();

        let outcome = store.sync_now().await.unwrap();
        assert_eq!(outcome, SyncOutcome::default());
        assert_eq!(store.queue.len().await.unwrap(), 1);

        let status = store.status().await.unwrap();
        assert!(!status.configured);
        assert_eq!(status.pending, 1);
    }

    #[tokio::test]
    async fn test_saved_record_reaches_backend() {
        let ctx = setup().await;
        let saved = ctx
            .store
            .save(EntityKind::Health, weight_fields("2026-03-01", 71.2))
            .await
            .unwrap();

        ctx.store.sync_now().await.unwrap();

        let record = ctx
            .store
            .get_by_key(EntityKind::Health, &saved.key)
            .await
            .unwrap()
            .unwrap();
        assert!(record.synced);
        assert!(record.row_index.is_some());
        assert!(ctx.store.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_get_schedules_one_pull_per_stale_range() {
        let ctx = setup().await;
        let query = RecordQuery::on("2026-03-01".parse().unwrap());

        ctx.store.get(EntityKind::Health, &query).await.unwrap();
        ctx.store.get(EntityKind::Health, &query).await.unwrap();
        // A different range schedules its own pull.
        ctx.store
            .get(EntityKind::Health, &RecordQuery::all())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reads = ctx
            .gateway
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Read(EntityKind::Health)))
            .count();
        assert_eq!(reads, 2);
    }

    #[tokio::test]
    async fn test_clear_wipes_records_queue_and_counters() {
        let (store, _dir) = setup_local().await;
        store
            .save(EntityKind::Health, weight_fields("2026-03-01", 71.2))
            .await
            .unwrap();
        store.clear().await.unwrap();

        assert!(store
            .get(EntityKind::Health, &RecordQuery::all())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.queue.len().await.unwrap(), 0);

        // Key counters restart from scratch.
        let record = store
            .save(EntityKind::Health, weight_fields("2026-03-02", 70.9))
            .await
            .unwrap();
        assert_eq!(record.key, "1");
    }

    #[tokio::test]
    async fn test_export_covers_all_kinds_with_tombstones() {
        let (store, _dir) = setup_local().await;
        let saved = store
            .save(EntityKind::Health, weight_fields("2026-03-01", 71.2))
            .await
            .unwrap();
        store.delete(EntityKind::Health, &saved.key).await.unwrap();
        store
            .set_profile_value("name", json!("Ada"))
            .await
            .unwrap();

        let export = store.export().await.unwrap();
        assert_eq!(export.entities.len(), EntityKind::ALL.len());
        assert_eq!(export.entities["health"].len(), 1);
        assert!(export.entities["health"][0].deleted);
        assert_eq!(export.entities["profile"].len(), 1);
        assert!(!export.exported_at.is_empty());
    }
}
