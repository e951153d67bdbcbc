//! Push/pull sync engine.
//!
//! A cycle drains the local mutation queue to the backend in FIFO
//! order, then pulls today's rows for every date-indexed kind and
//! merges them into the record store. Cycles are serialized behind a
//! lock; triggers that arrive mid-cycle coalesce into one follow-up.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::gateway::{Gateway, GatewayError};
use crate::db::{RecordStore, SyncQueue};
use crate::error::StoreError;
use crate::models::{
    decode_row, encode_row, natural_key_of, now_millis, EntityKind, KeyMode, QueueEntry, Record,
    RecordQuery, SyncAction,
};

/// Pushes are abandoned to the dead-letter table after this many
/// failed attempts.
pub const MAX_RETRIES: i64 = 3;

/// Interval between scheduled background cycles.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Counters from one sync cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub pushed: u64,
    pub pulled: u64,
    pub errors: u64,
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pushed {}, pulled {}, errors {}",
            self.pushed, self.pulled, self.errors
        )
    }
}

/// What the backend said about one queue entry.
enum PushReply {
    Accepted { start_row: Option<i64> },
    Rejected,
    Offline,
}

pub struct SyncEngine<G> {
    records: RecordStore,
    queue: SyncQueue,
    gateway: Option<G>,
    /// Optimistic connectivity flag: assumed online until a transport
    /// failure, restored by a successful ping.
    online: AtomicBool,
    cycle_lock: Mutex<()>,
    follow_up: AtomicBool,
    events: broadcast::Sender<SyncOutcome>,
    last_outcome: StdMutex<Option<SyncOutcome>>,
}

impl<G: Gateway> SyncEngine<G> {
    pub fn new(pool: SqlitePool, gateway: Option<G>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            records: RecordStore::new(pool.clone()),
            queue: SyncQueue::new(pool),
            gateway,
            online: AtomicBool::new(true),
            cycle_lock: Mutex::new(()),
            follow_up: AtomicBool::new(false),
            events,
            last_outcome: StdMutex::new(None),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.gateway.is_some()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn last_outcome(&self) -> Option<SyncOutcome> {
        self.last_outcome.lock().map(|slot| *slot).unwrap_or(None)
    }

    /// Receiver of per-cycle outcomes, for UI refresh hooks.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncOutcome> {
        self.events.subscribe()
    }

    /// Run one full sync cycle now, waiting for any in-flight cycle to
    /// finish first. A no-op returning zero counters when no backend is
    /// configured or the backend is unreachable.
    pub async fn sync_now(&self) -> Result<SyncOutcome, StoreError> {
        let Some(gateway) = &self.gateway else {
            debug!("sync requested with no backend configured");
            return Ok(SyncOutcome::default());
        };
        if !self.is_online() && !self.probe(gateway).await {
            debug!("offline, skipping sync cycle");
            return Ok(SyncOutcome::default());
        }

        let _guard = self.cycle_lock.lock().await;
        // Requests flagged before this point are satisfied by the cycle
        // about to run; only triggers landing mid-cycle need a follow-up.
        self.follow_up.store(false, Ordering::SeqCst);
        let mut outcome = self.run_cycle(gateway).await?;
        while self.follow_up.swap(false, Ordering::SeqCst) && self.is_online() {
            outcome = self.run_cycle(gateway).await?;
        }
        Ok(outcome)
    }

    /// Fire-and-forget cycle trigger, used after every local mutation.
    /// The request is flagged before racing for the cycle lock, so a
    /// trigger that loses the race is drained by the cycle holding it.
    pub fn request_cycle(self: &Arc<Self>) {
        if self.gateway.is_none() {
            return;
        }
        self.follow_up.store(true, Ordering::SeqCst);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.drain_requests().await {
                warn!("background sync cycle failed: {e}");
            }
        });
    }

    /// Runs cycles only while a request flag is pending. Backs off when
    /// another cycle holds the lock instead of queueing a duplicate.
    async fn drain_requests(&self) -> Result<(), StoreError> {
        let Some(gateway) = &self.gateway else {
            return Ok(());
        };
        if !self.is_online() && !self.probe(gateway).await {
            debug!("offline, skipping requested cycle");
            return Ok(());
        }
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            return Ok(());
        };
        while self.follow_up.swap(false, Ordering::SeqCst) && self.is_online() {
            self.run_cycle(gateway).await?;
        }
        Ok(())
    }

    /// Ping the backend and update the connectivity flag. Regaining
    /// connectivity schedules a cycle to flush whatever queued while
    /// offline.
    pub async fn check_connectivity(self: &Arc<Self>) -> bool {
        let Some(gateway) = &self.gateway else {
            return false;
        };
        let was_online = self.is_online();
        let now_online = self.probe(gateway).await;
        if now_online && !was_online {
            info!("connectivity regained, scheduling sync");
            self.request_cycle();
        }
        now_online
    }

    /// Pull and merge one range outside the regular cycle. Serves the
    /// staleness-gated background refresh behind reads.
    pub async fn pull(&self, kind: EntityKind, query: RecordQuery) -> Result<u64, StoreError> {
        let Some(gateway) = &self.gateway else {
            return Ok(0);
        };
        if !self.is_online() {
            return Ok(0);
        }
        let stamp = now_millis();
        match gateway.read(kind, query).await {
            Ok(resp) if resp.success => {
                let merged = self.merge_rows(kind, &resp.data, stamp).await?;
                debug!(kind = %kind, rows = merged, "background pull merged");
                Ok(merged)
            }
            Ok(resp) => {
                warn!(
                    kind = %kind,
                    error = resp.error.as_deref().unwrap_or("unknown"),
                    "background pull rejected"
                );
                Ok(0)
            }
            Err(e) => {
                self.online.store(false, Ordering::SeqCst);
                warn!(kind = %kind, "background pull failed: {e}");
                Ok(0)
            }
        }
    }

    /// Scheduled cycle loop. The first tick fires immediately, so a
    /// freshly started process syncs right away.
    pub async fn run_timer(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sync_now().await {
                warn!("scheduled sync failed: {e}");
            }
        }
    }

    async fn probe(&self, gateway: &G) -> bool {
        let reachable = matches!(gateway.ping().await, Ok(ack) if ack.success);
        self.online.store(reachable, Ordering::SeqCst);
        reachable
    }

    async fn run_cycle(&self, gateway: &G) -> Result<SyncOutcome, StoreError> {
        let (pushed, push_errors) = self.push_phase(gateway).await?;
        let (pulled, pull_errors) = self.pull_phase(gateway).await?;
        let outcome = SyncOutcome {
            pushed,
            pulled,
            errors: push_errors + pull_errors,
        };
        info!(
            pushed = outcome.pushed,
            pulled = outcome.pulled,
            errors = outcome.errors,
            "sync cycle complete"
        );
        if let Ok(mut slot) = self.last_outcome.lock() {
            *slot = Some(outcome);
        }
        let _ = self.events.send(outcome);
        Ok(outcome)
    }

    /// Drain the queue in FIFO order. A backend rejection costs the
    /// entry a retry and moves on; a transport failure costs a retry
    /// and halts the drain, so later entries keep their order.
    async fn push_phase(&self, gateway: &G) -> Result<(u64, u64), StoreError> {
        let entries = self.queue.drain_order().await?;
        if entries.is_empty() {
            return Ok((0, 0));
        }
        debug!(pending = entries.len(), "draining sync queue");

        let mut pushed = 0u64;
        let mut errors = 0u64;
        for entry in entries {
            if entry.retries >= MAX_RETRIES {
                warn!(
                    id = entry.id,
                    kind = %entry.kind,
                    action = %entry.action,
                    "abandoning mutation after {} attempts",
                    entry.retries
                );
                self.queue.move_to_dead_letters(&entry).await?;
                errors += 1;
                continue;
            }

            match self.transmit(gateway, &entry).await? {
                PushReply::Accepted { start_row } => {
                    self.confirm(&entry, start_row).await?;
                    pushed += 1;
                }
                PushReply::Rejected => {
                    self.queue.increment_retries(entry.id).await?;
                    errors += 1;
                }
                PushReply::Offline => {
                    self.queue.increment_retries(entry.id).await?;
                    errors += 1;
                    self.online.store(false, Ordering::SeqCst);
                    warn!("transport failure, halting queue drain");
                    break;
                }
            }
        }
        Ok((pushed, errors))
    }

    async fn transmit(&self, gateway: &G, entry: &QueueEntry) -> Result<PushReply, StoreError> {
        let reply = match entry.action {
            SyncAction::Append => {
                let row = encode_row(entry.kind, &entry.fields);
                match gateway.append(entry.kind, vec![row]).await {
                    Ok(resp) if resp.success => PushReply::Accepted {
                        start_row: resp.start_row,
                    },
                    Ok(resp) => rejected(entry, resp.error),
                    Err(e) => offline(entry, e),
                }
            }
            // Key-value sheets have no positional addressing; an update
            // replaces the whole sheet with the live local state.
            SyncAction::Update if entry.kind.is_key_value() => {
                let live = self.records.read_all(entry.kind, &RecordQuery::all()).await?;
                let rows = live
                    .iter()
                    .map(|r| encode_row(entry.kind, &r.fields))
                    .collect();
                match gateway.write_all(entry.kind, rows).await {
                    Ok(ack) if ack.success => PushReply::Accepted { start_row: None },
                    Ok(ack) => rejected(entry, ack.error),
                    Err(e) => offline(entry, e),
                }
            }
            SyncAction::Update => {
                let Some(row_index) = self.row_index_for(entry).await? else {
                    warn!(kind = %entry.kind, key = %entry.key, "no row index for remote update, will retry");
                    return Ok(PushReply::Rejected);
                };
                let row = encode_row(entry.kind, &entry.fields);
                match gateway.update(entry.kind, row_index, row).await {
                    Ok(ack) if ack.success => PushReply::Accepted { start_row: None },
                    Ok(ack) => rejected(entry, ack.error),
                    Err(e) => offline(entry, e),
                }
            }
            SyncAction::Delete => {
                let Some(row_index) = self.row_index_for(entry).await? else {
                    warn!(kind = %entry.kind, key = %entry.key, "no row index for remote delete, will retry");
                    return Ok(PushReply::Rejected);
                };
                match gateway.delete(entry.kind, row_index).await {
                    Ok(ack) if ack.success => PushReply::Accepted { start_row: None },
                    Ok(ack) => rejected(entry, ack.error),
                    Err(e) => offline(entry, e),
                }
            }
        };
        Ok(reply)
    }

    /// Freshest known sheet position for an entry: the one captured at
    /// enqueue time, or whatever a later push or pull stored on the
    /// record itself.
    async fn row_index_for(&self, entry: &QueueEntry) -> Result<Option<i64>, StoreError> {
        if entry.row_index.is_some() {
            return Ok(entry.row_index);
        }
        Ok(self
            .records
            .get_by_key(entry.kind, &entry.key)
            .await?
            .and_then(|r| r.row_index))
    }

    async fn confirm(&self, entry: &QueueEntry, start_row: Option<i64>) -> Result<(), StoreError> {
        if entry.action == SyncAction::Delete {
            self.records.delete_by_key(entry.kind, &entry.key).await?;
        } else {
            self.records
                .mark_synced(entry.kind, &entry.key, start_row)
                .await?;
        }
        self.queue.remove(entry.id).await?;
        Ok(())
    }

    /// Pull today's rows for every date-indexed kind. Failures are
    /// counted per kind and never abort the remaining kinds.
    async fn pull_phase(&self, gateway: &G) -> Result<(u64, u64), StoreError> {
        let today = chrono::Local::now().date_naive();
        let stamp = now_millis();
        let mut pulled = 0u64;
        let mut errors = 0u64;

        for kind in EntityKind::ALL {
            if !kind.is_date_indexed() {
                continue;
            }
            match gateway.read(kind, RecordQuery::on(today)).await {
                Ok(resp) if resp.success => {
                    pulled += self.merge_rows(kind, &resp.data, stamp).await?;
                }
                Ok(resp) => {
                    warn!(
                        kind = %kind,
                        error = resp.error.as_deref().unwrap_or("unknown"),
                        "pull rejected"
                    );
                    errors += 1;
                }
                Err(e) => {
                    warn!(kind = %kind, "pull failed: {e}");
                    self.online.store(false, Ordering::SeqCst);
                    errors += 1;
                }
            }
        }
        Ok((pulled, errors))
    }

    /// Merge pulled rows into the record store. Each row is matched to
    /// a local record by natural key; an unsynced local record newer
    /// than the pull stamp wins, otherwise the remote version does.
    pub(crate) async fn merge_rows(
        &self,
        kind: EntityKind,
        rows: &[Vec<Value>],
        stamp: i64,
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut by_key: HashMap<Vec<String>, Record> = HashMap::new();
        for record in self.records.scan_all(kind).await? {
            by_key.insert(record.natural_key(kind), record);
        }

        let mut merged = 0u64;
        for row in rows {
            let (fields, row_index) = decode_row(kind, row);
            let nk = natural_key_of(kind, &fields);

            match by_key.get(&nk).cloned() {
                None => {
                    let Some(key) = self.key_for_pulled(kind, &fields).await? else {
                        warn!(kind = %kind, "pulled row is missing its key field, skipped");
                        continue;
                    };
                    let record = Record {
                        key,
                        fields,
                        synced: true,
                        modified: stamp,
                        deleted: false,
                        row_index,
                    };
                    self.records.put(kind, &record).await?;
                    by_key.insert(nk, record);
                }
                Some(local) if !local.synced && local.modified > stamp => {
                    debug!(kind = %kind, key = %local.key, "keeping newer local version");
                }
                Some(local) => {
                    let record = Record {
                        key: local.key,
                        fields,
                        synced: true,
                        modified: stamp,
                        deleted: false,
                        row_index: row_index.or(local.row_index),
                    };
                    self.records.put(kind, &record).await?;
                    by_key.insert(nk, record);
                }
            }
            merged += 1;
        }
        Ok(merged)
    }

    async fn key_for_pulled(
        &self,
        kind: EntityKind,
        fields: &Map<String, Value>,
    ) -> Result<Option<String>, StoreError> {
        match kind.key_mode() {
            KeyMode::Auto => Ok(Some(self.records.allocate_key(kind).await?)),
            KeyMode::Generated(field) | KeyMode::Semantic(field) => Ok(fields
                .get(field)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)),
        }
    }
}

fn rejected(entry: &QueueEntry, error: Option<String>) -> PushReply {
    warn!(
        id = entry.id,
        kind = %entry.kind,
        action = %entry.action,
        error = error.as_deref().unwrap_or("unknown"),
        "backend rejected mutation"
    );
    PushReply::Rejected
}

fn offline(entry: &QueueEntry, error: GatewayError) -> PushReply {
    warn!(
        id = entry.id,
        kind = %entry.kind,
        action = %entry.action,
        "transport failure: {error}"
    );
    PushReply::Offline
}
