//! Vitalog Library
//!
//! Offline-first storage and sync for personal health records.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod store;
pub mod sync;

pub use config::{Config, ConfigError, ConfigSource, ConfigValue, SyncConfig};
pub use db::{init_db, RecordStore, SyncQueue};
pub use error::StoreError;
pub use models::{
    natural_key_of, now_millis, DeadLetter, EntityKind, KeyMode, QueueEntry, Record, RecordQuery,
    SyncAction,
};
pub use store::{ExportData, HealthStore, StoreStatus, PULL_STALENESS};
pub use sync::{
    Gateway, GatewayError, HttpGateway, SyncEngine, SyncOutcome, MAX_RETRIES, SYNC_INTERVAL,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
