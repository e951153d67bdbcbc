//! Background synchronization with the spreadsheet backend.
//!
//! Local mutations land in a durable queue and are replayed against
//! the backend in order (push); remote rows are fetched and merged
//! back by natural key (pull). The store stays fully usable offline;
//! the queue simply grows until the backend is reachable again.
//!
//! ## Wire model
//!
//! The backend is a spreadsheet fronted by a single web-app URL. Each
//! entity kind maps to one sheet, each record to one row, addressed by
//! its 1-based row number. Row addressing is positional: a row number
//! captured at push or pull time can go stale if the sheet is edited
//! concurrently elsewhere, so the sheet should not be reordered by
//! hand while a device holds unsynced changes.

mod engine;
mod gateway;
#[cfg(test)]
pub mod testing;

pub use engine::{SyncEngine, SyncOutcome, MAX_RETRIES, SYNC_INTERVAL};
pub use gateway::{Ack, AppendResponse, Gateway, GatewayError, HttpGateway, ReadResponse};
