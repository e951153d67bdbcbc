mod entity;
mod record;

pub use entity::{decode_row, encode_row, EntityKind, KeyMode};
pub use record::{
    natural_key_of, now_millis, DeadLetter, QueueEntry, Record, RecordQuery, SyncAction,
};
