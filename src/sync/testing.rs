//! Scripted gateway for exercising the sync engine without a network.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use super::gateway::{Ack, AppendResponse, Gateway, GatewayError, ReadResponse};
use crate::models::{EntityKind, RecordQuery};

/// One recorded gateway invocation, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Read(EntityKind),
    Append(EntityKind, Vec<Vec<Value>>),
    Update(EntityKind, i64, Vec<Value>),
    WriteAll(EntityKind, Vec<Vec<Value>>),
    Delete(EntityKind, i64),
    Ping,
}

struct MockState {
    calls: Mutex<Vec<Call>>,
    read_rows: Mutex<HashMap<EntityKind, Vec<Vec<Value>>>>,
    fail_read_kinds: Mutex<HashSet<EntityKind>>,
    fail_transport: AtomicBool,
    reject: AtomicBool,
    ping_ok: AtomicBool,
    next_start_row: AtomicI64,
}

/// Gateway whose behavior is scripted per test: healthy by default,
/// switchable to rejecting every request (`{success: false}`) or to
/// failing at the transport level. Clones share state so tests can
/// inspect calls after handing the gateway to an engine.
#[derive(Clone)]
pub struct MockGateway {
    state: Arc<MockState>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                calls: Mutex::new(Vec::new()),
                read_rows: Mutex::new(HashMap::new()),
                fail_read_kinds: Mutex::new(HashSet::new()),
                fail_transport: AtomicBool::new(false),
                reject: AtomicBool::new(false),
                ping_ok: AtomicBool::new(true),
                next_start_row: AtomicI64::new(1),
            }),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.calls.lock().unwrap().clone()
    }

    /// Rows returned for reads of the given kind, regardless of query.
    pub fn set_read_rows(&self, kind: EntityKind, rows: Vec<Vec<Value>>) {
        self.state.read_rows.lock().unwrap().insert(kind, rows);
    }

    pub fn set_fail_transport(&self, fail: bool) {
        self.state.fail_transport.store(fail, Ordering::SeqCst);
    }

    /// Reads of one kind fail at the transport level while every other
    /// operation stays scripted as before.
    pub fn set_fail_read(&self, kind: EntityKind) {
        self.state.fail_read_kinds.lock().unwrap().insert(kind);
    }

    pub fn set_reject(&self, reject: bool) {
        self.state.reject.store(reject, Ordering::SeqCst);
    }

    pub fn set_ping_ok(&self, ok: bool) {
        self.state.ping_ok.store(ok, Ordering::SeqCst);
    }

    /// Row number the next accepted append will report.
    pub fn set_next_start_row(&self, row: i64) {
        self.state.next_start_row.store(row, Ordering::SeqCst);
    }

    fn record(&self, call: Call) {
        self.state.calls.lock().unwrap().push(call);
    }

    /// Transport gate shared by every operation: `Err` when scripted
    /// to fail, otherwise whether the backend accepts the request.
    fn gate(&self) -> Result<bool, GatewayError> {
        if self.state.fail_transport.load(Ordering::SeqCst) {
            return Err(GatewayError::Connection("connection refused".to_string()));
        }
        Ok(!self.state.reject.load(Ordering::SeqCst))
    }

    fn ack(&self) -> Result<Ack, GatewayError> {
        let success = self.gate()?;
        Ok(Ack {
            success,
            message: None,
            error: scripted_error(success),
        })
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway for MockGateway {
    async fn read(
        &self,
        kind: EntityKind,
        _query: RecordQuery,
    ) -> Result<ReadResponse, GatewayError> {
        self.record(Call::Read(kind));
        if self.state.fail_read_kinds.lock().unwrap().contains(&kind) {
            return Err(GatewayError::Connection("connection refused".to_string()));
        }
        let success = self.gate()?;
        let data = if success {
            self.state
                .read_rows
                .lock()
                .unwrap()
                .get(&kind)
                .cloned()
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        Ok(ReadResponse {
            success,
            data,
            error: scripted_error(success),
        })
    }

    async fn append(
        &self,
        kind: EntityKind,
        rows: Vec<Vec<Value>>,
    ) -> Result<AppendResponse, GatewayError> {
        self.record(Call::Append(kind, rows.clone()));
        let success = self.gate()?;
        if success {
            let appended = rows.len() as i64;
            let start_row = self
                .state
                .next_start_row
                .fetch_add(appended, Ordering::SeqCst);
            Ok(AppendResponse {
                success: true,
                appended: Some(appended),
                start_row: Some(start_row),
                error: None,
            })
        } else {
            Ok(AppendResponse {
                success: false,
                appended: None,
                start_row: None,
                error: scripted_error(false),
            })
        }
    }

    async fn update(
        &self,
        kind: EntityKind,
        row_index: i64,
        row: Vec<Value>,
    ) -> Result<Ack, GatewayError> {
        self.record(Call::Update(kind, row_index, row));
        self.ack()
    }

    async fn write_all(&self, kind: EntityKind, rows: Vec<Vec<Value>>) -> Result<Ack, GatewayError> {
        self.record(Call::WriteAll(kind, rows));
        self.ack()
    }

    async fn delete(&self, kind: EntityKind, row_index: i64) -> Result<Ack, GatewayError> {
        self.record(Call::Delete(kind, row_index));
        self.ack()
    }

    async fn ping(&self) -> Result<Ack, GatewayError> {
        self.record(Call::Ping);
        if self.state.fail_transport.load(Ordering::SeqCst) {
            return Err(GatewayError::Connection("connection refused".to_string()));
        }
        let success = self.state.ping_ok.load(Ordering::SeqCst);
        Ok(Ack {
            success,
            message: success.then(|| "pong".to_string()),
            error: scripted_error(success),
        })
    }
}

fn scripted_error(success: bool) -> Option<String> {
    (!success).then(|| "scripted rejection".to_string())
}
