//! HTTP gateway to the spreadsheet backend.
//!
//! The backend is a single web-app endpoint multiplexing every
//! operation through an `action` query parameter. Rows travel as
//! positional arrays in the sheet's column order; reads come back with
//! the 1-based sheet row number appended to each row so callers can
//! address later updates and deletes.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::models::{EntityKind, RecordQuery};

/// Per-request timeout. The backend can be slow on cold starts.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport-level failure talking to the backend. Distinct from a
/// well-formed `{success: false}` rejection, which the response types
/// carry instead.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("backend returned status {0}")]
    Status(u16),

    #[error("malformed response: {0}")]
    Decode(String),
}

/// Response to a read: one positional array per sheet row.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Vec<Vec<Value>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Response to an append, reporting where the rows landed.
#[derive(Debug, Clone, Deserialize)]
pub struct AppendResponse {
    pub success: bool,
    #[serde(default)]
    pub appended: Option<i64>,
    #[serde(default, rename = "startRow")]
    pub start_row: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Plain acknowledgement for write/update/delete/ping.
#[derive(Debug, Clone, Deserialize)]
pub struct Ack {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Remote operations the sync engine needs. Implemented by
/// [`HttpGateway`] for production and by a scripted mock in tests.
pub trait Gateway: Send + Sync + 'static {
    fn read(
        &self,
        kind: EntityKind,
        query: RecordQuery,
    ) -> impl Future<Output = Result<ReadResponse, GatewayError>> + Send;

    fn append(
        &self,
        kind: EntityKind,
        rows: Vec<Vec<Value>>,
    ) -> impl Future<Output = Result<AppendResponse, GatewayError>> + Send;

    fn update(
        &self,
        kind: EntityKind,
        row_index: i64,
        row: Vec<Value>,
    ) -> impl Future<Output = Result<Ack, GatewayError>> + Send;

    /// Replace the sheet's entire contents. Used for key-value kinds,
    /// which have no stable positional addressing.
    fn write_all(
        &self,
        kind: EntityKind,
        rows: Vec<Vec<Value>>,
    ) -> impl Future<Output = Result<Ack, GatewayError>> + Send;

    fn delete(
        &self,
        kind: EntityKind,
        row_index: i64,
    ) -> impl Future<Output = Result<Ack, GatewayError>> + Send;

    fn ping(&self) -> impl Future<Output = Result<Ack, GatewayError>> + Send;
}

/// Gateway implementation over a deployed web-app endpoint.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    script_url: String,
    http: reqwest::Client,
}

impl HttpGateway {
    pub fn new(script_url: impl Into<String>) -> Self {
        Self {
            script_url: script_url.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn script_url(&self) -> &str {
        &self.script_url
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        params: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        let response = self
            .http
            .get(&self.script_url)
            .query(params)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))?;
        decode(response).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        action: &str,
        body: Value,
    ) -> Result<T, GatewayError> {
        let response = self
            .http
            .post(&self.script_url)
            .query(&[("action", action)])
            .json(&body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, GatewayError> {
    if !response.status().is_success() {
        return Err(GatewayError::Status(response.status().as_u16()));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| GatewayError::Decode(e.to_string()))
}

fn read_params(kind: EntityKind, query: &RecordQuery) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("action", "read".to_string()),
        ("sheet", kind.sheet_name().to_string()),
    ];
    if let Some(date) = query.date {
        params.push(("date", date.to_string()));
    }
    if let Some(from) = query.from {
        params.push(("from", from.to_string()));
    }
    if let Some(to) = query.to {
        params.push(("to", to.to_string()));
    }
    if let Some(limit) = query.limit {
        params.push(("limit", limit.to_string()));
    }
    params
}

impl Gateway for HttpGateway {
    async fn read(
        &self,
        kind: EntityKind,
        query: RecordQuery,
    ) -> Result<ReadResponse, GatewayError> {
        self.get_json(&read_params(kind, &query)).await
    }

    async fn append(
        &self,
        kind: EntityKind,
        rows: Vec<Vec<Value>>,
    ) -> Result<AppendResponse, GatewayError> {
        self.post_json("append", json!({ "sheet": kind.sheet_name(), "rows": rows }))
            .await
    }

    async fn update(
        &self,
        kind: EntityKind,
        row_index: i64,
        row: Vec<Value>,
    ) -> Result<Ack, GatewayError> {
        self.post_json(
            "update",
            json!({ "sheet": kind.sheet_name(), "rowIndex": row_index, "row": row }),
        )
        .await
    }

    async fn write_all(&self, kind: EntityKind, rows: Vec<Vec<Value>>) -> Result<Ack, GatewayError> {
        self.post_json("write", json!({ "sheet": kind.sheet_name(), "rows": rows }))
            .await
    }

    async fn delete(&self, kind: EntityKind, row_index: i64) -> Result<Ack, GatewayError> {
        self.post_json(
            "delete",
            json!({ "sheet": kind.sheet_name(), "rowIndex": row_index }),
        )
        .await
    }

    async fn ping(&self) -> Result<Ack, GatewayError> {
        self.get_json(&[("action", "ping".to_string())]).await
    }
}
