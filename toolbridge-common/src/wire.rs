use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// JSON error body returned by every non-2xx response:
/// `{error, message?, epoch?}`. The `epoch` hint accompanies
/// `error = "epoch_mismatch"` so clients can resynchronize without a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self { error: error.into(), message: Some(message.into()), epoch: None }
    }
}

/// Body of `POST /v1/sync/<kind>/push`. Items are opaque client documents;
/// the server reads only `uid`, `updatedTs` and the `sync` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub items: Vec<Value>,
}

/// Per-item acknowledgement for a push, returned in input order.
/// `applied` is `true` iff this operation changed the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushAck {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uuid>,
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PushAck {
    /// Ack for an item that failed validation or storage; carries the error
    /// without aborting the batch.
    pub fn rejected(uid: Option<Uuid>, error: impl Into<String>) -> Self {
        Self { uid, version: 0, updated_at: None, applied: false, error: Some(error.into()) }
    }
}

/// Tombstone reference emitted by pull: enough for a replica to delete
/// locally without shipping the dead payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TombstoneRef {
    pub uid: Uuid,
    pub deleted_at: DateTime<Utc>,
}

/// Body of `GET /v1/sync/<kind>/pull`. `next_cursor` is present iff any row
/// was returned; its absence signals the client has caught up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub upserts: Vec<Value>,
    pub deletes: Vec<TombstoneRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Body of `POST /v1/sync/sessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub user_id: String,
    pub epoch: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Body of `POST /v1/sync/epoch/bump`; also carried inside 409
/// epoch-mismatch errors via [`ErrorBody::epoch`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochInfo {
    pub epoch: u64,
}

/// Body of `POST /v1/<kind>/{uid}/process`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub action: String,
}

/// REST list response; same pagination contract as pull but rows are whole
/// payloads regardless of liveness (tombstones only when requested).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub items: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}
