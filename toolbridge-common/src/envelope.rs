use serde_json::Value;
use uuid::Uuid;

use crate::{time, ToolbridgeError};

/// The fields the sync engine reads out of an otherwise-opaque client
/// document: identity, the client-asserted write timestamp, and the `sync`
/// block. Everything else in the document is stored verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemEnvelope {
    pub uid: Uuid,
    pub updated_at_ms: u64,
    /// Client's version hint; the server treats it as advisory.
    pub client_version: u64,
    /// `Some(ms)` when the document asserts `sync.isDeleted = true`.
    /// Falls back to `updated_at_ms` when `deletedAt` is absent.
    pub deleted_at_ms: Option<u64>,
}

impl ItemEnvelope {
    /// Extract the envelope from a client document.
    ///
    /// `uid` and `updatedTs` are mandatory; a missing `sync` block reads as
    /// `{version: 0, isDeleted: false}` so bare documents still sync.
    pub fn parse(doc: &Value) -> crate::Result<Self> {
        let obj = doc
            .as_object()
            .ok_or_else(|| ToolbridgeError::Validation("item must be a JSON object".to_string()))?;

        let uid = obj
            .get("uid")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolbridgeError::Validation("missing uid".to_string()))?;
        let uid = Uuid::parse_str(uid)
            .map_err(|_| ToolbridgeError::Validation(format!("invalid uid: {uid}")))?;

        let updated_ts = obj
            .get("updatedTs")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolbridgeError::Validation("missing updatedTs".to_string()))?;
        let updated_at_ms = time::rfc3339_to_ms(updated_ts)?;

        let sync = obj.get("sync").and_then(Value::as_object);

        let client_version = sync
            .and_then(|s| s.get("version"))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let is_deleted = sync
            .and_then(|s| s.get("isDeleted"))
            .map(truthy)
            .unwrap_or(false);

        let deleted_at_ms = if is_deleted {
            let explicit = sync
                .and_then(|s| s.get("deletedAt"))
                .and_then(Value::as_str)
                .map(time::rfc3339_to_ms)
                .transpose()?;
            Some(explicit.unwrap_or(updated_at_ms))
        } else {
            None
        };

        Ok(Self { uid, updated_at_ms, client_version, deleted_at_ms })
    }
}

/// Clients encode booleans either as JSON booleans or as 0/1 mirrors
/// (`isDirty`, `isDeleted` in legacy payloads).
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().map(|n| n != 0).unwrap_or(false),
        _ => false,
    }
}
