use serde_json::{json, Value};

use crate::time;

/// Which mirror fields the server rewrites in a stored payload after a
/// winning write. The `sync.version` mirror is not optional; the rest can
/// be tuned per entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorSpec {
    pub version: bool,
    pub update_time: bool,
    pub remote_updated_at: bool,
    pub last_synced_at: bool,
    pub is_dirty: bool,
    pub is_deleted: bool,
}

impl MirrorSpec {
    /// Full REST normalization set.
    pub fn full() -> Self {
        Self {
            version: true,
            update_time: true,
            remote_updated_at: true,
            last_synced_at: true,
            is_dirty: true,
            is_deleted: true,
        }
    }

    /// The floor applied on the sync push path: only the authoritative
    /// `sync.version` is mirrored, the rest of the document stays as the
    /// client wrote it.
    pub fn minimal() -> Self {
        Self {
            version: false,
            update_time: false,
            remote_updated_at: false,
            last_synced_at: false,
            is_dirty: false,
            is_deleted: false,
        }
    }
}

/// Rewrite the mirror fields of `payload` to authoritative server values
/// after a write that changed the row. Losing writes must never reach this
/// function; the caller returns the unmodified stored state instead.
pub fn normalize_payload(
    payload: &mut Value,
    spec: &MirrorSpec,
    version: u64,
    updated_at_ms: u64,
    deleted_at_ms: Option<u64>,
) {
    let Some(obj) = payload.as_object_mut() else {
        return;
    };

    if spec.version {
        obj.insert("version".to_string(), json!(version));
    }

    let rfc = time::ms_to_rfc3339(updated_at_ms);
    if spec.update_time {
        obj.insert("updateTime".to_string(), json!(rfc));
    }
    if spec.remote_updated_at {
        obj.insert("remoteUpdatedAt".to_string(), json!(rfc));
    }
    if spec.last_synced_at {
        obj.insert("lastSyncedAt".to_string(), json!(rfc));
    }
    if spec.is_dirty {
        obj.insert("isDirty".to_string(), json!(0));
    }
    if spec.is_deleted {
        obj.insert("isDeleted".to_string(), json!(if deleted_at_ms.is_some() { 1 } else { 0 }));
    }

    let sync = obj
        .entry("sync".to_string())
        .or_insert_with(|| json!({}));
    if let Some(sync) = sync.as_object_mut() {
        sync.insert("version".to_string(), json!(version));
        sync.insert("isDeleted".to_string(), json!(deleted_at_ms.is_some()));
        match deleted_at_ms {
            Some(ms) => {
                sync.insert("deletedAt".to_string(), json!(time::ms_to_rfc3339(ms)));
            }
            None => {
                sync.remove("deletedAt");
            }
        }
    }
}
