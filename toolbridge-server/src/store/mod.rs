use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use toolbridge_common::{Cursor, EntityKind, MirrorSpec};
use uuid::Uuid;

pub mod mem;
pub mod pg;

pub use mem::MemStore;
pub use pg::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// A persisted entity row. `payload` is opaque except for the envelope
/// fields and the mirror set rewritten on winning writes.
#[derive(Debug, Clone)]
pub struct ItemRow {
    pub uid: Uuid,
    pub owner_id: String,
    pub updated_at_ms: u64,
    pub deleted_at_ms: Option<u64>,
    pub version: u64,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl ItemRow {
    pub fn is_tombstone(&self) -> bool {
        self.deleted_at_ms.is_some()
    }
}

/// One write against `(owner_id, uid)`, carrying everything the LWW upsert
/// needs. Relation columns are denormalized out of the payload by the
/// caller; the store never parses domain fields.
#[derive(Debug, Clone)]
pub struct ItemWrite {
    pub uid: Uuid,
    pub updated_at_ms: u64,
    pub deleted_at_ms: Option<u64>,
    /// Client version hint; first sighting stores `max(hint, 1)`.
    pub client_version: u64,
    pub payload: Value,
    /// Mirror fields rewritten with authoritative values if this write wins.
    pub mirror: MirrorSpec,
    /// When set, the update half of the upsert additionally requires the
    /// stored version to equal this value (optimistic locking).
    pub expected_version: Option<u64>,
    /// Comment parent linkage, stored as columns for parent-scoped queries.
    pub parent_uid: Option<Uuid>,
    pub parent_kind: Option<String>,
    /// Chat-message linkage.
    pub chat_uid: Option<Uuid>,
}

impl ItemWrite {
    pub fn new(uid: Uuid, updated_at_ms: u64, payload: Value) -> Self {
        Self {
            uid,
            updated_at_ms,
            deleted_at_ms: None,
            client_version: 0,
            payload,
            mirror: MirrorSpec::minimal(),
            expected_version: None,
            parent_uid: None,
            parent_kind: None,
            chat_uid: None,
        }
    }
}

/// Authoritative state of a row after an upsert attempt. `applied` is
/// `false` for both the stale-timestamp no-op and the version-conflict
/// no-op; `version`/`updated_at_ms` always reflect what is stored now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub version: u64,
    pub updated_at_ms: u64,
    pub applied: bool,
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub owner_id: String,
    pub epoch: u64,
    pub created_ms: u64,
    pub expires_ms: u64,
}

/// The relational adapter. Two implementations: `PgStore` for production
/// and `MemStore` for tests and single-process smoke runs. Both enforce
/// the same write predicate: a row changes only for a strictly newer
/// `updated_at_ms` (and, when requested, a matching expected version).
#[async_trait]
pub trait Store: Send + Sync {
    /// Apply a batch of writes for one owner in a single transaction.
    /// Outcomes are returned in input order; a per-item failure yields
    /// `Err(message)` for that slot without aborting the batch.
    async fn apply_batch(
        &self,
        kind: EntityKind,
        owner: &str,
        now_ms: u64,
        writes: Vec<ItemWrite>,
    ) -> Result<Vec<Result<UpsertOutcome, String>>, StoreError>;

    async fn get(
        &self,
        kind: EntityKind,
        owner: &str,
        uid: Uuid,
    ) -> Result<Option<ItemRow>, StoreError>;

    /// Rows strictly after `cursor` in `(updated_at_ms, uid)` order.
    async fn list(
        &self,
        kind: EntityKind,
        owner: &str,
        cursor: Cursor,
        limit: usize,
        include_deleted: bool,
    ) -> Result<Vec<ItemRow>, StoreError>;

    /// Soft-delete a task list and strip its membership from its tasks,
    /// atomically. Returns the outcome of the list tombstone write.
    async fn cascade_task_list_delete(
        &self,
        owner: &str,
        now_ms: u64,
        list_write: ItemWrite,
        task_writes: Vec<ItemWrite>,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Get-or-create the user row for an IdP subject; returns the stable
    /// internal user id.
    async fn get_or_create_user(&self, sub: &str) -> Result<String, StoreError>;

    /// Current epoch for an owner, initializing to 1 on first use.
    async fn current_epoch(&self, owner: &str) -> Result<u64, StoreError>;

    /// Atomically increment the owner's epoch; returns the new value.
    async fn bump_epoch(&self, owner: &str) -> Result<u64, StoreError>;

    async fn create_session(&self, session: SessionRow) -> Result<(), StoreError>;

    async fn lookup_session(&self, id: &str) -> Result<Option<SessionRow>, StoreError>;

    /// Remove expired sessions; returns how many were pruned.
    async fn prune_sessions(&self, now_ms: u64) -> Result<u64, StoreError>;

    /// Connectivity probe used at startup and by /healthz.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Convenience wrapper for single-item writes.
pub async fn upsert_one(
    store: &dyn Store,
    kind: EntityKind,
    owner: &str,
    now_ms: u64,
    write: ItemWrite,
) -> Result<Result<UpsertOutcome, String>, StoreError> {
    let mut outcomes = store.apply_batch(kind, owner, now_ms, vec![write]).await?;
    Ok(outcomes.pop().unwrap_or(Err("empty batch".to_string())))
}
