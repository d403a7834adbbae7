use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;
use toolbridge_common::normalize::normalize_payload;
use toolbridge_common::{time, Cursor, EntityKind};
use uuid::Uuid;

use super::{ItemRow, ItemWrite, SessionRow, Store, StoreError, UpsertOutcome};

/// In-memory store. Backs unit and integration tests and the
/// `--store memory` smoke mode; state dies with the process.
///
/// A single writer lock over the whole state stands in for the database
/// transaction: a batch applied under the lock is atomic and totally
/// ordered with respect to every other batch.
pub struct MemStore {
    inner: RwLock<MemInner>,
}

#[derive(Default)]
struct MemInner {
    items: HashMap<EntityKind, BTreeMap<(String, Uuid), ItemRow>>,
    users: HashMap<String, String>,
    epochs: HashMap<String, u64>,
    sessions: HashMap<String, SessionRow>,
}

impl MemStore {
    pub fn new() -> Self {
        Self { inner: RwLock::new(MemInner::default()) }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

/// The LWW upsert predicate, applied to one owner-keyed map.
///
/// Insert on first sighting with `version = max(hint, 1)`; overwrite only
/// for a strictly newer timestamp (and a matching expected version when
/// one was asserted), bumping `version` by one. Anything else is a no-op
/// that reports the stored state.
fn apply_write(
    map: &mut BTreeMap<(String, Uuid), ItemRow>,
    owner: &str,
    now_ms: u64,
    write: ItemWrite,
) -> UpsertOutcome {
    let key = (owner.to_string(), write.uid);
    match map.get_mut(&key) {
        None => {
            if write.expected_version.is_some() {
                // Guarded writes are update-only; nothing to lock against.
                return UpsertOutcome { version: 0, updated_at_ms: 0, applied: false };
            }
            let version = write.client_version.max(1);
            let mut payload = write.payload;
            normalize_payload(
                &mut payload,
                &write.mirror,
                version,
                write.updated_at_ms,
                write.deleted_at_ms,
            );
            map.insert(
                key,
                ItemRow {
                    uid: write.uid,
                    owner_id: owner.to_string(),
                    updated_at_ms: write.updated_at_ms,
                    deleted_at_ms: write.deleted_at_ms,
                    version,
                    payload,
                    created_at: time::ms_to_datetime(now_ms),
                },
            );
            UpsertOutcome { version, updated_at_ms: write.updated_at_ms, applied: true }
        }
        Some(row) => {
            let newer = write.updated_at_ms > row.updated_at_ms;
            let version_ok = write.expected_version.map_or(true, |v| v == row.version);
            if newer && version_ok {
                row.version += 1;
                row.updated_at_ms = write.updated_at_ms;
                row.deleted_at_ms = write.deleted_at_ms;
                let mut payload = write.payload;
                normalize_payload(
                    &mut payload,
                    &write.mirror,
                    row.version,
                    row.updated_at_ms,
                    row.deleted_at_ms,
                );
                row.payload = payload;
                UpsertOutcome {
                    version: row.version,
                    updated_at_ms: row.updated_at_ms,
                    applied: true,
                }
            } else {
                UpsertOutcome {
                    version: row.version,
                    updated_at_ms: row.updated_at_ms,
                    applied: false,
                }
            }
        }
    }
}

#[async_trait]
impl Store for MemStore {
    async fn apply_batch(
        &self,
        kind: EntityKind,
        owner: &str,
        now_ms: u64,
        writes: Vec<ItemWrite>,
    ) -> Result<Vec<Result<UpsertOutcome, String>>, StoreError> {
        let mut inner = self.inner.write().await;
        let map = inner.items.entry(kind).or_default();
        Ok(writes
            .into_iter()
            .map(|w| Ok(apply_write(map, owner, now_ms, w)))
            .collect())
    }

    async fn get(
        &self,
        kind: EntityKind,
        owner: &str,
        uid: Uuid,
    ) -> Result<Option<ItemRow>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .items
            .get(&kind)
            .and_then(|map| map.get(&(owner.to_string(), uid)))
            .cloned())
    }

    async fn list(
        &self,
        kind: EntityKind,
        owner: &str,
        cursor: Cursor,
        limit: usize,
        include_deleted: bool,
    ) -> Result<Vec<ItemRow>, StoreError> {
        let inner = self.inner.read().await;
        let Some(map) = inner.items.get(&kind) else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<ItemRow> = map
            .range((owner.to_string(), Uuid::nil())..=(owner.to_string(), Uuid::max()))
            .map(|(_, row)| row)
            .filter(|row| include_deleted || !row.is_tombstone())
            .filter(|row| cursor.precedes(row.updated_at_ms, &row.uid))
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.updated_at_ms, r.uid));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn cascade_task_list_delete(
        &self,
        owner: &str,
        now_ms: u64,
        list_write: ItemWrite,
        task_writes: Vec<ItemWrite>,
    ) -> Result<UpsertOutcome, StoreError> {
        // One write-lock scope = one transaction.
        let mut inner = self.inner.write().await;
        let tasks = inner.items.entry(EntityKind::Task).or_default();
        for write in task_writes {
            apply_write(tasks, owner, now_ms, write);
        }
        let lists = inner.items.entry(EntityKind::TaskList).or_default();
        Ok(apply_write(lists, owner, now_ms, list_write))
    }

    async fn get_or_create_user(&self, sub: &str) -> Result<String, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .users
            .entry(sub.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone())
    }

    async fn current_epoch(&self, owner: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(*inner.epochs.entry(owner.to_string()).or_insert(1))
    }

    async fn bump_epoch(&self, owner: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let epoch = inner.epochs.entry(owner.to_string()).or_insert(1);
        *epoch += 1;
        Ok(*epoch)
    }

    async fn create_session(&self, session: SessionRow) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn lookup_session(&self, id: &str) -> Result<Option<SessionRow>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(id).cloned())
    }

    async fn prune_sessions(&self, now_ms: u64) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.sessions.len();
        inner.sessions.retain(|_, s| s.expires_ms > now_ms);
        Ok((before - inner.sessions.len()) as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
