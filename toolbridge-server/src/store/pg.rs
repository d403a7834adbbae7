use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Acquire, PgConnection, Row};
use toolbridge_common::normalize::normalize_payload;
use toolbridge_common::{time, Cursor, EntityKind};
use uuid::Uuid;

use super::{ItemRow, ItemWrite, SessionRow, Store, StoreError, UpsertOutcome};

/// Production store over a shared PostgreSQL pool. Every statement filters
/// on `owner_id`; the LWW predicate lives in the upsert's WHERE clause so
/// concurrent writers converge without application-level locking.
pub struct PgStore {
    pool: PgPool,
}

const MIGRATIONS: &[(&str, &str)] = &[("0001_init", include_str!("../../migrations/0001_init.sql"))];

impl PgStore {
    /// Connect and verify connectivity with a ping.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .max_lifetime(Duration::from_secs(60 * 60))
            .idle_timeout(Duration::from_secs(30 * 60))
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.ping().await?;
        Ok(store)
    }

    /// Apply any embedded migrations that have not been recorded yet.
    /// The external migration runner remains authoritative in deployments
    /// that carry one; this path keeps fresh databases self-sufficient.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS schema_migrations (\
                 migration TEXT PRIMARY KEY, \
                 applied_at TIMESTAMPTZ NOT NULL DEFAULT now())",
        )
        .execute(&self.pool)
        .await?;

        for (name, sql) in MIGRATIONS {
            let mut tx = self.pool.begin().await?;
            let applied: Option<String> =
                sqlx::query_scalar("SELECT migration FROM schema_migrations WHERE migration = $1")
                    .bind(*name)
                    .fetch_optional(&mut *tx)
                    .await?;
            if applied.is_none() {
                sqlx::raw_sql(sql).execute(&mut *tx).await?;
                sqlx::query("INSERT INTO schema_migrations (migration) VALUES ($1)")
                    .bind(*name)
                    .execute(&mut *tx)
                    .await?;
                tracing::info!(migration = name, "applied migration");
            }
            tx.commit().await?;
        }
        Ok(())
    }
}

fn row_to_item(row: &PgRow) -> ItemRow {
    ItemRow {
        uid: row.get("uid"),
        owner_id: row.get("owner_id"),
        updated_at_ms: row.get::<i64, _>("updated_at_ms") as u64,
        deleted_at_ms: row.get::<Option<i64>, _>("deleted_at_ms").map(|v| v as u64),
        version: row.get::<i64, _>("version") as u64,
        payload: row.get("payload_json"),
        created_at: row.get("created_at"),
    }
}

fn upsert_sql(kind: EntityKind) -> String {
    let table = kind.table();
    let (extra_cols, extra_vals, extra_set) = match kind {
        EntityKind::Comment => (
            ", parent_uid, parent_kind",
            ", $8, $9",
            ", parent_uid = EXCLUDED.parent_uid, parent_kind = EXCLUDED.parent_kind",
        ),
        EntityKind::ChatMessage => (", chat_uid", ", $8", ", chat_uid = EXCLUDED.chat_uid"),
        _ => ("", "", ""),
    };
    format!(
        "INSERT INTO {table} \
             (owner_id, uid, updated_at_ms, deleted_at_ms, version, payload_json, created_at{extra_cols}) \
         VALUES ($1, $2, $3, $4, GREATEST($5::BIGINT, 1), $6, $7{extra_vals}) \
         ON CONFLICT (owner_id, uid) DO UPDATE SET \
             payload_json = EXCLUDED.payload_json, \
             updated_at_ms = EXCLUDED.updated_at_ms, \
             deleted_at_ms = EXCLUDED.deleted_at_ms, \
             version = {table}.version + 1{extra_set} \
         WHERE EXCLUDED.updated_at_ms > {table}.updated_at_ms \
         RETURNING version, updated_at_ms"
    )
}

fn guarded_update_sql(kind: EntityKind) -> String {
    let table = kind.table();
    let extra_set = match kind {
        EntityKind::Comment => ", parent_uid = $7, parent_kind = $8",
        EntityKind::ChatMessage => ", chat_uid = $7",
        _ => "",
    };
    format!(
        "UPDATE {table} SET \
             payload_json = $3, \
             updated_at_ms = $4, \
             deleted_at_ms = $5, \
             version = version + 1{extra_set} \
         WHERE owner_id = $1 AND uid = $2 \
           AND $4::BIGINT > updated_at_ms AND version = $6 \
         RETURNING version, updated_at_ms"
    )
}

/// Run one write inside the supplied connection (a transaction or a
/// per-item savepoint) and return the authoritative outcome.
async fn apply_write(
    conn: &mut PgConnection,
    kind: EntityKind,
    owner: &str,
    now_ms: u64,
    write: &ItemWrite,
) -> Result<UpsertOutcome, StoreError> {
    let table = kind.table();

    let returned: Option<PgRow> = if let Some(expected) = write.expected_version {
        let sql = guarded_update_sql(kind);
        let mut q = sqlx::query(&sql)
            .bind(owner)
            .bind(write.uid)
            .bind(&write.payload)
            .bind(write.updated_at_ms as i64)
            .bind(write.deleted_at_ms.map(|v| v as i64))
            .bind(expected as i64);
        match kind {
            EntityKind::Comment => {
                q = q.bind(write.parent_uid).bind(write.parent_kind.as_deref());
            }
            EntityKind::ChatMessage => {
                q = q.bind(write.chat_uid);
            }
            _ => {}
        }
        q.fetch_optional(&mut *conn).await?
    } else {
        let sql = upsert_sql(kind);
        let mut q = sqlx::query(&sql)
            .bind(owner)
            .bind(write.uid)
            .bind(write.updated_at_ms as i64)
            .bind(write.deleted_at_ms.map(|v| v as i64))
            .bind(write.client_version as i64)
            .bind(&write.payload)
            .bind(time::ms_to_datetime(now_ms));
        match kind {
            EntityKind::Comment => {
                q = q.bind(write.parent_uid).bind(write.parent_kind.as_deref());
            }
            EntityKind::ChatMessage => {
                q = q.bind(write.chat_uid);
            }
            _ => {}
        }
        q.fetch_optional(&mut *conn).await?
    };

    match returned {
        Some(row) => {
            let version = row.get::<i64, _>("version") as u64;
            let updated_at_ms = row.get::<i64, _>("updated_at_ms") as u64;

            // The write won: rewrite the mirror fields with the values the
            // database just committed, still inside the transaction.
            let mut payload = write.payload.clone();
            normalize_payload(
                &mut payload,
                &write.mirror,
                version,
                updated_at_ms,
                write.deleted_at_ms,
            );
            let sql = format!(
                "UPDATE {table} SET payload_json = $3 WHERE owner_id = $1 AND uid = $2"
            );
            sqlx::query(&sql)
                .bind(owner)
                .bind(write.uid)
                .bind(&payload)
                .execute(&mut *conn)
                .await?;

            Ok(UpsertOutcome { version, updated_at_ms, applied: true })
        }
        None => {
            // No-op; report what is stored.
            let sql = format!(
                "SELECT version, updated_at_ms FROM {table} WHERE owner_id = $1 AND uid = $2"
            );
            let current = sqlx::query(&sql)
                .bind(owner)
                .bind(write.uid)
                .fetch_optional(&mut *conn)
                .await?;
            Ok(match current {
                Some(row) => UpsertOutcome {
                    version: row.get::<i64, _>("version") as u64,
                    updated_at_ms: row.get::<i64, _>("updated_at_ms") as u64,
                    applied: false,
                },
                None => UpsertOutcome { version: 0, updated_at_ms: 0, applied: false },
            })
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn apply_batch(
        &self,
        kind: EntityKind,
        owner: &str,
        now_ms: u64,
        writes: Vec<ItemWrite>,
    ) -> Result<Vec<Result<UpsertOutcome, String>>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(writes.len());
        for write in &writes {
            // Nested transaction = savepoint; an item failure rolls back
            // that item only and the batch continues.
            let mut sp = tx.begin().await?;
            match apply_write(&mut sp, kind, owner, now_ms, write).await {
                Ok(outcome) => {
                    sp.commit().await?;
                    outcomes.push(Ok(outcome));
                }
                Err(e) => {
                    sp.rollback().await?;
                    outcomes.push(Err(e.to_string()));
                }
            }
        }
        tx.commit().await?;
        Ok(outcomes)
    }

    async fn get(
        &self,
        kind: EntityKind,
        owner: &str,
        uid: Uuid,
    ) -> Result<Option<ItemRow>, StoreError> {
        let sql = format!(
            "SELECT uid, owner_id, updated_at_ms, deleted_at_ms, version, payload_json, created_at \
             FROM {} WHERE owner_id = $1 AND uid = $2",
            kind.table()
        );
        let row = sqlx::query(&sql)
            .bind(owner)
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_item))
    }

    async fn list(
        &self,
        kind: EntityKind,
        owner: &str,
        cursor: Cursor,
        limit: usize,
        include_deleted: bool,
    ) -> Result<Vec<ItemRow>, StoreError> {
        let alive = if include_deleted { "" } else { "AND deleted_at_ms IS NULL " };
        let sql = format!(
            "SELECT uid, owner_id, updated_at_ms, deleted_at_ms, version, payload_json, created_at \
             FROM {} WHERE owner_id = $1 \
               AND (updated_at_ms, uid) > ($2::BIGINT, $3::UUID) {alive}\
             ORDER BY updated_at_ms, uid LIMIT $4",
            kind.table()
        );
        let rows = sqlx::query(&sql)
            .bind(owner)
            .bind(cursor.ms as i64)
            .bind(cursor.uid)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_item).collect())
    }

    async fn cascade_task_list_delete(
        &self,
        owner: &str,
        now_ms: u64,
        list_write: ItemWrite,
        task_writes: Vec<ItemWrite>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        for write in &task_writes {
            apply_write(&mut tx, EntityKind::Task, owner, now_ms, write).await?;
        }
        let outcome = apply_write(&mut tx, EntityKind::TaskList, owner, now_ms, &list_write).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn get_or_create_user(&self, sub: &str) -> Result<String, StoreError> {
        sqlx::query("INSERT INTO app_user (id, sub) VALUES ($1, $2) ON CONFLICT (sub) DO NOTHING")
            .bind(Uuid::new_v4())
            .bind(sub)
            .execute(&self.pool)
            .await?;
        let id: Uuid = sqlx::query_scalar("SELECT id FROM app_user WHERE sub = $1")
            .bind(sub)
            .fetch_one(&self.pool)
            .await?;
        Ok(id.to_string())
    }

    async fn current_epoch(&self, owner: &str) -> Result<u64, StoreError> {
        sqlx::query("INSERT INTO owner_state (owner_id, epoch) VALUES ($1, 1) ON CONFLICT (owner_id) DO NOTHING")
            .bind(owner)
            .execute(&self.pool)
            .await?;
        let epoch: i64 = sqlx::query_scalar("SELECT epoch FROM owner_state WHERE owner_id = $1")
            .bind(owner)
            .fetch_one(&self.pool)
            .await?;
        Ok(epoch as u64)
    }

    async fn bump_epoch(&self, owner: &str) -> Result<u64, StoreError> {
        let epoch: i64 = sqlx::query_scalar(
            "INSERT INTO owner_state (owner_id, epoch) VALUES ($1, 2) \
             ON CONFLICT (owner_id) DO UPDATE SET epoch = owner_state.epoch + 1 \
             RETURNING epoch",
        )
        .bind(owner)
        .fetch_one(&self.pool)
        .await?;
        Ok(epoch as u64)
    }

    async fn create_session(&self, session: SessionRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_session (id, owner_id, epoch, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&session.id)
        .bind(&session.owner_id)
        .bind(session.epoch as i64)
        .bind(time::ms_to_datetime(session.created_ms))
        .bind(time::ms_to_datetime(session.expires_ms))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lookup_session(&self, id: &str) -> Result<Option<SessionRow>, StoreError> {
        let row = sqlx::query(
            "SELECT id, owner_id, epoch, created_at, expires_at FROM sync_session WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| SessionRow {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            epoch: row.get::<i64, _>("epoch") as u64,
            created_ms: row.get::<chrono::DateTime<chrono::Utc>, _>("created_at").timestamp_millis()
                as u64,
            expires_ms: row.get::<chrono::DateTime<chrono::Utc>, _>("expires_at").timestamp_millis()
                as u64,
        }))
    }

    async fn prune_sessions(&self, now_ms: u64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM sync_session WHERE expires_at <= $1")
            .bind(time::ms_to_datetime(now_ms))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let _: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}
