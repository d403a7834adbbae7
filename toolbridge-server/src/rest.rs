use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use toolbridge_common::wire::{ListResponse, ProcessRequest};
use toolbridge_common::{time, Cursor, EntityKind, ItemEnvelope};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::config::PULL_LIMIT_MAX;
use crate::error::{etag_value, ApiError};
use crate::store::{upsert_one, ItemRow, ItemWrite, UpsertOutcome};
use crate::sync::{parse_kind, relation_columns};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetParams {
    #[serde(default)]
    pub include_deleted: bool,
}

fn parse_uid(segment: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(segment).map_err(|_| ApiError::Validation(format!("invalid uid: {segment}")))
}

/// `If-Match` carries the expected row version, quoted or bare.
fn if_match_version(headers: &HeaderMap) -> Result<Option<u64>, ApiError> {
    match headers.get(header::IF_MATCH) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .map(|s| s.trim().trim_matches('"'))
            .and_then(|s| s.parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| ApiError::Validation("If-Match must be a version number".to_string())),
    }
}

/// Effective timestamp for mutations of an existing row: strictly after
/// whatever is stored, even under clock skew.
fn monotonic_ts(now_ms: u64, existing_ms: u64) -> u64 {
    now_ms.max(existing_ms + 1)
}

fn item_response(status: StatusCode, row: &ItemRow) -> Response {
    let mut response = (status, Json(row.payload.clone())).into_response();
    response.headers_mut().insert(header::ETAG, etag_value(row.version));
    response
}

/// Assemble a REST-originated write: path identity wins over the body,
/// `updatedTs` is stamped with the effective timestamp, and relation
/// columns are denormalized and validated.
fn build_write(
    state: &AppState,
    kind: EntityKind,
    uid: Uuid,
    mut payload: Value,
    effective_ms: u64,
    expected_version: Option<u64>,
    force_delete: bool,
) -> Result<ItemWrite, ApiError> {
    let obj = payload
        .as_object_mut()
        .ok_or_else(|| ApiError::Validation("body must be a JSON object".to_string()))?;
    obj.insert("uid".to_string(), json!(uid.to_string()));
    obj.insert("updatedTs".to_string(), json!(time::ms_to_rfc3339(effective_ms)));

    let env = ItemEnvelope::parse(&payload)?;
    let deleted_at_ms = if force_delete { Some(effective_ms) } else { env.deleted_at_ms };

    let (parent_uid, parent_kind, chat_uid) =
        relation_columns(kind, &payload).map_err(ApiError::Validation)?;

    Ok(ItemWrite {
        uid,
        updated_at_ms: effective_ms,
        deleted_at_ms,
        client_version: env.client_version,
        payload,
        mirror: state.mirrors.for_kind(kind),
        expected_version,
        parent_uid,
        parent_kind,
        chat_uid,
    })
}

async fn write_and_reload(
    state: &AppState,
    kind: EntityKind,
    owner: &str,
    write: ItemWrite,
) -> Result<(UpsertOutcome, ItemRow), ApiError> {
    let uid = write.uid;
    let now = state.clock.now_ms();
    let outcome = upsert_one(state.store.as_ref(), kind, owner, now, write)
        .await?
        .map_err(ApiError::Internal)?;
    let row = state
        .store
        .get(kind, owner, uid)
        .await?
        .ok_or_else(|| ApiError::Internal("row vanished after write".to_string()))?;
    Ok((outcome, row))
}

/// Handler for GET /v1/:kind — cursor pagination identical to pull;
/// tombstones are filtered in storage unless `includeDeleted=true`.
pub async fn handle_list(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Extension(ctx): Extension<AuthContext>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>, ApiError> {
    let kind = parse_kind(&kind)?;
    let owner = ctx.owner_id();
    let cursor = Cursor::decode_opt(params.cursor.as_deref())?;
    let limit = params.limit.unwrap_or(PULL_LIMIT_MAX).clamp(1, PULL_LIMIT_MAX);

    let rows = state
        .store
        .list(kind, &owner, cursor, limit, params.include_deleted)
        .await?;
    let next_cursor = rows
        .last()
        .map(|row| Cursor { ms: row.updated_at_ms, uid: row.uid }.encode());
    let items = rows.into_iter().map(|row| row.payload).collect();
    Ok(Json(ListResponse { items, next_cursor }))
}

/// Handler for GET /v1/:kind/:uid — 200 alive, 410 tombstone, 404 absent.
/// `includeDeleted=true` turns the 410 into a 200.
pub async fn handle_get(
    State(state): State<AppState>,
    Path((kind, uid)): Path<(String, String)>,
    Extension(ctx): Extension<AuthContext>,
    Query(params): Query<GetParams>,
) -> Result<Response, ApiError> {
    let kind = parse_kind(&kind)?;
    let uid = parse_uid(&uid)?;
    let row = state
        .store
        .get(kind, &ctx.owner_id(), uid)
        .await?
        .ok_or(ApiError::NotFound)?;
    if row.is_tombstone() && !params.include_deleted {
        return Err(ApiError::Gone);
    }
    Ok(item_response(StatusCode::OK, &row))
}

/// Handler for POST /v1/:kind — create with client-assigned identity
/// (a uid is minted when the body carries none).
pub async fn handle_create(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let kind = parse_kind(&kind)?;
    let owner = ctx.owner_id();
    let obj = body
        .as_object()
        .ok_or_else(|| ApiError::Validation("body must be a JSON object".to_string()))?;

    let uid = match obj.get("uid").and_then(Value::as_str) {
        Some(raw) => parse_uid(raw)?,
        None => Uuid::new_v4(),
    };

    if state.store.get(kind, &owner, uid).await?.is_some() {
        return Err(ApiError::Conflict("entity already exists".to_string()));
    }

    let ts = match obj.get("updatedTs").and_then(Value::as_str) {
        Some(raw) => time::rfc3339_to_ms(raw)?,
        None => state.clock.now_ms(),
    };

    let write = build_write(&state, kind, uid, body, ts, None, false)?;
    let (outcome, row) = write_and_reload(&state, kind, &owner, write).await?;
    if !outcome.applied {
        // Lost a race with a concurrent create of the same uid.
        return Err(ApiError::Conflict("entity already exists".to_string()));
    }
    Ok(item_response(StatusCode::CREATED, &row))
}

/// Shared update path for PUT and PATCH: monotonic timestamp, optional
/// optimistic lock, winner-only normalization.
async fn update_existing(
    state: &AppState,
    kind: EntityKind,
    owner: &str,
    existing: &ItemRow,
    payload: Value,
    expected_version: Option<u64>,
) -> Result<Response, ApiError> {
    let effective = monotonic_ts(state.clock.now_ms(), existing.updated_at_ms);
    let write = build_write(state, kind, existing.uid, payload, effective, expected_version, false)?;
    let (outcome, row) = write_and_reload(state, kind, owner, write).await?;

    if !outcome.applied {
        if let Some(expected) = expected_version {
            if outcome.version != expected {
                return Err(ApiError::VersionMismatch { current: outcome.version });
            }
        }
        // A concurrent write won; reflect the authoritative state rather
        // than clobbering it.
        return Ok(item_response(StatusCode::OK, &row));
    }
    Ok(item_response(StatusCode::OK, &row))
}

async fn load_alive(
    state: &AppState,
    kind: EntityKind,
    owner: &str,
    uid: Uuid,
) -> Result<ItemRow, ApiError> {
    let row = state.store.get(kind, owner, uid).await?.ok_or(ApiError::NotFound)?;
    if row.is_tombstone() {
        return Err(ApiError::Gone);
    }
    Ok(row)
}

/// Handler for PUT /v1/:kind/:uid — full replace with optional
/// `If-Match` optimistic locking.
pub async fn handle_put(
    State(state): State<AppState>,
    Path((kind, uid)): Path<(String, String)>,
    Extension(ctx): Extension<AuthContext>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let kind = parse_kind(&kind)?;
    let uid = parse_uid(&uid)?;
    let owner = ctx.owner_id();
    let expected = if_match_version(&headers)?;
    let existing = load_alive(&state, kind, &owner, uid).await?;
    update_existing(&state, kind, &owner, &existing, body, expected).await
}

/// Handler for PATCH /v1/:kind/:uid — shallow merge; `null` removes a key.
pub async fn handle_patch(
    State(state): State<AppState>,
    Path((kind, uid)): Path<(String, String)>,
    Extension(ctx): Extension<AuthContext>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let kind = parse_kind(&kind)?;
    let uid = parse_uid(&uid)?;
    let owner = ctx.owner_id();
    let expected = if_match_version(&headers)?;
    let existing = load_alive(&state, kind, &owner, uid).await?;

    let patch = body
        .as_object()
        .ok_or_else(|| ApiError::Validation("body must be a JSON object".to_string()))?;
    let mut merged = existing.payload.clone();
    let target = merged
        .as_object_mut()
        .ok_or_else(|| ApiError::Internal("stored payload is not an object".to_string()))?;
    for (key, value) in patch {
        if value.is_null() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }

    update_existing(&state, kind, &owner, &existing, merged, expected).await
}

/// Handler for DELETE /v1/:kind/:uid — soft delete. Deleting a task list
/// additionally orphans its tasks in the same transaction.
pub async fn handle_delete(
    State(state): State<AppState>,
    Path((kind, uid)): Path<(String, String)>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    let kind = parse_kind(&kind)?;
    let uid = parse_uid(&uid)?;
    let owner = ctx.owner_id();

    let Some(existing) = state.store.get(kind, &owner, uid).await? else {
        return Err(ApiError::NotFound);
    };
    if existing.is_tombstone() {
        // Deletion already propagated.
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    if kind == EntityKind::TaskList {
        cascade_task_list_delete(&state, &owner, &existing).await?;
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let effective = monotonic_ts(state.clock.now_ms(), existing.updated_at_ms);
    let write = build_write(&state, kind, uid, existing.payload.clone(), effective, None, true)?;
    write_and_reload(&state, kind, &owner, write).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Strip `taskListUid` from every task on the list, then tombstone the
/// list itself; either everything commits or nothing does.
async fn cascade_task_list_delete(
    state: &AppState,
    owner: &str,
    list_row: &ItemRow,
) -> Result<(), ApiError> {
    let list_uid = list_row.uid.to_string();
    let now = state.clock.now_ms();

    let mut members = Vec::new();
    let mut cursor = Cursor::zero();
    loop {
        let page = state
            .store
            .list(EntityKind::Task, owner, cursor, PULL_LIMIT_MAX, false)
            .await?;
        let Some(last) = page.last() else {
            break;
        };
        cursor = Cursor { ms: last.updated_at_ms, uid: last.uid };
        let full_page = page.len() == PULL_LIMIT_MAX;
        members.extend(page.into_iter().filter(|task| {
            task.payload.get("taskListUid").and_then(Value::as_str) == Some(list_uid.as_str())
        }));
        if !full_page {
            break;
        }
    }

    let mut task_writes = Vec::with_capacity(members.len());
    for task in members {
        let mut payload = task.payload.clone();
        if let Some(obj) = payload.as_object_mut() {
            obj.remove("taskListUid");
        }
        let effective = monotonic_ts(now, task.updated_at_ms);
        task_writes.push(build_write(
            state,
            EntityKind::Task,
            task.uid,
            payload,
            effective,
            None,
            false,
        )?);
    }

    let effective = monotonic_ts(now, list_row.updated_at_ms);
    let list_write = build_write(
        state,
        EntityKind::TaskList,
        list_row.uid,
        list_row.payload.clone(),
        effective,
        None,
        true,
    )?;

    state
        .store
        .cascade_task_list_delete(owner, now, list_write, task_writes)
        .await?;
    Ok(())
}

/// Handler for POST /v1/:kind/:uid/archive — payload-level archival,
/// orthogonal to tombstones.
pub async fn handle_archive(
    State(state): State<AppState>,
    Path((kind, uid)): Path<(String, String)>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    let kind = parse_kind(&kind)?;
    let uid = parse_uid(&uid)?;
    let owner = ctx.owner_id();
    let existing = load_alive(&state, kind, &owner, uid).await?;

    let mut payload = existing.payload.clone();
    let changed = match kind {
        EntityKind::Note => set_string_field(&mut payload, "status", "archived"),
        _ => set_field(&mut payload, "archived", json!(true)),
    };
    if !changed {
        return Ok(item_response(StatusCode::OK, &existing));
    }
    update_existing(&state, kind, &owner, &existing, payload, None).await
}

/// Handler for POST /v1/:kind/:uid/process — named state transitions.
pub async fn handle_process(
    State(state): State<AppState>,
    Path((kind, uid)): Path<(String, String)>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<ProcessRequest>,
) -> Result<Response, ApiError> {
    let kind = parse_kind(&kind)?;
    let uid = parse_uid(&uid)?;
    let owner = ctx.owner_id();
    let existing = load_alive(&state, kind, &owner, uid).await?;

    match apply_action(kind, &body.action, &existing.payload)? {
        // Already in the target state; do not churn the version.
        None => Ok(item_response(StatusCode::OK, &existing)),
        Some(payload) => update_existing(&state, kind, &owner, &existing, payload, None).await,
    }
}

fn set_field(payload: &mut Value, key: &str, value: Value) -> bool {
    let Some(obj) = payload.as_object_mut() else {
        return false;
    };
    if obj.get(key) == Some(&value) {
        return false;
    }
    obj.insert(key.to_string(), value);
    true
}

fn set_string_field(payload: &mut Value, key: &str, value: &str) -> bool {
    set_field(payload, key, json!(value))
}

fn string_field<'a>(payload: &'a Value, key: &str, default: &'a str) -> &'a str {
    payload.get(key).and_then(Value::as_str).unwrap_or(default)
}

/// Entity state machines. Returns `None` when the action is a no-op
/// (idempotent transitions), `Some(payload)` when the row must change.
fn apply_action(kind: EntityKind, action: &str, payload: &Value) -> Result<Option<Value>, ApiError> {
    let mut doc = payload.clone();
    let changed = match (kind, action) {
        (EntityKind::Note, "pin") => set_field(&mut doc, "pinned", json!(true)),
        (EntityKind::Note, "unpin") => set_field(&mut doc, "pinned", json!(false)),
        (EntityKind::Note, "archive") => set_string_field(&mut doc, "status", "archived"),
        (EntityKind::Note, "unarchive") => set_string_field(&mut doc, "status", "active"),
        (EntityKind::Task, "start") => {
            if string_field(payload, "status", "open") == "done" {
                return Err(ApiError::Validation("cannot start a completed task".to_string()));
            }
            set_string_field(&mut doc, "status", "in_progress")
        }
        (EntityKind::Task, "complete") => set_string_field(&mut doc, "status", "done"),
        (EntityKind::Task, "reopen") => set_string_field(&mut doc, "status", "open"),
        (EntityKind::Comment, "resolve") | (EntityKind::Chat, "resolve") => {
            set_string_field(&mut doc, "status", "resolved")
        }
        (EntityKind::Comment, "reopen") | (EntityKind::Chat, "reopen") => {
            set_string_field(&mut doc, "status", "open")
        }
        (EntityKind::ChatMessage, "mark_read") => set_field(&mut doc, "isRead", json!(1)),
        (EntityKind::ChatMessage, "mark_delivered") => set_field(&mut doc, "isDelivered", json!(1)),
        _ => {
            return Err(ApiError::Validation(format!(
                "unknown action {action:?} for {kind}"
            )))
        }
    };
    Ok(changed.then_some(doc))
}
