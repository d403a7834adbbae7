use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::Value;
use toolbridge_common::wire::{PullResponse, PushAck, PushRequest, TombstoneRef};
use toolbridge_common::{time, Cursor, EntityKind, ItemEnvelope, MirrorSpec};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::config::PULL_LIMIT_MAX;
use crate::error::ApiError;
use crate::store::ItemWrite;
use crate::AppState;

/// Resolve a path segment to an entity kind; unknown collections are 404.
pub(crate) fn parse_kind(segment: &str) -> Result<EntityKind, ApiError> {
    segment.parse().map_err(|_| ApiError::NotFound)
}

/// Denormalize the relation columns the storage layer keeps next to the
/// payload. Comments require a valid parent reference; chat messages
/// require their chat.
pub(crate) fn relation_columns(
    kind: EntityKind,
    doc: &Value,
) -> Result<(Option<Uuid>, Option<String>, Option<Uuid>), String> {
    match kind {
        EntityKind::Comment => {
            let parent_uid = doc
                .get("parentUid")
                .and_then(Value::as_str)
                .ok_or("missing parentUid")?;
            let parent_uid =
                Uuid::parse_str(parent_uid).map_err(|_| format!("invalid parentUid: {parent_uid}"))?;
            let parent_kind = doc
                .get("parentKind")
                .and_then(Value::as_str)
                .ok_or("missing parentKind")?;
            let parsed: EntityKind = parent_kind
                .parse()
                .map_err(|_| format!("invalid parentKind: {parent_kind}"))?;
            if !parsed.is_comment_parent() {
                return Err(format!("invalid parentKind: {parent_kind}"));
            }
            Ok((Some(parent_uid), Some(parsed.singular().to_string()), None))
        }
        EntityKind::ChatMessage => {
            let chat_uid = doc.get("chatUid").and_then(Value::as_str).ok_or("missing chatUid")?;
            let chat_uid =
                Uuid::parse_str(chat_uid).map_err(|_| format!("invalid chatUid: {chat_uid}"))?;
            Ok((None, None, Some(chat_uid)))
        }
        _ => Ok((None, None, None)),
    }
}

fn salvage_uid(doc: &Value) -> Option<Uuid> {
    doc.get("uid").and_then(Value::as_str).and_then(|s| Uuid::parse_str(s).ok())
}

enum Slot {
    Write { index: usize, uid: Uuid },
    Rejected(PushAck),
}

/// Handler for POST /v1/sync/:kind/push — apply a batch of client
/// documents under the LWW rule and ack each in input order. Item
/// failures land in the ack's `error`; the batch continues.
pub async fn handle_push(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<PushRequest>,
) -> Result<Json<Vec<PushAck>>, ApiError> {
    let kind = parse_kind(&kind)?;
    let owner = ctx.owner_id();
    let now = state.clock.now_ms();

    let mut slots = Vec::with_capacity(body.items.len());
    let mut writes = Vec::new();
    for doc in body.items {
        let env = match ItemEnvelope::parse(&doc) {
            Ok(env) => env,
            Err(e) => {
                slots.push(Slot::Rejected(PushAck::rejected(salvage_uid(&doc), e.to_string())));
                continue;
            }
        };
        let (parent_uid, parent_kind, chat_uid) = match relation_columns(kind, &doc) {
            Ok(columns) => columns,
            Err(msg) => {
                slots.push(Slot::Rejected(PushAck::rejected(Some(env.uid), msg)));
                continue;
            }
        };
        slots.push(Slot::Write { index: writes.len(), uid: env.uid });
        writes.push(ItemWrite {
            uid: env.uid,
            updated_at_ms: env.updated_at_ms,
            deleted_at_ms: env.deleted_at_ms,
            client_version: env.client_version,
            payload: doc,
            mirror: MirrorSpec::minimal(),
            expected_version: None,
            parent_uid,
            parent_kind,
            chat_uid,
        });
    }

    let outcomes = state.store.apply_batch(kind, &owner, now, writes).await?;

    let acks = slots
        .into_iter()
        .map(|slot| match slot {
            Slot::Rejected(ack) => ack,
            Slot::Write { index, uid } => match &outcomes[index] {
                Ok(outcome) => PushAck {
                    uid: Some(uid),
                    version: outcome.version,
                    updated_at: Some(time::ms_to_datetime(outcome.updated_at_ms)),
                    applied: outcome.applied,
                    error: None,
                },
                Err(message) => PushAck::rejected(Some(uid), message.clone()),
            },
        })
        .collect();
    Ok(Json(acks))
}

#[derive(Debug, Deserialize)]
pub struct PullParams {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

/// Handler for GET /v1/sync/:kind/pull — cursor-paginated delta download.
/// Alive rows emit whole payloads; tombstones emit `{uid, deletedAt}`.
pub async fn handle_pull(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Extension(ctx): Extension<AuthContext>,
    Query(params): Query<PullParams>,
) -> Result<Json<PullResponse>, ApiError> {
    let kind = parse_kind(&kind)?;
    let owner = ctx.owner_id();

    let cursor = Cursor::decode_opt(params.cursor.as_deref())?;
    let limit = params.limit.unwrap_or(PULL_LIMIT_MAX).clamp(1, PULL_LIMIT_MAX);

    let rows = state.store.list(kind, &owner, cursor, limit, true).await?;

    let next_cursor = rows
        .last()
        .map(|row| Cursor { ms: row.updated_at_ms, uid: row.uid }.encode());

    let mut upserts = Vec::new();
    let mut deletes = Vec::new();
    for row in rows {
        match row.deleted_at_ms {
            Some(deleted_ms) => deletes.push(TombstoneRef {
                uid: row.uid,
                deleted_at: time::ms_to_datetime(deleted_ms),
            }),
            None => upserts.push(row.payload),
        }
    }

    Ok(Json(PullResponse { upserts, deletes, next_cursor }))
}
