use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use toolbridge_common::wire::{EpochInfo, SessionInfo};
use toolbridge_common::{headers, time};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::config::SESSION_TTL_MS;
use crate::error::ApiError;
use crate::store::SessionRow;
use crate::AppState;

fn epoch_header(response: &mut Response, epoch: u64) {
    if let Ok(value) = HeaderValue::from_str(&epoch.to_string()) {
        response.headers_mut().insert(headers::SYNC_EPOCH, value);
    }
}

/// Handler for POST /v1/sync/sessions — mint a session bound to the
/// owner's current epoch. The epoch is also echoed in `X-Sync-Epoch`.
pub async fn handle_create_session(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    let owner = ctx.owner_id();
    let epoch = state.store.current_epoch(&owner).await?;

    let now = state.clock.now_ms();
    let session = SessionRow {
        id: Uuid::new_v4().to_string(),
        owner_id: owner,
        epoch,
        created_ms: now,
        expires_ms: now + SESSION_TTL_MS,
    };
    state.store.create_session(session.clone()).await?;

    tracing::debug!(session_id = %session.id, epoch, "session created");

    let body = SessionInfo {
        id: session.id,
        user_id: ctx.user_id,
        epoch,
        created_at: time::ms_to_datetime(session.created_ms),
        expires_at: time::ms_to_datetime(session.expires_ms),
    };
    let mut response = (StatusCode::CREATED, Json(body)).into_response();
    epoch_header(&mut response, epoch);
    Ok(response)
}

/// Handler for POST /v1/sync/epoch/bump — advance the owner's epoch,
/// invalidating every outstanding session at the precondition gate.
pub async fn handle_bump_epoch(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    let owner = ctx.owner_id();
    let epoch = state.store.bump_epoch(&owner).await?;
    tracing::info!(owner = %owner, epoch, "epoch bumped");

    let mut response = (StatusCode::OK, Json(EpochInfo { epoch })).into_response();
    epoch_header(&mut response, epoch);
    Ok(response)
}
