use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use toolbridge_common::headers;
use tracing::Instrument;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::rate::RateDecision;
use crate::AppState;

/// Correlation id carried through the request for log stitching.
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

/// Accept the caller's `X-Correlation-ID` or synthesize one, bind it into
/// the request's log span, and echo it on the response. Outermost layer so
/// error responses carry it too.
pub async fn correlation_id(mut request: Request, next: Next) -> Response {
    let cid = request
        .headers()
        .get(headers::CORRELATION_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(CorrelationId(cid.clone()));

    let span = tracing::info_span!(
        "request",
        correlation_id = %cid,
        method = %request.method(),
        path = %request.uri().path(),
    );
    let mut response = next.run(request).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&cid) {
        response.headers_mut().insert(headers::CORRELATION_ID, value);
    }
    response
}

/// Session + epoch preconditions and the rate limiter, in that order,
/// for data endpoints. Runs after identity resolution.
pub async fn preconditions(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let ctx = request.extensions().get::<AuthContext>().cloned();
    match check_preconditions(&state, ctx, request.headers()).await {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

async fn check_preconditions(
    state: &AppState,
    ctx: Option<AuthContext>,
    req_headers: &axum::http::HeaderMap,
) -> Result<(), ApiError> {
    let ctx = ctx.ok_or_else(|| ApiError::Internal("auth context missing".to_string()))?;

    let session_id = req_headers
        .get(headers::SYNC_SESSION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::PreconditionRequired("missing X-Sync-Session".to_string()))?;

    let now = state.clock.now_ms();
    let session = state
        .store
        .lookup_session(session_id)
        .await?
        .filter(|s| s.expires_ms > now && s.owner_id == ctx.owner_id())
        .ok_or_else(|| ApiError::PreconditionRequired("unknown or expired session".to_string()))?;

    let claimed_epoch = req_headers
        .get(headers::SYNC_EPOCH)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::PreconditionRequired("missing X-Sync-Epoch".to_string()))?;
    let claimed_epoch: u64 = claimed_epoch
        .parse()
        .map_err(|_| ApiError::Validation("X-Sync-Epoch must be an integer".to_string()))?;

    let current = state.store.current_epoch(&ctx.owner_id()).await?;
    if claimed_epoch != current || session.epoch != current {
        return Err(ApiError::EpochMismatch { epoch: current });
    }

    apply_rate_limit(state, &ctx.sub)
}

/// Standalone rate limiting for endpoints that carry no session
/// preconditions (session creation, epoch bump).
pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(ctx) = request.extensions().get::<AuthContext>().cloned() else {
        return ApiError::Internal("auth context missing".to_string()).into_response();
    };
    match apply_rate_limit(&state, &ctx.sub) {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

fn apply_rate_limit(state: &AppState, subject: &str) -> Result<(), ApiError> {
    match state.rate.check(subject) {
        RateDecision::Allowed { .. } => Ok(()),
        RateDecision::Limited { retry_after_secs, reset_secs } => {
            Err(ApiError::RateLimited { retry_after_secs, reset_secs })
        }
    }
}
