use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use toolbridge_common::headers;

use crate::error::ApiError;
use crate::AppState;

pub mod jwks;
pub mod tenant;
pub mod token;

pub use tenant::{MembershipProvider, TenantAuthorizer, WorkOsMembershipClient};
pub use token::{TokenValidator, ValidatedToken};

/// Identity and tenant of the caller, established before any handler runs.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub sub: String,
    pub tenant_id: String,
}

impl AuthContext {
    /// Rows, sessions and epochs are keyed by this composite: the same
    /// user acting on two tenants owns disjoint data.
    pub fn owner_id(&self) -> String {
        format!("{}:{}", self.user_id, self.tenant_id)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Extract and validate the caller's identity, upsert the user row, and
/// authorize the requested tenant. On success an [`AuthContext`] is placed
/// into request extensions for downstream middleware and handlers.
pub async fn resolve_identity(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    match establish_context(&state, request.headers()).await {
        Ok(ctx) => {
            request.extensions_mut().insert(ctx);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

async fn establish_context(state: &AppState, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    let sub = resolve_subject(state, headers).await?;
    let user_id = state.store.get_or_create_user(&sub).await?;

    let tenant_id = header_str(headers, headers::TENANT_ID)
        .map(str::to_string)
        .ok_or_else(|| ApiError::Tenant("missing X-TB-Tenant-ID header".to_string()))?;

    // The deprecated HMAC header and the membership resolver are mutually
    // exclusive: when no membership client is configured, a legacy secret
    // replaces the membership check entirely rather than stacking on it.
    // A configured membership client always takes precedence.
    #[cfg(feature = "legacy-tenant-hmac")]
    if !state.tenants.has_provider() {
        if let Some(secret) = &state.legacy_tenant_secret {
            let sig = header_str(headers, "x-tb-tenant-sig")
                .ok_or_else(|| ApiError::Tenant("missing tenant signature".to_string()))?;
            tenant::legacy::verify_tenant_sig(secret, &tenant_id, sig, state.clock.now_ms())?;
            return Ok(AuthContext { user_id, sub, tenant_id });
        }
    }

    state.tenants.authorize(&sub, &tenant_id).await?;

    Ok(AuthContext { user_id, sub, tenant_id })
}

async fn resolve_subject(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    if let Some(value) = header_str(headers, "authorization") {
        let token = value
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::Auth("authorization scheme must be Bearer".to_string()))?;
        let validated = state.tokens.validate(token).await?;
        return Ok(validated.sub);
    }

    if state.dev_mode {
        if let Some(sub) = header_str(headers, headers::DEBUG_SUB) {
            return Ok(sub.to_string());
        }
    }

    Err(ApiError::Auth("missing bearer token".to_string()))
}
