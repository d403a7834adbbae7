use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ETAG, IF_MATCH, RETRY_AFTER};
use reqwest::{Method, Response, StatusCode};
use serde_json::Value;
use tokio::sync::Mutex;
use toolbridge_common::wire::{
    EpochInfo, ErrorBody, ListResponse, ProcessRequest, PullResponse, PushAck, PushRequest,
    SessionInfo,
};
use toolbridge_common::{headers, EntityKind, Result, ToolbridgeError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How many times a single logical call may be retried across all retry
/// classes (auth, session recreation, rate limiting).
const MAX_RETRIES: u32 = 3;

/// Toolbridge client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the API, e.g. `http://127.0.0.1:8080`.
    pub base_url: String,
    /// Bearer token forwarded on every request. The client never mints or
    /// refreshes tokens; MCP passthrough hands the caller's token straight
    /// through here.
    pub bearer_token: Option<String>,
    /// Dev-mode identity bypass, used when no bearer token is set.
    pub debug_sub: Option<String>,
    pub tenant_id: String,
}

#[derive(Debug, Clone)]
struct SessionState {
    id: String,
    epoch: u64,
}

/// Result of fetching a single entity.
#[derive(Debug, Clone)]
pub struct ItemResult {
    pub payload: Value,
    pub version: u64,
}

/// Toolbridge API client. Holds one sync session and transparently
/// recreates it when the server reports a precondition failure or an
/// epoch mismatch.
pub struct ApiClient {
    config: ClientConfig,
    http: reqwest::Client,
    session: Mutex<Option<SessionState>>,
}

impl ApiClient {
    /// Create a new client with the given configuration
    pub fn new(config: ClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { config, http, session: Mutex::new(None) }
    }

    /// Build the URL for an API path against the configured base.
    pub fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn identity_headers(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        if let Some(token) = &self.config.bearer_token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                map.insert("authorization", value);
            }
        } else if let Some(sub) = &self.config.debug_sub {
            if let Ok(value) = HeaderValue::from_str(sub) {
                map.insert(headers::DEBUG_SUB, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&self.config.tenant_id) {
            map.insert(headers::TENANT_ID, value);
        }
        map
    }

    /// Explicitly create a sync session; data calls do this lazily.
    pub async fn create_session(&self) -> Result<SessionInfo> {
        let response = self
            .http
            .post(self.build_url("/v1/sync/sessions"))
            .headers(self.identity_headers())
            .send()
            .await
            .map_err(|e| ToolbridgeError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let info: SessionInfo = response
            .json()
            .await
            .map_err(|e| ToolbridgeError::Transport(e.to_string()))?;
        *self.session.lock().await = Some(SessionState { id: info.id.clone(), epoch: info.epoch });
        Ok(info)
    }

    /// Advance the owner's epoch, invalidating every outstanding session
    /// (including this client's, which is refreshed on the next call).
    pub async fn bump_epoch(&self) -> Result<u64> {
        let response = self
            .http
            .post(self.build_url("/v1/sync/epoch/bump"))
            .headers(self.identity_headers())
            .send()
            .await
            .map_err(|e| ToolbridgeError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let info: EpochInfo = response
            .json()
            .await
            .map_err(|e| ToolbridgeError::Transport(e.to_string()))?;
        *self.session.lock().await = None;
        Ok(info.epoch)
    }

    async fn ensure_session(&self) -> Result<SessionState> {
        if let Some(session) = self.session.lock().await.clone() {
            return Ok(session);
        }
        self.create_session().await?;
        self.session
            .lock()
            .await
            .clone()
            .ok_or_else(|| ToolbridgeError::Backend("session missing after create".to_string()))
    }

    async fn invalidate_session(&self) {
        *self.session.lock().await = None;
    }

    /// Issue one data request with the retry contract:
    /// 401 retried once, 409 epoch-mismatch and 428 recreate the session
    /// and retry once, 429 honors Retry-After with exponential fallback,
    /// everything else surfaces immediately.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        if_match: Option<u64>,
    ) -> Result<Response> {
        let mut auth_retried = false;
        let mut session_retried = false;
        let mut retries = 0u32;
        let mut backoff_secs = 1u64;

        loop {
            let session = self.ensure_session().await?;

            let mut request = self
                .http
                .request(method.clone(), self.build_url(path))
                .headers(self.identity_headers())
                .header(headers::SYNC_SESSION, &session.id)
                .header(headers::SYNC_EPOCH, session.epoch.to_string());
            if let Some(version) = if_match {
                request = request.header(IF_MATCH, format!("\"{version}\""));
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .map_err(|e| ToolbridgeError::Transport(e.to_string()))?;
            let status = response.status();

            if status.is_success() {
                return Ok(response);
            }

            match status {
                StatusCode::UNAUTHORIZED if !auth_retried && retries < MAX_RETRIES => {
                    // Passthrough tokens cannot be refreshed; a single
                    // retry covers transient validation failures.
                    auth_retried = true;
                    retries += 1;
                }
                StatusCode::CONFLICT => {
                    let error = error_from_response(response).await;
                    let epoch_mismatch = matches!(error, ToolbridgeError::EpochMismatch { .. });
                    if epoch_mismatch && !session_retried && retries < MAX_RETRIES {
                        session_retried = true;
                        retries += 1;
                        self.invalidate_session().await;
                    } else {
                        return Err(error);
                    }
                }
                StatusCode::PRECONDITION_REQUIRED if !session_retried && retries < MAX_RETRIES => {
                    session_retried = true;
                    retries += 1;
                    self.invalidate_session().await;
                }
                StatusCode::TOO_MANY_REQUESTS if retries < MAX_RETRIES => {
                    let wait = retry_after_secs(response.headers()).unwrap_or_else(|| {
                        let current = backoff_secs;
                        backoff_secs = backoff_secs.saturating_mul(2);
                        current
                    });
                    retries += 1;
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }
                _ => return Err(error_from_response(response).await),
            }
        }
    }

    // --- Sync surface ---

    pub async fn push(&self, kind: EntityKind, items: Vec<Value>) -> Result<Vec<PushAck>> {
        let body = serde_json::to_value(PushRequest { items })
            .map_err(|e| ToolbridgeError::Validation(e.to_string()))?;
        let response = self
            .request(
                Method::POST,
                &format!("/v1/sync/{}/push", kind.path_segment()),
                Some(&body),
                None,
            )
            .await?;
        parse_json(response).await
    }

    pub async fn pull(
        &self,
        kind: EntityKind,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<PullResponse> {
        let mut path = format!("/v1/sync/{}/pull", kind.path_segment());
        let mut sep = '?';
        if let Some(cursor) = cursor {
            path.push_str(&format!("{sep}cursor={cursor}"));
            sep = '&';
        }
        if let Some(limit) = limit {
            path.push_str(&format!("{sep}limit={limit}"));
        }
        let response = self.request(Method::GET, &path, None, None).await?;
        parse_json(response).await
    }

    // --- REST surface ---

    pub async fn get(&self, kind: EntityKind, uid: &str) -> Result<ItemResult> {
        let path = format!("/v1/{}/{uid}", kind.path_segment());
        let response = self.request(Method::GET, &path, None, None).await?;
        item_result(response).await
    }

    pub async fn list(
        &self,
        kind: EntityKind,
        cursor: Option<&str>,
        include_deleted: bool,
    ) -> Result<ListResponse> {
        let mut path = format!("/v1/{}?includeDeleted={include_deleted}", kind.path_segment());
        if let Some(cursor) = cursor {
            path.push_str(&format!("&cursor={cursor}"));
        }
        let response = self.request(Method::GET, &path, None, None).await?;
        parse_json(response).await
    }

    pub async fn create(&self, kind: EntityKind, body: Value) -> Result<ItemResult> {
        let path = format!("/v1/{}", kind.path_segment());
        let response = self.request(Method::POST, &path, Some(&body), None).await?;
        item_result(response).await
    }

    /// Full replace; `if_match` engages optimistic locking.
    pub async fn update(
        &self,
        kind: EntityKind,
        uid: &str,
        body: Value,
        if_match: Option<u64>,
    ) -> Result<ItemResult> {
        let path = format!("/v1/{}/{uid}", kind.path_segment());
        let response = self.request(Method::PUT, &path, Some(&body), if_match).await?;
        item_result(response).await
    }

    /// Shallow merge; `null` values remove keys.
    pub async fn patch(&self, kind: EntityKind, uid: &str, body: Value) -> Result<ItemResult> {
        let path = format!("/v1/{}/{uid}", kind.path_segment());
        let response = self.request(Method::PATCH, &path, Some(&body), None).await?;
        item_result(response).await
    }

    pub async fn delete(&self, kind: EntityKind, uid: &str) -> Result<()> {
        let path = format!("/v1/{}/{uid}", kind.path_segment());
        self.request(Method::DELETE, &path, None, None).await?;
        Ok(())
    }

    pub async fn archive(&self, kind: EntityKind, uid: &str) -> Result<ItemResult> {
        let path = format!("/v1/{}/{uid}/archive", kind.path_segment());
        let response = self.request(Method::POST, &path, None, None).await?;
        item_result(response).await
    }

    pub async fn process(&self, kind: EntityKind, uid: &str, action: &str) -> Result<ItemResult> {
        let path = format!("/v1/{}/{uid}/process", kind.path_segment());
        let body = serde_json::to_value(ProcessRequest { action: action.to_string() })
            .map_err(|e| ToolbridgeError::Validation(e.to_string()))?;
        let response = self.request(Method::POST, &path, Some(&body), None).await?;
        item_result(response).await
    }
}

async fn parse_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| ToolbridgeError::Transport(e.to_string()))
}

async fn item_result(response: Response) -> Result<ItemResult> {
    let version = parse_etag(&response).unwrap_or(0);
    let payload = parse_json(response).await?;
    Ok(ItemResult { payload, version })
}

/// Parse the ETag header as a `u64` version; returns `None` if absent or
/// unparseable.
pub fn parse_etag(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim_matches('"'))
        .and_then(|s| s.parse::<u64>().ok())
}

/// `Retry-After` in whole seconds, accepting both the delta-seconds and
/// HTTP-date forms.
pub fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
    if let Ok(secs) = raw.trim().parse::<u64>() {
        return Some(secs);
    }
    let when = chrono::DateTime::parse_from_rfc2822(raw.trim()).ok()?;
    let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.num_seconds().max(0) as u64)
}

/// Map a non-2xx response to a typed error using the JSON body's `error`
/// kind, falling back to the status code.
pub async fn error_from_response(response: Response) -> ToolbridgeError {
    let status = response.status();
    let current_version = parse_etag(&response);
    let retry_after = retry_after_secs(response.headers());
    let body: Option<ErrorBody> = response.json().await.ok();
    classify_error(status.as_u16(), body, current_version, retry_after)
}

/// Pure classification used by [`error_from_response`].
pub fn classify_error(
    status: u16,
    body: Option<ErrorBody>,
    etag_version: Option<u64>,
    retry_after: Option<u64>,
) -> ToolbridgeError {
    let kind = body.as_ref().map(|b| b.error.clone()).unwrap_or_default();
    let epoch_hint = body.as_ref().and_then(|b| b.epoch);
    let message = body
        .and_then(|b| b.message)
        .unwrap_or_else(|| format!("status {status}"));

    match status {
        401 => ToolbridgeError::Auth(message),
        403 => ToolbridgeError::TenantDenied(message),
        404 => ToolbridgeError::NotFound(message),
        410 => ToolbridgeError::Gone(message),
        409 if kind == "epoch_mismatch" => {
            ToolbridgeError::EpochMismatch { epoch: epoch_hint.unwrap_or(0) }
        }
        409 => ToolbridgeError::HttpError(409, message),
        412 => ToolbridgeError::VersionMismatch { current: etag_version.unwrap_or(0) },
        428 => ToolbridgeError::PreconditionRequired(message),
        429 => ToolbridgeError::RateLimited { retry_after_secs: retry_after.unwrap_or(1) },
        400 => ToolbridgeError::Validation(message),
        _ => ToolbridgeError::HttpError(status, message),
    }
}
