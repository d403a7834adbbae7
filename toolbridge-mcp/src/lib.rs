use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use toolbridge_client::{ApiClient, ClientConfig};
use toolbridge_common::headers;
use toolbridge_common::wire::ErrorBody;
use toolbridge_server::auth::TokenValidator;
use toolbridge_server::Clock;

pub mod rpc;
pub mod session;
pub mod tools;

use rpc::{codes, RpcError, RpcRequest, RpcResponse};
use session::SessionTable;

pub const MCP_SESSION_HEADER: &str = "mcp-session-id";

/// MCP protocol revision the bridge speaks.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub address: SocketAddr,
    /// Upstream Toolbridge API base URL.
    pub upstream_url: String,
    /// Upstream IdP issuer, reflected in the discovery documents.
    pub issuer: Option<String>,
    pub jwks_url: Option<String>,
    /// Tenant used when the caller sends no X-TB-Tenant-ID header.
    pub default_tenant: Option<String>,
}

#[derive(Clone)]
pub struct BridgeState {
    pub tokens: Arc<TokenValidator>,
    pub sessions: Arc<SessionTable>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<BridgeConfig>,
}

/// Toolbridge MCP bridge server
pub struct Server {
    state: BridgeState,
}

impl Server {
    pub fn new(state: BridgeState) -> Self {
        Self { state }
    }

    /// Create the application router with the given state.
    pub fn create_router(state: BridgeState) -> Router {
        Router::new()
            .route("/healthz", get(handle_healthz))
            .route(
                "/mcp",
                get(handle_mcp_get).post(handle_mcp_post).delete(handle_mcp_delete),
            )
            .route(
                "/.well-known/oauth-authorization-server",
                get(handle_authorization_server_metadata),
            )
            .route(
                "/.well-known/oauth-protected-resource",
                get(handle_protected_resource_metadata),
            )
            .with_state(state)
    }

    /// Run the bridge, signalling `ready_tx` with the bound address once
    /// accepting connections.
    pub async fn run(
        self,
        ready_tx: tokio::sync::oneshot::Sender<SocketAddr>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let state = self.state.clone();
        let sessions = state.sessions.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let swept = sessions.sweep().await;
                if swept > 0 {
                    tracing::debug!(swept, "expired MCP sessions removed");
                }
            }
        });

        let app = Self::create_router(state.clone());
        let listener = tokio::net::TcpListener::bind(state.config.address).await?;
        let local_addr = listener.local_addr()?;
        ready_tx.send(local_addr).ok();
        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn handle_healthz() -> &'static str {
    "ok"
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn rpc_json(status: StatusCode, response: RpcResponse) -> Response {
    (status, Json(response)).into_response()
}

fn upstream_client(state: &BridgeState, token: &str, tenant: &str) -> Arc<ApiClient> {
    Arc::new(ApiClient::new(ClientConfig {
        base_url: state.config.upstream_url.clone(),
        bearer_token: Some(token.to_string()),
        debug_sub: None,
        tenant_id: tenant.to_string(),
    }))
}

/// Handler for POST /mcp — the Streamable-HTTP JSON-RPC entry point.
/// `initialize` mints a session; every other method requires
/// `Mcp-Session-Id` and dispatches with the caller's own bearer token.
pub async fn handle_mcp_post(
    State(state): State<BridgeState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return rpc_json(
                StatusCode::OK,
                RpcResponse::failure(None, RpcError::new(codes::PARSE_ERROR, e.to_string())),
            )
        }
    };
    if request.jsonrpc != "2.0" {
        return rpc_json(
            StatusCode::OK,
            RpcResponse::failure(
                request.id,
                RpcError::new(codes::INVALID_REQUEST, "jsonrpc must be \"2.0\""),
            ),
        );
    }

    // The bridge reuses the API's validation rules and then passes the
    // token through unchanged; it never mints its own.
    let Some(token) = bearer_token(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody::new("auth", "missing bearer token")),
        )
            .into_response();
    };
    let validated = match state.tokens.validate(token).await {
        Ok(validated) => validated,
        Err(_) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody::new("auth", "invalid bearer token")),
            )
                .into_response()
        }
    };

    if request.method == "initialize" {
        return initialize(&state, &headers, token, &validated.sub, request.id).await;
    }
    if request.method == "notifications/initialized" {
        return StatusCode::ACCEPTED.into_response();
    }

    let Some(session_id) = headers.get(MCP_SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
        return rpc_json(
            StatusCode::BAD_REQUEST,
            RpcResponse::failure(
                request.id,
                RpcError::new(codes::INVALID_REQUEST, "missing Mcp-Session-Id header"),
            ),
        );
    };
    let Some((sub, tenant, session_token, mut client)) = state.sessions.lookup(session_id).await
    else {
        return rpc_json(
            StatusCode::NOT_FOUND,
            RpcResponse::failure(
                request.id,
                RpcError::new(codes::INVALID_REQUEST, "unknown or expired session"),
            ),
        );
    };
    if sub != validated.sub {
        return (
            StatusCode::FORBIDDEN,
            Json(ErrorBody::new("auth", "session belongs to a different subject")),
        )
            .into_response();
    }
    if session_token != token {
        // Token rotated mid-session: rebind the passthrough client.
        client = upstream_client(&state, token, &tenant);
        state
            .sessions
            .rebind(session_id, token.to_string(), client.clone())
            .await;
    }

    tracing::debug!(sub = %sub, session_id = %session_id, method = %request.method, "mcp request");

    let RpcRequest { id, method, params, .. } = request;
    match method.as_str() {
        "ping" => rpc_json(StatusCode::OK, RpcResponse::success(id, json!({}))),
        "tools/list" => {
            let tools: Vec<Value> = tools::list_tools().iter().map(|tool| tool.to_json()).collect();
            rpc_json(StatusCode::OK, RpcResponse::success(id, json!({"tools": tools})))
        }
        "tools/call" => {
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return rpc_json(
                    StatusCode::OK,
                    RpcResponse::failure(id, RpcError::invalid_params("missing tool name")),
                );
            };
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            match tools::dispatch(name, &arguments, &client, &state.sessions, session_id).await {
                Ok(result) => {
                    let text =
                        serde_json::to_string(&result).unwrap_or_else(|_| "null".to_string());
                    rpc_json(
                        StatusCode::OK,
                        RpcResponse::success(
                            id,
                            json!({
                                "content": [{"type": "text", "text": text}],
                                "isError": false,
                            }),
                        ),
                    )
                }
                Err(error) => {
                    tracing::debug!(tool = %name, code = error.code, "tool call failed");
                    rpc_json(StatusCode::OK, RpcResponse::failure(id, error))
                }
            }
        }
        "resources/list" => {
            let resources: Vec<Value> = state
                .sessions
                .attachments(session_id)
                .await
                .iter()
                .map(|a| {
                    json!({
                        "uri": format!("toolbridge://{}/{}", a.entity_kind, a.entity_uid),
                        "name": a.title,
                        "mimeType": "application/json",
                    })
                })
                .collect();
            rpc_json(StatusCode::OK, RpcResponse::success(id, json!({"resources": resources})))
        }
        "resources/read" => {
            let Some(uri) = params.get("uri").and_then(Value::as_str) else {
                return rpc_json(
                    StatusCode::OK,
                    RpcResponse::failure(id, RpcError::invalid_params("missing uri")),
                );
            };
            match read_resource(&client, uri).await {
                Ok(contents) => rpc_json(
                    StatusCode::OK,
                    RpcResponse::success(id, json!({"contents": [contents]})),
                ),
                Err(error) => rpc_json(StatusCode::OK, RpcResponse::failure(id, error)),
            }
        }
        other => rpc_json(
            StatusCode::OK,
            RpcResponse::failure(id, RpcError::method_not_found(other)),
        ),
    }
}

async fn initialize(
    state: &BridgeState,
    headers: &HeaderMap,
    token: &str,
    sub: &str,
    id: Option<Value>,
) -> Response {
    let tenant = headers
        .get(headers::TENANT_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| state.config.default_tenant.clone());
    let Some(tenant) = tenant else {
        return rpc_json(
            StatusCode::BAD_REQUEST,
            RpcResponse::failure(
                id,
                RpcError::new(codes::INVALID_REQUEST, "no tenant header and no default tenant"),
            ),
        );
    };

    let client = upstream_client(state, token, &tenant);
    let session_id = state
        .sessions
        .create(sub.to_string(), tenant, token.to_string(), client)
        .await;

    tracing::info!(sub = %sub, session_id = %session_id, "mcp session initialized");

    let result = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": {},
            "resources": {},
        },
        "serverInfo": {
            "name": "toolbridge-mcp",
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let mut response = rpc_json(StatusCode::OK, RpcResponse::success(id, result));
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response.headers_mut().insert(MCP_SESSION_HEADER, value);
    }
    response
}

/// `toolbridge://<kind>/<uid>` resource URIs.
async fn read_resource(client: &Arc<ApiClient>, uri: &str) -> Result<Value, RpcError> {
    let rest = uri
        .strip_prefix("toolbridge://")
        .ok_or_else(|| RpcError::invalid_params(format!("unsupported uri: {uri}")))?;
    let (kind, uid) = rest
        .split_once('/')
        .ok_or_else(|| RpcError::invalid_params(format!("unsupported uri: {uri}")))?;
    let kind = kind
        .parse()
        .map_err(|_| RpcError::invalid_params(format!("unknown kind in uri: {uri}")))?;
    let item = client.get(kind, uid).await?;
    Ok(json!({
        "uri": uri,
        "mimeType": "application/json",
        "text": serde_json::to_string(&item.payload).unwrap_or_default(),
    }))
}

/// Handler for GET /mcp — the server-to-client SSE stream. The bridge has
/// no server-initiated messages; the stream carries keep-alives until the
/// client disconnects.
pub async fn handle_mcp_get(
    State(state): State<BridgeState>,
    headers: HeaderMap,
) -> Response {
    let Some(session_id) = headers.get(MCP_SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::new("validation", "missing Mcp-Session-Id header")),
        )
            .into_response();
    };
    if state.sessions.lookup(session_id).await.is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorBody::new("not_found", "unknown or expired session")),
        )
            .into_response();
    }

    let stream = futures::stream::pending::<Result<Event, Infallible>>();
    Sse::new(stream).keep_alive(KeepAlive::new()).into_response()
}

/// Handler for DELETE /mcp — close and forget a session.
pub async fn handle_mcp_delete(
    State(state): State<BridgeState>,
    headers: HeaderMap,
) -> Response {
    let Some(session_id) = headers.get(MCP_SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::new("validation", "missing Mcp-Session-Id header")),
        )
            .into_response();
    };
    if state.sessions.remove(session_id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorBody::new("not_found", "unknown or expired session")),
        )
            .into_response()
    }
}

/// Handler for GET /.well-known/oauth-authorization-server — reflects the
/// upstream IdP so MCP clients can run the OAuth flow against it.
pub async fn handle_authorization_server_metadata(
    State(state): State<BridgeState>,
) -> Response {
    let Some(issuer) = state.config.issuer.clone() else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorBody::new("not_found", "no issuer configured")),
        )
            .into_response();
    };
    let base = issuer.trim_end_matches('/');
    Json(json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{base}/oauth2/authorize"),
        "token_endpoint": format!("{base}/oauth2/token"),
        "registration_endpoint": format!("{base}/oauth2/register"),
        "jwks_uri": state.config.jwks_url,
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "code_challenge_methods_supported": ["S256"],
    }))
    .into_response()
}

/// Handler for GET /.well-known/oauth-protected-resource.
pub async fn handle_protected_resource_metadata(
    State(state): State<BridgeState>,
) -> Response {
    Json(json!({
        "resource": state.config.upstream_url,
        "authorization_servers": state.config.issuer.as_ref().map(|i| vec![i.clone()]).unwrap_or_default(),
        "bearer_methods_supported": ["header"],
    }))
    .into_response()
}
