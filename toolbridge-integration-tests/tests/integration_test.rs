use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::timeout;
use toolbridge_client::{ApiClient, ClientConfig};
use toolbridge_common::{headers, EntityKind, ToolbridgeError};
use toolbridge_server::auth::{TenantAuthorizer, TokenValidator};
use toolbridge_server::rate::{RateLimiter, RateSettings};
use toolbridge_server::store::MemStore;
use toolbridge_server::{
    AppState, Clock, MirrorConfig, Server, ServerConfig, SystemClock,
};

const SERVER_READY_TIMEOUT: Duration = Duration::from_secs(60);
const SECRET: &str = "integration-secret";

const UID_X: &str = "a0000000-0000-0000-0000-000000000001";

async fn start_backend(rate: Option<RateSettings>) -> SocketAddr {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = AppState {
        store: Arc::new(MemStore::new()),
        clock: clock.clone(),
        tokens: Arc::new(TokenValidator::new(
            None,
            None,
            None,
            Vec::new(),
            Some(SECRET.to_string()),
            clock.clone(),
        )),
        tenants: Arc::new(TenantAuthorizer::new(None, None, clock.clone())),
        rate: Arc::new(RateLimiter::new(rate, clock.clone())),
        mirrors: Arc::new(MirrorConfig::new()),
        dev_mode: true,
        #[cfg(feature = "legacy-tenant-hmac")]
        legacy_tenant_secret: None,
    };

    let (ready_tx, ready_rx) = oneshot::channel();
    let server = Server::new(ServerConfig::default(), state);
    tokio::spawn(async move {
        server.run(ready_tx).await.expect("server failed");
    });
    timeout(SERVER_READY_TIMEOUT, ready_rx)
        .await
        .expect("server did not start within 60 seconds")
        .expect("server ready signal dropped")
}

fn api(addr: SocketAddr, sub: &str, tenant: &str) -> ApiClient {
    ApiClient::new(ClientConfig {
        base_url: format!("http://{addr}"),
        bearer_token: None,
        debug_sub: Some(sub.to_string()),
        tenant_id: tenant.to_string(),
    })
}

fn note(uid: &str, ts: &str, version: u64, title: &str) -> Value {
    json!({
        "uid": uid,
        "updatedTs": ts,
        "sync": {"version": version, "isDeleted": false},
        "title": title,
    })
}

// --- Health ---

#[tokio::test]
async fn test_healthz_is_unauthenticated() {
    let addr = start_backend(None).await;
    let response = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "ok");
}

// --- Scenario: create-then-update note ---

#[tokio::test]
async fn test_create_then_update_note() {
    let addr = start_backend(None).await;
    let client = api(addr, "sub-1", "org_a");

    let acks = client
        .push(EntityKind::Note, vec![note(UID_X, "2025-01-01T00:00:00Z", 1, "A")])
        .await
        .expect("push failed");
    assert_eq!(acks[0].version, 1);
    assert!(acks[0].applied);

    // Identical push is already applied.
    let acks = client
        .push(EntityKind::Note, vec![note(UID_X, "2025-01-01T00:00:00Z", 1, "A")])
        .await
        .expect("push failed");
    assert_eq!(acks[0].version, 1);
    assert!(!acks[0].applied);

    // Strictly newer timestamp wins.
    let acks = client
        .push(EntityKind::Note, vec![note(UID_X, "2025-01-01T00:00:01Z", 1, "B")])
        .await
        .expect("push failed");
    assert_eq!(acks[0].version, 2);
    assert!(acks[0].applied);
}

// --- Scenario: pull with cursor ---

#[tokio::test]
async fn test_pull_with_cursor() {
    let addr = start_backend(None).await;
    let client = api(addr, "sub-1", "org_a");

    client
        .push(EntityKind::Note, vec![note(UID_X, "2025-01-01T00:00:01Z", 1, "B")])
        .await
        .unwrap();

    let page = client.pull(EntityKind::Note, None, Some(1)).await.unwrap();
    assert_eq!(page.upserts.len(), 1);
    assert_eq!(page.upserts[0]["title"], "B");
    assert!(page.deletes.is_empty());
    let cursor = page.next_cursor.expect("non-empty page must carry a cursor");

    let done = client.pull(EntityKind::Note, Some(&cursor), Some(1)).await.unwrap();
    assert!(done.upserts.is_empty());
    assert!(done.next_cursor.is_none());
}

// --- Scenario: soft-delete tombstone ---

#[tokio::test]
async fn test_soft_delete_tombstone_propagates() {
    let addr = start_backend(None).await;
    let client = api(addr, "sub-1", "org_a");

    client
        .push(EntityKind::Note, vec![note(UID_X, "2025-01-01T00:00:01Z", 1, "B")])
        .await
        .unwrap();
    let acks = client
        .push(
            EntityKind::Note,
            vec![json!({
                "uid": UID_X,
                "updatedTs": "2025-01-01T00:00:02Z",
                "sync": {"version": 2, "isDeleted": true, "deletedAt": "2025-01-01T00:00:02Z"},
            })],
        )
        .await
        .unwrap();
    assert_eq!(acks[0].version, 3);
    assert!(acks[0].applied);

    let page = client.pull(EntityKind::Note, None, None).await.unwrap();
    assert!(page.upserts.is_empty());
    assert_eq!(page.deletes.len(), 1);
    assert_eq!(page.deletes[0].uid.to_string(), UID_X);
}

// --- Scenario: epoch bump invalidates sessions (raw headers) ---

#[tokio::test]
async fn test_epoch_bump_invalidates_old_epoch() {
    let addr = start_backend(None).await;
    let base = format!("http://{addr}");
    let http = reqwest::Client::new();

    // Create a session with epoch 1.
    let session: Value = http
        .post(format!("{base}/v1/sync/sessions"))
        .header(headers::DEBUG_SUB, "sub-1")
        .header(headers::TENANT_ID, "org_a")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let session_id = session["id"].as_str().unwrap().to_string();
    assert_eq!(session["epoch"], 1);

    let push_body = json!({"items": [note(UID_X, "2025-01-01T00:00:00Z", 1, "A")]});

    // Push succeeds under epoch 1.
    let ok = http
        .post(format!("{base}/v1/sync/notes/push"))
        .header(headers::DEBUG_SUB, "sub-1")
        .header(headers::TENANT_ID, "org_a")
        .header(headers::SYNC_SESSION, &session_id)
        .header(headers::SYNC_EPOCH, "1")
        .json(&push_body)
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), reqwest::StatusCode::OK);

    // Bump the epoch to 2.
    let bumped: Value = http
        .post(format!("{base}/v1/sync/epoch/bump"))
        .header(headers::DEBUG_SUB, "sub-1")
        .header(headers::TENANT_ID, "org_a")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(bumped["epoch"], 2);

    // The same push with the stale epoch now conflicts.
    let stale = http
        .post(format!("{base}/v1/sync/notes/push"))
        .header(headers::DEBUG_SUB, "sub-1")
        .header(headers::TENANT_ID, "org_a")
        .header(headers::SYNC_SESSION, &session_id)
        .header(headers::SYNC_EPOCH, "1")
        .json(&push_body)
        .send()
        .await
        .unwrap();
    assert_eq!(stale.status(), reqwest::StatusCode::CONFLICT);
    assert_eq!(stale.headers().get(headers::SYNC_EPOCH).unwrap(), "2");
    let body: Value = stale.json().await.unwrap();
    assert_eq!(body["error"], "epoch_mismatch");
    assert_eq!(body["epoch"], 2);
}

// --- Scenario: client recovers from an epoch bump transparently ---

#[tokio::test]
async fn test_client_recreates_session_after_epoch_bump() {
    let addr = start_backend(None).await;
    let client = api(addr, "sub-1", "org_a");
    client.create_session().await.unwrap();

    // Another handle for the same identity bumps the epoch.
    let admin = api(addr, "sub-1", "org_a");
    assert_eq!(admin.bump_epoch().await.unwrap(), 2);

    // The stale client hits 409 epoch_mismatch, recreates its session and
    // retries once, so the call still succeeds.
    let acks = client
        .push(EntityKind::Note, vec![note(UID_X, "2025-01-01T00:00:00Z", 1, "A")])
        .await
        .expect("client must recover from the epoch bump");
    assert!(acks[0].applied);
}

// --- Scenario: optimistic lock conflict ---

#[tokio::test]
async fn test_optimistic_lock_conflict() {
    let addr = start_backend(None).await;
    let client = api(addr, "sub-1", "org_a");

    let created = client
        .create(EntityKind::Note, json!({"uid": UID_X, "title": "A"}))
        .await
        .unwrap();
    assert_eq!(created.version, 1);

    let updated = client
        .update(EntityKind::Note, UID_X, json!({"title": "B"}), Some(1))
        .await
        .unwrap();
    assert_eq!(updated.version, 2);

    // A second writer holding the stale version is rejected with the
    // current version.
    let conflict = client
        .update(EntityKind::Note, UID_X, json!({"title": "C"}), Some(1))
        .await;
    assert_eq!(conflict.unwrap_err(), ToolbridgeError::VersionMismatch { current: 2 });

    let current = client.get(EntityKind::Note, UID_X).await.unwrap();
    assert_eq!(current.payload["title"], "B");
}

// --- Scenario: cross-tenant isolation ---

#[tokio::test]
async fn test_cross_tenant_isolation() {
    let addr = start_backend(None).await;
    let tenant_one = api(addr, "sub-1", "org_a");
    let tenant_two = api(addr, "sub-1", "org_b");

    tenant_one
        .create(EntityKind::Note, json!({"uid": UID_X, "title": "secret"}))
        .await
        .unwrap();

    // Same user, different tenant: the uid does not exist there.
    let missing = tenant_two.get(EntityKind::Note, UID_X).await;
    assert!(matches!(missing, Err(ToolbridgeError::NotFound(_))));

    assert!(tenant_two.pull(EntityKind::Note, None, None).await.unwrap().upserts.is_empty());
}

// --- Preconditions ---

#[tokio::test]
async fn test_data_endpoints_require_session_and_epoch() {
    let addr = start_backend(None).await;
    let base = format!("http://{addr}");
    let http = reqwest::Client::new();

    // No session header at all.
    let response = http
        .get(format!("{base}/v1/sync/notes/pull"))
        .header(headers::DEBUG_SUB, "sub-1")
        .header(headers::TENANT_ID, "org_a")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::PRECONDITION_REQUIRED);

    // Unknown session id.
    let response = http
        .get(format!("{base}/v1/sync/notes/pull"))
        .header(headers::DEBUG_SUB, "sub-1")
        .header(headers::TENANT_ID, "org_a")
        .header(headers::SYNC_SESSION, "not-a-session")
        .header(headers::SYNC_EPOCH, "1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::PRECONDITION_REQUIRED);

    // Valid session but no epoch header.
    let session: Value = http
        .post(format!("{base}/v1/sync/sessions"))
        .header(headers::DEBUG_SUB, "sub-1")
        .header(headers::TENANT_ID, "org_a")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let response = http
        .get(format!("{base}/v1/sync/notes/pull"))
        .header(headers::DEBUG_SUB, "sub-1")
        .header(headers::TENANT_ID, "org_a")
        .header(headers::SYNC_SESSION, session["id"].as_str().unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::PRECONDITION_REQUIRED);
}

#[tokio::test]
async fn test_missing_credentials_and_tenant() {
    let addr = start_backend(None).await;
    let base = format!("http://{addr}");
    let http = reqwest::Client::new();

    // No identity at all.
    let response = http.post(format!("{base}/v1/sync/sessions")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    // Identity but no tenant header.
    let response = http
        .post(format!("{base}/v1/sync/sessions"))
        .header(headers::DEBUG_SUB, "sub-1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_correlation_id_is_echoed() {
    let addr = start_backend(None).await;
    let http = reqwest::Client::new();

    // Provided id comes straight back, even on errors.
    let response = http
        .post(format!("http://{addr}/v1/sync/sessions"))
        .header(headers::CORRELATION_ID, "corr-42")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers().get(headers::CORRELATION_ID).unwrap(), "corr-42");

    // Absent id is synthesized.
    let response = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
    assert!(response.headers().get(headers::CORRELATION_ID).is_some());
}

// --- Backend (HS256) tokens ---

#[derive(serde::Serialize)]
struct BackendClaims {
    sub: String,
    exp: u64,
    token_type: String,
}

fn mint_backend_token(secret: &str, sub: &str) -> String {
    let claims = BackendClaims {
        sub: sub.to_string(),
        exp: 4_102_444_800,
        token_type: "backend".to_string(),
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_backend_token_end_to_end() {
    let addr = start_backend(None).await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("http://{addr}/v1/sync/sessions"))
        .bearer_auth(mint_backend_token(SECRET, "svc-1"))
        .header(headers::TENANT_ID, "org_a")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    assert_eq!(response.headers().get(headers::SYNC_EPOCH).unwrap(), "1");

    // A token signed with the wrong secret is rejected.
    let response = http
        .post(format!("http://{addr}/v1/sync/sessions"))
        .bearer_auth(mint_backend_token("wrong-secret", "svc-1"))
        .header(headers::TENANT_ID, "org_a")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}

// --- Rate limiting ---

#[tokio::test]
async fn test_rate_limit_surfaces_retry_after() {
    let settings = RateSettings { max_requests: 2, window_secs: 60, burst: 2 };
    let addr = start_backend(Some(settings)).await;
    let http = reqwest::Client::new();

    let request = |_: u32| {
        http.post(format!("http://{addr}/v1/sync/sessions"))
            .header(headers::DEBUG_SUB, "sub-rate")
            .header(headers::TENANT_ID, "org_a")
            .send()
    };

    assert_eq!(request(0).await.unwrap().status(), reqwest::StatusCode::CREATED);
    assert_eq!(request(1).await.unwrap().status(), reqwest::StatusCode::CREATED);

    let limited = request(2).await.unwrap();
    assert_eq!(limited.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = limited
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
    assert_eq!(limited.headers().get(headers::RATELIMIT_REMAINING).unwrap(), "0");

    // Another subject is unaffected.
    let other = http
        .post(format!("http://{addr}/v1/sync/sessions"))
        .header(headers::DEBUG_SUB, "sub-other")
        .header(headers::TENANT_ID, "org_a")
        .send()
        .await
        .unwrap();
    assert_eq!(other.status(), reqwest::StatusCode::CREATED);
}

// --- REST round trip over HTTP ---

#[tokio::test]
async fn test_rest_round_trip() {
    let addr = start_backend(None).await;
    let client = api(addr, "sub-1", "org_a");

    let created = client
        .create(EntityKind::Task, json!({"uid": UID_X, "title": "write tests"}))
        .await
        .unwrap();
    assert_eq!(created.version, 1);
    assert_eq!(created.payload["sync"]["version"], 1);
    assert_eq!(created.payload["isDirty"], 0);

    let started = client.process(EntityKind::Task, UID_X, "start").await.unwrap();
    assert_eq!(started.payload["status"], "in_progress");

    let patched = client
        .patch(EntityKind::Task, UID_X, json!({"priority": 3}))
        .await
        .unwrap();
    assert_eq!(patched.payload["priority"], 3);
    assert_eq!(patched.payload["status"], "in_progress", "patch must not clobber other fields");

    client.delete(EntityKind::Task, UID_X).await.unwrap();
    let gone = client.get(EntityKind::Task, UID_X).await;
    assert!(matches!(gone, Err(ToolbridgeError::Gone(_))));

    // The tombstone flows through sync pull.
    let page = client.pull(EntityKind::Task, None, None).await.unwrap();
    assert_eq!(page.deletes.len(), 1);
}

// --- MCP bridge end-to-end ---

async fn start_bridge(upstream: SocketAddr) -> SocketAddr {
    use toolbridge_mcp::session::SessionTable;
    use toolbridge_mcp::{BridgeConfig, BridgeState, Server as BridgeServer};

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = BridgeState {
        tokens: Arc::new(TokenValidator::new(
            None,
            None,
            None,
            Vec::new(),
            Some(SECRET.to_string()),
            clock.clone(),
        )),
        sessions: Arc::new(SessionTable::new(clock.clone())),
        clock,
        config: Arc::new(BridgeConfig {
            address: "127.0.0.1:0".parse().unwrap(),
            upstream_url: format!("http://{upstream}"),
            issuer: None,
            jwks_url: None,
            default_tenant: Some("org_a".to_string()),
        }),
    };

    let (ready_tx, ready_rx) = oneshot::channel();
    tokio::spawn(async move {
        BridgeServer::new(state).run(ready_tx).await.expect("bridge failed");
    });
    timeout(SERVER_READY_TIMEOUT, ready_rx)
        .await
        .expect("bridge did not start within 60 seconds")
        .expect("bridge ready signal dropped")
}

#[tokio::test]
async fn test_mcp_tool_calls_pass_the_token_through() {
    let backend = start_backend(None).await;
    let bridge = start_bridge(backend).await;
    let http = reqwest::Client::new();
    let token = mint_backend_token(SECRET, "mcp-user");
    let mcp = format!("http://{bridge}/mcp");

    // initialize → session id.
    let response = http
        .post(&mcp)
        .bearer_auth(&token)
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let session_id = response
        .headers()
        .get("mcp-session-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    // Create a note through the tool registry; the bridge reuses the
    // caller's bearer token upstream.
    let response = http
        .post(&mcp)
        .bearer_auth(&token)
        .header("mcp-session-id", &session_id)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": {
                "name": "notes.create",
                "arguments": {"payload": {"uid": UID_X, "title": "from mcp"}},
            },
        }))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["result"]["isError"], false);
    let text = body["result"]["content"][0]["text"].as_str().unwrap();
    let payload: Value = serde_json::from_str(text).unwrap();
    assert_eq!(payload["title"], "from mcp");
    assert_eq!(payload["sync"]["version"], 1);

    // The same note is visible to the same identity through the API.
    let direct = ApiClient::new(ClientConfig {
        base_url: format!("http://{backend}"),
        bearer_token: Some(token.clone()),
        debug_sub: None,
        tenant_id: "org_a".to_string(),
    });
    let fetched = direct.get(EntityKind::Note, UID_X).await.unwrap();
    assert_eq!(fetched.payload["title"], "from mcp");

    // Unknown tool surfaces a JSON-RPC error, not an HTTP failure.
    let response = http
        .post(&mcp)
        .bearer_auth(&token)
        .header("mcp-session-id", &session_id)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": {"name": "widgets.create", "arguments": {}},
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32601);

    // Close the session.
    let response = http
        .delete(&mcp)
        .header("mcp-session-id", &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
}
