use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use toolbridge_client::ApiClient;
use toolbridge_server::Clock;
use uuid::Uuid;

/// Lifetime of an MCP session.
pub const MCP_SESSION_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// Upper bound on context attachments per session.
pub const MAX_ATTACHMENTS: usize = 64;

/// An ephemeral reference a caller pinned to its session, surfaced through
/// `resources/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextAttachment {
    pub entity_uid: String,
    pub entity_kind: String,
    pub title: String,
}

/// One MCP session: the caller's identity, the upstream client bound to
/// the caller's bearer token, and its context attachments.
pub struct McpSession {
    pub sub: String,
    pub tenant_id: String,
    /// The bearer the upstream client was built with; compared on each
    /// request so a rotated token rebinds the client. Never logged.
    pub token: String,
    pub client: Arc<ApiClient>,
    pub attachments: Vec<ContextAttachment>,
    pub expires_ms: u64,
}

/// In-memory session table keyed by `Mcp-Session-Id`. Lookups take the
/// read lock; creation, deletion, attachment writes and the sweeper take
/// the write lock.
pub struct SessionTable {
    clock: Arc<dyn Clock>,
    inner: RwLock<HashMap<String, McpSession>>,
}

impl SessionTable {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, inner: RwLock::new(HashMap::new()) }
    }

    pub async fn create(
        &self,
        sub: String,
        tenant_id: String,
        token: String,
        client: Arc<ApiClient>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let session = McpSession {
            sub,
            tenant_id,
            token,
            client,
            attachments: Vec::new(),
            expires_ms: self.clock.now_ms() + MCP_SESSION_TTL_MS,
        };
        self.inner.write().await.insert(id.clone(), session);
        id
    }

    /// Resolve a live session to the data a request needs.
    pub async fn lookup(&self, id: &str) -> Option<(String, String, String, Arc<ApiClient>)> {
        let inner = self.inner.read().await;
        let session = inner.get(id)?;
        if session.expires_ms <= self.clock.now_ms() {
            return None;
        }
        Some((
            session.sub.clone(),
            session.tenant_id.clone(),
            session.token.clone(),
            session.client.clone(),
        ))
    }

    /// Swap in a new upstream client after a token rotation.
    pub async fn rebind(&self, id: &str, token: String, client: Arc<ApiClient>) {
        if let Some(session) = self.inner.write().await.get_mut(id) {
            session.token = token;
            session.client = client;
        }
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.inner.write().await.remove(id).is_some()
    }

    /// Append an attachment, dropping the oldest once the cap is reached.
    pub async fn attach(&self, id: &str, attachment: ContextAttachment) -> bool {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.get_mut(id) else {
            return false;
        };
        if session.attachments.len() >= MAX_ATTACHMENTS {
            session.attachments.remove(0);
        }
        session.attachments.push(attachment);
        true
    }

    pub async fn attachments(&self, id: &str) -> Vec<ContextAttachment> {
        let inner = self.inner.read().await;
        inner.get(id).map(|s| s.attachments.clone()).unwrap_or_default()
    }

    /// Evict expired sessions; returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let mut inner = self.inner.write().await;
        let before = inner.len();
        inner.retain(|_, session| session.expires_ms > now);
        before - inner.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}
