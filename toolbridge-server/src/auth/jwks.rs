use std::collections::HashMap;
use std::sync::Arc;

use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::config::{JWKS_FETCH_TIMEOUT, JWKS_TTL_MS};
use crate::error::ApiError;
use crate::Clock;

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kty: String,
    kid: Option<String>,
    n: Option<String>,
    e: Option<String>,
}

#[derive(Default)]
struct JwksState {
    keys: HashMap<String, DecodingKey>,
    fetched_at_ms: u64,
}

/// Cache of the IdP's RS256 verification keys, keyed by `kid`.
///
/// Reads take the read lock; the write lock is held only while the key map
/// is rebuilt after a TTL expiry or an unknown `kid` (key rotation).
pub struct JwksCache {
    url: String,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
    inner: RwLock<JwksState>,
}

impl JwksCache {
    pub fn new(url: String, clock: Arc<dyn Clock>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(JWKS_FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { url, client, clock, inner: RwLock::new(JwksState::default()) }
    }

    /// Resolve the decoding key for `kid`, refreshing the cache on expiry
    /// or rotation.
    pub async fn key_for(&self, kid: &str) -> Result<DecodingKey, ApiError> {
        let now = self.clock.now_ms();
        {
            let state = self.inner.read().await;
            let fresh = state.fetched_at_ms != 0 && now < state.fetched_at_ms + JWKS_TTL_MS;
            if fresh {
                if let Some(key) = state.keys.get(kid) {
                    return Ok(key.clone());
                }
                // Fresh cache without the kid: fall through and force a
                // refresh; the IdP may have rotated keys.
            }
        }

        let mut state = self.inner.write().await;
        // Another request may have refreshed while we waited for the lock.
        let stale = state.fetched_at_ms == 0 || now >= state.fetched_at_ms + JWKS_TTL_MS;
        if stale || !state.keys.contains_key(kid) {
            state.keys = self.fetch().await?;
            state.fetched_at_ms = self.clock.now_ms();
        }
        state
            .keys
            .get(kid)
            .cloned()
            .ok_or_else(|| ApiError::Auth(format!("unknown signing key: {kid}")))
    }

    async fn fetch(&self) -> Result<HashMap<String, DecodingKey>, ApiError> {
        let doc: JwksDocument = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ApiError::Internal(format!("JWKS fetch failed: {e}")))?
            .error_for_status()
            .map_err(|e| ApiError::Internal(format!("JWKS fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| ApiError::Internal(format!("JWKS parse failed: {e}")))?;

        let mut keys = HashMap::new();
        for jwk in doc.keys {
            if jwk.kty != "RSA" {
                continue;
            }
            let (Some(kid), Some(n), Some(e)) = (jwk.kid, jwk.n, jwk.e) else {
                continue;
            };
            match DecodingKey::from_rsa_components(&n, &e) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(err) => {
                    tracing::warn!(kid = %kid, error = %err, "skipping malformed JWK");
                }
            }
        }
        Ok(keys)
    }
}
