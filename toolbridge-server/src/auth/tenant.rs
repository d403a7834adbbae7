use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::config::TENANT_CACHE_TTL_MS;
use crate::error::ApiError;
use crate::Clock;

/// Source of a user's organization memberships at the identity provider.
#[async_trait]
pub trait MembershipProvider: Send + Sync {
    async fn organization_ids(&self, sub: &str) -> Result<Vec<String>, ApiError>;
}

#[derive(Debug, Deserialize)]
struct MembershipPage {
    data: Vec<Membership>,
    #[serde(default)]
    list_metadata: ListMetadata,
}

#[derive(Debug, Deserialize)]
struct Membership {
    organization_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ListMetadata {
    after: Option<String>,
}

/// WorkOS-style membership client: pages through
/// `/user_management/organization_memberships` with the configured API key.
pub struct WorkOsMembershipClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl WorkOsMembershipClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self { base_url, api_key, client: reqwest::Client::new() }
    }
}

#[async_trait]
impl MembershipProvider for WorkOsMembershipClient {
    async fn organization_ids(&self, sub: &str) -> Result<Vec<String>, ApiError> {
        let mut out = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let mut request = self
                .client
                .get(format!("{}/user_management/organization_memberships", self.base_url))
                .bearer_auth(&self.api_key)
                .query(&[("user_id", sub), ("limit", "100")]);
            if let Some(cursor) = &after {
                request = request.query(&[("after", cursor.as_str())]);
            }
            let page: MembershipPage = request
                .send()
                .await
                .map_err(|e| ApiError::Internal(format!("membership lookup failed: {e}")))?
                .error_for_status()
                .map_err(|e| ApiError::Internal(format!("membership lookup failed: {e}")))?
                .json()
                .await
                .map_err(|e| ApiError::Internal(format!("membership response malformed: {e}")))?;

            out.extend(page.data.into_iter().map(|m| m.organization_id));
            match page.list_metadata.after {
                Some(next) => after = Some(next),
                None => break,
            }
        }
        Ok(out)
    }
}

/// Tenant authorization with a positive-result cache.
///
/// A user may act on tenant `T` iff the IdP lists a membership with
/// `organization_id == T`, or `T` is the configured default tenant and the
/// user has no memberships at all (B2C fallback). Without a membership
/// provider the check is disabled (single-tenant / smoke-test mode).
pub struct TenantAuthorizer {
    provider: Option<Arc<dyn MembershipProvider>>,
    default_tenant: Option<String>,
    clock: Arc<dyn Clock>,
    cache: RwLock<HashMap<(String, String), u64>>,
}

impl TenantAuthorizer {
    pub fn new(
        provider: Option<Arc<dyn MembershipProvider>>,
        default_tenant: Option<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        if provider.is_none() {
            tracing::warn!("no membership client configured; accepting any tenant");
        }
        Self { provider, default_tenant, clock, cache: RwLock::new(HashMap::new()) }
    }

    /// `true` when a membership client is configured; it then takes
    /// precedence over the deprecated HMAC tenant path.
    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    pub async fn authorize(&self, sub: &str, tenant: &str) -> Result<(), ApiError> {
        let Some(provider) = &self.provider else {
            return Ok(());
        };

        let now = self.clock.now_ms();
        let key = (sub.to_string(), tenant.to_string());
        {
            let cache = self.cache.read().await;
            if let Some(expires) = cache.get(&key) {
                if *expires > now {
                    return Ok(());
                }
            }
        }

        let memberships = provider.organization_ids(sub).await?;
        let member = memberships.iter().any(|org| org == tenant);
        let b2c_fallback = self.default_tenant.as_deref() == Some(tenant) && memberships.is_empty();
        if !(member || b2c_fallback) {
            return Err(ApiError::Tenant(format!("no membership for tenant {tenant}")));
        }

        let mut cache = self.cache.write().await;
        cache.insert(key, now + TENANT_CACHE_TTL_MS);
        Ok(())
    }

    /// Evict expired entries; called by the background sweeper.
    pub async fn sweep(&self) {
        let now = self.clock.now_ms();
        let mut cache = self.cache.write().await;
        cache.retain(|_, expires| *expires > now);
    }
}

#[cfg(feature = "legacy-tenant-hmac")]
pub mod legacy {
    //! Deprecated HMAC-signed tenant header, kept for migration only and
    //! mutually exclusive with the membership resolver.

    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    use crate::config::TENANT_HMAC_SKEW_MS;
    use crate::error::ApiError;

    /// Verify `X-TB-Tenant-Sig: <unix_ms>:<hex>` where the digest is
    /// `HMAC_SHA256(secret, "{tenant}:{unix_ms}")`, within the skew window.
    pub fn verify_tenant_sig(
        secret: &str,
        tenant: &str,
        signature: &str,
        now_ms: u64,
    ) -> Result<(), ApiError> {
        let (ts, hex_sig) = signature
            .split_once(':')
            .ok_or_else(|| ApiError::Tenant("malformed tenant signature".to_string()))?;
        let ts: u64 = ts
            .parse()
            .map_err(|_| ApiError::Tenant("malformed tenant signature".to_string()))?;
        if ts.abs_diff(now_ms) > TENANT_HMAC_SKEW_MS {
            return Err(ApiError::Tenant("tenant signature outside skew window".to_string()));
        }

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|_| ApiError::Internal("invalid tenant secret".to_string()))?;
        mac.update(format!("{tenant}:{ts}").as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());
        if expected != hex_sig {
            return Err(ApiError::Tenant("tenant signature mismatch".to_string()));
        }
        Ok(())
    }
}
