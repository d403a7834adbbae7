use std::time::Duration;

/// Lifetime of a sync session.
pub const SESSION_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// How long fetched JWKS keys are trusted before a background refetch.
pub const JWKS_TTL_MS: u64 = 60 * 60 * 1000;

/// Bound on a single JWKS document fetch.
pub const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifetime of a positive tenant-authorization cache entry.
pub const TENANT_CACHE_TTL_MS: u64 = 5 * 60 * 1000;

/// How often the background sweepers evict expired cache entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default and maximum page size for pull/list; requested limits are clamped.
pub const PULL_LIMIT_MAX: usize = 1000;

/// Default bound on a single request handler.
pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on draining in-flight requests at shutdown.
pub const SHUTDOWN_DRAIN: Duration = Duration::from_secs(7);

/// Issuer written into backend-minted HS256 tokens; also accepted as the
/// legacy marker identifying a backend token that predates `token_type`.
pub const BACKEND_ISSUER: &str = "toolbridge-api";

#[cfg(feature = "legacy-tenant-hmac")]
/// Accepted clock skew for signed legacy tenant headers.
pub const TENANT_HMAC_SKEW_MS: u64 = 5 * 60 * 1000;
