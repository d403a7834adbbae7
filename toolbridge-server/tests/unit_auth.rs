use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use toolbridge_server::auth::{MembershipProvider, TenantAuthorizer, TokenValidator};
use toolbridge_server::error::ApiError;
use toolbridge_server::Clock;

const NOW: u64 = 1_735_689_600_000;
const SECRET: &str = "test-secret";
const FAR_FUTURE: u64 = 4_102_444_800; // 2100, seconds

struct MockClock(AtomicU64);

impl MockClock {
    fn new(now: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(now)))
    }

    fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::Relaxed);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Serialize)]
struct TestClaims {
    sub: String,
    exp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_type: Option<String>,
}

fn mint_hs256(secret: &str, sub: &str, iss: Option<&str>, token_type: Option<&str>, exp: u64) -> String {
    let claims = TestClaims {
        sub: sub.to_string(),
        exp,
        iss: iss.map(str::to_string),
        token_type: token_type.map(str::to_string),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
}

fn validator(secret: Option<&str>) -> TokenValidator {
    TokenValidator::new(
        None,
        None,
        None,
        Vec::new(),
        secret.map(str::to_string),
        MockClock::new(NOW),
    )
}

// --- Backend (HS256) tokens ---

#[tokio::test]
async fn test_backend_token_via_token_type_claim() {
    let token = mint_hs256(SECRET, "user-1", None, Some("backend"), FAR_FUTURE);
    let validated = validator(Some(SECRET)).validate(&token).await.unwrap();
    assert_eq!(validated.sub, "user-1");
    assert!(validated.backend);
}

#[tokio::test]
async fn test_backend_token_via_legacy_issuer() {
    let token = mint_hs256(SECRET, "user-2", Some("toolbridge-api"), None, FAR_FUTURE);
    let validated = validator(Some(SECRET)).validate(&token).await.unwrap();
    assert_eq!(validated.sub, "user-2");
    assert!(validated.backend);
}

#[tokio::test]
async fn test_hs256_without_backend_marker_is_rejected() {
    let token = mint_hs256(SECRET, "user-3", Some("someone-else"), None, FAR_FUTURE);
    assert!(matches!(
        validator(Some(SECRET)).validate(&token).await,
        Err(ApiError::Auth(_))
    ));
}

#[tokio::test]
async fn test_hs256_with_wrong_secret_is_rejected() {
    let token = mint_hs256("other-secret", "user-4", None, Some("backend"), FAR_FUTURE);
    assert!(matches!(
        validator(Some(SECRET)).validate(&token).await,
        Err(ApiError::Auth(_))
    ));
}

#[tokio::test]
async fn test_expired_token_is_rejected() {
    let token = mint_hs256(SECRET, "user-5", None, Some("backend"), 1); // 1970
    assert!(matches!(
        validator(Some(SECRET)).validate(&token).await,
        Err(ApiError::Auth(_))
    ));
}

#[tokio::test]
async fn test_hs256_rejected_when_no_secret_configured() {
    let token = mint_hs256(SECRET, "user-6", None, Some("backend"), FAR_FUTURE);
    assert!(matches!(validator(None).validate(&token).await, Err(ApiError::Auth(_))));
}

#[tokio::test]
async fn test_garbage_token_is_rejected() {
    assert!(matches!(
        validator(Some(SECRET)).validate("not.a.jwt").await,
        Err(ApiError::Auth(_))
    ));
}

// --- Audience carve-out flag ---

#[test]
fn test_audience_check_disabled_only_when_both_lists_empty() {
    let clock = MockClock::new(NOW);
    let open = TokenValidator::new(
        Some("https://idp.example".to_string()),
        Some("https://idp.example/jwks".to_string()),
        None,
        Vec::new(),
        None,
        clock.clone(),
    );
    assert!(open.audience_check_disabled(), "no audiences = DCR carve-out");

    let pinned = TokenValidator::new(
        Some("https://idp.example".to_string()),
        Some("https://idp.example/jwks".to_string()),
        Some("api://primary".to_string()),
        Vec::new(),
        None,
        clock.clone(),
    );
    assert!(!pinned.audience_check_disabled());

    let additional_only = TokenValidator::new(
        Some("https://idp.example".to_string()),
        Some("https://idp.example/jwks".to_string()),
        None,
        vec!["api://other".to_string()],
        None,
        clock,
    );
    assert!(!additional_only.audience_check_disabled());
}

// --- Tenant authorization ---

struct FakeMemberships {
    orgs: Vec<String>,
    calls: AtomicUsize,
}

impl FakeMemberships {
    fn new(orgs: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            orgs: orgs.iter().map(|s| s.to_string()).collect(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl MembershipProvider for FakeMemberships {
    async fn organization_ids(&self, _sub: &str) -> Result<Vec<String>, ApiError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.orgs.clone())
    }
}

#[tokio::test]
async fn test_member_is_authorized_for_their_org() {
    let clock = MockClock::new(NOW);
    let provider = FakeMemberships::new(&["org_a", "org_b"]);
    let tenants = TenantAuthorizer::new(Some(provider), None, clock);

    assert!(tenants.authorize("sub-1", "org_a").await.is_ok());
    assert!(matches!(
        tenants.authorize("sub-1", "org_zzz").await,
        Err(ApiError::Tenant(_))
    ));
}

#[tokio::test]
async fn test_b2c_fallback_default_tenant_for_membershipless_user() {
    let clock = MockClock::new(NOW);
    let provider = FakeMemberships::new(&[]);
    let tenants = TenantAuthorizer::new(Some(provider), Some("default".to_string()), clock);

    assert!(tenants.authorize("sub-1", "default").await.is_ok());
    assert!(matches!(
        tenants.authorize("sub-1", "org_a").await,
        Err(ApiError::Tenant(_))
    ));
}

#[tokio::test]
async fn test_b2b_user_is_denied_the_default_tenant() {
    let clock = MockClock::new(NOW);
    let provider = FakeMemberships::new(&["org_a"]);
    let tenants = TenantAuthorizer::new(Some(provider), Some("default".to_string()), clock);

    assert!(
        matches!(tenants.authorize("sub-1", "default").await, Err(ApiError::Tenant(_))),
        "a user with memberships must not use the B2C fallback"
    );
    assert!(tenants.authorize("sub-1", "org_a").await.is_ok());
}

#[tokio::test]
async fn test_no_provider_accepts_any_tenant() {
    let clock = MockClock::new(NOW);
    let tenants = TenantAuthorizer::new(None, None, clock);
    assert!(tenants.authorize("sub-1", "anything").await.is_ok());
}

#[tokio::test]
async fn test_positive_results_are_cached_until_ttl() {
    let clock = MockClock::new(NOW);
    let provider = FakeMemberships::new(&["org_a"]);
    let counter = provider.clone();
    let tenants = TenantAuthorizer::new(Some(provider), None, clock.clone());

    tenants.authorize("sub-1", "org_a").await.unwrap();
    tenants.authorize("sub-1", "org_a").await.unwrap();
    assert_eq!(counter.calls.load(Ordering::Relaxed), 1, "second check must hit the cache");

    // Past the 5-minute TTL the IdP is consulted again.
    clock.advance(5 * 60 * 1000 + 1);
    tenants.authorize("sub-1", "org_a").await.unwrap();
    assert_eq!(counter.calls.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn test_sweep_evicts_expired_entries() {
    let clock = MockClock::new(NOW);
    let provider = FakeMemberships::new(&["org_a"]);
    let counter = provider.clone();
    let tenants = TenantAuthorizer::new(Some(provider), None, clock.clone());

    tenants.authorize("sub-1", "org_a").await.unwrap();
    clock.advance(5 * 60 * 1000 + 1);
    tenants.sweep().await;

    tenants.authorize("sub-1", "org_a").await.unwrap();
    assert_eq!(counter.calls.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn test_denials_are_not_cached() {
    let clock = MockClock::new(NOW);
    let provider = FakeMemberships::new(&[]);
    let counter = provider.clone();
    let tenants = TenantAuthorizer::new(Some(provider), None, clock);

    assert!(tenants.authorize("sub-1", "org_a").await.is_err());
    assert!(tenants.authorize("sub-1", "org_a").await.is_err());
    assert_eq!(counter.calls.load(Ordering::Relaxed), 2);
}
