use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use toolbridge_server::auth::{TenantAuthorizer, TokenValidator, WorkOsMembershipClient};
use toolbridge_server::rate::{RateLimiter, RateSettings};
use toolbridge_server::store::{MemStore, PgStore, Store};
use toolbridge_server::{AppState, Clock, MirrorConfig, Server, ServerConfig, SystemClock};

#[derive(Debug, Clone, ValueEnum)]
enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Parser, Debug)]
#[command(name = "toolbridge-server")]
struct Args {
    /// Listen address.
    #[arg(long, env = "TB_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Storage backend. The memory backend is for smoke tests only.
    #[arg(long, env = "TB_STORE", value_enum, default_value_t = StoreBackend::Postgres)]
    store: StoreBackend,

    /// PostgreSQL connection URL (postgres backend).
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Expected issuer of external-IdP tokens.
    #[arg(long, env = "TB_JWT_ISSUER")]
    jwt_issuer: Option<String>,

    /// JWKS endpoint of the IdP.
    #[arg(long, env = "TB_JWKS_URL")]
    jwks_url: Option<String>,

    /// Primary accepted audience. Leaving this and the additional list
    /// empty disables audience validation (dynamic client registration).
    #[arg(long, env = "TB_JWT_AUDIENCE")]
    jwt_audience: Option<String>,

    /// Additional accepted audiences, comma-separated.
    #[arg(long, env = "TB_JWT_ADDITIONAL_AUDIENCES", value_delimiter = ',')]
    jwt_additional_audiences: Vec<String>,

    /// HS256 secret validating backend-issued tokens.
    #[arg(long, env = "TB_HS256_SECRET")]
    hs256_secret: Option<String>,

    /// Accept the X-Debug-Sub identity bypass.
    #[arg(long, env = "TB_DEV_MODE")]
    dev_mode: bool,

    /// Tenant granted to membership-less users (B2C fallback).
    #[arg(long, env = "TB_DEFAULT_TENANT")]
    default_tenant: Option<String>,

    /// API key enabling membership-based tenant authorization.
    #[arg(long, env = "TB_WORKOS_API_KEY")]
    workos_api_key: Option<String>,

    /// Base URL of the membership API.
    #[arg(long, env = "TB_WORKOS_BASE_URL", default_value = "https://api.workos.com")]
    workos_base_url: String,

    /// Deprecated HMAC tenant-header secret; only honored when the crate
    /// is built with the legacy-tenant-hmac feature.
    #[cfg(feature = "legacy-tenant-hmac")]
    #[arg(long, env = "TB_TENANT_SECRET")]
    tenant_secret: Option<String>,

    /// Requests per subject per window; 0 disables rate limiting.
    #[arg(long, env = "TB_RATE_MAX", default_value_t = 0)]
    rate_max: u32,

    /// Rate-limit window in seconds.
    #[arg(long, env = "TB_RATE_WINDOW_SECS", default_value_t = 60)]
    rate_window_secs: u64,

    /// Token-bucket burst capacity; defaults to the per-window maximum.
    #[arg(long, env = "TB_RATE_BURST", default_value_t = 0)]
    rate_burst: u32,

    /// Bound on a single request handler, in seconds.
    #[arg(long, env = "TB_HANDLER_TIMEOUT_SECS", default_value_t = 30)]
    handler_timeout_secs: u64,

    /// Bound on draining in-flight requests at shutdown, in seconds.
    #[arg(long, env = "TB_SHUTDOWN_DRAIN_SECS", default_value_t = 7)]
    shutdown_drain_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store: Arc<dyn Store> = match args.store {
        StoreBackend::Postgres => {
            let url = args
                .database_url
                .as_deref()
                .ok_or("DATABASE_URL is required for the postgres backend")?;
            let store = PgStore::connect(url).await?;
            store.migrate().await?;
            Arc::new(store)
        }
        StoreBackend::Memory => {
            tracing::warn!("memory store selected; state will not survive restarts");
            Arc::new(MemStore::new())
        }
    };

    if args.dev_mode {
        tracing::warn!("dev mode enabled: X-Debug-Sub identity bypass is active");
    }

    let tokens = Arc::new(TokenValidator::new(
        args.jwt_issuer,
        args.jwks_url,
        args.jwt_audience,
        args.jwt_additional_audiences,
        args.hs256_secret,
        clock.clone(),
    ));

    let membership = args
        .workos_api_key
        .map(|key| {
            Arc::new(WorkOsMembershipClient::new(args.workos_base_url, key))
                as Arc<dyn toolbridge_server::auth::MembershipProvider>
        });
    #[cfg(feature = "legacy-tenant-hmac")]
    if args.tenant_secret.is_some() && membership.is_some() {
        tracing::warn!("legacy tenant secret ignored: membership client takes precedence");
    }
    let tenants = Arc::new(TenantAuthorizer::new(membership, args.default_tenant, clock.clone()));

    let rate_settings = (args.rate_max > 0).then(|| RateSettings {
        max_requests: args.rate_max,
        window_secs: args.rate_window_secs,
        burst: if args.rate_burst > 0 { args.rate_burst } else { args.rate_max },
    });
    let rate = Arc::new(RateLimiter::new(rate_settings, clock.clone()));

    let state = AppState {
        store,
        clock,
        tokens,
        tenants,
        rate,
        mirrors: Arc::new(MirrorConfig::new()),
        dev_mode: args.dev_mode,
        #[cfg(feature = "legacy-tenant-hmac")]
        legacy_tenant_secret: args.tenant_secret,
    };

    let config = ServerConfig {
        address: args.listen,
        handler_timeout: Duration::from_secs(args.handler_timeout_secs),
        shutdown_drain: Duration::from_secs(args.shutdown_drain_secs),
    };

    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

    // Log the bound address once the server signals it is accepting.
    tokio::spawn(async move {
        if let Ok(addr) = ready_rx.await {
            tracing::info!(%addr, "listening");
        }
    });

    Server::new(config, state).run(ready_tx).await?;
    Ok(())
}
