use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware as axum_middleware, Json, Router};
use toolbridge_common::wire::ErrorBody;
use toolbridge_common::{EntityKind, MirrorSpec};
use tower::ServiceBuilder;

pub mod auth;
pub mod config;
pub mod error;
pub mod middleware;
pub mod rate;
pub mod rest;
pub mod session;
pub mod store;
pub mod sync;

use auth::{TenantAuthorizer, TokenValidator};
use config::SWEEP_INTERVAL;
use rate::RateLimiter;
use store::Store;

/// Abstraction over current time for testability.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Production clock backed by `SystemTime`.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Per-kind mirror-normalization configuration; kinds without an override
/// use the full REST set.
#[derive(Default)]
pub struct MirrorConfig {
    overrides: HashMap<EntityKind, MirrorSpec>,
}

impl MirrorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(mut self, kind: EntityKind, spec: MirrorSpec) -> Self {
        self.overrides.insert(kind, spec);
        self
    }

    pub fn for_kind(&self, kind: EntityKind) -> MirrorSpec {
        self.overrides.get(&kind).copied().unwrap_or_else(MirrorSpec::full)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub tokens: Arc<TokenValidator>,
    pub tenants: Arc<TenantAuthorizer>,
    pub rate: Arc<RateLimiter>,
    pub mirrors: Arc<MirrorConfig>,
    pub dev_mode: bool,
    #[cfg(feature = "legacy-tenant-hmac")]
    pub legacy_tenant_secret: Option<String>,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: SocketAddr,
    pub handler_timeout: Duration,
    pub shutdown_drain: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: ([127, 0, 0, 1], 0).into(),
            handler_timeout: config::HANDLER_TIMEOUT,
            shutdown_drain: config::SHUTDOWN_DRAIN,
        }
    }
}

/// Toolbridge sync backend server
pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Get the server's configured address
    pub fn address(&self) -> SocketAddr {
        self.config.address
    }

    /// Create the application router with the given state.
    pub fn create_router(state: AppState, handler_timeout: Duration) -> Router {
        let data = Router::new()
            .route("/v1/sync/:kind/push", post(sync::handle_push))
            .route("/v1/sync/:kind/pull", get(sync::handle_pull))
            .route("/v1/:kind", get(rest::handle_list).post(rest::handle_create))
            .route(
                "/v1/:kind/:uid",
                get(rest::handle_get)
                    .put(rest::handle_put)
                    .patch(rest::handle_patch)
                    .delete(rest::handle_delete),
            )
            .route("/v1/:kind/:uid/archive", post(rest::handle_archive))
            .route("/v1/:kind/:uid/process", post(rest::handle_process))
            .route_layer(axum_middleware::from_fn_with_state(
                state.clone(),
                middleware::preconditions,
            ));

        // Session establishment carries no session preconditions, only
        // identity and rate limiting.
        let control = Router::new()
            .route("/v1/sync/sessions", post(session::handle_create_session))
            .route("/v1/sync/epoch/bump", post(session::handle_bump_epoch))
            .route_layer(axum_middleware::from_fn_with_state(
                state.clone(),
                middleware::rate_limit,
            ));

        let api = data.merge(control).route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth::resolve_identity,
        ));

        Router::new()
            .route("/healthz", get(handle_healthz))
            .merge(api)
            .layer(
                ServiceBuilder::new()
                    .layer(HandleErrorLayer::new(handle_layer_error))
                    .timeout(handler_timeout),
            )
            .layer(axum_middleware::from_fn(middleware::correlation_id))
            .with_state(state)
    }

    /// Run the server, signalling `ready_tx` with the bound address once
    /// accepting connections. Shuts down gracefully on SIGINT, draining
    /// in-flight requests up to the configured bound.
    pub async fn run(
        self,
        ready_tx: tokio::sync::oneshot::Sender<SocketAddr>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let state = self.state.clone();
        spawn_sweepers(state.clone());

        let app = Self::create_router(state, self.config.handler_timeout);
        let listener = tokio::net::TcpListener::bind(self.config.address).await?;
        let local_addr = listener.local_addr()?;
        ready_tx.send(local_addr).ok();

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
        });

        let drain = self.config.shutdown_drain;
        let mut graceful_rx = shutdown_rx.clone();
        let mut deadline_rx = shutdown_rx;
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = graceful_rx.wait_for(|stop| *stop).await;
        });

        tokio::select! {
            result = serve => result?,
            _ = async {
                let _ = deadline_rx.wait_for(|stop| *stop).await;
                tokio::time::sleep(drain).await;
            } => {
                tracing::warn!("drain deadline reached; aborting in-flight requests");
            }
        }
        Ok(())
    }
}

/// Background eviction of expired tenant-cache entries and sync sessions.
fn spawn_sweepers(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            state.tenants.sweep().await;
            if let Err(e) = state.store.prune_sessions(state.clock.now_ms()).await {
                tracing::warn!(error = %e, "session prune failed");
            }
        }
    });
}

async fn handle_healthz() -> &'static str {
    "ok"
}

async fn handle_layer_error(err: tower::BoxError) -> Response {
    if err.is::<tower::timeout::error::Elapsed>() {
        (
            StatusCode::REQUEST_TIMEOUT,
            Json(ErrorBody::new("timeout", "request timed out")),
        )
            .into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody::new("internal", err.to_string())),
        )
            .into_response()
    }
}
