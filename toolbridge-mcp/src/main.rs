use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use toolbridge_mcp::session::SessionTable;
use toolbridge_mcp::{BridgeConfig, BridgeState, Server};
use toolbridge_server::auth::TokenValidator;
use toolbridge_server::{Clock, SystemClock};

#[derive(Parser, Debug)]
#[command(name = "toolbridge-mcp")]
struct Args {
    /// Listen address.
    #[arg(long, env = "TB_MCP_LISTEN_ADDR", default_value = "0.0.0.0:8090")]
    listen: SocketAddr,

    /// Base URL of the upstream Toolbridge API.
    #[arg(long, env = "TB_UPSTREAM_URL")]
    upstream_url: String,

    /// Expected issuer of external-IdP tokens; also reflected in the
    /// OAuth discovery documents.
    #[arg(long, env = "TB_JWT_ISSUER")]
    jwt_issuer: Option<String>,

    /// JWKS endpoint of the IdP.
    #[arg(long, env = "TB_JWKS_URL")]
    jwks_url: Option<String>,

    /// Primary accepted audience; empty lists enable the DCR carve-out.
    #[arg(long, env = "TB_JWT_AUDIENCE")]
    jwt_audience: Option<String>,

    /// Additional accepted audiences, comma-separated.
    #[arg(long, env = "TB_JWT_ADDITIONAL_AUDIENCES", value_delimiter = ',')]
    jwt_additional_audiences: Vec<String>,

    /// HS256 secret validating backend-issued tokens.
    #[arg(long, env = "TB_HS256_SECRET")]
    hs256_secret: Option<String>,

    /// Tenant used when callers send no tenant header.
    #[arg(long, env = "TB_DEFAULT_TENANT")]
    default_tenant: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let tokens = Arc::new(TokenValidator::new(
        args.jwt_issuer.clone(),
        args.jwks_url.clone(),
        args.jwt_audience,
        args.jwt_additional_audiences,
        args.hs256_secret,
        clock.clone(),
    ));

    let state = BridgeState {
        tokens,
        sessions: Arc::new(SessionTable::new(clock.clone())),
        clock,
        config: Arc::new(BridgeConfig {
            address: args.listen,
            upstream_url: args.upstream_url,
            issuer: args.jwt_issuer,
            jwks_url: args.jwks_url,
            default_tenant: args.default_tenant,
        }),
    };

    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        if let Ok(addr) = ready_rx.await {
            tracing::info!(%addr, "mcp bridge listening");
        }
    });

    Server::new(state).run(ready_tx).await?;
    Ok(())
}
