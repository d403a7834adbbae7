use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cursor;
pub mod envelope;
pub mod kind;
pub mod normalize;
pub mod time;
pub mod wire;

pub use cursor::Cursor;
pub use envelope::ItemEnvelope;
pub use kind::EntityKind;
pub use normalize::MirrorSpec;
pub use wire::{ErrorBody, PullResponse, PushAck, PushRequest, SessionInfo, TombstoneRef};

/// Request/response header names shared by the server, the client and the
/// MCP bridge. Lowercase because that is how axum's `HeaderMap` stores them.
pub mod headers {
    pub const TENANT_ID: &str = "x-tb-tenant-id";
    pub const SYNC_SESSION: &str = "x-sync-session";
    pub const SYNC_EPOCH: &str = "x-sync-epoch";
    pub const CORRELATION_ID: &str = "x-correlation-id";
    pub const DEBUG_SUB: &str = "x-debug-sub";
    pub const RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
    pub const RATELIMIT_RESET: &str = "x-ratelimit-reset";
}

/// Outcome taxonomy of the sync and REST surfaces, shared by the server
/// edge, the API client and the MCP bridge. Each variant corresponds to
/// one class of `{error, message?, ...hints}` response body, so callers
/// branch on the variant instead of re-parsing status codes; hint-bearing
/// conditions (server epoch, current version, retry delay) carry the hint
/// as data.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolbridgeError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Tenant not authorized: {0}")]
    TenantDenied(String),

    #[error("Precondition required: {0}")]
    PreconditionRequired(String),

    #[error("Epoch mismatch; server epoch is {epoch}")]
    EpochMismatch { epoch: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Gone: {0}")]
    Gone(String),

    #[error("Version mismatch; server version is {current}")]
    VersionMismatch { current: u64 },

    #[error("Rate limited; retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Invalid input: {0}")]
    Validation(String),

    /// The request never produced a usable response (connect failure,
    /// timeout, undecodable body).
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("HTTP {0}: {1}")]
    HttpError(u16, String),

    /// The backend misbehaved in a way the taxonomy cannot name, such as
    /// a session create that returned success without a session.
    #[error("backend fault: {0}")]
    Backend(String),
}

/// Shorthand for fallible sync/REST calls; every surface in this
/// workspace returns it.
pub type Result<T> = std::result::Result<T, ToolbridgeError>;
