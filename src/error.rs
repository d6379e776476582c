//! Error types for the session-proxy engine.
//!
//! Mirrors the teacher's single `ConnectError`, split into one
//! `thiserror` enum per component family and aggregated into
//! [`GatewayError`] for the Socket Adapter to surface to clients.

use thiserror::Error;

/// Errors from the Connection Pool (spec §4.2, §7 *System*).
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("pool exhausted: {0} connections in use")]
    PoolExhausted(usize),

    #[error("no pooled connection for this session")]
    NotFound,

    #[error("connection factory failed: {0}")]
    FactoryFailed(#[from] russh::Error),

    #[error("authentication rejected by remote host")]
    AuthFailed,
}

/// Errors from the SFTP Transfer Manager (spec §4.4, §7 *Transfer*).
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("transfer not found")]
    NotFound,

    #[error("session already has {0} active transfers")]
    MaxTransfers(usize),

    #[error("transfer is not in a state that permits this operation")]
    InvalidState,

    #[error("expected chunk index {expected}, got {got}")]
    ChunkMismatch { expected: u64, got: u64 },

    #[error("file size {size} exceeds maximum {max}")]
    FileTooLarge { size: u64, max: u64 },

    #[error("file extension '{0}' is blocked")]
    ExtensionBlocked(String),

    #[error("path '{0}' is outside the allowed roots")]
    PathForbidden(String),

    #[error("chunk payload exceeds the maximum encoded size")]
    ChunkTooLarge,

    #[error("sftp protocol error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),

    #[error("ssh channel error opening sftp subsystem: {0}")]
    Channel(#[from] russh::Error),
}

/// Errors from the Authentication Pipeline (spec §4.6, §7 *Authentication*).
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("auth method '{0}' is not in the allowed set")]
    AuthMethodDisabled(String),

    #[error("no credential source produced a usable credential")]
    NoCredential,
}

/// Errors from the Host-Key Trust Store and Verifier (spec §4.7, §4.9, §7 *HostKey*).
#[derive(Error, Debug)]
pub enum HostKeyError {
    #[error("presented host key does not match the stored key (presented {presented}, stored {stored})")]
    Mismatch { presented: String, stored: String },

    #[error("host key rejected by policy")]
    Rejected,

    #[error("client did not respond to the host-key prompt in time")]
    PromptTimeout,

    #[error("trust store error: {0}")]
    Store(#[from] rusqlite::Error),
}

/// Errors surfaced by message validation at the Socket Adapter boundary
/// (spec §7 *Validation*) — rejected before any state mutation.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("dimension out of range: {0}")]
    DimensionOutOfRange(String),

    #[error("invalid environment variable name or value: {0}")]
    InvalidEnvVar(String),
}

/// Connection-level errors (spec §7 *Connection*).
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("dial timed out after {0:?}")]
    DialTimeout(std::time::Duration),

    #[error("connection refused")]
    Refused,

    #[error("host unreachable")]
    Unreachable,

    #[error("rate limited by remote peer")]
    RateLimited,

    #[error("ssh protocol error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("connection closed")]
    Closed,
}

/// Aggregate error type the Socket Adapter converts into a client-facing
/// `ssherror` / `sftp-error` frame. One variant per component family,
/// following the teacher's `#[from]`-heavy `ConnectError`.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    HostKey(#[from] HostKeyError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("operational error: {0}")]
    System(String),
}
