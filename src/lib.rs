//! # webshgate - web-based SSH gateway
//!
//! `webshgate` proxies authenticated WebSocket connections from browsers to
//! remote SSH servers as interactive shells, exec invocations, and SFTP
//! transfers. It holds one session per browser connection: auth state, a
//! pooled SSH connection, terminal state, in-flight SFTP transfers, and
//! backpressure/rate-limit state.
//!
//! ## Main components
//!
//! - [`store`] - the per-session state machine (a pure reducer over a closed action set)
//! - [`pool`] - the SSH connection pool (idle eviction, capacity control)
//! - [`rate_limiter`] - per-flow byte-rate limiting
//! - [`transfer`] - the SFTP transfer manager (ordered chunks, concurrency caps, ownership checks)
//! - [`event_bus`] - priority-queued pub/sub decoupling protocol handlers from services
//! - [`auth`] - credential resolution and SSH auth-method negotiation
//! - [`hostkey`] - the host-key trust store and verification decision table
//! - [`ssh`] - SSH dialing, shell/exec/resize, and SFTP subsystem wiring
//! - [`socket`] - the Socket Adapter: wire protocol and the per-connection event loop
//! - [`core`] - the orchestrator wiring every component into one service container
//! - [`config`] - the configuration surface every component is parameterised by
//! - [`error`] - the typed error families aggregated into [`error::GatewayError`]
//!
//! The teacher's original device-automation modules (`device`, `templates`,
//! `session`) remain in the workspace as reference material while the
//! gateway above is built; they are not part of this crate's public API.

pub mod auth;
pub mod config;
pub mod core;
pub mod error;
pub mod event_bus;
pub mod hostkey;
pub mod ids;
pub mod pool;
pub mod rate_limiter;
pub mod socket;
pub mod ssh;
pub mod store;
pub mod transfer;
