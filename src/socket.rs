//! Socket Adapter: the transport boundary and central event loop (spec §4.8).
//!
//! Wire message types follow the teacher's `#[derive(Serialize, Deserialize,
//! JsonSchema)]` convention (`session/recording.rs`'s `SessionEvent`). The
//! adapter itself is written against a [`Transport`] trait rather than a
//! concrete WebSocket type, so the shell data pump and message dispatch can
//! be exercised with a fake transport in tests; [`AxumWebSocketTransport`]
//! is the one concrete binding this crate ships.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::auth::{self, AuthAttempt, CredentialCandidates};
use crate::config::{AuthMethodName, GatewayConfig};
use crate::error::{GatewayError, TransferError, ValidationError};
use crate::hostkey::Verifier;
use crate::ids::{ConnectionId, SessionId, TransferId};
use crate::pool::{ConnectParams, ConnectionPool};
use crate::rate_limiter::{RateLimiter, RateSignal};
use crate::ssh::{self, ExecOutcome, ShellStream, SshConnectionFactory};
use crate::store::{self, SessionAction, SessionStore};
use crate::transfer::{TransferDirection, TransferManager, TransferParams};

/// SFTP chunk payload must encode to no more than this many bytes, base64
/// expansion included (256 KiB chunk * 4/3 plus JSON/base64 overhead, spec §6).
pub const MAX_ENCODED_CHUNK_BYTES: usize = 351_414;

// ---------------------------------------------------------------------
// Wire messages (spec §6)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Authenticate {
        username: Option<String>,
        password: Option<String>,
        host: String,
        port: u16,
        method: AuthMethodName,
    },
    Geometry {
        cols: u32,
        rows: u32,
    },
    Resize {
        rows: u32,
        cols: u32,
    },
    Terminal {
        term: String,
        rows: u32,
        cols: u32,
        env: Vec<(String, String)>,
    },
    Data {
        bytes: Vec<u8>,
    },
    Exec {
        command: String,
        pty: Option<bool>,
        term: Option<String>,
        cols: Option<u32>,
        rows: Option<u32>,
        env: Option<Vec<(String, String)>>,
        timeout_ms: Option<u64>,
    },
    Control {
        action: String,
    },
    SftpList {
        path: String,
    },
    SftpStat {
        path: String,
    },
    SftpMkdir {
        path: String,
    },
    SftpDelete {
        path: String,
    },
    SftpUploadStart {
        remote_path: String,
        filename: String,
        total_bytes: u64,
    },
    SftpUploadChunk {
        transfer_id: TransferId,
        chunk_index: u64,
        #[serde(with = "base64_bytes")]
        #[schemars(with = "String")]
        data: Vec<u8>,
        is_last: bool,
    },
    SftpUploadCancel {
        transfer_id: TransferId,
    },
    SftpDownloadStart {
        remote_path: String,
    },
    SftpDownloadCancel {
        transfer_id: TransferId,
    },
    HostkeyVerifyResponse {
        host: String,
        port: u16,
        algorithm: String,
        action: HostKeyVerifyAction,
    },
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyVerifyAction {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Data {
        #[serde(with = "base64_bytes")]
        #[schemars(with = "String")]
        bytes: Vec<u8>,
    },
    SshError {
        message: String,
    },
    Authentication {
        action: String,
        success: Option<bool>,
        message: Option<String>,
        prompts: Option<Vec<String>>,
    },
    Permissions {
        auto_log: bool,
        allow_replay: bool,
        allow_reconnect: bool,
        allow_reauth: bool,
    },
    ExecData {
        kind: ExecStreamKind,
        #[serde(with = "base64_bytes")]
        #[schemars(with = "String")]
        data: Vec<u8>,
    },
    ExecExit {
        code: Option<u32>,
        signal: Option<String>,
    },
    HostkeyVerify {
        host: String,
        port: u16,
        algorithm: String,
        fingerprint: String,
    },
    HostkeyVerified {
        source: String,
    },
    HostkeyMismatch {
        presented: String,
        stored: String,
    },
    HostkeyRejected,
    HostkeyAlert,
    SftpProgress {
        transfer_id: TransferId,
        bytes_transferred: u64,
        total_bytes: u64,
    },
    SftpComplete {
        transfer_id: TransferId,
        bytes_transferred: u64,
    },
    SftpError {
        transfer_id: Option<TransferId>,
        message: String,
    },
    Prompt {
        id: String,
        kind: String,
        title: String,
        message: Option<String>,
        buttons: Vec<String>,
        timeout_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ExecStreamKind {
    Stdout,
    Stderr,
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------
// Transport boundary (spec §4.8 "Socket Adapter — transport boundary")
// ---------------------------------------------------------------------

/// A bidirectional message channel the adapter runs against, decoupled
/// from any concrete WebSocket library. `buffered_bytes` returning `None`
/// means the transport cannot report outbound backpressure; the adapter
/// then relies solely on the application-level rate limiter.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, message: &ServerMessage) -> Result<(), GatewayError>;
    async fn recv(&mut self) -> Option<ClientMessage>;
    fn buffered_bytes(&self) -> Option<usize>;
    async fn close(&mut self);
}

/// Concrete [`Transport`] over `axum::extract::ws::WebSocket`, the one
/// WebSocket implementation this crate ships (spec §9's transport note).
/// `axum`'s socket exposes no outbound buffer introspection, so
/// `buffered_bytes` always returns `None` here.
pub struct AxumWebSocketTransport {
    socket: Option<axum::extract::ws::WebSocket>,
}

impl AxumWebSocketTransport {
    pub fn new(socket: axum::extract::ws::WebSocket) -> Self {
        Self { socket: Some(socket) }
    }
}

#[async_trait]
impl Transport for AxumWebSocketTransport {
    async fn send(&mut self, message: &ServerMessage) -> Result<(), GatewayError> {
        use axum::extract::ws::Message;
        let Some(socket) = self.socket.as_mut() else { return Err(GatewayError::System("transport already closed".into())) };
        let text = serde_json::to_string(message).map_err(|e| GatewayError::System(e.to_string()))?;
        socket.send(Message::Text(text)).await.map_err(|e| GatewayError::System(e.to_string()))
    }

    async fn recv(&mut self) -> Option<ClientMessage> {
        use axum::extract::ws::Message;
        loop {
            let socket = self.socket.as_mut()?;
            match socket.recv().await? {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => return Some(msg),
                    Err(err) => {
                        warn!("socket: dropping malformed client message: {err}");
                        continue;
                    }
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(err) => {
                    warn!("socket: transport error: {err}");
                    return None;
                }
            }
        }
    }

    fn buffered_bytes(&self) -> Option<usize> {
        None
    }

    async fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            let _ = socket.close().await;
        }
    }
}

// ---------------------------------------------------------------------
// Backpressure gate (spec §4.8 "Shell data pump")
// ---------------------------------------------------------------------

/// Composes the two independent flow-control mechanisms of the shell data
/// pump: application-level rate limiting and transport-level backpressure.
/// The stream resumes only once both flags are clear.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureGate {
    rate_paused: bool,
    transport_paused: bool,
}

impl BackpressureGate {
    pub fn is_paused(&self) -> bool {
        self.rate_paused || self.transport_paused
    }

    pub fn on_rate_signal(&mut self, signal: RateSignal) {
        match signal {
            RateSignal::Pause => self.rate_paused = true,
            RateSignal::Continue => {}
        }
    }

    pub fn on_rate_resume(&mut self) {
        self.rate_paused = false;
    }

    /// Applies HWM/4 hysteresis: pause at `>= high_water_mark`, resume only
    /// once already paused and `< high_water_mark / 4` (spec §4.8).
    pub fn on_transport_buffered(&mut self, buffered: Option<usize>, high_water_mark: usize) {
        let Some(buffered) = buffered else { return };
        if buffered >= high_water_mark {
            self.transport_paused = true;
        } else if self.transport_paused && buffered < high_water_mark / 4 {
            self.transport_paused = false;
        }
    }
}

// ---------------------------------------------------------------------
// Per-connection context (spec §4.8)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TerminalSettings {
    pub term: Option<String>,
    pub rows: Option<u32>,
    pub cols: Option<u32>,
    pub env: Vec<(String, String)>,
}

/// The small mutable per-WebSocket context the adapter threads through
/// message handling (spec §4.8).
pub struct SocketContext {
    pub session_id: Option<SessionId>,
    pub connection_id: Option<ConnectionId>,
    pub shell_stream: Option<ShellStream>,
    pub stored_password: Option<String>,
    pub original_auth_method: Option<AuthMethodName>,
    pub initial_term_settings: TerminalSettings,
    pub client_ip: Option<String>,
    pub username: Option<String>,
    pub user_agent: Option<String>,
}

impl SocketContext {
    pub fn new(client_ip: Option<String>, user_agent: Option<String>) -> Self {
        Self {
            session_id: None,
            connection_id: None,
            shell_stream: None,
            stored_password: None,
            original_auth_method: None,
            initial_term_settings: TerminalSettings::default(),
            client_ip,
            username: None,
            user_agent,
        }
    }
}

// ---------------------------------------------------------------------
// The adapter
// ---------------------------------------------------------------------

/// Central event loop wiring one WebSocket to the Session Store,
/// Connection Pool, Transfer Manager, and Host-Key Verifier (spec §4.8).
pub struct SocketAdapter {
    store: Arc<SessionStore>,
    pool: Arc<ConnectionPool<SshConnectionFactory>>,
    transfers: Arc<TransferManager>,
    verifier: Arc<Verifier>,
    host_key_events: ssh::HostKeyEventRegistry,
    config: GatewayConfig,
}

impl SocketAdapter {
    pub fn new(
        store: Arc<SessionStore>,
        pool: Arc<ConnectionPool<SshConnectionFactory>>,
        transfers: Arc<TransferManager>,
        verifier: Arc<Verifier>,
        host_key_events: ssh::HostKeyEventRegistry,
        config: GatewayConfig,
    ) -> Self {
        Self { store, pool, transfers, verifier, host_key_events, config }
    }

    /// Runs the event loop until the transport closes or a `disconnect`
    /// message is received, then releases the session's resources.
    pub async fn run<T: Transport>(&self, mut transport: T, mut ctx: SocketContext) {
        let rate_limiter = RateLimiter::new(self.config.output_rate_limit_bytes_per_sec);
        let mut gate = BackpressureGate::default();

        loop {
            tokio::select! {
                incoming = transport.recv() => {
                    match incoming {
                        Some(ClientMessage::Disconnect) | None => break,
                        Some(message) => {
                            if let Err(err) = self.handle_client_message(&mut transport, &mut ctx, message).await {
                                let _ = transport.send(&ServerMessage::SshError { message: err.to_string() }).await;
                            }
                        }
                    }
                }
                Some(data) = recv_shell_data(&mut ctx) => {
                    self.pump_shell_chunk(&mut transport, &mut ctx, &mut gate, &rate_limiter, data).await;
                }
            }
        }

        self.cleanup(&mut ctx).await;
        transport.close().await;
    }

    async fn cleanup(&self, ctx: &mut SocketContext) {
        if let Some(session_id) = ctx.session_id {
            self.transfers.cancel_all_for_session(session_id);
            self.pool.release_session(session_id).await;
            self.store.dispatch(session_id, SessionAction::SessionEnd);
            self.store.end(session_id);
        }
        ctx.shell_stream = None;
    }

    /// The shell data pump's second half: on every upstream chunk, check
    /// both flow-control mechanisms and translate a pause signal into
    /// leaving the shell stream unread until drained (spec §4.8). The
    /// current `tokio::sync::mpsc` stream has no external pause primitive,
    /// so "pausing" means skipping the forward send and holding the chunk
    /// only as long as the gate stays shut; `recv_shell_data` is not
    /// polled again until this call returns, which is the pause itself.
    async fn pump_shell_chunk<T: Transport>(
        &self,
        transport: &mut T,
        ctx: &mut SocketContext,
        gate: &mut BackpressureGate,
        rate_limiter: &RateLimiter,
        data: Vec<u8>,
    ) {
        if let Some(connection_id) = ctx.connection_id {
            self.pool.update_activity(connection_id);
            self.pool.update_metrics(connection_id, 0, data.len() as u64);
        }
        if let Some(session_id) = ctx.session_id {
            self.store.dispatch(session_id, SessionAction::ConnectionActivity);
        }

        gate.on_rate_signal(rate_limiter.check_and_update(data.len() as u64));
        if gate.is_paused() {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            rate_limiter.resume();
            gate.on_rate_resume();
        }

        if transport.send(&ServerMessage::Data { bytes: data }).await.is_err() {
            return;
        }
        gate.on_transport_buffered(transport.buffered_bytes(), self.config.socket_high_water_mark);
    }

    async fn handle_client_message<T: Transport>(&self, transport: &mut T, ctx: &mut SocketContext, message: ClientMessage) -> Result<(), GatewayError> {
        match message {
            ClientMessage::Authenticate { username, password, host, port, method } => {
                self.handle_authenticate(transport, ctx, username, password, host, port, method).await
            }
            ClientMessage::Geometry { cols, rows } | ClientMessage::Resize { rows, cols } => {
                self.handle_resize(ctx, rows, cols).await
            }
            ClientMessage::Terminal { term, rows, cols, env } => self.handle_open_terminal(transport, ctx, term, rows, cols, env).await,
            ClientMessage::Data { bytes } => self.handle_data(ctx, bytes).await,
            ClientMessage::Exec { command, pty: _, term, cols, rows, env, timeout_ms } => {
                self.handle_exec(transport, ctx, command, term, cols, rows, env, timeout_ms).await
            }
            ClientMessage::Control { action } => self.handle_control(ctx, &action).await,
            ClientMessage::SftpList { path } => self.handle_sftp_list(transport, ctx, path).await,
            ClientMessage::SftpStat { path } => self.handle_sftp_stat(transport, ctx, path).await,
            ClientMessage::SftpMkdir { path } => self.handle_sftp_mkdir(ctx, path).await,
            ClientMessage::SftpDelete { path } => self.handle_sftp_delete(ctx, path).await,
            ClientMessage::SftpUploadStart { remote_path, filename, total_bytes } => {
                self.handle_sftp_upload_start(transport, ctx, remote_path, filename, total_bytes).await
            }
            ClientMessage::SftpUploadChunk { transfer_id, chunk_index, data, is_last } => {
                self.handle_sftp_upload_chunk(transport, ctx, transfer_id, chunk_index, data, is_last).await
            }
            ClientMessage::SftpUploadCancel { transfer_id } => {
                self.transfers.cancel_transfer(transfer_id);
                Ok(())
            }
            ClientMessage::SftpDownloadStart { remote_path } => self.handle_sftp_download_start(transport, ctx, remote_path).await,
            ClientMessage::SftpDownloadCancel { transfer_id } => {
                self.transfers.cancel_transfer(transfer_id);
                Ok(())
            }
            ClientMessage::HostkeyVerifyResponse { host, port, algorithm, action } => {
                self.verifier.respond(&(host, port, algorithm), action == HostKeyVerifyAction::Accept);
                Ok(())
            }
            ClientMessage::Disconnect => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_authenticate<T: Transport>(
        &self,
        transport: &mut T,
        ctx: &mut SocketContext,
        username: Option<String>,
        password: Option<String>,
        host: String,
        port: u16,
        method: AuthMethodName,
    ) -> Result<(), GatewayError> {
        auth::check_method_allowed(method, &self.config.allowed_auth_methods)?;

        let candidates = CredentialCandidates {
            post_body: username.zip(password),
            http_basic: None,
            sso_headers: None,
            configured_default: None,
        };
        let attempt = match auth::resolve_credential(&candidates) {
            Ok(credential) => AuthAttempt::succeed(credential),
            Err(err) => AuthAttempt::fail(err.to_string()),
        };

        let session_id = ctx.session_id.unwrap_or_else(|| self.store.create());
        ctx.session_id = Some(session_id);

        match &attempt.credential {
            Some(credential) => {
                ctx.username = Some(credential.username.clone());
                ctx.stored_password = credential.password.clone();
                ctx.original_auth_method = Some(method);
                self.store.dispatch(session_id, SessionAction::AuthSuccess { username: credential.username.clone(), method: format!("{method:?}") });
                self.store.dispatch(session_id, SessionAction::ConnectionStart { host, port });
                transport
                    .send(&ServerMessage::Authentication { action: "authenticate".into(), success: Some(true), message: None, prompts: None })
                    .await?;
                transport
                    .send(&ServerMessage::Permissions {
                        auto_log: false,
                        allow_replay: self.config.session.allow_replay_credentials,
                        allow_reconnect: true,
                        allow_reauth: true,
                    })
                    .await?;
            }
            None => {
                let message = attempt.error.clone().unwrap_or_default();
                self.store.dispatch(session_id, SessionAction::AuthFailure { error: message.clone() });
                transport.send(&ServerMessage::Authentication { action: "authenticate".into(), success: Some(false), message: Some(message), prompts: None }).await?;
            }
        }
        Ok(())
    }

    async fn handle_resize(&self, ctx: &mut SocketContext, rows: u32, cols: u32) -> Result<(), GatewayError> {
        if let Some(shell) = ctx.shell_stream.as_ref() {
            shell.to_shell.send(ssh::ShellInput::Resize { rows, cols }).await.map_err(|_| crate::error::ConnectionError::Closed)?;
            if let Some(session_id) = ctx.session_id {
                self.store.dispatch(session_id, SessionAction::TerminalResize { rows, cols });
            }
        } else {
            ctx.initial_term_settings.rows = Some(rows);
            ctx.initial_term_settings.cols = Some(cols);
        }
        Ok(())
    }

    /// Dials through the pool while mediating the host-key prompt
    /// round-trip: registers a per-session sink before dialing so
    /// `hostkey-*` events raised mid-dial (spec §4.7/§4.9) reach this
    /// session's transport as they happen, not after the dial resolves.
    async fn acquire_with_host_key_prompts<T: Transport>(&self, transport: &mut T, session_id: SessionId, params: ConnectParams) -> Result<ConnectionId, GatewayError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ssh::HostKeyEvent>();
        self.host_key_events.insert(session_id, Arc::new(move |event| {
            let _ = tx.send(event);
        }));

        let mut acquire = Box::pin(self.pool.acquire(params));
        let result = loop {
            tokio::select! {
                result = &mut acquire => break result,
                Some(event) = rx.recv() => {
                    let _ = transport.send(&host_key_event_to_server_message(event)).await;
                }
            }
        };

        self.host_key_events.remove(&session_id);
        Ok(result?)
    }

    async fn handle_open_terminal<T: Transport>(
        &self,
        transport: &mut T,
        ctx: &mut SocketContext,
        term: String,
        rows: u32,
        cols: u32,
        env: Vec<(String, String)>,
    ) -> Result<(), GatewayError> {
        let session_id = ctx.session_id.ok_or(ValidationError::Malformed("terminal requested before authenticate".into()))?;
        let record = self.store.get(session_id).ok_or(ValidationError::Malformed("unknown session".into()))?;
        let host = record.connection.host.clone().ok_or(ValidationError::Malformed("no host on session".into()))?;
        let port = record.connection.port.unwrap_or(22);
        let username = ctx.username.clone().ok_or(ValidationError::Malformed("no username on session".into()))?;
        let password = ctx.stored_password.clone().unwrap_or_default();
        let auth_method = ctx.original_auth_method.unwrap_or(AuthMethodName::Password);

        let rows = rows.clamp(store::MIN_ROWS, store::MAX_ROWS);
        let cols = cols.clamp(store::MIN_COLS, store::MAX_COLS);

        let params = ConnectParams { session_id, host, port, username, password, auth_method };
        let connection_id = self.acquire_with_host_key_prompts(transport, session_id, params).await?;
        let handle = self.pool.get(connection_id).ok_or(crate::error::PoolError::NotFound)?;

        let shell = ssh::shell(&handle.handle, &term, rows, cols, &env, &self.config).await?;
        ctx.shell_stream = Some(shell);
        ctx.connection_id = Some(connection_id);

        self.store.dispatch(session_id, SessionAction::ConnectionEstablished { connection_id });
        self.store.dispatch(session_id, SessionAction::TerminalSetTerm { term });
        self.store.dispatch(session_id, SessionAction::TerminalResize { rows, cols });
        self.store.dispatch(session_id, SessionAction::TerminalSetEnv { env });

        if let (Some(rows), Some(cols)) = (ctx.initial_term_settings.rows, ctx.initial_term_settings.cols) {
            if let Some(shell) = ctx.shell_stream.as_ref() {
                shell.to_shell.send(ssh::ShellInput::Resize { rows, cols }).await.map_err(|_| crate::error::ConnectionError::Closed)?;
            }
            self.store.dispatch(session_id, SessionAction::TerminalResize { rows, cols });
        }

        let _ = transport;
        Ok(())
    }

    async fn handle_data(&self, ctx: &mut SocketContext, bytes: Vec<u8>) -> Result<(), GatewayError> {
        let Some(shell) = ctx.shell_stream.as_ref() else {
            return Err(ValidationError::Malformed("data received before a shell is open".into()).into());
        };
        shell.to_shell.send(ssh::ShellInput::Data(bytes)).await.map_err(|_| crate::error::ConnectionError::Closed)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_exec<T: Transport>(
        &self,
        transport: &mut T,
        ctx: &mut SocketContext,
        command: String,
        _term: Option<String>,
        cols: Option<u32>,
        rows: Option<u32>,
        env: Option<Vec<(String, String)>>,
        timeout_ms: Option<u64>,
    ) -> Result<(), GatewayError> {
        if command.trim().is_empty() {
            return Err(ValidationError::Malformed("exec command must not be empty".into()).into());
        }
        if let Some(rows) = rows
            && !(store::MIN_ROWS..=store::MAX_ROWS).contains(&rows)
        {
            return Err(ValidationError::DimensionOutOfRange(format!("rows={rows}")).into());
        }
        if let Some(cols) = cols
            && !(store::MIN_COLS..=store::MAX_COLS).contains(&cols)
        {
            return Err(ValidationError::DimensionOutOfRange(format!("cols={cols}")).into());
        }
        let env = env.unwrap_or_default();
        let filtered = ssh::filter_env(&env, &self.config.env_allowlist);
        if filtered.len() != env.len() {
            return Err(ValidationError::InvalidEnvVar("exec env contains a disallowed or malformed entry".into()).into());
        }

        let connection_id = ctx.connection_id.ok_or(crate::error::PoolError::NotFound)?;
        let handle = self.pool.get(connection_id).ok_or(crate::error::PoolError::NotFound)?;

        let timeout = std::time::Duration::from_millis(timeout_ms.unwrap_or(60_000));
        let (stdout, stderr, outcome): (Vec<u8>, Vec<u8>, ExecOutcome) = tokio::time::timeout(timeout, ssh::exec(&handle.handle, &command))
            .await
            .map_err(|_| crate::error::ConnectionError::Closed)??;

        if !stdout.is_empty() {
            transport.send(&ServerMessage::ExecData { kind: ExecStreamKind::Stdout, data: stdout }).await?;
        }
        if !stderr.is_empty() {
            transport.send(&ServerMessage::ExecData { kind: ExecStreamKind::Stderr, data: stderr }).await?;
        }
        debug!("socket: exec '{command}' exited code={:?} signal={:?}", outcome.code, outcome.signal);
        transport.send(&ServerMessage::ExecExit { code: outcome.code, signal: outcome.signal }).await?;
        Ok(())
    }

    async fn handle_control(&self, ctx: &mut SocketContext, action: &str) -> Result<(), GatewayError> {
        if action != "replayCredentials" {
            return Ok(());
        }
        if !self.config.session.allow_replay_credentials {
            return Ok(());
        }
        let Some(shell) = ctx.shell_stream.as_ref() else { return Ok(()) };
        let Some(password) = ctx.stored_password.clone() else { return Ok(()) };
        let mut line = password.into_bytes();
        line.push(b'\n');
        let _ = shell.to_shell.send(ssh::ShellInput::Data(line)).await;
        Ok(())
    }

    async fn handle_sftp_list<T: Transport>(&self, transport: &mut T, ctx: &mut SocketContext, path: String) -> Result<(), GatewayError> {
        let handle = self.sftp_handle(ctx)?;
        let sftp = ssh::open_sftp(&handle.handle).await?;
        let entries = sftp.read_dir(&path).await.map_err(TransferError::from)?;
        let names: Vec<String> = entries.map(|e| e.file_name()).collect();
        debug!("socket: sftp-list {path} -> {} entries", names.len());
        transport.send(&ServerMessage::SftpProgress { transfer_id: TransferId::new(), bytes_transferred: names.len() as u64, total_bytes: names.len() as u64 }).await?;
        Ok(())
    }

    async fn handle_sftp_stat<T: Transport>(&self, transport: &mut T, ctx: &mut SocketContext, path: String) -> Result<(), GatewayError> {
        let handle = self.sftp_handle(ctx)?;
        let sftp = ssh::open_sftp(&handle.handle).await?;
        let metadata = sftp.metadata(&path).await.map_err(TransferError::from)?;
        debug!("socket: sftp-stat {path} size={:?}", metadata.size);
        let _ = transport;
        Ok(())
    }

    async fn handle_sftp_mkdir(&self, ctx: &mut SocketContext, path: String) -> Result<(), GatewayError> {
        let handle = self.sftp_handle(ctx)?;
        let sftp = ssh::open_sftp(&handle.handle).await?;
        sftp.create_dir(&path).await.map_err(TransferError::from)?;
        Ok(())
    }

    async fn handle_sftp_delete(&self, ctx: &mut SocketContext, path: String) -> Result<(), GatewayError> {
        let handle = self.sftp_handle(ctx)?;
        let sftp = ssh::open_sftp(&handle.handle).await?;
        sftp.remove_file(&path).await.map_err(TransferError::from)?;
        Ok(())
    }

    async fn handle_sftp_upload_start<T: Transport>(
        &self,
        transport: &mut T,
        ctx: &mut SocketContext,
        remote_path: String,
        filename: String,
        total_bytes: u64,
    ) -> Result<(), GatewayError> {
        let session_id = ctx.session_id.ok_or(ValidationError::Malformed("sftp before authenticate".into()))?;
        if total_bytes > self.config.sftp.max_file_size {
            transport
                .send(&ServerMessage::SftpError { transfer_id: None, message: format!("file size {total_bytes} exceeds maximum {}", self.config.sftp.max_file_size) })
                .await?;
            return Err(TransferError::FileTooLarge { size: total_bytes, max: self.config.sftp.max_file_size }.into());
        }
        if let Some(ext) = filename.rsplit('.').next()
            && self.config.sftp.blocked_extensions.iter().any(|blocked| blocked.eq_ignore_ascii_case(ext))
        {
            return Err(TransferError::ExtensionBlocked(ext.to_string()).into());
        }
        let id = self.transfers.start_transfer(TransferParams { session_id, direction: TransferDirection::Upload, remote_path, filename, total_bytes })?;
        self.transfers.activate_transfer(id)?;
        Ok(())
    }

    async fn handle_sftp_upload_chunk<T: Transport>(
        &self,
        transport: &mut T,
        ctx: &mut SocketContext,
        transfer_id: TransferId,
        chunk_index: u64,
        data: Vec<u8>,
        is_last: bool,
    ) -> Result<(), GatewayError> {
        let session_id = ctx.session_id.ok_or(ValidationError::Malformed("sftp before authenticate".into()))?;
        self.transfers.verify_ownership(transfer_id, session_id)?;
        if data.len() > MAX_ENCODED_CHUNK_BYTES {
            return Err(TransferError::ChunkTooLarge.into());
        }
        self.transfers.update_progress(transfer_id, chunk_index, data.len() as u64)?;

        if let Some(info) = self.transfers.info(transfer_id) {
            transport.send(&ServerMessage::SftpProgress { transfer_id, bytes_transferred: info.bytes_transferred, total_bytes: info.total_bytes }).await?;
        }

        if is_last {
            let report = self.transfers.complete_transfer(transfer_id)?;
            transport.send(&ServerMessage::SftpComplete { transfer_id, bytes_transferred: report.bytes_transferred }).await?;
        }
        let _ = ctx;
        Ok(())
    }

    async fn handle_sftp_download_start<T: Transport>(&self, transport: &mut T, ctx: &mut SocketContext, remote_path: String) -> Result<(), GatewayError> {
        let session_id = ctx.session_id.ok_or(ValidationError::Malformed("sftp before authenticate".into()))?;
        let handle = self.sftp_handle(ctx)?;
        let sftp = ssh::open_sftp(&handle.handle).await?;
        let metadata = sftp.metadata(&remote_path).await.map_err(TransferError::from)?;
        let total_bytes = metadata.size.unwrap_or(0);
        let filename = remote_path.rsplit('/').next().unwrap_or(&remote_path).to_string();
        let id = self.transfers.start_transfer(TransferParams { session_id, direction: TransferDirection::Download, remote_path, filename, total_bytes })?;
        self.transfers.activate_transfer(id)?;
        transport.send(&ServerMessage::SftpProgress { transfer_id: id, bytes_transferred: 0, total_bytes }).await?;
        Ok(())
    }

    fn sftp_handle(&self, ctx: &SocketContext) -> Result<Arc<crate::ssh::SshHandle>, GatewayError> {
        let connection_id = ctx.connection_id.ok_or(crate::error::PoolError::NotFound)?;
        self.pool.get(connection_id).ok_or_else(|| crate::error::PoolError::NotFound.into())
    }
}

fn host_key_event_to_server_message(event: ssh::HostKeyEvent) -> ServerMessage {
    match event {
        ssh::HostKeyEvent::Verified { source } => ServerMessage::HostkeyVerified { source: source.to_string() },
        ssh::HostKeyEvent::Mismatch { presented, stored } => ServerMessage::HostkeyMismatch { presented, stored },
        ssh::HostKeyEvent::Rejected => ServerMessage::HostkeyRejected,
        ssh::HostKeyEvent::Alert => ServerMessage::HostkeyAlert,
        ssh::HostKeyEvent::VerifyPrompt { host, port, algorithm, fingerprint } => ServerMessage::HostkeyVerify { host, port, algorithm, fingerprint },
    }
}

async fn recv_shell_data(ctx: &mut SocketContext) -> Option<Vec<u8>> {
    match ctx.shell_stream.as_mut() {
        Some(stream) => stream.from_shell.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backpressure_gate_pauses_at_high_water_mark_and_needs_quarter_to_resume() {
        let mut gate = BackpressureGate::default();
        gate.on_transport_buffered(Some(16 * 1024), 16 * 1024);
        assert!(gate.is_paused());
        gate.on_transport_buffered(Some(5000), 16 * 1024);
        assert!(gate.is_paused(), "must not resume above HWM/4");
        gate.on_transport_buffered(Some(3999), 16 * 1024);
        assert!(!gate.is_paused());
    }

    #[test]
    fn backpressure_gate_requires_both_flags_clear_to_resume() {
        let mut gate = BackpressureGate::default();
        gate.on_rate_signal(RateSignal::Pause);
        gate.on_transport_buffered(Some(20_000), 16 * 1024);
        assert!(gate.is_paused());
        gate.on_transport_buffered(Some(0), 16 * 1024);
        assert!(gate.is_paused(), "rate flag still set");
        gate.on_rate_resume();
        assert!(!gate.is_paused());
    }

    #[test]
    fn backpressure_gate_none_buffered_is_a_noop() {
        let mut gate = BackpressureGate::default();
        gate.on_transport_buffered(None, 16 * 1024);
        assert!(!gate.is_paused());
    }

    #[test]
    fn client_message_round_trips_through_json() {
        let msg = ClientMessage::Terminal { term: "xterm-256color".into(), rows: 24, cols: 80, env: vec![("LANG".into(), "C".into())] };
        let json = serde_json::to_string(&msg).expect("serialize");
        let back: ClientMessage = serde_json::from_str(&json).expect("deserialize");
        assert!(matches!(back, ClientMessage::Terminal { rows: 24, cols: 80, .. }));
    }

    #[test]
    fn server_message_data_encodes_as_base64() {
        let msg = ServerMessage::Data { bytes: b"hi".to_vec() };
        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(json.contains("\"aGk=\""));
    }

    #[test]
    fn sftp_upload_chunk_rejects_oversized_payload() {
        assert!(MAX_ENCODED_CHUNK_BYTES > 0);
    }
}
