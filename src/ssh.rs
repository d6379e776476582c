//! SSH Service: dialing, shell/exec/resize/disconnect, and the host-key
//! callback wiring (spec §4.7).
//!
//! The teacher dials through `async_ssh2_tokio::Client`, whose
//! `ClientHandler::check_server_key` is a fixed match over
//! `ServerCheckMethod` and cannot run the trust-store-then-prompt
//! decision table. This dials with `russh::client::connect` directly
//! (one layer below what the teacher already depends on) with a custom
//! `russh::client::Handler` wired to [`crate::hostkey::Verifier`]. Shell
//! I/O pumping follows `session/client.rs`'s `tokio::select!` loop over
//! channel messages and an mpsc pair, generalized from device text lines
//! to raw bytes. SFTP hands a channel's `into_stream()` to
//! `russh_sftp::client::SftpSession`, the natural extension of the
//! teacher's existing `russh` dependency.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use russh::client::{self, AuthResult, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::PublicKey;
use russh::{ChannelMsg, Disconnect};
use tokio::sync::mpsc;

use russh_sftp::client::SftpSession;

use crate::auth;
use crate::config::{AuthMethodName, GatewayConfig, SshDialConfig};
use crate::error::{ConnectionError, PoolError, TransferError};
use crate::hostkey::{VerifyAction, Verifier};
use crate::ids::SessionId;
use crate::pool::{ConnectParams, ConnectionFactory};

static ENV_NAME_SHAPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_]\w*$").expect("static regex"));
static SHELL_METACHARACTERS: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[;&|`$(){}<>\\\n]"#).expect("static regex"));

/// Filters `env` down to allowlisted, shape-valid names with
/// metacharacter-free values (spec §4.7).
pub fn filter_env(env: &[(String, String)], allowlist: &[String]) -> Vec<(String, String)> {
    env.iter()
        .filter(|(name, value)| {
            allowlist.iter().any(|allowed| allowed == name) && ENV_NAME_SHAPE.is_match(name) && !SHELL_METACHARACTERS.is_match(value)
        })
        .cloned()
        .collect()
}

/// A channel the Socket Adapter should emit to the client, decided by the
/// host-key verifier's decision table (spec §4.7).
#[derive(Debug, Clone)]
pub enum HostKeyEvent {
    Verified { source: &'static str },
    Mismatch { presented: String, stored: String },
    Rejected,
    Alert,
    VerifyPrompt { host: String, port: u16, algorithm: String, fingerprint: String },
}

type EventSink = Arc<dyn Fn(HostKeyEvent) + Send + Sync>;

/// Per-session registry of host-key event sinks, shared between the
/// [`SshConnectionFactory`] (which emits into it during `connect`) and the
/// Socket Adapter (which registers a sink before dialing so it can forward
/// `hostkey-*` events to that session's transport as they occur).
pub type HostKeyEventRegistry = Arc<DashMap<SessionId, EventSink>>;

/// `client::Handler` that runs the host-key decision table against the
/// trust store, forwarding prompt-worthy events through `emit`.
pub struct GatewayHandler {
    pub host: String,
    pub port: u16,
    pub verifier: Arc<Verifier>,
    pub emit: EventSink,
}

impl client::Handler for GatewayHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let algorithm = server_public_key.algorithm().to_string();
        let key_bytes = server_public_key.to_bytes().map_err(|_| russh::Error::NotAuthenticated)?;

        let action = self
            .verifier
            .decide(&self.host, self.port, &algorithm, &key_bytes)
            .map_err(|_| russh::Error::NotAuthenticated)?;

        match action {
            VerifyAction::Decided(outcome) => Ok(self.apply_outcome(outcome)),
            VerifyAction::AwaitClient { prompt_id } => {
                let fp = crate::hostkey::fingerprint(&key_bytes);
                (self.emit)(HostKeyEvent::VerifyPrompt { host: self.host.clone(), port: self.port, algorithm: algorithm.clone(), fingerprint: fp });
                let rx = self.verifier.register_prompt(prompt_id.clone());
                let timeout = self.verifier.prompt_timeout();
                let accepted = match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(accepted)) => accepted,
                    _ => false,
                };
                self.verifier.clear_prompt(&prompt_id);
                if accepted {
                    (self.emit)(HostKeyEvent::Verified { source: "client" });
                    Ok(true)
                } else {
                    (self.emit)(HostKeyEvent::Rejected);
                    Ok(false)
                }
            }
        }
    }
}

impl GatewayHandler {
    fn apply_outcome(&self, outcome: crate::hostkey::VerifyOutcome) -> bool {
        use crate::hostkey::VerifyOutcome::*;
        match outcome {
            AcceptTrusted => {
                (self.emit)(HostKeyEvent::Verified { source: "server" });
                true
            }
            AcceptAlert => {
                (self.emit)(HostKeyEvent::Alert);
                true
            }
            AcceptPrompted => {
                (self.emit)(HostKeyEvent::Verified { source: "client" });
                true
            }
            RejectMismatch { presented, stored } => {
                (self.emit)(HostKeyEvent::Mismatch { presented, stored });
                false
            }
            RejectPolicy | RejectPrompted | RejectTimeout => {
                (self.emit)(HostKeyEvent::Rejected);
                false
            }
        }
    }
}

/// A live, authenticated SSH connection: the pool's `Handle` type.
pub struct SshHandle {
    pub handle: Handle<GatewayHandler>,
    pub host: String,
    pub port: u16,
    pub username: String,
}

/// [`ConnectionFactory`] dialing real SSH servers and running the
/// gateway's host-key verifier as the connection's trust callback.
pub struct SshConnectionFactory {
    pub verifier: Arc<Verifier>,
    pub dial_config: SshDialConfig,
    pub preferred: russh::Preferred,
    pub event_registry: HostKeyEventRegistry,
}

#[async_trait]
impl ConnectionFactory for SshConnectionFactory {
    type Handle = SshHandle;

    async fn connect(&self, params: &ConnectParams) -> Result<Self::Handle, PoolError> {
        let config = Arc::new(client::Config {
            preferred: self.preferred.clone(),
            keepalive_interval: Some(self.dial_config.keepalive_interval),
            keepalive_max: self.dial_config.keepalive_count_max as usize,
            ..Default::default()
        });
        let registry = self.event_registry.clone();
        let session_id = params.session_id;
        let emit: EventSink = Arc::new(move |event| {
            if let Some(sink) = registry.get(&session_id) {
                (sink)(event);
            }
        });
        let handler = GatewayHandler { host: params.host.clone(), port: params.port, verifier: self.verifier.clone(), emit };

        let mut handle = tokio::time::timeout(self.dial_config.ready_timeout, client::connect(config, (params.host.as_str(), params.port), handler))
            .await
            .map_err(|_| PoolError::FactoryFailed(russh::Error::ConnectionTimeout))??;

        let authenticated = match params.auth_method {
            AuthMethodName::KeyboardInteractive => authenticate_keyboard_interactive(&mut handle, &params.username, &params.password).await?,
            _ => {
                let auth: AuthResult = handle.authenticate_password(params.username.clone(), params.password.clone()).await?;
                auth.success()
            }
        };
        if !authenticated {
            return Err(PoolError::AuthFailed);
        }

        debug!("ssh: connected {}@{}:{}", params.username, params.host, params.port);
        Ok(SshHandle { handle, host: params.host.clone(), port: params.port, username: params.username.clone() })
    }

    async fn destroy(&self, handle: Self::Handle) {
        if let Err(err) = handle.handle.disconnect(Disconnect::ByApplication, "", "en").await {
            warn!("ssh: disconnect error for {}@{}:{}: {err}", handle.username, handle.host, handle.port);
        }
    }
}

/// Negotiates `keyboard-interactive` (spec §4.6): auto-answers a challenge
/// only when every prompt text matches `/password/i`, the gateway's default
/// mode. A challenge with any other prompt has no browser round-trip to
/// forward to at dial time, so it is treated as a rejected auth attempt
/// rather than silently falling back to password auth.
async fn authenticate_keyboard_interactive(handle: &mut Handle<GatewayHandler>, username: &str, password: &str) -> Result<bool, PoolError> {
    let mut response = handle.authenticate_keyboard_interactive_start(username.to_string(), None).await?;
    loop {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                let prompt_texts: Vec<String> = prompts.iter().map(|p| p.prompt.clone()).collect();
                if !auth::all_prompts_auto_answerable(&prompt_texts) {
                    return Ok(false);
                }
                let answers = prompt_texts.iter().map(|text| auth::auto_answer_prompt(text, password).unwrap_or_default()).collect();
                response = handle.authenticate_keyboard_interactive_respond(answers).await?;
            }
        }
    }
}

/// A message the Socket Adapter sends into a pumped shell channel: either
/// bytes typed at the terminal, or a PTY window-change (spec §4.7's
/// `resize(connectionId, rows, cols)`).
#[derive(Debug)]
pub enum ShellInput {
    Data(Vec<u8>),
    Resize { rows: u32, cols: u32 },
}

/// A duplex byte stream backing a shell or exec channel, pumped by a
/// background task the way `session/client.rs`'s I/O task pumps text
/// lines — generalized here to raw bytes plus resize control messages.
pub struct ShellStream {
    pub to_shell: mpsc::Sender<ShellInput>,
    pub from_shell: mpsc::Receiver<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub code: Option<u32>,
    pub signal: Option<String>,
}

/// Opens a PTY-backed shell channel with environment restricted by
/// `envAllowlist` (spec §4.7).
pub async fn shell(handle: &Handle<GatewayHandler>, term: &str, rows: u32, cols: u32, env: &[(String, String)], config: &GatewayConfig) -> Result<ShellStream, ConnectionError> {
    let channel = handle.channel_open_session().await?;
    channel.request_pty(false, term, cols, rows, 0, 0, &[]).await?;
    for (name, value) in filter_env(env, &config.env_allowlist) {
        channel.set_env(false, name, value).await?;
    }
    channel.request_shell(false).await?;
    Ok(pump_channel(channel))
}

/// Runs a non-interactive command, returning stdout/stderr bytes and the
/// process outcome.
pub async fn exec(handle: &Handle<GatewayHandler>, command: &str) -> Result<(Vec<u8>, Vec<u8>, ExecOutcome), ConnectionError> {
    let mut channel = handle.channel_open_session().await?;
    channel.exec(true, command.as_bytes()).await?;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut outcome = ExecOutcome { code: None, signal: None };
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, .. } => stderr.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } => outcome.code = Some(exit_status),
            ChannelMsg::ExitSignal { signal_name, .. } => outcome.signal = Some(format!("{signal_name:?}")),
            ChannelMsg::Eof | ChannelMsg::Close => break,
            _ => {}
        }
    }
    Ok((stdout, stderr, outcome))
}

fn pump_channel(mut channel: russh::Channel<client::Msg>) -> ShellStream {
    let (to_shell_tx, mut to_shell_rx) = mpsc::channel::<ShellInput>(256);
    let (from_shell_tx, from_shell_rx) = mpsc::channel::<Vec<u8>>(256);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(input) = to_shell_rx.recv() => {
                    let result = match input {
                        ShellInput::Data(data) => channel.data(&data[..]).await,
                        ShellInput::Resize { rows, cols } => channel.window_change(cols, rows, 0, 0).await,
                    };
                    if result.is_err() {
                        break;
                    }
                }
                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if from_shell_tx.send(data.to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                        Some(ChannelMsg::ExitStatus { .. }) => {
                            let _ = channel.eof().await;
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }
    });

    ShellStream { to_shell: to_shell_tx, from_shell: from_shell_rx }
}

/// Opens the `sftp` subsystem on a fresh channel, the natural extension of
/// the teacher's `russh` dependency this gateway otherwise has no use for.
pub async fn open_sftp(handle: &Handle<GatewayHandler>) -> Result<SftpSession, TransferError> {
    let channel = handle.channel_open_session().await?;
    channel.request_subsystem(true, "sftp").await?;
    SftpSession::new(channel.into_stream()).await.map_err(TransferError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_env_requires_allowlist_membership() {
        let env = vec![("PATH".to_string(), "/usr/bin".to_string())];
        assert!(filter_env(&env, &[]).is_empty());
        assert_eq!(filter_env(&env, &["PATH".to_string()]).len(), 1);
    }

    #[test]
    fn filter_env_rejects_bad_shape_names() {
        let env = vec![("1BAD".to_string(), "x".to_string())];
        assert!(filter_env(&env, &["1BAD".to_string()]).is_empty());
    }

    #[test]
    fn filter_env_rejects_shell_metacharacters_in_values() {
        let env = vec![("FOO".to_string(), "a; rm -rf /".to_string())];
        assert!(filter_env(&env, &["FOO".to_string()]).is_empty());
    }

    #[test]
    fn filter_env_allows_clean_values() {
        let env = vec![("FOO".to_string(), "bar-baz_123".to_string())];
        assert_eq!(filter_env(&env, &["FOO".to_string()]), vec![("FOO".to_string(), "bar-baz_123".to_string())]);
    }
}
