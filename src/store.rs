//! Session Store: an in-memory keyed collection of immutable session records,
//! mutated only through a pure, total reducer over a closed action set.
//!
//! Grounded on the teacher's `SessionRecorder` (`session/recording.rs`): an
//! `Arc<Mutex<_>>`-guarded append-only log driven by a closed `SessionEvent`
//! enum. The Session Store generalizes that shape from "append an event" to
//! "reduce into a new immutable snapshot, notify subscribers only on change".

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use log::{error, warn};

use crate::ids::{ConnectionId, SessionId};

pub const MIN_ROWS: u32 = 1;
pub const MAX_ROWS: u32 = 1000;
pub const MIN_COLS: u32 = 1;
pub const MAX_COLS: u32 = 1000;

const DEFAULT_MAX_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Pending,
    Authenticated,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRecord {
    pub status: AuthStatus,
    pub method: Option<String>,
    pub username: Option<String>,
    pub error: Option<String>,
    pub updated_at_ms: u128,
}

impl Default for AuthRecord {
    fn default() -> Self {
        Self {
            status: AuthStatus::Pending,
            method: None,
            username: None,
            error: None,
            updated_at_ms: now_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub status: ConnectionStatus,
    pub connection_id: Option<ConnectionId>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub last_activity_ms: u128,
    pub error: Option<String>,
}

impl Default for ConnectionRecord {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            connection_id: None,
            host: None,
            port: None,
            last_activity_ms: now_ms(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TerminalRecord {
    pub term: String,
    pub rows: u32,
    pub cols: u32,
    pub env: Vec<(String, String)>,
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    pub created_at_ms: u128,
    pub updated_at_ms: u128,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub user_id: Option<String>,
}

impl Default for MetadataRecord {
    fn default() -> Self {
        let now = now_ms();
        Self {
            created_at_ms: now,
            updated_at_ms: now,
            client_ip: None,
            user_agent: None,
            user_id: None,
        }
    }
}

/// Immutable per-session state snapshot (spec §3 "Session").
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionRecord {
    pub auth: AuthRecord,
    pub connection: ConnectionRecord,
    pub terminal: TerminalRecord,
    pub metadata: MetadataRecord,
}

/// Closed set of actions the reducer accepts (spec §4.1).
#[derive(Debug, Clone)]
pub enum SessionAction {
    AuthRequest { method: String },
    AuthSuccess { username: String, method: String },
    AuthFailure { error: String },
    Logout,
    ClearAuthError,
    ConnectionStart { host: String, port: u16 },
    ConnectionEstablished { connection_id: ConnectionId },
    ConnectionError { error: String },
    ConnectionClosed,
    ConnectionActivity,
    TerminalResize { rows: u32, cols: u32 },
    TerminalSetTerm { term: String },
    TerminalSetEnv { env: Vec<(String, String)> },
    TerminalSetCwd { cwd: String },
    MetadataUpdate { client_ip: Option<String>, user_agent: Option<String>, user_id: Option<String> },
    SessionReset,
    SessionEnd,
}

/// Pure, total reducer: `reduce(s, a) == reduce(s, a)` for any `(s, a)`.
pub fn reduce(state: &SessionRecord, action: &SessionAction) -> SessionRecord {
    let mut next = state.clone();
    let now = now_ms();
    match action {
        SessionAction::AuthRequest { method } => {
            next.auth.status = AuthStatus::Pending;
            next.auth.method = Some(method.clone());
            next.auth.error = None;
            next.auth.updated_at_ms = now;
        }
        SessionAction::AuthSuccess { username, method } => {
            next.auth.status = AuthStatus::Authenticated;
            next.auth.username = Some(username.clone());
            next.auth.method = Some(method.clone());
            next.auth.error = None;
            next.auth.updated_at_ms = now;
        }
        SessionAction::AuthFailure { error } => {
            next.auth.status = AuthStatus::Failed;
            next.auth.error = Some(error.clone());
            next.auth.updated_at_ms = now;
        }
        SessionAction::Logout => {
            // The reducer has no `logged-out` terminal state (spec §9 open
            // question); logout collapses back to `pending` by design.
            next.auth = AuthRecord {
                status: AuthStatus::Pending,
                method: None,
                username: None,
                error: None,
                updated_at_ms: now,
            };
            next.connection = ConnectionRecord::default();
        }
        SessionAction::ClearAuthError => {
            next.auth.error = None;
            next.auth.updated_at_ms = now;
        }
        SessionAction::ConnectionStart { host, port } => {
            next.connection.status = ConnectionStatus::Connecting;
            next.connection.host = Some(host.clone());
            next.connection.port = Some(*port);
            next.connection.error = None;
            next.connection.last_activity_ms = now;
        }
        SessionAction::ConnectionEstablished { connection_id } => {
            next.connection.status = ConnectionStatus::Connected;
            next.connection.connection_id = Some(*connection_id);
            next.connection.last_activity_ms = now;
        }
        SessionAction::ConnectionError { error } => {
            next.connection.status = ConnectionStatus::Error;
            next.connection.error = Some(error.clone());
            next.connection.last_activity_ms = now;
        }
        SessionAction::ConnectionClosed => {
            next.connection.status = ConnectionStatus::Closed;
            next.connection.connection_id = None;
            next.connection.last_activity_ms = now;
        }
        SessionAction::ConnectionActivity => {
            next.connection.last_activity_ms = now;
        }
        SessionAction::TerminalResize { rows, cols } => {
            next.terminal.rows = (*rows).clamp(MIN_ROWS, MAX_ROWS);
            next.terminal.cols = (*cols).clamp(MIN_COLS, MAX_COLS);
        }
        SessionAction::TerminalSetTerm { term } => {
            next.terminal.term = term.clone();
        }
        SessionAction::TerminalSetEnv { env } => {
            next.terminal.env = env.clone();
        }
        SessionAction::TerminalSetCwd { cwd } => {
            next.terminal.cwd = Some(cwd.clone());
        }
        SessionAction::MetadataUpdate { client_ip, user_agent, user_id } => {
            if client_ip.is_some() {
                next.metadata.client_ip = client_ip.clone();
            }
            if user_agent.is_some() {
                next.metadata.user_agent = user_agent.clone();
            }
            if user_id.is_some() {
                next.metadata.user_id = user_id.clone();
            }
            next.metadata.updated_at_ms = now;
        }
        SessionAction::SessionReset => {
            next = SessionRecord::default();
        }
        SessionAction::SessionEnd => {
            next.connection = ConnectionRecord {
                status: ConnectionStatus::Closed,
                ..ConnectionRecord::default()
            };
        }
    }
    next
}

type Subscriber = Arc<dyn Fn(&SessionRecord, &SessionRecord) + Send + Sync>;

/// Keyed collection of session records plus per-session subscribers and a
/// bounded action history, driven entirely by [`reduce`].
pub struct SessionStore {
    records: DashMap<SessionId, SessionRecord>,
    subscribers: DashMap<SessionId, Vec<Subscriber>>,
    history: DashMap<SessionId, VecDeque<SessionAction>>,
    max_history: usize,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_max_history(DEFAULT_MAX_HISTORY)
    }

    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            records: DashMap::new(),
            subscribers: DashMap::new(),
            history: DashMap::new(),
            max_history,
        }
    }

    /// Creates a fresh session record, returning the new id.
    pub fn create(&self) -> SessionId {
        let id = SessionId::new();
        self.records.insert(id, SessionRecord::default());
        id
    }

    pub fn get(&self, id: SessionId) -> Option<SessionRecord> {
        self.records.get(&id).map(|r| r.clone())
    }

    /// Applies `action` to the session's current record via [`reduce`].
    /// No-ops with a warning if the session does not exist.
    pub fn dispatch(&self, id: SessionId, action: SessionAction) {
        let Some(mut entry) = self.records.get_mut(&id) else {
            warn!("dispatch to nonexistent session {id}");
            return;
        };

        let old = entry.clone();
        let new = reduce(&old, &action);
        let changed = new != old;
        *entry = new.clone();
        drop(entry);

        self.push_history(id, action);

        if changed {
            self.notify(id, &old, &new);
        }
    }

    fn push_history(&self, id: SessionId, action: SessionAction) {
        let mut hist = self.history.entry(id).or_default();
        hist.push_back(action);
        while hist.len() > self.max_history {
            hist.pop_front();
        }
    }

    fn notify(&self, id: SessionId, old: &SessionRecord, new: &SessionRecord) {
        let Some(subs) = self.subscribers.get(&id) else {
            return;
        };
        for sub in subs.iter() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| sub(new, old)));
            if result.is_err() {
                error!("session {id} subscriber panicked; isolating");
            }
        }
    }

    /// Registers a subscriber invoked as `(newState, oldState)` on every
    /// effective (state-changing) dispatch for `id`.
    pub fn subscribe(
        &self,
        id: SessionId,
        callback: impl Fn(&SessionRecord, &SessionRecord) + Send + Sync + 'static,
    ) {
        self.subscribers.entry(id).or_default().push(Arc::new(callback));
    }

    pub fn history(&self, id: SessionId) -> Vec<SessionAction> {
        self.history.get(&id).map(|h| h.iter().cloned().collect()).unwrap_or_default()
    }

    /// Destroys a session and all of its subscribers/history.
    pub fn end(&self, id: SessionId) {
        self.records.remove(&id);
        self.subscribers.remove(&id);
        self.history.remove(&id);
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Despite the name, carries microsecond resolution: millisecond
/// granularity let two reduces inside the same test tick land on an
/// identical timestamp, masking a real field change from `PartialEq`.
fn now_ms() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_micros()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_to_nonexistent_session_is_a_noop() {
        let store = SessionStore::new();
        let id = SessionId::new();
        store.dispatch(id, SessionAction::AuthFailure { error: "nope".into() });
        assert!(store.get(id).is_none());
    }

    #[test]
    fn auth_success_requires_username() {
        let store = SessionStore::new();
        let id = store.create();
        store.dispatch(
            id,
            SessionAction::AuthSuccess { username: "alice".into(), method: "password".into() },
        );
        let record = store.get(id).expect("session");
        assert_eq!(record.auth.status, AuthStatus::Authenticated);
        assert_eq!(record.auth.username.as_deref(), Some("alice"));
    }

    #[test]
    fn reducer_is_pure() {
        let state = SessionRecord::default();
        let action = SessionAction::TerminalResize { rows: 24, cols: 80 };
        assert_eq!(reduce(&state, &action), reduce(&state, &action));
    }

    #[test]
    fn terminal_resize_clamps_to_bounds() {
        let state = SessionRecord::default();
        let next = reduce(&state, &SessionAction::TerminalResize { rows: 0, cols: 5000 });
        assert_eq!(next.terminal.rows, MIN_ROWS);
        assert_eq!(next.terminal.cols, MAX_COLS);
    }

    #[test]
    fn no_notification_on_identical_state() {
        let store = SessionStore::new();
        let id = store.create();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_clone = calls.clone();
        store.subscribe(id, move |_, _| {
            calls_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        store.dispatch(id, SessionAction::ConnectionActivity);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        // Resetting rows/cols to the same clamped value is a real change
        // here, but two resizes to the same value collapse to one notify.
        store.dispatch(id, SessionAction::TerminalResize { rows: 24, cols: 80 });
        store.dispatch(id, SessionAction::TerminalResize { rows: 24, cols: 80 });
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn logout_collapses_to_pending_not_logged_out() {
        let store = SessionStore::new();
        let id = store.create();
        store.dispatch(
            id,
            SessionAction::AuthSuccess { username: "bob".into(), method: "password".into() },
        );
        store.dispatch(id, SessionAction::Logout);
        let record = store.get(id).expect("session");
        assert_eq!(record.auth.status, AuthStatus::Pending);
        assert!(record.auth.username.is_none());
    }

    #[test]
    fn subscriber_panic_does_not_poison_other_subscribers() {
        let store = SessionStore::new();
        let id = store.create();
        store.subscribe(id, |_, _| panic!("boom"));
        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let called_clone = called.clone();
        store.subscribe(id, move |_, _| {
            called_clone.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        store.dispatch(id, SessionAction::ConnectionActivity);
        assert!(called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn bounded_history_evicts_oldest() {
        let store = SessionStore::with_max_history(2);
        let id = store.create();
        store.dispatch(id, SessionAction::ConnectionActivity);
        store.dispatch(id, SessionAction::ConnectionActivity);
        store.dispatch(id, SessionAction::ConnectionActivity);
        assert_eq!(store.history(id).len(), 2);
    }
}
