//! Host-Key Trust Store and Verifier (spec §4.7, §4.9).
//!
//! The teacher has no persistence layer — it has no host keys to trust.
//! A durable table keyed by `(host, port, algorithm)` with exact lookups
//! is a plain relational table, so this is backed by `rusqlite` (bundled
//! SQLite), the least-ceremony real crate for that in the pack.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use base64::Engine;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;

use crate::config::{HostKeyVerificationConfig, HostKeyVerificationMode, UnknownKeyAction};
use crate::error::HostKeyError;

/// Computes `"SHA256:" + base64(sha256(key_bytes))`, deterministic across
/// calls (spec §4.7).
pub fn fingerprint(key_bytes: &[u8]) -> String {
    let digest = Sha256::digest(key_bytes);
    format!("SHA256:{}", base64::engine::general_purpose::STANDARD.encode(digest))
}

#[derive(Debug, Clone)]
pub struct KnownHost {
    pub host: String,
    pub port: u16,
    pub algorithm: String,
    pub key: Vec<u8>,
    pub comment: Option<String>,
    pub added_at_ms: u64,
}

/// The persistent store backing the verifier's "server store" column.
pub struct TrustStore {
    conn: Mutex<Connection>,
}

impl TrustStore {
    pub fn open(path: &str) -> Result<Self, HostKeyError> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS known_hosts (
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                algorithm TEXT NOT NULL,
                key BLOB NOT NULL,
                comment TEXT,
                added_at_ms INTEGER NOT NULL,
                PRIMARY KEY (host, port, algorithm)
            )",
            [],
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn in_memory() -> Result<Self, HostKeyError> {
        let conn = Connection::open_in_memory()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS known_hosts (
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                algorithm TEXT NOT NULL,
                key BLOB NOT NULL,
                comment TEXT,
                added_at_ms INTEGER NOT NULL,
                PRIMARY KEY (host, port, algorithm)
            )",
            [],
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn lookup(&self, host: &str, port: u16, algorithm: &str) -> Result<Option<KnownHost>, HostKeyError> {
        let conn = self.conn.lock().expect("trust store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT host, port, algorithm, key, comment, added_at_ms FROM known_hosts
             WHERE host = ?1 AND port = ?2 AND algorithm = ?3",
        )?;
        let mut rows = stmt.query(rusqlite::params![host, port, algorithm])?;
        if let Some(row) = rows.next()? {
            Ok(Some(KnownHost {
                host: row.get(0)?,
                port: row.get(1)?,
                algorithm: row.get(2)?,
                key: row.get(3)?,
                comment: row.get(4)?,
                added_at_ms: row.get(5)?,
            }))
        } else {
            Ok(None)
        }
    }

    pub fn add_known_host(&self, host: &str, port: u16, algorithm: &str, key: &[u8], comment: Option<&str>, added_at_ms: u64) -> Result<(), HostKeyError> {
        let conn = self.conn.lock().expect("trust store lock poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO known_hosts (host, port, algorithm, key, comment, added_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![host, port, algorithm, key, comment, added_at_ms],
        )?;
        Ok(())
    }

    pub fn remove_host(&self, host: &str, port: u16, algorithm: &str) -> Result<bool, HostKeyError> {
        let conn = self.conn.lock().expect("trust store lock poisoned");
        let affected = conn.execute(
            "DELETE FROM known_hosts WHERE host = ?1 AND port = ?2 AND algorithm = ?3",
            rusqlite::params![host, port, algorithm],
        )?;
        Ok(affected > 0)
    }

    pub fn list_hosts(&self) -> Result<Vec<KnownHost>, HostKeyError> {
        let conn = self.conn.lock().expect("trust store lock poisoned");
        let mut stmt = conn.prepare("SELECT host, port, algorithm, key, comment, added_at_ms FROM known_hosts ORDER BY host, port, algorithm")?;
        let rows = stmt.query_map([], |row| {
            Ok(KnownHost {
                host: row.get(0)?,
                port: row.get(1)?,
                algorithm: row.get(2)?,
                key: row.get(3)?,
                comment: row.get(4)?,
                added_at_ms: row.get(5)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(HostKeyError::from)
    }
}

/// Outcome of a verification decision (spec §4.7's decision table),
/// carrying the client-facing event the Socket Adapter should emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    AcceptTrusted,
    AcceptAlert,
    AcceptPrompted,
    RejectMismatch { presented: String, stored: String },
    RejectPolicy,
    RejectPrompted,
    RejectTimeout,
}

/// A pending client prompt, correlated by `(host, port, algorithm)`.
struct PendingPrompt {
    responder: oneshot::Sender<bool>,
}

/// Implements §4.7's decision table: looks up the trust store, and for
/// unknown keys either applies `unknownKeyAction` or awaits a client
/// response via a correlation-keyed prompt channel.
pub struct Verifier {
    store: TrustStore,
    config: HostKeyVerificationConfig,
    pending: Mutex<HashMap<(String, u16, String), PendingPrompt>>,
}

/// What the caller (the Socket Adapter) must do as a result of a
/// verification call: possibly emit a client event, and wait on a prompt
/// future if one was registered.
#[derive(Debug)]
pub enum VerifyAction {
    Decided(VerifyOutcome),
    AwaitClient { prompt_id: (String, u16, String) },
}

impl Verifier {
    pub fn new(store: TrustStore, config: HostKeyVerificationConfig) -> Self {
        Self { store, config, pending: Mutex::new(HashMap::new()) }
    }

    /// Runs the §4.7 decision table against the current trust-store state
    /// for a presented key. When verification is disabled globally,
    /// returns `AcceptTrusted` without any store lookup or emission.
    pub fn decide(&self, host: &str, port: u16, algorithm: &str, presented_key: &[u8]) -> Result<VerifyAction, HostKeyError> {
        if !self.config.enabled {
            return Ok(VerifyAction::Decided(VerifyOutcome::AcceptTrusted));
        }
        let presented_fp = fingerprint(presented_key);
        match self.store.lookup(host, port, algorithm)? {
            Some(known) if known.key == presented_key => Ok(VerifyAction::Decided(VerifyOutcome::AcceptTrusted)),
            Some(known) => Ok(VerifyAction::Decided(VerifyOutcome::RejectMismatch { presented: presented_fp, stored: fingerprint(&known.key) })),
            None => self.decide_unknown(host, port, algorithm),
        }
    }

    fn decide_unknown(&self, host: &str, port: u16, algorithm: &str) -> Result<VerifyAction, HostKeyError> {
        match self.config.mode {
            HostKeyVerificationMode::ClientOnly | HostKeyVerificationMode::Hybrid => {
                let key = (host.to_string(), port, algorithm.to_string());
                Ok(VerifyAction::AwaitClient { prompt_id: key })
            }
            HostKeyVerificationMode::ServerOnly => match self.config.unknown_key_action {
                UnknownKeyAction::Reject => Ok(VerifyAction::Decided(VerifyOutcome::RejectPolicy)),
                UnknownKeyAction::Alert => Ok(VerifyAction::Decided(VerifyOutcome::AcceptAlert)),
                UnknownKeyAction::Prompt => {
                    let key = (host.to_string(), port, algorithm.to_string());
                    Ok(VerifyAction::AwaitClient { prompt_id: key })
                }
            },
        }
    }

    /// Registers a oneshot for `prompt_id` and returns the receiving half;
    /// the Socket Adapter awaits it with the configured timeout.
    pub fn register_prompt(&self, prompt_id: (String, u16, String)) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("verifier lock poisoned").insert(prompt_id, PendingPrompt { responder: tx });
        rx
    }

    /// Resolves a pending prompt from a client's `hostkey-verify-response`.
    /// A missing prompt id (already timed out, or never registered) is a
    /// silent no-op.
    pub fn respond(&self, prompt_id: &(String, u16, String), accept: bool) {
        if let Some(pending) = self.pending.lock().expect("verifier lock poisoned").remove(prompt_id) {
            let _ = pending.responder.send(accept);
        }
    }

    pub fn prompt_timeout(&self) -> Duration {
        self.config.prompt_timeout
    }

    /// Removes the listener for `prompt_id` regardless of outcome — the
    /// spec requires cleanup on both success and timeout.
    pub fn clear_prompt(&self, prompt_id: &(String, u16, String)) {
        self.pending.lock().expect("verifier lock poisoned").remove(prompt_id);
    }

    pub fn trust(&self, host: &str, port: u16, algorithm: &str, key: &[u8], added_at_ms: u64) -> Result<(), HostKeyError> {
        self.store.add_known_host(host, port, algorithm, key, None, added_at_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: HostKeyVerificationMode, unknown_key_action: UnknownKeyAction) -> HostKeyVerificationConfig {
        HostKeyVerificationConfig { enabled: true, mode, unknown_key_action, trust_store_path: ":memory:".into(), prompt_timeout: Duration::from_secs(5) }
    }

    #[test]
    fn fingerprint_is_deterministic() {
        assert_eq!(fingerprint(b"some-key-bytes"), fingerprint(b"some-key-bytes"));
        assert_ne!(fingerprint(b"a"), fingerprint(b"b"));
    }

    #[test]
    fn trusted_exact_match_accepts() {
        let store = TrustStore::in_memory().expect("open");
        store.add_known_host("h", 22, "ssh-ed25519", b"key-a", None, 0).expect("insert");
        let verifier = Verifier::new(store, config(HostKeyVerificationMode::Hybrid, UnknownKeyAction::Prompt));
        let action = verifier.decide("h", 22, "ssh-ed25519", b"key-a").expect("decide");
        assert!(matches!(action, VerifyAction::Decided(VerifyOutcome::AcceptTrusted)));
    }

    #[test]
    fn mismatch_is_rejected_with_fingerprints() {
        let store = TrustStore::in_memory().expect("open");
        store.add_known_host("h", 22, "ssh-ed25519", b"key-a", None, 0).expect("insert");
        let verifier = Verifier::new(store, config(HostKeyVerificationMode::Hybrid, UnknownKeyAction::Prompt));
        let action = verifier.decide("h", 22, "ssh-ed25519", b"key-b").expect("decide");
        match action {
            VerifyAction::Decided(VerifyOutcome::RejectMismatch { presented, stored }) => {
                assert_ne!(presented, stored);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn unknown_with_server_only_reject_policy_rejects() {
        let store = TrustStore::in_memory().expect("open");
        let verifier = Verifier::new(store, config(HostKeyVerificationMode::ServerOnly, UnknownKeyAction::Reject));
        let action = verifier.decide("h", 22, "ssh-ed25519", b"key-a").expect("decide");
        assert!(matches!(action, VerifyAction::Decided(VerifyOutcome::RejectPolicy)));
    }

    #[test]
    fn unknown_with_server_only_alert_accepts() {
        let store = TrustStore::in_memory().expect("open");
        let verifier = Verifier::new(store, config(HostKeyVerificationMode::ServerOnly, UnknownKeyAction::Alert));
        let action = verifier.decide("h", 22, "ssh-ed25519", b"key-a").expect("decide");
        assert!(matches!(action, VerifyAction::Decided(VerifyOutcome::AcceptAlert)));
    }

    #[test]
    fn unknown_with_hybrid_mode_awaits_client() {
        let store = TrustStore::in_memory().expect("open");
        let verifier = Verifier::new(store, config(HostKeyVerificationMode::Hybrid, UnknownKeyAction::Reject));
        let action = verifier.decide("h", 22, "ssh-ed25519", b"key-a").expect("decide");
        assert!(matches!(action, VerifyAction::AwaitClient { .. }));
    }

    #[test]
    fn disabled_globally_accepts_without_lookup() {
        let store = TrustStore::in_memory().expect("open");
        let mut cfg = config(HostKeyVerificationMode::Hybrid, UnknownKeyAction::Reject);
        cfg.enabled = false;
        let verifier = Verifier::new(store, cfg);
        let action = verifier.decide("h", 22, "ssh-ed25519", b"key-a").expect("decide");
        assert!(matches!(action, VerifyAction::Decided(VerifyOutcome::AcceptTrusted)));
    }

    #[tokio::test]
    async fn prompt_respond_resolves_the_receiver() {
        let store = TrustStore::in_memory().expect("open");
        let verifier = Verifier::new(store, config(HostKeyVerificationMode::Hybrid, UnknownKeyAction::Prompt));
        let id = ("h".to_string(), 22u16, "ssh-ed25519".to_string());
        let rx = verifier.register_prompt(id.clone());
        verifier.respond(&id, true);
        assert!(rx.await.expect("resolved"));
    }

    #[tokio::test]
    async fn respond_to_unknown_prompt_is_a_noop() {
        let store = TrustStore::in_memory().expect("open");
        let verifier = Verifier::new(store, config(HostKeyVerificationMode::Hybrid, UnknownKeyAction::Prompt));
        verifier.respond(&("nope".to_string(), 1u16, "x".to_string()), true);
    }

    #[test]
    fn list_and_remove_host_round_trip() {
        let store = TrustStore::in_memory().expect("open");
        store.add_known_host("h", 22, "ssh-ed25519", b"key-a", Some("office router"), 100).expect("insert");
        assert_eq!(store.list_hosts().expect("list").len(), 1);
        assert!(store.remove_host("h", 22, "ssh-ed25519").expect("remove"));
        assert!(store.list_hosts().expect("list").is_empty());
    }
}
