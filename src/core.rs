//! Core Orchestrator: wires every component behind one explicit service
//! container and owns process lifecycle (spec §2 component 10, §9).
//!
//! The teacher keeps its connection manager behind a `Lazy<SshConnectionManager>`
//! static (process-wide hidden global). Spec §9 calls that out directly:
//! "rewrite as an explicit *Core* value carrying handles to all long-lived
//! singletons; its creation happens at startup and teardown releases them."
//! `Core` is that value — every other module's constructor stays a plain
//! function, and this is the one place that calls them all.

use std::sync::Arc;

use dashmap::DashMap;
use log::info;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::hostkey::{TrustStore, Verifier};
use crate::pool::ConnectionPool;
use crate::socket::SocketAdapter;
use crate::ssh::SshConnectionFactory;
use crate::store::SessionStore;
use crate::transfer::TransferManager;

/// Owns every long-lived singleton the gateway needs: the Session Store,
/// Connection Pool, Transfer Manager, and Host-Key Verifier. Built once at
/// startup, torn down once at shutdown; nothing here is a `static`.
pub struct Core {
    pub config: GatewayConfig,
    pub store: Arc<SessionStore>,
    pub pool: Arc<ConnectionPool<SshConnectionFactory>>,
    pub transfers: Arc<TransferManager>,
    pub verifier: Arc<Verifier>,
    pub host_key_events: crate::ssh::HostKeyEventRegistry,
}

impl Core {
    /// Builds every singleton from `config`. Opens the host-key trust store
    /// at `config.host_key.trust_store_path` — the only I/O this does.
    pub fn new(config: GatewayConfig) -> Result<Arc<Self>, GatewayError> {
        let trust_store = TrustStore::open(&config.host_key.trust_store_path)?;
        let verifier = Arc::new(Verifier::new(trust_store, config.host_key.clone()));

        let preferred = config.security_level.preferred();
        let event_registry: crate::ssh::HostKeyEventRegistry = Arc::new(DashMap::new());
        let factory = SshConnectionFactory {
            verifier: verifier.clone(),
            dial_config: config.dial.clone(),
            preferred,
            event_registry: event_registry.clone(),
        };
        let pool = ConnectionPool::new(factory, config.pool.clone());
        let transfers = Arc::new(TransferManager::new(config.sftp.max_concurrent_transfers, config.sftp.chunk_rate_limit_bytes_per_sec));
        let store = Arc::new(SessionStore::with_max_history(config.session.max_history_size));

        Ok(Arc::new(Self { config, store, pool, transfers, verifier, host_key_events: event_registry }))
    }

    /// Starts background lifecycle tasks (currently: the pool's idle sweep).
    /// Call once after construction.
    pub fn start(self: &Arc<Self>) {
        self.pool.start_sweep();
        info!("core: started on {}:{}", self.config.listen_addr, self.config.listen_port);
    }

    /// Builds a [`SocketAdapter`] sharing this `Core`'s singletons, one per
    /// accepted WebSocket connection.
    pub fn adapter(self: &Arc<Self>) -> SocketAdapter {
        SocketAdapter::new(
            self.store.clone(),
            self.pool.clone(),
            self.transfers.clone(),
            self.verifier.clone(),
            self.host_key_events.clone(),
            self.config.clone(),
        )
    }

    /// Releases every pooled connection and stops background tasks (spec
    /// §2/§5: "graceful shutdown stops cleanup timers ... releases every
    /// pooled connection").
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        info!("core: shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.host_key.trust_store_path = ":memory:".to_string();
        config
    }

    #[tokio::test]
    async fn core_builds_and_shuts_down_cleanly() {
        let core = Core::new(test_config()).expect("core builds");
        core.start();
        assert_eq!(core.pool.stats().total, 0);
        core.shutdown().await;
    }

    #[tokio::test]
    async fn adapter_shares_the_same_singletons() {
        let core = Core::new(test_config()).expect("core builds");
        let session_id = core.store.create();
        let adapter = core.adapter();
        let _ = adapter;
        assert!(core.store.get(session_id).is_some());
    }
}
