//! Connection Pool: forward map of pooled SSH connections plus a reverse
//! map from owning session to current connection (spec §4.2).
//!
//! The teacher pools connections in a `moka::future::Cache` keyed by
//! `user@host:port` (`session/manager.rs`). Moka's cache-wide
//! `time_to_idle` cannot express a per-entry idle timer, the forward and
//! reverse map invariant the spec requires, or running a factory's
//! `destroy` hook before an entry disappears, so this pool is hand-rolled
//! on `dashmap::DashMap` instead, keeping the teacher's shape (cache keyed
//! by identity, guarded acquire/release, background cleanup).

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{AuthMethodName, PoolConfig};
use crate::error::PoolError;
use crate::ids::{ConnectionId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Active,
    Closing,
    Closed,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionMetrics {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub session_id: SessionId,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub auth_method: AuthMethodName,
}

/// A factory that dials and tears down native connection handles. The
/// pool is generic over `Handle` so it can hold SSH connections in
/// production and a fake handle in tests.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    type Handle: Send + Sync;

    async fn connect(&self, params: &ConnectParams) -> Result<Self::Handle, PoolError>;
    async fn destroy(&self, handle: Self::Handle);
}

struct PoolEntry<H> {
    session_id: SessionId,
    status: ConnectionStatus,
    last_activity_tx: watch::Sender<Instant>,
    last_activity_rx: watch::Receiver<Instant>,
    metrics: ConnectionMetrics,
    handle: Arc<H>,
}

#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
}

/// Connection Pool over a single connection-handle type `H`, supplied by a
/// [`ConnectionFactory`].
pub struct ConnectionPool<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    forward: DashMap<ConnectionId, PoolEntry<F::Handle>>,
    reverse: DashMap<SessionId, ConnectionId>,
    sweep_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<F: ConnectionFactory + 'static> ConnectionPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            factory,
            config,
            forward: DashMap::new(),
            reverse: DashMap::new(),
            sweep_task: std::sync::Mutex::new(None),
        })
    }

    /// Starts the periodic idle sweep. Idempotent; a second call is a no-op.
    pub fn start_sweep(self: &Arc<Self>) {
        let mut guard = self.sweep_task.lock().expect("sweep task lock poisoned");
        if guard.is_some() {
            return;
        }
        let pool = self.clone();
        let interval = self.config.cleanup_interval;
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                pool.sweep_idle().await;
            }
        }));
    }

    async fn sweep_idle(&self) {
        let idle_timeout = self.config.idle_timeout;
        let now = Instant::now();
        let stale: Vec<ConnectionId> = self
            .forward
            .iter()
            .filter(|e| {
                e.status == ConnectionStatus::Active
                    && now.duration_since(*e.last_activity_rx.borrow()) >= idle_timeout
            })
            .map(|e| *e.key())
            .collect();
        for id in &stale {
            if let Some(mut entry) = self.forward.get_mut(id) {
                entry.status = ConnectionStatus::Idle;
            }
        }
        let expired: Vec<ConnectionId> = self
            .forward
            .iter()
            .filter(|e| {
                e.status == ConnectionStatus::Idle
                    && now.duration_since(*e.last_activity_rx.borrow()) >= idle_timeout
            })
            .map(|e| *e.key())
            .collect();
        for id in expired {
            self.release(id).await;
        }
    }

    /// `acquire` policy per spec §4.2: reuse an active mapping, clean up a
    /// stale one, sweep-then-fail on capacity, else dial and arm activity.
    pub async fn acquire(&self, params: ConnectParams) -> Result<ConnectionId, PoolError> {
        if let Some(existing) = self.reverse.get(&params.session_id).map(|r| *r) {
            if let Some(entry) = self.forward.get(&existing) {
                if entry.status == ConnectionStatus::Active {
                    let _ = entry.last_activity_tx.send(Instant::now());
                    return Ok(existing);
                }
            }
            drop(self.forward.get(&existing));
            self.release(existing).await;
        }

        if self.forward.len() >= self.config.max_connections {
            self.sweep_idle().await;
            if self.forward.len() >= self.config.max_connections {
                return Err(PoolError::PoolExhausted(self.forward.len()));
            }
        }

        let handle = self.factory.connect(&params).await?;
        let connection_id = ConnectionId::new();
        let (tx, rx) = watch::channel(Instant::now());
        self.forward.insert(
            connection_id,
            PoolEntry {
                session_id: params.session_id,
                status: ConnectionStatus::Active,
                last_activity_tx: tx,
                last_activity_rx: rx,
                metrics: ConnectionMetrics::default(),
                handle: Arc::new(handle),
            },
        );
        self.reverse.insert(params.session_id, connection_id);
        debug!("pool: acquired connection {connection_id} for session {}", params.session_id);
        Ok(connection_id)
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<Arc<F::Handle>> {
        self.forward.get(&connection_id).map(|e| e.handle.clone())
    }

    pub fn update_activity(&self, connection_id: ConnectionId) {
        if let Some(entry) = self.forward.get(&connection_id) {
            let _ = entry.last_activity_tx.send(Instant::now());
        }
    }

    pub fn update_metrics(&self, connection_id: ConnectionId, bytes_sent: u64, bytes_received: u64) {
        if let Some(mut entry) = self.forward.get_mut(&connection_id) {
            entry.metrics.bytes_sent += bytes_sent;
            entry.metrics.bytes_received += bytes_received;
        }
    }

    /// Tears down a connection, calling the factory's `destroy` and
    /// dropping both forward and reverse mappings.
    pub async fn release(&self, connection_id: ConnectionId) {
        let Some((_, mut entry)) = self.forward.remove(&connection_id) else {
            return;
        };
        entry.status = ConnectionStatus::Closing;
        self.reverse.remove_if(&entry.session_id, |_, v| *v == connection_id);
        let handle = match Arc::try_unwrap(entry.handle) {
            Ok(h) => Some(h),
            Err(_) => {
                warn!("pool: connection {connection_id} destroyed with outstanding handle refs");
                None
            }
        };
        if let Some(handle) = handle {
            self.factory.destroy(handle).await;
        }
    }

    pub async fn release_session(&self, session_id: SessionId) {
        if let Some((_, connection_id)) = self.reverse.remove(&session_id) {
            self.release(connection_id).await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats { total: self.forward.len(), ..Default::default() };
        for entry in self.forward.iter() {
            match entry.status {
                ConnectionStatus::Active => stats.active += 1,
                ConnectionStatus::Idle => stats.idle += 1,
                _ => {}
            }
        }
        stats
    }

    /// Stops the sweep timer and releases every connection in parallel.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweep_task.lock().expect("sweep task lock poisoned").take() {
            handle.abort();
        }
        let ids: Vec<ConnectionId> = self.forward.iter().map(|e| *e.key()).collect();
        let releases = ids.into_iter().map(|id| self.release(id));
        futures_release_all(releases).await;
    }

    /// Invariant check used by tests: forward and reverse maps agree.
    #[cfg(test)]
    fn invariant_holds(&self) -> bool {
        let mut by_session: std::collections::HashMap<SessionId, ConnectionId> = std::collections::HashMap::new();
        for entry in self.forward.iter() {
            by_session.insert(entry.session_id, *entry.key());
        }
        if self.reverse.len() != by_session.len() {
            return false;
        }
        self.reverse.iter().all(|r| by_session.get(r.key()) == Some(r.value()))
    }
}

async fn futures_release_all(iter: impl IntoIterator<Item = impl std::future::Future<Output = ()>>) {
    let futures: Vec<_> = iter.into_iter().collect();
    for f in futures {
        f.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeFactory {
        destroyed: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl ConnectionFactory for FakeFactory {
        type Handle = u32;

        async fn connect(&self, _params: &ConnectParams) -> Result<Self::Handle, PoolError> {
            if self.fail {
                return Err(PoolError::PoolExhausted(0));
            }
            Ok(42)
        }

        async fn destroy(&self, _handle: Self::Handle) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn params(session_id: SessionId) -> ConnectParams {
        ConnectParams { session_id, host: "h".into(), port: 22, username: "u".into(), password: "p".into(), auth_method: AuthMethodName::Password }
    }

    #[tokio::test]
    async fn acquire_then_get_returns_same_handle_until_release() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let pool = ConnectionPool::new(FakeFactory { destroyed: destroyed.clone(), fail: false }, PoolConfig::default());
        let session = SessionId::new();
        let cid = pool.acquire(params(session)).await.expect("acquire");
        assert_eq!(*pool.get(cid).expect("handle"), 42);
        pool.release(cid).await;
        assert!(pool.get(cid).is_none());
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn acquire_reuses_active_mapping_for_same_session() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let pool = ConnectionPool::new(FakeFactory { destroyed, fail: false }, PoolConfig::default());
        let session = SessionId::new();
        let first = pool.acquire(params(session)).await.expect("acquire");
        let second = pool.acquire(params(session)).await.expect("acquire again");
        assert_eq!(first, second);
        assert!(pool.invariant_holds());
    }

    #[tokio::test]
    async fn pool_exhausted_when_at_capacity() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let mut config = PoolConfig::default();
        config.max_connections = 1;
        let pool = ConnectionPool::new(FakeFactory { destroyed, fail: false }, config);
        pool.acquire(params(SessionId::new())).await.expect("first acquire");
        let err = pool.acquire(params(SessionId::new())).await.expect_err("should be exhausted");
        assert!(matches!(err, PoolError::PoolExhausted(_)));
    }

    #[tokio::test]
    async fn shutdown_drains_all_connections() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let pool = ConnectionPool::new(FakeFactory { destroyed: destroyed.clone(), fail: false }, PoolConfig::default());
        pool.acquire(params(SessionId::new())).await.expect("acquire 1");
        pool.acquire(params(SessionId::new())).await.expect("acquire 2");
        pool.shutdown().await;
        assert_eq!(pool.stats().total, 0);
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
    }
}
