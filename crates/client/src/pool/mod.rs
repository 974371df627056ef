//! Connection pool keyed by server endpoint and database.
//!
//! Each key gets a semaphore sized to `max_connections`. A permit is held by
//! every checked-out entry and every in-flight connect, so the number of
//! in-use plus connecting entries never exceeds the bound. Idle entries hold
//! no permit. The per-key entry table sits behind a short synchronous lock
//! that is never held across an await.

mod breaker;
mod factory;
mod retry;

pub use breaker::{CircuitBreaker, CircuitState};
pub use factory::{ConnectionFactory, DefaultConnectionFactory};
pub use retry::RetryPolicy;

#[cfg(test)]
pub use factory::MockConnectionFactory;

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use spacelink_domain::{PoolKey, ServerConfig};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::ClientError;
use crate::settings::PoolSettings;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn disconnect_in_background(connections: Vec<Arc<Connection>>) {
    if connections.is_empty() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                for connection in connections {
                    connection.disconnect().await;
                }
            });
        }
        // Outside a runtime the session tasks are already gone; dropping the
        // handles closes the sockets.
        Err(_) => drop(connections),
    }
}

// ============================================================================
// Entries
// ============================================================================

#[derive(Debug)]
struct PoolEntry {
    id: Uuid,
    connection: Arc<Connection>,
    in_use: bool,
    last_health_check: Instant,
    consecutive_failures: u32,
}

impl PoolEntry {
    fn new(connection: Arc<Connection>) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection,
            in_use: true,
            last_health_check: Instant::now(),
            consecutive_failures: 0,
        }
    }
}

#[derive(Debug)]
struct KeyState {
    entries: Vec<PoolEntry>,
    breaker: CircuitBreaker,
}

impl KeyState {
    /// Probe every entry and drop idle ones that are no longer healthy.
    /// Checked-out entries only have their failure count bumped; they are
    /// evicted on release.
    fn evict_unhealthy_idle(&mut self) -> Vec<Arc<Connection>> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        self.entries.retain_mut(|entry| {
            entry.last_health_check = now;
            if entry.connection.is_healthy() {
                entry.consecutive_failures = 0;
                return true;
            }
            entry.consecutive_failures += 1;
            if entry.in_use {
                return true;
            }
            evicted.push(Arc::clone(&entry.connection));
            false
        });
        evicted
    }

    fn idle(&self) -> usize {
        self.entries.iter().filter(|e| !e.in_use).count()
    }
}

#[derive(Debug, Default)]
struct KeyCounters {
    created: AtomicU64,
    failed: AtomicU64,
    evicted: AtomicU64,
}

#[derive(Debug)]
struct KeyPool {
    key: PoolKey,
    config: ServerConfig,
    state: Mutex<KeyState>,
    permits: Arc<Semaphore>,
    counters: KeyCounters,
}

impl KeyPool {
    fn evict(&self, connections: Vec<Arc<Connection>>) {
        if !connections.is_empty() {
            self.counters
                .evicted
                .fetch_add(connections.len() as u64, Ordering::Relaxed);
            tracing::info!(key = %self.key, evicted = connections.len(), "Evicting pooled connections");
        }
        disconnect_in_background(connections);
    }

    /// Mark a reusable idle entry as checked out.
    fn checkout_idle(&self) -> Option<(Uuid, Arc<Connection>)> {
        let (evicted, found) = {
            let mut state = lock(&self.state);
            let evicted = state.evict_unhealthy_idle();
            let found = state.entries.iter_mut().find(|e| !e.in_use).map(|entry| {
                entry.in_use = true;
                (entry.id, Arc::clone(&entry.connection))
            });
            (evicted, found)
        };
        self.evict(evicted);
        found
    }

    /// One connect attempt behind the breaker.
    async fn connect_once(&self, factory: &dyn ConnectionFactory) -> Result<Arc<Connection>, ClientError> {
        lock(&self.state)
            .breaker
            .allow_request()
            .map_err(|retry_after| ClientError::CircuitOpen {
                key: self.key.to_string(),
                retry_after,
            })?;

        match factory.connect(&self.config).await {
            Ok(connection) => {
                lock(&self.state).breaker.record_success();
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                Ok(connection)
            }
            Err(e) => {
                lock(&self.state).breaker.record_failure();
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn insert(&self, connection: Arc<Connection>, in_use: bool) -> Uuid {
        let mut entry = PoolEntry::new(connection);
        entry.in_use = in_use;
        let id = entry.id;
        lock(&self.state).entries.push(entry);
        id
    }

    /// Return a checked-out entry, evicting it if it can't be reused.
    fn release(&self, entry_id: Uuid, failed: bool, pool_closed: bool) {
        let removed = {
            let mut state = lock(&self.state);
            let Some(index) = state.entries.iter().position(|e| e.id == entry_id) else {
                return;
            };
            let healthy = state.entries[index].connection.is_healthy();
            if failed {
                state.breaker.record_failure();
            }
            if failed || !healthy || pool_closed {
                Some(state.entries.swap_remove(index).connection)
            } else {
                state.entries[index].in_use = false;
                None
            }
        };
        if let Some(connection) = removed {
            tracing::debug!(key = %self.key, connection_id = %connection.id(), failed, "Dropping released connection");
            if failed {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            self.evict(vec![connection]);
        }
    }

    fn metrics(&self) -> KeyMetrics {
        let state = lock(&self.state);
        let active = state.entries.iter().filter(|e| e.in_use).count();
        let healthy = state
            .entries
            .iter()
            .filter(|e| e.connection.is_healthy())
            .count();
        let entries = state
            .entries
            .iter()
            .map(|e| EntryMetrics {
                connection_id: e.connection.id().to_string(),
                in_use: e.in_use,
                healthy: e.connection.is_healthy(),
                since_health_check_ms: e.last_health_check.elapsed().as_millis() as u64,
                consecutive_failures: e.consecutive_failures,
            })
            .collect();
        KeyMetrics {
            key: self.key.to_string(),
            total: state.entries.len(),
            active,
            idle: state.idle(),
            healthy,
            created: self.counters.created.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            circuit: state.breaker.state(),
            consecutive_failures: state.breaker.consecutive_failures(),
            entries,
        }
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct EntryMetrics {
    pub connection_id: String,
    pub in_use: bool,
    pub healthy: bool,
    pub since_health_check_ms: u64,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyMetrics {
    pub key: String,
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub healthy: usize,
    pub created: u64,
    pub failed: u64,
    pub evicted: u64,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    pub entries: Vec<EntryMetrics>,
}

impl KeyMetrics {
    pub fn is_healthy(&self) -> bool {
        self.circuit == CircuitState::Closed && self.healthy == self.total
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolMetrics {
    pub keys: Vec<KeyMetrics>,
}

impl PoolMetrics {
    pub fn key(&self, key: &PoolKey) -> Option<&KeyMetrics> {
        let key = key.to_string();
        self.keys.iter().find(|m| m.key == key)
    }

    pub fn total(&self) -> usize {
        self.keys.iter().map(|m| m.total).sum()
    }

    pub fn active(&self) -> usize {
        self.keys.iter().map(|m| m.active).sum()
    }

    pub fn failed(&self) -> u64 {
        self.keys.iter().map(|m| m.failed).sum()
    }
}

// ============================================================================
// Checked-out handle
// ============================================================================

/// A checked-out connection. Dropping it returns the entry to the pool,
/// whether the caller finished, bailed out with `?` or panicked.
pub struct PooledConnection {
    connection: Arc<Connection>,
    entry_id: Uuid,
    pool: Arc<KeyPool>,
    inner: Arc<PoolInner>,
    failed: bool,
    // Released after the entry is marked idle
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn key(&self) -> &PoolKey {
        &self.pool.key
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Evict this connection on release and count a failure against its key.
    pub fn report_failure(&mut self) {
        self.failed = true;
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("key", &self.pool.key)
            .field("connection", &self.connection.id())
            .field("failed", &self.failed)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let closed = self.inner.closed.load(Ordering::Acquire);
        self.pool.release(self.entry_id, self.failed, closed);
    }
}

// ============================================================================
// Pool
// ============================================================================

struct PoolInner {
    settings: PoolSettings,
    factory: Arc<dyn ConnectionFactory>,
    retry: RetryPolicy,
    pools: DashMap<PoolKey, Arc<KeyPool>>,
    health_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("keys", &self.inner.pools.len())
            .field("max_connections", &self.inner.settings.max_connections)
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    pub fn new(settings: PoolSettings, factory: Arc<dyn ConnectionFactory>) -> Result<Self, ClientError> {
        settings.validate().map_err(ClientError::Configuration)?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                retry: RetryPolicy::new(settings.retry.clone()),
                settings,
                factory,
                pools: DashMap::new(),
                health_task: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Register a server; registering the same key again keeps the existing
    /// bucket and its connections.
    pub fn register(&self, config: ServerConfig) -> Result<PoolKey, ClientError> {
        config.validate()?;
        let key = config.pool_key();
        self.inner.pools.entry(key.clone()).or_insert_with(|| {
            tracing::info!(key = %key, url = %config.url(), "Registered pool key");
            Arc::new(KeyPool {
                key: key.clone(),
                permits: Arc::new(Semaphore::new(self.inner.settings.max_connections)),
                state: Mutex::new(KeyState {
                    entries: Vec::new(),
                    breaker: CircuitBreaker::new(&self.inner.settings.breaker),
                }),
                counters: KeyCounters::default(),
                config,
            })
        });
        Ok(key)
    }

    pub fn keys(&self) -> Vec<PoolKey> {
        self.inner.pools.iter().map(|e| e.key().clone()).collect()
    }

    fn key_pool(&self, key: &PoolKey) -> Result<Arc<KeyPool>, ClientError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ClientError::NotConnected);
        }
        self.inner
            .pools
            .get(key)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| ClientError::configuration(format!("no server registered for {key}")))
    }

    /// Check out a healthy connection, waiting up to the configured acquire
    /// timeout.
    pub async fn acquire(&self, key: &PoolKey) -> Result<PooledConnection, ClientError> {
        self.acquire_with_timeout(key, self.inner.settings.acquire_timeout())
            .await
    }

    /// Check out a healthy connection. On timeout nothing is left behind: a
    /// connect in flight is dropped and its socket closed.
    pub async fn acquire_with_timeout(
        &self,
        key: &PoolKey,
        timeout: Duration,
    ) -> Result<PooledConnection, ClientError> {
        let pool = self.key_pool(key)?;
        let started = Instant::now();
        let result = tokio::time::timeout(timeout, self.checkout(pool)).await;
        match result {
            Ok(Ok(handle)) => {
                tracing::debug!(
                    key = %key,
                    connection_id = %handle.connection.id(),
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Acquired connection"
                );
                Ok(handle)
            }
            Ok(Err(e)) => {
                tracing::warn!(key = %key, error = %e, "Acquire failed");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(key = %key, timeout_ms = timeout.as_millis() as u64, "Acquire timed out");
                Err(ClientError::timeout("acquire", timeout))
            }
        }
    }

    async fn checkout(&self, pool: Arc<KeyPool>) -> Result<PooledConnection, ClientError> {
        let permit = Arc::clone(&pool.permits)
            .acquire_owned()
            .await
            .map_err(|_| ClientError::NotConnected)?;

        if let Some((entry_id, connection)) = pool.checkout_idle() {
            return Ok(self.handle(pool, entry_id, connection, permit));
        }

        let factory = Arc::clone(&self.inner.factory);
        let connection = self
            .inner
            .retry
            .run("connect", |attempt| {
                let pool = Arc::clone(&pool);
                let factory = Arc::clone(&factory);
                async move {
                    tracing::debug!(key = %pool.key, attempt, "Opening pooled connection");
                    pool.connect_once(factory.as_ref()).await
                }
            })
            .await?;

        if self.inner.closed.load(Ordering::Acquire) {
            disconnect_in_background(vec![connection]);
            return Err(ClientError::NotConnected);
        }

        tracing::info!(key = %pool.key, connection_id = %connection.id(), "Opened pooled connection");
        let entry_id = pool.insert(Arc::clone(&connection), true);
        Ok(self.handle(pool, entry_id, connection, permit))
    }

    fn handle(
        &self,
        pool: Arc<KeyPool>,
        entry_id: Uuid,
        connection: Arc<Connection>,
        permit: OwnedSemaphorePermit,
    ) -> PooledConnection {
        PooledConnection {
            connection,
            entry_id,
            pool,
            inner: Arc::clone(&self.inner),
            failed: false,
            _permit: permit,
        }
    }

    /// Open idle connections until `key` has `min_connections` entries.
    /// Only uses free slots; never waits for checked-out entries.
    ///
    /// Returns the number of connections opened.
    pub async fn warm_up(&self, key: &PoolKey) -> Result<usize, ClientError> {
        let pool = self.key_pool(key)?;
        let min = self.inner.settings.min_connections;
        let mut opened = 0;

        loop {
            let (evicted, total) = {
                let mut state = lock(&pool.state);
                (state.evict_unhealthy_idle(), state.entries.len())
            };
            pool.evict(evicted);
            if total >= min {
                break;
            }
            let Ok(_permit) = Arc::clone(&pool.permits).try_acquire_owned() else {
                break;
            };
            let connection = self
                .inner
                .retry
                .run("warm_up", |_| {
                    let pool = Arc::clone(&pool);
                    let factory = Arc::clone(&self.inner.factory);
                    async move { pool.connect_once(factory.as_ref()).await }
                })
                .await?;
            if self.inner.closed.load(Ordering::Acquire) {
                disconnect_in_background(vec![connection]);
                return Err(ClientError::NotConnected);
            }
            pool.insert(connection, false);
            opened += 1;
        }

        if opened > 0 {
            tracing::info!(key = %key, opened, "Warmed up pool");
        }
        Ok(opened)
    }

    /// Run one health pass over every key: evict dead idle entries, then top
    /// each key back up to `min_connections`.
    pub async fn check_health(&self) {
        let pools: Vec<Arc<KeyPool>> = self
            .inner
            .pools
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        for pool in pools {
            let evicted = lock(&pool.state).evict_unhealthy_idle();
            pool.evict(evicted);

            if let Err(e) = self.warm_up(&pool.key).await {
                tracing::warn!(key = %pool.key, error = %e, "Failed to replenish pool");
            }
        }
    }

    /// Start the background health loop. Calling it again restarts the loop.
    pub fn start_health_checks(&self) {
        let token = CancellationToken::new();
        let interval = self.inner.settings.health_check_interval();
        let weak = Arc::downgrade(&self.inner);
        let child = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                ConnectionPool { inner }.check_health().await;
            }
            tracing::debug!("Pool health loop stopped");
        });

        let previous = lock(&self.inner.health_task).replace((token, handle));
        if let Some((token, handle)) = previous {
            token.cancel();
            handle.abort();
        }
        tracing::info!(interval_ms = interval.as_millis() as u64, "Started pool health checks");
    }

    pub fn metrics(&self) -> PoolMetrics {
        let mut keys: Vec<KeyMetrics> = self.inner.pools.iter().map(|e| e.value().metrics()).collect();
        keys.sort_by(|a, b| a.key.cmp(&b.key));
        PoolMetrics { keys }
    }

    /// Stop health checks, fail pending acquires and disconnect idle entries.
    /// Checked-out connections are disconnected when released.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let task = lock(&self.inner.health_task).take();
        if let Some((token, handle)) = task {
            token.cancel();
            handle.abort();
            let _ = handle.await;
        }

        let pools: Vec<Arc<KeyPool>> = self
            .inner
            .pools
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut idle = Vec::new();
        for pool in pools {
            pool.permits.close();
            let mut state = lock(&pool.state);
            let (in_use, released): (Vec<_>, Vec<_>) =
                state.entries.drain(..).partition(|e| e.in_use);
            state.entries = in_use;
            idle.extend(released.into_iter().map(|e| e.connection));
        }

        let count = idle.len();
        for connection in idle {
            connection.disconnect().await;
        }
        tracing::info!(disconnected = count, "Connection pool closed");
    }
}

#[cfg(test)]
mod tests;
