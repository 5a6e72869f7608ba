//! Bounded pool of connected protocol clients.
//!
//! Every live connection (idle or checked out) holds one semaphore permit, so
//! `max_connections` caps open sockets across the whole fleet. Idle
//! connections are keyed by [`Endpoint`] and reused; the pool is the only
//! place that connects or disconnects a transport.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{
    error::ProtocolError,
    protocol::{ClientFactory, Endpoint, ProtocolClient},
};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
    pub health_check_interval: Duration,
    /// Upper bound for a single disconnect during eviction or shutdown.
    pub close_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            idle_timeout: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(60),
            close_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CloseFailure {
    pub endpoint: Endpoint,
    pub error: String,
}

#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("connection pool exhausted: no connection for {endpoint} within {waited:?}")]
    Exhausted { endpoint: Endpoint, waited: Duration },
    #[error(transparent)]
    Connect(#[from] ProtocolError),
    #[error("connection pool is closed")]
    Closed,
    #[error("{} connection(s) failed to close cleanly", .0.len())]
    CloseFailures(Vec<CloseFailure>),
}

struct IdleEntry<C> {
    client: C,
    permit: OwnedSemaphorePermit,
    last_used: Instant,
}

struct PoolState<C> {
    idle: HashMap<Endpoint, Vec<IdleEntry<C>>>,
    closed: bool,
}

impl<C> PoolState<C> {
    fn idle_count(&self) -> usize {
        self.idle.values().map(Vec::len).sum()
    }

    /// Remove the least recently used idle connection, if any.
    fn take_lru(&mut self) -> Option<IdleEntry<C>> {
        let (endpoint, idx) = self
            .idle
            .iter()
            .flat_map(|(ep, entries)| {
                entries
                    .iter()
                    .enumerate()
                    .map(move |(i, e)| (ep, i, e.last_used))
            })
            .min_by_key(|(_, _, last_used)| *last_used)
            .map(|(ep, i, _)| (ep.clone(), i))?;

        let entries = self.idle.get_mut(&endpoint)?;
        let entry = entries.swap_remove(idx);
        if entries.is_empty() {
            self.idle.remove(&endpoint);
        }
        Some(entry)
    }
}

struct Shared<C> {
    state: Mutex<PoolState<C>>,
    returned: Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub max_connections: usize,
}

pub struct ConnectionPool<F: ClientFactory> {
    config: PoolConfig,
    factory: F,
    permits: Arc<Semaphore>,
    shared: Arc<Shared<F::Client>>,
}

impl<F: ClientFactory> ConnectionPool<F> {
    pub fn new(config: PoolConfig, factory: F) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Self {
            config,
            factory,
            permits,
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    idle: HashMap::new(),
                    closed: false,
                }),
                returned: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check out a connected client for `endpoint`.
    ///
    /// Reuses an idle connection to the same endpoint when one is healthy,
    /// otherwise opens a new one. Waits up to `acquire_timeout` for capacity.
    pub async fn acquire(&self, endpoint: &Endpoint) -> Result<PooledClient<F::Client>, PoolError> {
        let deadline = tokio::time::Instant::now() + self.config.acquire_timeout;

        let permit = loop {
            // Register interest before checking so a concurrent return is not missed.
            let returned = self.shared.returned.notified();
            tokio::pin!(returned);
            returned.as_mut().enable();

            let stale = {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Err(PoolError::Closed);
                }
                let mut stale = Vec::new();
                if let Some(entries) = state.idle.get_mut(endpoint) {
                    while let Some(entry) = entries.pop() {
                        let fresh = entry.last_used.elapsed() <= self.config.idle_timeout;
                        if entry.client.is_healthy() && fresh {
                            return Ok(PooledClient::new(
                                entry.client,
                                entry.permit,
                                endpoint.clone(),
                                &self.shared,
                            ));
                        }
                        stale.push(entry);
                    }
                    state.idle.remove(endpoint);
                }
                stale
            };
            if !stale.is_empty() {
                tracing::debug!(%endpoint, count = stale.len(), "dropping stale idle connections");
            }
            drop(stale);

            if let Ok(permit) = self.permits.clone().try_acquire_owned() {
                break permit;
            }

            // At capacity: make room by evicting the least recently used idle connection.
            let evicted = self.shared.state.lock().take_lru();
            if let Some(entry) = evicted {
                tracing::debug!(evicted = %entry.client.endpoint(), %endpoint, "evicting idle connection for capacity");
                self.close_entry(entry).await;
                continue;
            }

            tokio::select! {
                permit = self.permits.clone().acquire_owned() => {
                    break permit.map_err(|_| PoolError::Closed)?;
                }
                _ = &mut returned => continue,
                _ = tokio::time::sleep_until(deadline) => {
                    metrics::counter!("pool_acquire_timeouts_total").increment(1);
                    return Err(PoolError::Exhausted {
                        endpoint: endpoint.clone(),
                        waited: self.config.acquire_timeout,
                    });
                }
            }
        };

        let mut client = self.factory.create(endpoint);
        client.connect().await?;
        metrics::counter!("pool_connections_opened_total").increment(1);

        Ok(PooledClient::new(client, permit, endpoint.clone(), &self.shared))
    }

    async fn close_entry(&self, mut entry: IdleEntry<F::Client>) -> Option<CloseFailure> {
        let endpoint = entry.client.endpoint().clone();
        let closed =
            tokio::time::timeout(self.config.close_timeout, entry.client.disconnect()).await;
        let result = match closed {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("disconnect timed out after {:?}", self.config.close_timeout)),
        };
        drop(entry);
        result.map(|error| CloseFailure { endpoint, error })
    }

    /// Drop idle connections that are unhealthy or idle past `idle_timeout`.
    pub async fn run_health_check(&self) -> usize {
        let evicted: Vec<IdleEntry<F::Client>> = {
            let mut state = self.shared.state.lock();
            let idle_timeout = self.config.idle_timeout;
            let mut evicted = Vec::new();
            for entries in state.idle.values_mut() {
                let (keep, expired): (Vec<_>, Vec<_>) = entries
                    .drain(..)
                    .partition(|e| e.client.is_healthy() && e.last_used.elapsed() <= idle_timeout);
                *entries = keep;
                evicted.extend(expired);
            }
            state.idle.retain(|_, entries| !entries.is_empty());
            evicted
        };

        let count = evicted.len();
        for entry in evicted {
            if let Some(failure) = self.close_entry(entry).await {
                tracing::debug!(endpoint = %failure.endpoint, error = %failure.error, "idle connection closed uncleanly");
            }
        }
        if count > 0 {
            tracing::debug!(evicted = count, "pool health check evicted idle connections");
            metrics::counter!("pool_connections_evicted_total").increment(count as u64);
        }
        count
    }

    /// Run [`run_health_check`](Self::run_health_check) every `health_check_interval`
    /// until cancelled.
    pub fn spawn_health_check(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.health_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.run_health_check().await;
                    }
                }
            }
        })
    }

    /// Close every idle connection and refuse further checkouts.
    ///
    /// Connections still checked out are discarded when returned. Close
    /// failures are collected and reported together.
    pub async fn close_all(&self) -> Result<(), PoolError> {
        let entries: Vec<IdleEntry<F::Client>> = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.idle.drain().flat_map(|(_, entries)| entries).collect()
        };
        self.permits.close();
        self.shared.returned.notify_waiters();

        let mut failures = Vec::new();
        for entry in entries {
            if let Some(failure) = self.close_entry(entry).await {
                failures.push(failure);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            for f in &failures {
                tracing::warn!(endpoint = %f.endpoint, error = %f.error, "connection failed to close cleanly");
            }
            Err(PoolError::CloseFailures(failures))
        }
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.shared.state.lock().idle_count();
        let max = self.config.max_connections.max(1);
        let live = max.saturating_sub(self.permits.available_permits());
        PoolStats {
            idle,
            in_use: live.saturating_sub(idle),
            max_connections: max,
        }
    }
}

/// A checked-out client. Returned to the pool on drop unless marked broken.
pub struct PooledClient<C: ProtocolClient + 'static> {
    entry: Option<(C, OwnedSemaphorePermit)>,
    endpoint: Endpoint,
    shared: Arc<Shared<C>>,
    broken: bool,
}

impl<C: ProtocolClient + 'static> PooledClient<C> {
    fn new(
        client: C,
        permit: OwnedSemaphorePermit,
        endpoint: Endpoint,
        shared: &Arc<Shared<C>>,
    ) -> Self {
        Self {
            entry: Some((client, permit)),
            endpoint,
            shared: Arc::clone(shared),
            broken: false,
        }
    }

    /// Discard this connection instead of returning it to the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl<C: ProtocolClient + 'static> std::ops::Deref for PooledClient<C> {
    type Target = C;

    fn deref(&self) -> &C {
        match &self.entry {
            Some((client, _)) => client,
            None => unreachable!("pooled client accessed after release"),
        }
    }
}

impl<C: ProtocolClient + 'static> std::ops::DerefMut for PooledClient<C> {
    fn deref_mut(&mut self) -> &mut C {
        match &mut self.entry {
            Some((client, _)) => client,
            None => unreachable!("pooled client accessed after release"),
        }
    }
}

impl<C: ProtocolClient + 'static> Drop for PooledClient<C> {
    fn drop(&mut self) {
        let Some((client, permit)) = self.entry.take() else {
            return;
        };

        if self.broken || !client.is_healthy() {
            tracing::debug!(endpoint = %self.endpoint, "discarding pooled connection");
            // Dropping the client releases its transport; the permit frees capacity.
            drop(client);
            drop(permit);
            self.shared.returned.notify_waiters();
            return;
        }

        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.idle.entry(self.endpoint.clone()).or_default().push(IdleEntry {
            client,
            permit,
            last_used: Instant::now(),
        });
        drop(state);
        self.shared.returned.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Operation, ProtocolErrorKind};
    use crate::protocol::{ConnectionState, ReadTarget};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        disconnected: AtomicUsize,
    }

    struct MockClient {
        endpoint: Endpoint,
        state: ConnectionState,
        counters: Arc<Counters>,
        fail_disconnect: bool,
    }

    #[async_trait::async_trait]
    impl ProtocolClient for MockClient {
        fn endpoint(&self) -> &Endpoint {
            &self.endpoint
        }

        fn state(&self) -> ConnectionState {
            self.state
        }

        async fn connect(&mut self) -> Result<ConnectionState, ProtocolError> {
            if self.endpoint.host == "refused" {
                return Err(ProtocolError::new(
                    self.endpoint.device_id,
                    Operation::Connect,
                    std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
                ));
            }
            self.state = ConnectionState::Connected;
            Ok(self.state)
        }

        async fn disconnect(&mut self) -> Result<(), ProtocolError> {
            self.state = ConnectionState::Disconnected;
            self.counters.disconnected.fetch_add(1, Ordering::SeqCst);
            if self.fail_disconnect {
                return Err(ProtocolError::new(
                    self.endpoint.device_id,
                    Operation::Disconnect,
                    ProtocolErrorKind::Timeout(Duration::from_millis(1)),
                ));
            }
            Ok(())
        }

        async fn read(&mut self, targets: &[ReadTarget]) -> Result<Vec<f64>, ProtocolError> {
            Ok(vec![0.0; targets.len()])
        }
    }

    struct MockFactory {
        counters: Arc<Counters>,
    }

    impl ClientFactory for MockFactory {
        type Client = MockClient;

        fn create(&self, endpoint: &Endpoint) -> MockClient {
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            MockClient {
                endpoint: endpoint.clone(),
                state: ConnectionState::Disconnected,
                counters: Arc::clone(&self.counters),
                fail_disconnect: endpoint.host == "stubborn",
            }
        }
    }

    fn pool(max_connections: usize) -> (ConnectionPool<MockFactory>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let config = PoolConfig {
            max_connections,
            idle_timeout: Duration::from_secs(60),
            acquire_timeout: Duration::from_millis(50),
            health_check_interval: Duration::from_secs(60),
            close_timeout: Duration::from_millis(50),
        };
        let factory = MockFactory {
            counters: Arc::clone(&counters),
        };
        (ConnectionPool::new(config, factory), counters)
    }

    fn ep(host: &str, device_id: i64) -> Endpoint {
        Endpoint::new(host, 502, device_id)
    }

    #[tokio::test]
    async fn idle_connection_is_reused_for_same_endpoint() {
        let (pool, counters) = pool(2);

        let first = pool.acquire(&ep("a", 1)).await.unwrap();
        drop(first);
        let second = pool.acquire(&ep("a", 1)).await.unwrap();

        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(second.state(), ConnectionState::Connected);
        assert_eq!(pool.stats().in_use, 1);
    }

    #[tokio::test]
    async fn acquire_times_out_when_all_connections_are_checked_out() {
        let (pool, _) = pool(1);
        let _held = pool.acquire(&ep("a", 1)).await.unwrap();

        let err = pool.acquire(&ep("b", 2)).await.err().unwrap();
        assert!(matches!(err, PoolError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn idle_connection_for_other_endpoint_is_evicted_at_capacity() {
        let (pool, counters) = pool(1);
        drop(pool.acquire(&ep("a", 1)).await.unwrap());

        let b = pool.acquire(&ep("b", 2)).await.unwrap();
        assert_eq!(b.endpoint(), &ep("b", 2));
        assert_eq!(counters.disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waiter_gets_capacity_when_connection_is_released() {
        let (pool, _) = pool(1);
        let pool = Arc::new(pool);
        let held = pool.acquire(&ep("a", 1)).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.acquire(&ep("b", 2))
                    .await
                    .map(|c| c.endpoint().clone())
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), ep("b", 2));
    }

    #[tokio::test]
    async fn broken_connections_are_not_returned() {
        let (pool, counters) = pool(2);
        let mut client = pool.acquire(&ep("a", 1)).await.unwrap();
        client.mark_broken();
        drop(client);

        assert_eq!(pool.stats().idle, 0);
        drop(pool.acquire(&ep("a", 1)).await.unwrap());
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn connect_failure_releases_capacity() {
        let (pool, _) = pool(1);
        let err = pool.acquire(&ep("refused", 9)).await.err().unwrap();
        assert!(matches!(err, PoolError::Connect(_)));
        assert!(pool.acquire(&ep("a", 1)).await.is_ok());
    }

    #[tokio::test]
    async fn health_check_evicts_expired_idle_connections() {
        let (mut pool, counters) = pool(2);
        pool.config.idle_timeout = Duration::ZERO;
        drop(pool.acquire(&ep("a", 1)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(pool.run_health_check().await, 1);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(counters.disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_all_reports_every_failure_and_closes_everything() {
        let (pool, counters) = pool(3);
        drop(pool.acquire(&ep("a", 1)).await.unwrap());
        drop(pool.acquire(&ep("stubborn", 2)).await.unwrap());
        drop(pool.acquire(&ep("stubborn", 3)).await.unwrap());

        match pool.close_all().await {
            Err(PoolError::CloseFailures(failures)) => assert_eq!(failures.len(), 2),
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(counters.disconnected.load(Ordering::SeqCst), 3);
        assert!(matches!(pool.acquire(&ep("a", 1)).await, Err(PoolError::Closed)));
    }
}
