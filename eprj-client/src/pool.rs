//! # Connection Pool
//!
//! Purpose: Keep one live connection per device key so commands skip the
//! dial and greeting, while guaranteeing that only one transaction talks to
//! a device at a time.
//!
//! ## Design Principles
//! 1. **One Slot Per Key**: Each key owns an async mutex around its cached
//!    connection; holding it is holding the right to talk to the device.
//! 2. **Minimal Locking**: The key -> slot map sits behind a separate
//!    short-lived lock, so a slow device never blocks bookkeeping for others.
//! 3. **Taint on Failure**: A failed transaction closes its connection; a
//!    half-finished exchange is never cached.
//! 4. **Lazy Expiry**: Idle timeout and max lifetime are checked when a key
//!    is accessed; a periodic sweep is opt-in.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::PoolConfig;
use crate::conn::{ConnState, Connection, ConnectionId};
use crate::error::{ClientError, ClientResult};
use crate::factory::ConnectionFactory;
use crate::stats::{PoolCounters, PoolStats};

/// Work executed against a key's connection while its lock is held.
///
/// The future borrows the connection, so it must own everything else it
/// captures.
pub type Transaction<'c, T> = BoxFuture<'c, ClientResult<T>>;

struct Entry {
    conn: Box<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
}

impl Entry {
    /// Returns why the entry may no longer be reused, if it may not.
    fn expiry(&self, now: Instant, config: &PoolConfig) -> Option<&'static str> {
        if self.conn.is_closed() {
            return Some("closed");
        }
        if now.saturating_duration_since(self.created_at) > config.max_lifetime() {
            return Some("max lifetime");
        }
        if now.saturating_duration_since(self.last_used) > config.idle_timeout() {
            return Some("idle timeout");
        }
        None
    }
}

#[derive(Default)]
struct Slot {
    // Per-key command lock. `None` means nothing is cached for the key.
    entry: tokio::sync::Mutex<Option<Entry>>,
}

/// A key's lock held for the duration of a transaction body.
///
/// Dropping it before the body settles (the caller abandoned the future)
/// discards the connection: its exchange may be half finished.
struct Lease<'p> {
    cached: tokio::sync::MutexGuard<'p, Option<Entry>>,
    counters: &'p PoolCounters,
    settled: bool,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(entry) = self.cached.take() {
            tracing::warn!(parent: entry.conn.span(), "discarding connection abandoned mid-transaction");
            self.counters.record_discarded();
        }
    }
}

struct PoolInner {
    factory: Arc<dyn ConnectionFactory>,
    clock: Arc<dyn Clock>,
    config: PoolConfig,
    // Slots are never removed: a waiter may already hold a clone.
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    counters: PoolCounters,
}

/// Keyed cache of one connection per device.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool that uses the system clock.
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: PoolConfig) -> Self {
        Self::with_clock(factory, config, Arc::new(SystemClock))
    }

    /// Creates a pool with an injected clock for expiry decisions.
    pub fn with_clock(
        factory: Arc<dyn ConnectionFactory>,
        config: PoolConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                factory,
                clock,
                config,
                slots: Mutex::new(HashMap::new()),
                counters: PoolCounters::default(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Runs `body` against the connection cached for `key`.
    ///
    /// **Logic**:
    /// 1. Take the key's lock; callers for the same key queue in arrival order.
    /// 2. Reuse the cached connection unless it has expired, otherwise close
    ///    it and ask the factory for a fresh one.
    /// 3. Run `body`. On failure close the connection and drop it from the
    ///    cache; on success stamp its last use and keep it. If the returned
    ///    future is dropped while `body` runs, the connection is discarded.
    ///
    /// Factory errors and body errors are returned unchanged.
    pub async fn transact<T, F>(&self, key: &str, body: F) -> ClientResult<T>
    where
        F: for<'c> FnOnce(&'c mut dyn Connection) -> Transaction<'c, T>,
    {
        let slot = self.slot(key);
        let mut cached = slot.entry.lock().await;

        let entry = self.checkout(key, &mut cached).await?;
        *cached = Some(entry);
        let mut lease = Lease {
            cached,
            counters: &self.inner.counters,
            settled: false,
        };

        let result = match lease.cached.as_mut() {
            Some(entry) => body(&mut *entry.conn).await,
            None => return Err(ClientError::Closed),
        };
        lease.settled = true;

        match result {
            Ok(value) => {
                if let Some(entry) = lease.cached.as_mut() {
                    entry.last_used = self.inner.clock.now();
                }
                Ok(value)
            }
            Err(err) => {
                if let Some(mut entry) = lease.cached.take() {
                    if err.is_connection_fatal() {
                        tracing::warn!(parent: entry.conn.span(), error = %err, "discarding connection after failed transaction");
                    } else {
                        tracing::debug!(parent: entry.conn.span(), error = %err, "discarding connection after rejected response");
                    }
                    self.inner.counters.record_discarded();
                    let _ = entry.conn.close().await;
                }
                Err(err)
            }
        }
    }

    /// Identity of the connection currently cached for `key`.
    ///
    /// Waits for any in-flight transaction on the key.
    pub async fn connection_id(&self, key: &str) -> Option<ConnectionId> {
        let slot = self.existing_slot(key)?;
        let cached = slot.entry.lock().await;
        cached.as_ref().map(|entry| entry.conn.id())
    }

    /// State of `key`'s connection without waiting for its lock.
    pub fn state(&self, key: &str) -> Option<ConnState> {
        let slot = self.existing_slot(key)?;
        let cached = match slot.entry.try_lock() {
            Ok(cached) => cached,
            Err(_) => return Some(ConnState::InUse),
        };
        cached.as_ref().map(|entry| {
            if entry.conn.is_closed() {
                ConnState::Closed
            } else {
                ConnState::Idle
            }
        })
    }

    /// Closes and forgets the connection cached for `key`.
    ///
    /// Returns true when a connection was closed.
    pub async fn close(&self, key: &str) -> bool {
        let Some(slot) = self.existing_slot(key) else {
            return false;
        };
        let mut cached = slot.entry.lock().await;
        match cached.take() {
            Some(mut entry) => {
                self.inner.counters.record_uncached();
                let _ = entry.conn.close().await;
                true
            }
            None => false,
        }
    }

    /// Closes every cached connection, waiting for in-flight transactions.
    pub async fn close_all(&self) -> usize {
        let mut closed = 0;
        for slot in self.all_slots() {
            let mut cached = slot.entry.lock().await;
            if let Some(mut entry) = cached.take() {
                self.inner.counters.record_uncached();
                let _ = entry.conn.close().await;
                closed += 1;
            }
        }
        closed
    }

    /// Closes cached connections that have expired.
    ///
    /// Keys with a transaction in flight are skipped rather than waited on.
    pub async fn evict_expired(&self) -> usize {
        let mut evicted = 0;
        for slot in self.all_slots() {
            let Ok(mut cached) = slot.entry.try_lock() else {
                continue;
            };
            let now = self.inner.clock.now();
            let Some(reason) = cached
                .as_ref()
                .and_then(|entry| entry.expiry(now, &self.inner.config))
            else {
                continue;
            };
            if let Some(mut entry) = cached.take() {
                tracing::info!(parent: entry.conn.span(), reason, "sweeping expired connection");
                self.inner.counters.record_expired();
                let _ = entry.conn.close().await;
                evicted += 1;
            }
        }
        evicted
    }

    /// Starts the periodic sweep if a non-zero `sweep_interval_ms` is
    /// configured.
    ///
    /// The task ends on its own once every pool handle is dropped.
    pub fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        let interval = self.inner.config.sweep_interval()?;
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        Some(tokio::spawn(sweep_loop(weak, interval)))
    }

    /// Keys that currently hold a connection, sorted.
    pub fn cached_keys(&self) -> Vec<String> {
        let slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| match slot.entry.try_lock() {
                Ok(cached) => cached.is_some(),
                Err(_) => true,
            })
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.counters.snapshot()
    }

    async fn checkout(&self, key: &str, cached: &mut Option<Entry>) -> ClientResult<Entry> {
        if let Some(mut entry) = cached.take() {
            let now = self.inner.clock.now();
            match entry.expiry(now, &self.inner.config) {
                None => {
                    self.inner.counters.record_reused();
                    return Ok(entry);
                }
                Some(reason) => {
                    tracing::info!(parent: entry.conn.span(), reason, "replacing expired connection");
                    self.inner.counters.record_expired();
                    let _ = entry.conn.close().await;
                }
            }
        }

        let conn = self.inner.factory.create(key).await?;
        let now = self.inner.clock.now();
        self.inner.counters.record_created();
        self.inner.counters.record_cached();
        Ok(Entry {
            conn,
            created_at: now,
            last_used: now,
        })
    }

    fn slot(&self, key: &str) -> Arc<Slot> {
        let mut slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(key.to_string()).or_default().clone()
    }

    fn existing_slot(&self, key: &str) -> Option<Arc<Slot>> {
        let slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(key).cloned()
    }

    fn all_slots(&self) -> Vec<Arc<Slot>> {
        let slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.values().cloned().collect()
    }
}

async fn sweep_loop(pool: Weak<PoolInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = pool.upgrade() else {
            break;
        };
        let evicted = ConnectionPool { inner }.evict_expired().await;
        if evicted > 0 {
            tracing::debug!(evicted, "sweep closed expired connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::clock::ManualClock;
    use crate::codec::{exchange, write_command};
    use crate::test_support::{ScriptedConnection, ScriptedFactory};

    fn pool_with(factory: &Arc<ScriptedFactory>, clock: &Arc<ManualClock>) -> ConnectionPool {
        ConnectionPool::with_clock(factory.clone(), PoolConfig::default(), clock.clone())
    }

    async fn current_id(pool: &ConnectionPool, key: &str) -> ConnectionId {
        pool.transact(key, |conn| Box::pin(async move { Ok(conn.id()) }))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn reuses_connection_within_bounds() {
        let factory = ScriptedFactory::echo();
        let clock = Arc::new(ManualClock::new());
        let pool = pool_with(&factory, &clock);

        let first = current_id(&pool, "10.0.0.5").await;
        clock.advance(Duration::from_secs(30));
        let second = current_id(&pool, "10.0.0.5").await;

        assert_eq!(first, second);
        assert_eq!(factory.attempts(), 1);
        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.cached, 1);
    }

    #[tokio::test]
    async fn idle_timeout_replaces_connection() {
        let factory = ScriptedFactory::echo();
        let clock = Arc::new(ManualClock::new());
        let pool = pool_with(&factory, &clock);

        let first = current_id(&pool, "dev").await;
        clock.advance(Duration::from_secs(41));
        let second = current_id(&pool, "dev").await;

        assert_ne!(first, second);
        assert!(factory.created()[0].1.is_closed());
        assert_eq!(pool.stats().expired, 1);
        assert_eq!(pool.stats().cached, 1);
    }

    #[tokio::test]
    async fn max_lifetime_replaces_busy_connection() {
        let factory = ScriptedFactory::echo();
        let clock = Arc::new(ManualClock::new());
        let pool = pool_with(&factory, &clock);

        let first = current_id(&pool, "dev").await;
        clock.advance(Duration::from_secs(30));
        assert_eq!(current_id(&pool, "dev").await, first);
        clock.advance(Duration::from_secs(30));
        // Used 30s ago (under idle timeout) but 60s old (over max lifetime).
        assert_ne!(current_id(&pool, "dev").await, first);
    }

    #[tokio::test]
    async fn failed_body_evicts_connection() {
        let factory = ScriptedFactory::echo();
        let clock = Arc::new(ManualClock::new());
        let pool = pool_with(&factory, &clock);

        let first = current_id(&pool, "dev").await;
        let err = pool
            .transact("dev", |_conn| {
                Box::pin(async move { Err::<(), _>(ClientError::Timeout(Duration::from_secs(3))) })
            })
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(factory.created()[0].1.is_closed());
        assert_eq!(pool.state("dev"), None);
        assert_ne!(current_id(&pool, "dev").await, first);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[tokio::test]
    async fn rejected_response_still_discards_connection() {
        let factory = ScriptedFactory::echo();
        let clock = Arc::new(ManualClock::new());
        let pool = pool_with(&factory, &clock);

        let first = current_id(&pool, "dev").await;
        let err = pool
            .transact("dev", |_conn| {
                Box::pin(async move { Err::<(), _>(ClientError::Protocol("garbled".to_string())) })
            })
            .await
            .unwrap_err();

        assert!(!err.is_connection_fatal());
        assert!(factory.created()[0].1.is_closed());
        assert_ne!(current_id(&pool, "dev").await, first);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[tokio::test]
    async fn abandoned_transaction_discards_connection() {
        let factory = ScriptedFactory::echo();
        let clock = Arc::new(ManualClock::new());
        let pool = pool_with(&factory, &clock);

        let first = current_id(&pool, "dev").await;
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            pool.transact("dev", |_conn| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                })
            }),
        )
        .await;
        assert!(abandoned.is_err());

        let stats = pool.stats();
        assert_eq!(stats.cached, pool.cached_keys().len() as u64);
        assert_eq!(stats.cached, 0);
        assert_eq!(stats.discarded, 1);

        assert_ne!(current_id(&pool, "dev").await, first);
        assert_eq!(pool.stats().cached, pool.cached_keys().len() as u64);
        assert_eq!(pool.stats().cached, 1);
    }

    #[tokio::test]
    async fn short_write_forces_new_connection() {
        let made = Arc::new(AtomicUsize::new(0));
        let factory = ScriptedFactory::new(move |key| {
            if made.fetch_add(1, Ordering::SeqCst) == 0 {
                ScriptedConnection::new(key).accepting_at_most(3)
            } else {
                ScriptedConnection::new(key).echoing()
            }
        });
        let clock = Arc::new(ManualClock::new());
        let pool = pool_with(&factory, &clock);

        let err = pool
            .transact("dev", |conn| {
                Box::pin(async move { write_command(conn, "lamp ?", Duration::from_secs(1)).await })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ShortWrite { written: 3, .. }));

        let resp = pool
            .transact("dev", |conn| {
                Box::pin(async move { exchange(conn, "lamp ?", Duration::from_secs(1)).await })
            })
            .await
            .unwrap();
        assert_eq!(resp, "lamp ?");
        assert_eq!(factory.attempts(), 2);
    }

    #[tokio::test]
    async fn factory_failure_caches_nothing() {
        let factory = ScriptedFactory::echo();
        let clock = Arc::new(ManualClock::new());
        let pool = pool_with(&factory, &clock);

        factory.fail_next();
        let err = pool
            .transact("dev", |conn| Box::pin(async move { Ok(conn.id()) }))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Handshake { .. }));
        assert!(pool.cached_keys().is_empty());
        assert_eq!(pool.stats().cached, 0);

        current_id(&pool, "dev").await;
        assert_eq!(factory.attempts(), 2);
        assert_eq!(pool.cached_keys(), vec!["dev".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_transactions_never_overlap() {
        let factory = ScriptedFactory::echo();
        let pool = ConnectionPool::new(factory.clone(), PoolConfig::default());
        let inflight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let inflight = inflight.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                pool.transact("dev", move |_conn| {
                    Box::pin(async move {
                        let now = inflight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        inflight.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(factory.attempts(), 1);
        assert_eq!(pool.stats().reused, 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn distinct_keys_run_in_parallel() {
        let factory = ScriptedFactory::echo();
        let pool = ConnectionPool::new(factory, PoolConfig::default());
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let run = |key: &'static str| {
            let pool = pool.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                pool.transact(key, move |_conn| {
                    Box::pin(async move {
                        // Only passes if the other key's body runs concurrently.
                        barrier.wait().await;
                        Ok(())
                    })
                })
                .await
            })
        };
        let a = run("10.0.0.1");
        let b = run("10.0.0.2");

        let joined = tokio::time::timeout(Duration::from_secs(2), async {
            a.await.unwrap().unwrap();
            b.await.unwrap().unwrap();
        })
        .await;
        assert!(joined.is_ok(), "distinct keys blocked each other");
    }

    #[tokio::test]
    async fn evict_expired_skips_keys_in_use() {
        let factory = ScriptedFactory::echo();
        let clock = Arc::new(ManualClock::new());
        let pool = pool_with(&factory, &clock);

        current_id(&pool, "a").await;
        current_id(&pool, "b").await;
        clock.advance(Duration::from_secs(50));

        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let busy = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.transact("b", move |_conn| {
                    Box::pin(async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok(())
                    })
                })
                .await
            })
        };
        started_rx.await.unwrap();
        assert_eq!(pool.state("b"), Some(ConnState::InUse));

        assert_eq!(pool.evict_expired().await, 1);
        assert_eq!(pool.state("a"), None);

        release_tx.send(()).unwrap();
        busy.await.unwrap().unwrap();
        // "b" was replaced on access, not by the sweep.
        assert_eq!(pool.stats().expired, 2);
        assert_eq!(pool.state("b"), Some(ConnState::Idle));
    }

    #[tokio::test]
    async fn close_forgets_connection() {
        let factory = ScriptedFactory::echo();
        let clock = Arc::new(ManualClock::new());
        let pool = pool_with(&factory, &clock);

        let first = current_id(&pool, "dev").await;
        assert_eq!(pool.connection_id("dev").await, Some(first));
        assert!(pool.close("dev").await);
        assert!(!pool.close("dev").await);
        assert!(factory.created()[0].1.is_closed());
        assert!(pool.cached_keys().is_empty());

        assert_ne!(current_id(&pool, "dev").await, first);
        current_id(&pool, "other").await;
        assert_eq!(pool.close_all().await, 2);
        assert_eq!(pool.stats().cached, 0);
    }

    #[tokio::test]
    async fn sweeper_reclaims_abandoned_connections() {
        let factory = ScriptedFactory::echo();
        let clock = Arc::new(ManualClock::new());
        let config = PoolConfig {
            sweep_interval_ms: Some(10),
            ..PoolConfig::default()
        };
        let pool = ConnectionPool::with_clock(factory.clone(), config, clock.clone());
        let sweeper = pool.spawn_sweeper().expect("sweep interval configured");

        current_id(&pool, "dev").await;
        clock.advance(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(pool.stats().expired, 1);
        assert!(factory.created()[0].1.is_closed());
        sweeper.abort();
    }

    #[test]
    fn sweeper_is_opt_in() {
        let pool = ConnectionPool::new(ScriptedFactory::echo(), PoolConfig::default());
        assert!(pool.spawn_sweeper().is_none());
    }

    #[test]
    fn zero_sweep_interval_spawns_nothing() {
        let config = PoolConfig {
            sweep_interval_ms: Some(0),
            ..PoolConfig::default()
        };
        let pool = ConnectionPool::new(ScriptedFactory::echo(), config);
        assert!(pool.spawn_sweeper().is_none());
    }
}
