//! # Pool Counters
//!
//! Provide lightweight counters describing how the pool treats its
//! connections: how often it dials, reuses, and throws connections away.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Atomic counters aggregate events cheaply.
//! 2. **Plain Snapshots**: Readers get a copyable struct, never the atomics.
//!
//! ## Notes
//! - `Ordering::Relaxed` is enough; no cross-counter ordering is promised.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of the pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections produced by the factory.
    pub created: u64,
    /// Transactions served by an already cached connection.
    pub reused: u64,
    /// Connections dropped because they outlived idle timeout or max lifetime.
    pub expired: u64,
    /// Connections dropped because a transaction on them failed.
    pub discarded: u64,
    /// Live cached connections at snapshot time.
    pub cached: u64,
}

#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    expired: AtomicU64,
    discarded: AtomicU64,
    cached: AtomicU64,
}

impl PoolCounters {
    pub(crate) fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reused(&self) {
        self.reused.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an expired connection leaving the cache.
    pub(crate) fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
        self.cached.fetch_sub(1, Ordering::Relaxed);
    }

    /// Records a connection dropped after a failed transaction.
    pub(crate) fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        self.cached.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cached(&self) {
        self.cached.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_uncached(&self) {
        self.cached.fetch_sub(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    ///
    /// **Input**: none.
    /// **Output**: `PoolStats` with point-in-time values.
    pub(crate) fn snapshot(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            cached: self.cached.load(Ordering::Relaxed),
        }
    }
}
