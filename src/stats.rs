use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cumulative river counters, shared by the producer, consumers and the supervisor.
///
/// Counters are a cache: they're persisted next to the checkpoint but a river can always
/// restart from zero.
#[derive(Debug, Default, Clone)]
pub struct Statistics {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    indexed: AtomicU64,
    deleted: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Point in time copy of [Statistics].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// documents written (full or partial).
    pub indexed: u64,
    /// documents deleted.
    pub deleted: u64,
    /// oplog entries which didn't concern the river.
    pub skipped: u64,
    /// malformed entries and permanently failed writes.
    pub failed: u64,
}

impl Statistics {
    /// create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// create counters starting from a persisted snapshot.
    pub fn from_snapshot(snapshot: StatsSnapshot) -> Self {
        let stats = Self::default();
        stats.inner.indexed.store(snapshot.indexed, Ordering::Relaxed);
        stats.inner.deleted.store(snapshot.deleted, Ordering::Relaxed);
        stats.inner.skipped.store(snapshot.skipped, Ordering::Relaxed);
        stats.inner.failed.store(snapshot.failed, Ordering::Relaxed);
        stats
    }

    /// count documents written to the index.
    pub fn add_indexed(&self, n: u64) {
        self.inner.indexed.fetch_add(n, Ordering::Relaxed);
    }

    /// count documents deleted from the index.
    pub fn add_deleted(&self, n: u64) {
        self.inner.deleted.fetch_add(n, Ordering::Relaxed);
    }

    /// count entries which didn't concern the index.
    pub fn add_skipped(&self, n: u64) {
        self.inner.skipped.fetch_add(n, Ordering::Relaxed);
    }

    /// count entries or intents dropped after a permanent failure.
    pub fn add_failed(&self, n: u64) {
        self.inner.failed.fetch_add(n, Ordering::Relaxed);
    }

    /// copy current values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            indexed: self.inner.indexed.load(Ordering::Relaxed),
            deleted: self.inner.deleted.load(Ordering::Relaxed),
            skipped: self.inner.skipped.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }
}
