//! In-process counter store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{CounterStore, StoreError};

/// Default number of records held before expired ones are swept.
const DEFAULT_PRUNE_THRESHOLD: usize = 10_000;

/// A counter for one key within its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterRecord {
    /// Units counted since the window began
    pub count: u64,
    /// When the first increment of this window happened
    pub window_start: Instant,
    /// How long the window lasts
    pub ttl: Duration,
}

impl CounterRecord {
    fn new(now: Instant, ttl: Duration) -> Self {
        Self {
            count: 0,
            window_start: now,
            ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.window_start) >= self.ttl
    }

    /// Duration until the window resets, or `None` once it has.
    fn remaining(&self, now: Instant) -> Option<Duration> {
        let elapsed = now.duration_since(self.window_start);
        self.ttl.checked_sub(elapsed).filter(|d| !d.is_zero())
    }
}

/// Counter store for throttled work that runs in a single process.
///
/// All records sit behind one mutex; increment and window creation happen in
/// the same critical section, so concurrent callers never lose a count.
/// Time is read from `tokio::time`, which lets tests pause and advance it.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    prune_threshold: usize,
}

#[derive(Debug)]
struct Inner {
    records: HashMap<String, CounterRecord>,
    /// Record count that triggers the next sweep during `increment`
    next_prune: usize,
}

impl Inner {
    /// Drop expired records and move the next sweep out to twice the
    /// number of survivors.
    fn sweep(&mut self, now: Instant, threshold: usize) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| !r.is_expired(now));
        self.next_prune = threshold.max(self.records.len().saturating_mul(2));
        before - self.records.len()
    }
}

impl MemoryStore {
    /// Create an empty store with the default prune threshold.
    pub fn new() -> Self {
        Self::with_prune_threshold(DEFAULT_PRUNE_THRESHOLD)
    }

    /// Create an empty store that sweeps expired records once it holds more
    /// than `prune_threshold` of them.
    pub fn with_prune_threshold(prune_threshold: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                next_prune: prune_threshold,
            }),
            prune_threshold,
        }
    }

    /// Snapshot of the live record for `key`.
    pub fn record(&self, key: &str) -> Option<CounterRecord> {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner.records.get(key).filter(|r| !r.is_expired(now)).copied()
    }

    /// Remove every expired record and return how many were dropped.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        self.inner.lock().sweep(now, self.prune_threshold)
    }

    /// Number of records held, live or not yet swept.
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all records.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.records.clear();
        inner.next_prune = self.prune_threshold;
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, amount: u64, period: Duration) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if inner.records.len() > inner.next_prune {
            let pruned = inner.sweep(now, self.prune_threshold);
            debug!(pruned, next_prune = inner.next_prune, "Pruned expired counters");
        }

        let record = inner
            .records
            .entry(key.to_string())
            .or_insert_with(|| CounterRecord::new(now, period));

        if record.is_expired(now) {
            *record = CounterRecord::new(now, period);
        }

        record.count = record.count.saturating_add(amount);

        trace!(key = %key, count = record.count, "Incremented counter");
        Ok(record.count)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = Instant::now();
        let inner = self.inner.lock();
        Ok(inner.records.get(key).and_then(|r| r.remaining(now)))
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.inner.lock().records.remove(key);
        Ok(())
    }
}
