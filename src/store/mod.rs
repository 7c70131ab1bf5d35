//! Counter storage backends.
//!
//! A [`CounterStore`] owns every piece of mutable rate limit state. The
//! limiter itself is stateless and only talks to the store, which makes the
//! store the single synchronization point between concurrent callers.

mod memory;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::{StorageBackend, StorageConfig};

pub use self::memory::{CounterRecord, MemoryStore};
pub use self::redis::RedisStore;

/// Errors raised by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The round trip did not finish within the configured timeout.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    /// The backend answered with something we could not interpret.
    #[error("unexpected store response: {0}")]
    Protocol(String),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

/// Atomic increment-with-expiry storage for rate limit counters.
///
/// Implementations must keep `increment` atomic with respect to concurrent
/// callers on the same key, and must set the record's expiry to `period`
/// only when the increment opens a new window.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `amount` to the counter for `key` and return the new count.
    ///
    /// A missing or expired record starts a new window lasting `period`.
    async fn increment(&self, key: &str, amount: u64, period: Duration) -> Result<u64, StoreError>;

    /// Time remaining until the current window for `key` resets.
    ///
    /// Returns `None` when no live record exists.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Drop the record for `key` so the next increment opens a new window.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;
}

/// Build the counter store selected by configuration.
///
/// A Redis store connects on first use, so an unreachable server shows up
/// as [`StoreError::Unavailable`] per operation rather than failing here.
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn CounterStore>, StoreError> {
    match config.backend {
        StorageBackend::Memory => {
            info!(prune_threshold = config.prune_threshold, "Using in-process counter store");
            Ok(Arc::new(MemoryStore::with_prune_threshold(config.prune_threshold)))
        }
        StorageBackend::Redis => {
            let timeout = Duration::from_millis(config.timeout_ms);
            info!(url = %config.url, timeout_ms = config.timeout_ms, "Using Redis counter store");
            Ok(Arc::new(RedisStore::new(&config.url, timeout)?))
        }
    }
}
