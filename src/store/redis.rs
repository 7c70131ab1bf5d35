//! Redis-backed counter store shared by multiple processes.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, ErrorKind, RedisError, Script};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{CounterStore, StoreError};

/// Increments a counter and opens its window in one server-side step.
///
/// The expiry is only set when the key has none, so later increments in the
/// same window never push the reset further out.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return count
"#;

/// Counter store backed by a Redis server.
///
/// Atomicity comes from Redis executing the increment script as a single
/// command; no client-side lock is taken. Every round trip is bounded by
/// `timeout`.
///
/// The connection is opened on first use. A failed attempt leaves the store
/// unconnected and the next operation tries again.
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    script: Script,
    timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("timeout", &self.timeout)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl RedisStore {
    /// Create a store for the Redis server at `url` without connecting yet.
    ///
    /// Only the URL is checked here.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(map_redis_error)?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            script: Script::new(INCREMENT_SCRIPT),
            timeout,
        })
    }

    /// Create a store and connect to the Redis server at `url` right away.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let store = Self::new(url, timeout)?;
        store.connection().await?;
        Ok(store)
    }

    /// Whether a connection has been established.
    pub fn is_connected(&self) -> bool {
        self.connection.initialized()
    }

    /// The per-operation timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                info!(timeout_ms = self.timeout.as_millis() as u64, "Connecting to Redis counter store");
                bounded(self.timeout, ConnectionManager::new(self.client.clone())).await
            })
            .await?;
        Ok(connection.clone())
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, amount: u64, period: Duration) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let period_ms = period.as_millis().max(1) as u64;

        let mut invocation = self.script.key(key);
        invocation.arg(amount).arg(period_ms);

        let count: u64 = bounded(self.timeout, invocation.invoke_async(&mut conn)).await?;
        debug!(key = %key, count = count, "Incremented shared counter");
        Ok(count)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("PTTL");
        cmd.arg(key);

        let millis: i64 = bounded(self.timeout, cmd.query_async(&mut conn)).await?;

        // -2: no such key, -1: key without expiry
        if millis > 0 {
            Ok(Some(Duration::from_millis(millis as u64)))
        } else {
            Ok(None)
        }
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);

        let _: () = bounded(self.timeout, cmd.query_async(&mut conn)).await?;
        Ok(())
    }
}

/// Run a Redis future, failing with [`StoreError::Timeout`] once `timeout`
/// has elapsed.
async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(map_redis_error),
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "Redis operation timed out");
            Err(StoreError::Timeout(timeout))
        }
    }
}

fn map_redis_error(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        return StoreError::Unavailable(e.to_string());
    }

    match e.kind() {
        ErrorKind::TypeError | ErrorKind::ResponseError => StoreError::Protocol(e.to_string()),
        ErrorKind::InvalidClientConfig => StoreError::Unavailable(format!("invalid redis url: {}", e)),
        _ => StoreError::Unavailable(e.to_string()),
    }
}
