//! Core rate limit decision engine.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::key::{KeyBuilder, LimiterIdentity, LimiterKey};
use super::quota::Quota;
use crate::error::Result;
use crate::store::CounterStore;

/// The outcome of one rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The call fits within the quota and may run now.
    WithinBounds {
        /// Counter value after this call
        count: u64,
    },
    /// The quota is used up; retry after `delay`.
    Exceeded {
        /// Counter value after this call
        count: u64,
        /// Time until the current window resets, always in `(0, period]`
        delay: Duration,
    },
}

impl Verdict {
    pub fn is_within_bounds(&self) -> bool {
        matches!(self, Verdict::WithinBounds { .. })
    }

    /// The retry delay, if the quota was exceeded.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Verdict::WithinBounds { .. } => None,
            Verdict::Exceeded { delay, .. } => Some(*delay),
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            Verdict::WithinBounds { count } | Verdict::Exceeded { count, .. } => *count,
        }
    }
}

/// The rate limiter.
///
/// Holds no counters of its own: every check increments first and decides
/// after, against the shared [`CounterStore`], so concurrent callers can
/// never both slip in under the limit. An over-limit call still consumes
/// its slot.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    keys: KeyBuilder,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("keys", &self.keys)
            .finish()
    }
}

impl RateLimiter {
    /// Create a rate limiter over `store` with the default key prefix.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_key_builder(store, KeyBuilder::default())
    }

    pub fn with_key_builder(store: Arc<dyn CounterStore>, keys: KeyBuilder) -> Self {
        Self { store, keys }
    }

    /// The key `identity` is counted under for `quota`.
    pub fn key_for(&self, identity: &LimiterIdentity, quota: &Quota) -> LimiterKey {
        self.keys.build(identity, quota)
    }

    /// Record one call for `identity` and decide whether it fits `quota`.
    ///
    /// Store failures are returned as
    /// [`ThrottlerError::StoreUnavailable`](crate::ThrottlerError::StoreUnavailable);
    /// deciding what to do about them is left to the caller.
    pub async fn check(&self, identity: &LimiterIdentity, quota: &Quota) -> Result<Verdict> {
        let key = self.key_for(identity, quota);

        trace!(
            key = %key,
            worker = %identity.worker,
            queue = %identity.queue,
            cost = quota.cost(),
            "Checking rate limit"
        );

        let count = self
            .store
            .increment(key.as_str(), quota.cost(), quota.period())
            .await?;

        if count <= quota.limit() {
            return Ok(Verdict::WithinBounds { count });
        }

        let delay = self.retry_delay(&key, quota).await;

        debug!(
            key = %key,
            count = count,
            limit = quota.limit(),
            delay_ms = delay.as_millis() as u64,
            "Rate limit exceeded"
        );

        Ok(Verdict::Exceeded { count, delay })
    }

    /// Clear the counter for `identity` under `quota`.
    pub async fn reset(&self, identity: &LimiterIdentity, quota: &Quota) -> Result<()> {
        let key = self.key_for(identity, quota);
        self.store.reset(key.as_str()).await?;
        debug!(key = %key, "Rate limit counter reset");
        Ok(())
    }

    /// Remaining window time, or the full period when the record vanished
    /// between the increment and this read.
    async fn retry_delay(&self, key: &LimiterKey, quota: &Quota) -> Duration {
        let period = quota.period();

        match self.store.ttl(key.as_str()).await {
            Ok(Some(remaining)) if !remaining.is_zero() => remaining.min(period),
            Ok(_) => period,
            Err(e) => {
                warn!(key = %key, error = %e, "Could not read counter ttl, using full period");
                period
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ThrottlerError;
    use crate::ratelimit::Scope;
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use serde_json::json;

    /// Store whose every call fails.
    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn increment(&self, _: &str, _: u64, _: Duration) -> std::result::Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn ttl(&self, _: &str) -> std::result::Result<Option<Duration>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn reset(&self, _: &str) -> std::result::Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    /// Store that counts but has already forgotten the window when asked.
    struct ForgetfulStore(MemoryStore);

    #[async_trait]
    impl CounterStore for ForgetfulStore {
        async fn increment(&self, key: &str, amount: u64, period: Duration) -> std::result::Result<u64, StoreError> {
            self.0.increment(key, amount, period).await
        }

        async fn ttl(&self, _: &str) -> std::result::Result<Option<Duration>, StoreError> {
            Ok(None)
        }

        async fn reset(&self, key: &str) -> std::result::Result<(), StoreError> {
            self.0.reset(key).await
        }
    }

    fn identity() -> LimiterIdentity {
        LimiterIdentity::new("MailerWorker", vec![json!(1)], "default")
    }

    fn quota(limit: u64, secs: u64) -> Quota {
        Quota::new(limit, Duration::from_secs(secs)).unwrap()
    }

    #[tokio::test]
    async fn test_within_limit() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let q = quota(3, 60);

        for expected in 1..=3 {
            let verdict = limiter.check(&identity(), &q).await.unwrap();
            assert_eq!(verdict, Verdict::WithinBounds { count: expected });
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exceeded_delay_is_remaining_window() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let q = quota(1, 60);

        limiter.check(&identity(), &q).await.unwrap();
        tokio::time::advance(Duration::from_secs(15)).await;

        let verdict = limiter.check(&identity(), &q).await.unwrap();
        assert_eq!(
            verdict,
            Verdict::Exceeded {
                count: 2,
                delay: Duration::from_secs(45)
            }
        );
    }

    #[tokio::test]
    async fn test_missing_ttl_falls_back_to_period() {
        let limiter = RateLimiter::new(Arc::new(ForgetfulStore(MemoryStore::new())));
        let q = quota(1, 30);

        limiter.check(&identity(), &q).await.unwrap();
        let verdict = limiter.check(&identity(), &q).await.unwrap();

        assert_eq!(verdict.delay(), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_cost_consumes_multiple_units() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let q = quota(5, 60).with_cost(2).unwrap();

        assert!(limiter.check(&identity(), &q).await.unwrap().is_within_bounds());
        assert!(limiter.check(&identity(), &q).await.unwrap().is_within_bounds());

        let verdict = limiter.check(&identity(), &q).await.unwrap();
        assert!(!verdict.is_within_bounds());
        assert_eq!(verdict.count(), 6);
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let limiter = RateLimiter::new(Arc::new(DownStore));
        let result = limiter.check(&identity(), &quota(3, 60)).await;

        assert!(matches!(result, Err(ThrottlerError::StoreUnavailable(StoreError::Unavailable(_)))));
    }

    #[tokio::test]
    async fn test_reset_starts_new_window() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let q = quota(1, 60);

        limiter.check(&identity(), &q).await.unwrap();
        assert!(!limiter.check(&identity(), &q).await.unwrap().is_within_bounds());

        limiter.reset(&identity(), &q).await.unwrap();
        assert_eq!(
            limiter.check(&identity(), &q).await.unwrap(),
            Verdict::WithinBounds { count: 1 }
        );
    }

    #[tokio::test]
    async fn test_argument_scope_counts_separately() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let q = quota(1, 60).per(Scope::Arguments);

        let a = LimiterIdentity::new("W", vec![json!("a")], "default");
        let b = LimiterIdentity::new("W", vec![json!("b")], "default");

        assert!(limiter.check(&a, &q).await.unwrap().is_within_bounds());
        assert!(limiter.check(&b, &q).await.unwrap().is_within_bounds());
        assert!(!limiter.check(&a, &q).await.unwrap().is_within_bounds());
    }
}
