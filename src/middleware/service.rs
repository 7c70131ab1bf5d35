//! The throttling middleware.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::job::{BatchLookup, Job, Scheduler};
use crate::config::ThrottlerConfig;
use crate::error::{Result, ThrottlerError};
use crate::ratelimit::{KeyBuilder, LimiterIdentity, Quota, QuotaRegistry, RateLimiter, Verdict};
use crate::store;

/// What to do when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Run the job as if it were within bounds.
    #[default]
    Open,
    /// Defer the job for one full quota period.
    Closed,
    /// Return the store error to the caller.
    Raise,
}

/// What happened to a job passed through the throttler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The job ran and produced a value.
    Performed(T),
    /// The job was handed back to the scheduler.
    Deferred {
        /// How long until the retry runs
        delay: Duration,
        /// Identifier of the rescheduled job
        jid: String,
    },
}

impl<T> Outcome<T> {
    pub fn is_performed(&self) -> bool {
        matches!(self, Outcome::Performed(_))
    }
}

/// Job middleware that runs or defers each job according to its worker's quota.
///
/// Every call is decided from scratch; retries come back through
/// [`Throttler::call`] and may be deferred again.
pub struct Throttler {
    limiter: RateLimiter,
    quotas: QuotaRegistry,
    policy: FailurePolicy,
    scheduler: Arc<dyn Scheduler>,
    batches: Option<Arc<dyn BatchLookup>>,
}

impl std::fmt::Debug for Throttler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttler")
            .field("limiter", &self.limiter)
            .field("quotas", &self.quotas)
            .field("policy", &self.policy)
            .finish()
    }
}

impl Throttler {
    /// Create a throttler.
    pub fn new(
        limiter: RateLimiter,
        quotas: QuotaRegistry,
        policy: FailurePolicy,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            limiter,
            quotas,
            policy,
            scheduler,
            batches: None,
        }
    }

    /// Build a throttler from configuration: set up the store and load the
    /// quota rules. Fails if either is invalid.
    ///
    /// A Redis store is not contacted until the first call, so an outage at
    /// startup is handled by the failure policy like any other.
    pub async fn from_config(config: &ThrottlerConfig, scheduler: Arc<dyn Scheduler>) -> Result<Self> {
        config.validate()?;
        let quotas = config.load_quotas()?;
        let store = store::connect(&config.storage).await?;
        let limiter = RateLimiter::with_key_builder(store, KeyBuilder::new(config.key_prefix.clone()));

        info!(
            quotas = quotas.len(),
            failure_policy = ?config.failure_policy,
            "Throttler initialized"
        );

        Ok(Self::new(limiter, quotas, config.failure_policy, scheduler))
    }

    /// Resolve batches through `lookup` when deferring batched jobs.
    pub fn with_batch_lookup(mut self, lookup: Arc<dyn BatchLookup>) -> Self {
        self.batches = Some(lookup);
        self
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn quotas(&self) -> &QuotaRegistry {
        &self.quotas
    }

    /// Run `work` for `job` if its worker's quota allows, otherwise
    /// reschedule the job for when the quota window resets.
    ///
    /// Errors from `work` are returned unchanged. Jobs whose worker has no
    /// quota always run.
    #[instrument(
        skip(self, job, queue, work),
        fields(worker = %job.class, jid = %job.jid, queue = %queue)
    )]
    pub async fn call<F, Fut, T, E>(&self, job: &Job, queue: &str, work: F) -> std::result::Result<Outcome<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<ThrottlerError>,
    {
        let quota = match self.quotas.get(&job.class) {
            Some(quota) => quota,
            None => return work().await.map(Outcome::Performed),
        };

        let identity = job.identity(queue);

        match self.decide(&identity, quota).await? {
            Verdict::WithinBounds { .. } => work().await.map(Outcome::Performed),
            Verdict::Exceeded { delay, .. } => {
                let jid = self.defer(job, delay).await?;
                Ok(Outcome::Deferred { delay, jid })
            }
        }
    }

    /// Ask the limiter, applying the failure policy to store errors.
    async fn decide(&self, identity: &LimiterIdentity, quota: &Quota) -> Result<Verdict> {
        match self.limiter.check(identity, quota).await {
            Err(ThrottlerError::StoreUnavailable(e)) => match self.policy {
                FailurePolicy::Open => {
                    warn!(error = %e, "Counter store unavailable, letting job through");
                    Ok(Verdict::WithinBounds { count: 0 })
                }
                FailurePolicy::Closed => {
                    warn!(error = %e, "Counter store unavailable, deferring job");
                    Ok(Verdict::Exceeded {
                        count: 0,
                        delay: quota.period(),
                    })
                }
                FailurePolicy::Raise => Err(ThrottlerError::StoreUnavailable(e)),
            },
            other => other,
        }
    }

    /// Hand a copy of `job` to the scheduler, attributed to its batch if the
    /// batch can still be found. Returns the new job identifier.
    async fn defer(&self, job: &Job, delay: Duration) -> Result<String> {
        let batch = match (&self.batches, &job.bid) {
            (Some(lookup), Some(bid)) => {
                let batch = lookup.find(bid).await;
                if batch.is_none() {
                    debug!(bid = %bid, "Batch no longer available, rescheduling without it");
                }
                batch
            }
            _ => None,
        };

        let retry = job.retry();
        let jid = retry.jid.clone();

        debug!(
            delay_ms = delay.as_millis() as u64,
            retry_jid = %jid,
            batch = ?batch.as_ref().map(|b| &b.id),
            "Deferring throttled job"
        );

        self.scheduler
            .perform_in(delay, retry, batch)
            .await
            .map_err(|e| ThrottlerError::Reschedule(e.to_string()))?;

        Ok(jid)
    }
}
