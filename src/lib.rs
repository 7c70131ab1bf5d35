//! Throttler - Rate Limiting Middleware for Background Jobs
//!
//! This crate gates the execution of jobs against per-worker quotas. Each
//! call atomically increments a counter in a pluggable store (in-process or
//! Redis) and either runs the job or defers it until the current window
//! resets, so several worker processes can share one quota.

pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod store;

pub use error::{Result, ThrottlerError};
pub use middleware::{Batch, BatchLookup, FailurePolicy, Job, Outcome, Scheduler, Throttler};
pub use ratelimit::{KeyBuilder, LimiterIdentity, LimiterKey, Quota, QuotaRegistry, RateLimiter, Scope, Verdict};
pub use store::{CounterStore, MemoryStore, RedisStore, StoreError};
