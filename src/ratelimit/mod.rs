//! Rate limiting logic: quotas, key derivation and the decision engine.

mod key;
mod limiter;
mod quota;

pub use key::{KeyBuilder, LimiterIdentity, LimiterKey};
pub use limiter::{RateLimiter, Verdict};
pub use quota::{Quota, QuotaRegistry, QuotaRule, Scope, TimeUnit};
