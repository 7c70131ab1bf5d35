//! Job middleware: routes each job to run now or to run later.

mod job;
mod service;

pub use job::{Batch, BatchLookup, BoxError, Job, Scheduler};
pub use service::{FailurePolicy, Outcome, Throttler};
