//! Job messages and the hooks into the surrounding job framework.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ratelimit::LimiterIdentity;

/// Boxed error returned by framework hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A unit of work as handed to the middleware by the job framework.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Worker type that performs the job
    pub class: String,
    /// Arguments passed to the worker
    #[serde(default)]
    pub args: Vec<Value>,
    /// Job identifier
    pub jid: String,
    /// Identifier of the batch this job belongs to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<String>,
}

impl Job {
    /// Create a job with a fresh identifier.
    pub fn new(class: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            class: class.into(),
            args,
            jid: new_jid(),
            bid: None,
        }
    }

    /// Attribute the job to a batch.
    pub fn in_batch(mut self, bid: impl Into<String>) -> Self {
        self.bid = Some(bid.into());
        self
    }

    /// The rate limiter inputs for this job on `queue`.
    pub fn identity(&self, queue: &str) -> LimiterIdentity {
        LimiterIdentity::new(self.class.clone(), self.args.clone(), queue)
    }

    /// A copy of this job to enqueue again: same worker, arguments and
    /// batch, new identifier.
    pub fn retry(&self) -> Self {
        Self {
            jid: new_jid(),
            ..self.clone()
        }
    }
}

fn new_jid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// A live batch the retried job should be attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub id: String,
}

impl Batch {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Resolves batch identifiers to live batches.
///
/// Queried at the moment a job is deferred, never cached, because a batch
/// may only be resolvable while it is still open.
#[async_trait]
pub trait BatchLookup: Send + Sync {
    /// Find the batch with identifier `bid`, or `None` if it is gone.
    async fn find(&self, bid: &str) -> Option<Batch>;
}

/// Enqueues jobs to run later.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run `job` again after `delay`, inside `batch` when one is given.
    async fn perform_in(&self, delay: Duration, job: Job, batch: Option<Batch>) -> Result<(), BoxError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retry_keeps_args_and_batch() {
        let job = Job::new("MailerWorker", vec![json!(42), json!({"to": "a@b.c"})]).in_batch("b-1");
        let retry = job.retry();

        assert_eq!(retry.class, job.class);
        assert_eq!(retry.args, job.args);
        assert_eq!(retry.bid.as_deref(), Some("b-1"));
        assert_ne!(retry.jid, job.jid);
    }

    #[test]
    fn test_identity() {
        let job = Job::new("MailerWorker", vec![json!("x")]);
        let identity = job.identity("mail");

        assert_eq!(identity.worker, "MailerWorker");
        assert_eq!(identity.args, vec![json!("x")]);
        assert_eq!(identity.queue, "mail");
    }

    #[test]
    fn test_deserialize_message() {
        let job: Job = serde_json::from_str(r#"{"class":"W","args":[1,"two"],"jid":"abc","bid":"b9"}"#).unwrap();

        assert_eq!(job.class, "W");
        assert_eq!(job.args, vec![json!(1), json!("two")]);
        assert_eq!(job.bid.as_deref(), Some("b9"));
    }

    #[test]
    fn test_serialize_skips_missing_batch() {
        let job = Job::new("W", vec![]);
        let encoded = serde_json::to_string(&job).unwrap();
        assert!(!encoded.contains("bid"));
    }
}
