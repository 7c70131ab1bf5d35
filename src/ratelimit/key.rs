//! Limiter key derivation.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::quota::{Quota, Scope};

/// The inputs a limiter key is derived from.
///
/// Rebuilt for every call; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterIdentity {
    /// Worker type name
    pub worker: String,
    /// Job arguments, in call order
    pub args: Vec<Value>,
    /// Queue the job was pulled from
    pub queue: String,
}

impl LimiterIdentity {
    pub fn new(worker: impl Into<String>, args: Vec<Value>, queue: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            args,
            queue: queue.into(),
        }
    }
}

/// A store key identifying one counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterKey(String);

impl LimiterKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LimiterKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derives [`LimiterKey`]s from identities and quotas.
///
/// Keys look like `{prefix}:{namespace}:{digest}`. The namespace is the
/// quota's custom key or the worker type and is only there to keep keys
/// readable; uniqueness comes from the SHA-256 digest of the scoping tuple.
/// Every field is length-prefixed before hashing so that no two tuples
/// encode to the same bytes.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Derive the key for `identity` under `quota`'s scoping policy.
    pub fn build(&self, identity: &LimiterIdentity, quota: &Quota) -> LimiterKey {
        let namespace = quota.key().unwrap_or(identity.worker.as_str());
        let scope = quota.scope();

        let mut hasher = Sha256::new();
        write_field(&mut hasher, scope.as_str().as_bytes());
        write_field(&mut hasher, namespace.as_bytes());
        write_field(&mut hasher, &(quota.period().as_millis() as u64).to_be_bytes());

        match scope {
            Scope::Worker => {}
            Scope::Queue => {
                write_field(&mut hasher, identity.queue.as_bytes());
            }
            Scope::Arguments => {
                write_field(&mut hasher, identity.queue.as_bytes());
                write_field(&mut hasher, canonical_args(&identity.args).as_bytes());
            }
        }

        LimiterKey(format!("{}:{}:{:x}", self.prefix, namespace, hasher.finalize()))
    }
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new("throttler")
    }
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// JSON rendering of the argument list. Object keys come out sorted, so
/// equal arguments always render identically.
fn canonical_args(args: &[Value]) -> String {
    Value::Array(args.to_vec()).to_string()
}
