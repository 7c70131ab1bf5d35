//! Quota rules and the per-worker quota registry.
//!
//! Rules are loaded from YAML and validated up front, so an invalid quota
//! prevents the throttler from being built at all.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, ThrottlerError};

/// How broadly a quota's counter is shared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// One counter per worker type, across all queues and arguments
    #[default]
    Worker,
    /// One counter per worker type and queue
    Queue,
    /// One counter per worker type, queue and argument list
    #[serde(alias = "args", alias = "argument_set")]
    Arguments,
}

impl Scope {
    /// Stable tag folded into limiter keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Worker => "worker",
            Scope::Queue => "queue",
            Scope::Arguments => "arguments",
        }
    }
}

/// A validated quota: at most `limit` units per `period`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quota {
    limit: u64,
    period: Duration,
    per: Scope,
    cost: u64,
    key: Option<String>,
    name: Option<String>,
}

impl Quota {
    /// Create a quota allowing `limit` calls per `period`, one counter per worker type.
    pub fn new(limit: u64, period: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(ThrottlerError::Config("quota limit must be positive".to_string()));
        }
        if period.is_zero() {
            return Err(ThrottlerError::Config("quota period must be positive".to_string()));
        }

        Ok(Self {
            limit,
            period,
            per: Scope::Worker,
            cost: 1,
            key: None,
            name: None,
        })
    }

    /// Set how the counter is scoped.
    pub fn per(mut self, per: Scope) -> Self {
        self.per = per;
        self
    }

    /// Set how many units each call consumes.
    ///
    /// The cost may not exceed the limit, or no call could ever fit in a window.
    pub fn with_cost(mut self, cost: u64) -> Result<Self> {
        if cost == 0 {
            return Err(ThrottlerError::Config("quota cost must be positive".to_string()));
        }
        if cost > self.limit {
            return Err(ThrottlerError::Config(format!(
                "quota cost {} exceeds limit {}",
                cost, self.limit
            )));
        }
        self.cost = cost;
        Ok(self)
    }

    /// Count against a custom namespace instead of the worker type, letting
    /// several worker types share one counter.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn scope(&self) -> Scope {
        self.per
    }

    pub fn cost(&self) -> u64 {
        self.cost
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// Time unit for quota periods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[default]
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// A quota as written in the rules file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaRule {
    /// Calls allowed per period
    pub limit: u64,
    /// Period length, counted in `unit`s
    pub period: u64,
    #[serde(default)]
    pub unit: TimeUnit,
    #[serde(default)]
    pub per: Scope,
    #[serde(default = "default_cost")]
    pub cost: u64,
    /// Optional shared counter namespace
    #[serde(default)]
    pub key: Option<String>,
    /// Optional name/description for this quota
    #[serde(default)]
    pub name: Option<String>,
}

fn default_cost() -> u64 {
    1
}

impl QuotaRule {
    /// Validate the rule and turn it into a [`Quota`].
    pub fn to_quota(&self) -> Result<Quota> {
        let period = u32::try_from(self.period)
            .ok()
            .and_then(|n| self.unit.duration().checked_mul(n))
            .ok_or_else(|| ThrottlerError::Config(format!("quota period {} is too large", self.period)))?;

        let mut quota = Quota::new(self.limit, period)?
            .per(self.per)
            .with_cost(self.cost)?;
        if let Some(key) = &self.key {
            quota = quota.with_key(key.clone());
        }
        if let Some(name) = &self.name {
            quota = quota.with_name(name.clone());
        }
        Ok(quota)
    }
}

/// The rules file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QuotaFile {
    #[serde(default)]
    workers: HashMap<String, QuotaRule>,
}

/// Mapping from worker type to its quota.
///
/// Built once during setup and handed to the throttler; read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct QuotaRegistry {
    quotas: HashMap<String, Quota>,
}

impl QuotaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading quota rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: QuotaFile = serde_yaml::from_str(yaml)
            .map_err(|e| ThrottlerError::Config(format!("Failed to parse quota rules: {}", e)))?;

        let mut registry = Self::new();
        for (worker, rule) in file.workers {
            let quota = rule
                .to_quota()
                .map_err(|e| ThrottlerError::Config(format!("worker {}: {}", worker, e)))?;
            registry.insert(worker, quota);
        }
        Ok(registry)
    }

    /// Register (or replace) the quota for a worker type.
    pub fn insert(&mut self, worker: impl Into<String>, quota: Quota) -> &mut Self {
        self.quotas.insert(worker.into(), quota);
        self
    }

    /// Get the quota for a worker type.
    pub fn get(&self, worker: &str) -> Option<&Quota> {
        self.quotas.get(worker)
    }

    pub fn len(&self) -> usize {
        self.quotas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotas.is_empty()
    }

    /// Iterate over registered workers and quotas, sorted by worker name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Quota)> {
        let mut entries: Vec<_> = self.quotas.iter().map(|(w, q)| (w.as_str(), q)).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter()
    }
}
