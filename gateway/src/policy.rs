//! Per-path rate-limit policies.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use crate::path_match::{PathPattern, PathTable};

/// What a bucket is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyStrategy {
    Ip,
    User,
    Path,
    Combined,
}

impl KeyStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStrategy::Ip => "ip",
            KeyStrategy::User => "user",
            KeyStrategy::Path => "path",
            KeyStrategy::Combined => "combined",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateLimitPolicy {
    /// `prefix/**` or an exact path.
    pub path: String,
    /// Tokens added per second.
    pub replenish_rate: u32,
    /// Bucket size.
    pub burst_capacity: u32,
    pub key_strategy: KeyStrategy,
}

impl RateLimitPolicy {
    pub fn new(path: &str, replenish_rate: u32, burst_capacity: u32, key_strategy: KeyStrategy) -> Self {
        Self {
            path: path.to_string(),
            replenish_rate,
            burst_capacity,
            key_strategy,
        }
    }

    /// The built-in table used when no policies are configured.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("/api/auth/**", 5, 10, KeyStrategy::User),
            Self::new("/api/monitoring/realtime/**", 30, 60, KeyStrategy::User),
            Self::new("/api/history/export/**", 2, 5, KeyStrategy::User),
        ]
    }

    pub fn default_fallback() -> Self {
        Self::new("/**", 10, 20, KeyStrategy::Combined)
    }
}

/// Most-specific-match lookup over the configured policies.
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    table: PathTable<RateLimitPolicy>,
    fallback: RateLimitPolicy,
}

impl PolicyResolver {
    pub fn new(policies: &[RateLimitPolicy], fallback: RateLimitPolicy) -> Self {
        let table = PathTable::new(
            policies
                .iter()
                .map(|p| (PathPattern::parse(&p.path), p.clone())),
        );
        Self { table, fallback }
    }

    /// Resolve the policy for `path`. Requests that match no configured
    /// pattern get the fallback limits, scoped to their own path.
    pub fn resolve(&self, path: &str) -> Cow<'_, RateLimitPolicy> {
        match self.table.lookup(path) {
            Some(policy) => Cow::Borrowed(policy),
            None => Cow::Owned(RateLimitPolicy {
                path: path.to_string(),
                ..self.fallback.clone()
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Default for PolicyResolver {
    fn default() -> Self {
        Self::new(&RateLimitPolicy::defaults(), RateLimitPolicy::default_fallback())
    }
}
