//! Distributed IP and user blacklist.
//!
//! Entries live in the shared store as `blacklist:{scope}:{id}` hashes. The
//! request path only checks for existence; entries are written and removed
//! through the admin endpoints.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::store::{call_with_retry, EdgeStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlacklistScope {
    Ip,
    User,
}

impl BlacklistScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlacklistScope::Ip => "ip",
            BlacklistScope::User => "user",
        }
    }
}

impl fmt::Display for BlacklistScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlacklistScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ip" => Ok(BlacklistScope::Ip),
            "user" => Ok(BlacklistScope::User),
            other => Err(format!("unknown blacklist scope '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlacklistEntry {
    pub reason: String,
    pub created_at: DateTime<Utc>,
    /// Seconds until the entry expires; `None` when permanent.
    pub ttl_secs: Option<i64>,
}

pub fn blacklist_key(scope: BlacklistScope, id: &str) -> String {
    format!("blacklist:{}:{}", scope, id)
}

#[derive(Clone)]
pub struct BlacklistGate {
    store: Arc<dyn EdgeStore>,
    timeout: Duration,
}

impl BlacklistGate {
    pub fn new(store: Arc<dyn EdgeStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub async fn is_blacklisted(&self, scope: BlacklistScope, id: &str) -> Result<bool, StoreError> {
        let key = blacklist_key(scope, id);
        call_with_retry("blacklist_check", self.timeout, || self.store.exists(&key)).await
    }

    /// Add or overwrite an entry. `ttl_secs <= 0` makes it permanent.
    pub async fn add(
        &self,
        scope: BlacklistScope,
        id: &str,
        reason: &str,
        ttl_secs: i64,
    ) -> Result<(), StoreError> {
        let key = blacklist_key(scope, id);
        let entry = BlacklistEntry {
            reason: reason.to_string(),
            created_at: Utc::now(),
            ttl_secs: (ttl_secs > 0).then_some(ttl_secs),
        };

        call_with_retry("blacklist_add", self.timeout, || {
            self.store.put_blacklist_entry(&key, &entry, ttl_secs)
        })
        .await?;

        tracing::info!(scope = %scope, id = %id, ttl_secs, "Blacklist entry added");
        Ok(())
    }

    /// Returns whether an entry existed.
    pub async fn remove(&self, scope: BlacklistScope, id: &str) -> Result<bool, StoreError> {
        let key = blacklist_key(scope, id);
        let removed =
            call_with_retry("blacklist_remove", self.timeout, || self.store.delete(&key)).await?;

        if removed {
            tracing::info!(scope = %scope, id = %id, "Blacklist entry removed");
        }
        Ok(removed)
    }

    pub async fn entry(
        &self,
        scope: BlacklistScope,
        id: &str,
    ) -> Result<Option<BlacklistEntry>, StoreError> {
        let key = blacklist_key(scope, id);
        call_with_retry("blacklist_get", self.timeout, || {
            self.store.get_blacklist_entry(&key)
        })
        .await
    }
}
