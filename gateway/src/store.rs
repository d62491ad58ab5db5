//! Shared edge-state store.
//!
//! Every replica of the gateway talks to the same store; it is the single
//! source of truth for token buckets, sliding windows, blacklist entries and
//! locks. Each operation is one atomic unit on the backend side.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::blacklist::BlacklistEntry;
use crate::metrics;

/// Attempts per store call: the first try plus one immediate retry.
const MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Store connection error: {0}")]
    Connection(String),
    #[error("Store script error: {0}")]
    Script(String),
    #[error("Store serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Timeouts and dropped connections are worth one more try.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::Connection(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Timeout(_) => "timeout",
            StoreError::Connection(_) => "connection",
            StoreError::Script(_) => "script",
            StoreError::Serialization(_) => "serialization",
        }
    }
}

/// Result of one token-bucket check-and-consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketOutcome {
    pub allowed: bool,
    pub remaining_tokens: i64,
}

/// Result of one sliding-window admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    pub admitted: bool,
    /// Entries in the window after this call.
    pub count: u64,
}

#[async_trait]
pub trait EdgeStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn consume_token(
        &self,
        key: &str,
        replenish_rate: u32,
        burst_capacity: u32,
        now_ms: i64,
    ) -> Result<BucketOutcome, StoreError>;

    async fn admit_in_window(
        &self,
        key: &str,
        window_secs: u64,
        limit: u64,
        now_ms: i64,
        member: &str,
    ) -> Result<WindowOutcome, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Write a blacklist entry; `ttl_secs <= 0` makes it permanent.
    async fn put_blacklist_entry(
        &self,
        key: &str,
        entry: &BlacklistEntry,
        ttl_secs: i64,
    ) -> Result<(), StoreError>;

    async fn get_blacklist_entry(&self, key: &str) -> Result<Option<BlacklistEntry>, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn acquire_lock(&self, key: &str, owner: &str, ttl_secs: u64)
        -> Result<bool, StoreError>;

    async fn release_lock(&self, key: &str, owner: &str) -> Result<bool, StoreError>;

    async fn ping(&self) -> Result<bool, StoreError>;
}

/// Run a store call under `timeout`, retrying a transient failure once.
pub async fn call_with_retry<T, F, Fut>(
    operation: &'static str,
    timeout: Duration,
    mut call: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(timeout)),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                tracing::debug!(operation, error = %e, "Transient store error, retrying once");
            }
            Err(e) => {
                metrics::record_store_error(operation, e.kind());
                return Err(e);
            }
        }
    }
}

/// Wall clock in epoch milliseconds, the time base of bucket and window scripts.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
