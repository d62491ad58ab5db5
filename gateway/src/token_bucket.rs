//! Token-bucket rate limiting against the shared store.

use std::sync::Arc;
use std::time::Duration;

use crate::store::{call_with_retry, now_millis, BucketOutcome, EdgeStore, StoreError};

/// Bucket state as kept by the in-memory backend. The Redis backend keeps the
/// same two fields in a hash and runs the same arithmetic in Lua.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BucketState {
    pub tokens: i64,
    pub last_refill_ms: i64,
}

/// One check-and-consume step. A missing bucket starts full.
pub(crate) fn refill_and_take(
    state: Option<BucketState>,
    replenish_rate: u32,
    burst_capacity: u32,
    now_ms: i64,
) -> (BucketState, BucketOutcome) {
    let burst = i64::from(burst_capacity);
    let state = state.unwrap_or(BucketState {
        tokens: burst,
        last_refill_ms: now_ms,
    });

    // Clamped so a replica with a lagging clock never drains the bucket.
    let elapsed = (now_ms - state.last_refill_ms).max(0);
    let refill = elapsed.saturating_mul(i64::from(replenish_rate)) / 1000;
    let mut tokens = state.tokens.saturating_add(refill).min(burst);

    let allowed = tokens >= 1;
    if allowed {
        tokens -= 1;
    }

    (
        BucketState {
            tokens,
            last_refill_ms: now_ms,
        },
        BucketOutcome {
            allowed,
            remaining_tokens: tokens,
        },
    )
}

/// Idle lifetime of a bucket: long enough to refill completely, plus one second.
pub(crate) fn bucket_ttl_secs(replenish_rate: u32, burst_capacity: u32) -> u64 {
    let burst = u64::from(burst_capacity);
    if replenish_rate == 0 {
        return burst + 1;
    }
    burst.div_ceil(u64::from(replenish_rate)) + 1
}

#[derive(Clone)]
pub struct TokenBucketLimiter {
    store: Arc<dyn EdgeStore>,
    timeout: Duration,
}

impl TokenBucketLimiter {
    pub fn new(store: Arc<dyn EdgeStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub async fn try_consume(
        &self,
        key: &str,
        replenish_rate: u32,
        burst_capacity: u32,
    ) -> Result<BucketOutcome, StoreError> {
        self.try_consume_at(key, replenish_rate, burst_capacity, now_millis())
            .await
    }

    pub async fn try_consume_at(
        &self,
        key: &str,
        replenish_rate: u32,
        burst_capacity: u32,
        now_ms: i64,
    ) -> Result<BucketOutcome, StoreError> {
        call_with_retry("token_bucket", self.timeout, || {
            self.store
                .consume_token(key, replenish_rate, burst_capacity, now_ms)
        })
        .await
    }
}
