//! Sliding-window admission counter.
//!
//! Counts admissions inside the trailing window, exact to the millisecond.
//! Not part of the default request pipeline; available to callers that need
//! a hard "N per window" quota rather than a bursty bucket.

use std::sync::Arc;
use std::time::Duration;

use crate::store::{call_with_retry, now_millis, EdgeStore, StoreError, WindowOutcome};

#[derive(Clone)]
pub struct SlidingWindowLimiter {
    store: Arc<dyn EdgeStore>,
    timeout: Duration,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn EdgeStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub async fn try_admit(
        &self,
        key: &str,
        window_secs: u64,
        limit: u64,
    ) -> Result<WindowOutcome, StoreError> {
        self.try_admit_at(key, window_secs, limit, now_millis()).await
    }

    pub async fn try_admit_at(
        &self,
        key: &str,
        window_secs: u64,
        limit: u64,
        now_ms: i64,
    ) -> Result<WindowOutcome, StoreError> {
        // Unique per call so same-millisecond admissions are counted separately.
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4().simple());
        call_with_retry("sliding_window", self.timeout, || {
            self.store
                .admit_in_window(key, window_secs, limit, now_ms, &member)
        })
        .await
    }
}
