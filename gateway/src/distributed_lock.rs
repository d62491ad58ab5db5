//! Advisory distributed lock.
//!
//! A lock is a store string holding the owner's token, set only if absent
//! and always with a TTL. Release compares the token before deleting, so an
//! expired holder can never free a lock someone else has since taken.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::store::{call_with_retry, EdgeStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Lock {0} is held by another owner")]
    Contended(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn EdgeStore>,
    timeout: Duration,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn EdgeStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub async fn acquire(
        &self,
        lock_key: &str,
        owner_token: &str,
        ttl_secs: u64,
    ) -> Result<bool, StoreError> {
        call_with_retry("lock_acquire", self.timeout, || {
            self.store.acquire_lock(lock_key, owner_token, ttl_secs)
        })
        .await
    }

    pub async fn release(&self, lock_key: &str, owner_token: &str) -> Result<bool, StoreError> {
        call_with_retry("lock_release", self.timeout, || {
            self.store.release_lock(lock_key, owner_token)
        })
        .await
    }

    /// Run `task` while holding `lock_key` under a fresh owner token.
    ///
    /// The lock is released whether or not `task` succeeds. A task that runs
    /// longer than `ttl_secs` loses exclusivity.
    pub async fn with_lock<F, T>(&self, lock_key: &str, ttl_secs: u64, task: F) -> Result<T, LockError>
    where
        F: Future<Output = T>,
    {
        let token = uuid::Uuid::new_v4().to_string();
        if !self.acquire(lock_key, &token, ttl_secs).await? {
            return Err(LockError::Contended(lock_key.to_string()));
        }

        let output = task.await;

        match self.release(lock_key, &token).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(lock = %lock_key, ttl_secs, "Lock expired before release");
            }
            Err(e) => {
                tracing::warn!(lock = %lock_key, error = %e, "Failed to release lock");
            }
        }
        Ok(output)
    }
}
