//! In-process edge store for single-instance deployments and tests.
//!
//! All state sits behind one async mutex, so each operation is as atomic as
//! its Lua counterpart. State is lost on restart and is not shared between
//! replicas; production mode refuses to start with this backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::blacklist::BlacklistEntry;
use crate::store::{BucketOutcome, EdgeStore, StoreError, WindowOutcome};
use crate::token_bucket::{bucket_ttl_secs, refill_and_take, BucketState};

/// Expired entries are swept once a map grows past this size.
const PRUNE_THRESHOLD: usize = 10_000;

struct StoredBucket {
    state: BucketState,
    expires_at_ms: i64,
}

struct StoredWindow {
    /// `(score_ms, member)` pairs.
    members: Vec<(i64, String)>,
    expires_at_ms: i64,
}

struct StoredEntry {
    entry: BlacklistEntry,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

struct StoredLock {
    owner: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    buckets: HashMap<String, StoredBucket>,
    windows: HashMap<String, StoredWindow>,
    blacklist: HashMap<String, StoredEntry>,
    locks: HashMap<String, StoredLock>,
}

impl Inner {
    fn prune(&mut self, now_ms: i64, now: Instant) {
        if self.buckets.len() > PRUNE_THRESHOLD {
            self.buckets.retain(|_, b| b.expires_at_ms > now_ms);
        }
        if self.windows.len() > PRUNE_THRESHOLD {
            self.windows.retain(|_, w| w.expires_at_ms > now_ms);
        }
        if self.blacklist.len() > PRUNE_THRESHOLD {
            self.blacklist.retain(|_, e| e.is_live(now));
        }
        if self.locks.len() > PRUNE_THRESHOLD {
            self.locks.retain(|_, l| l.expires_at > now);
        }
    }

    fn live_entry(&mut self, key: &str, now: Instant) -> Option<&StoredEntry> {
        if self.blacklist.get(key).is_some_and(|e| !e.is_live(now)) {
            self.blacklist.remove(key);
        }
        self.blacklist.get(key)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EdgeStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn consume_token(
        &self,
        key: &str,
        replenish_rate: u32,
        burst_capacity: u32,
        now_ms: i64,
    ) -> Result<BucketOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.prune(now_ms, Instant::now());

        let previous = inner
            .buckets
            .get(key)
            .filter(|b| b.expires_at_ms > now_ms)
            .map(|b| b.state);
        let (state, outcome) = refill_and_take(previous, replenish_rate, burst_capacity, now_ms);

        let ttl_ms = bucket_ttl_secs(replenish_rate, burst_capacity) as i64 * 1000;
        inner.buckets.insert(
            key.to_string(),
            StoredBucket {
                state,
                expires_at_ms: now_ms + ttl_ms,
            },
        );
        Ok(outcome)
    }

    async fn admit_in_window(
        &self,
        key: &str,
        window_secs: u64,
        limit: u64,
        now_ms: i64,
        member: &str,
    ) -> Result<WindowOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.prune(now_ms, Instant::now());

        let window_ms = window_secs as i64 * 1000;
        let window = inner
            .windows
            .entry(key.to_string())
            .or_insert_with(|| StoredWindow {
                members: Vec::new(),
                expires_at_ms: now_ms,
            });
        if window.expires_at_ms <= now_ms {
            window.members.clear();
        }

        let floor = now_ms - window_ms;
        window.members.retain(|(score, _)| *score > floor);

        let count = window.members.len() as u64;
        if count < limit {
            window.members.retain(|(_, m)| m != member);
            window.members.push((now_ms, member.to_string()));
            window.expires_at_ms = now_ms + window_ms + 1000;
            Ok(WindowOutcome {
                admitted: true,
                count: window.members.len() as u64,
            })
        } else {
            Ok(WindowOutcome {
                admitted: false,
                count,
            })
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.live_entry(key, Instant::now()).is_some())
    }

    async fn put_blacklist_entry(
        &self,
        key: &str,
        entry: &BlacklistEntry,
        ttl_secs: i64,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.prune(crate::store::now_millis(), now);

        let expires_at = (ttl_secs > 0).then(|| now + Duration::from_secs(ttl_secs as u64));
        inner.blacklist.insert(
            key.to_string(),
            StoredEntry {
                entry: entry.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get_blacklist_entry(&self, key: &str) -> Result<Option<BlacklistEntry>, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        Ok(inner.live_entry(key, now).map(|stored| {
            let mut entry = stored.entry.clone();
            entry.ttl_secs = stored
                .expires_at
                .map(|at| at.saturating_duration_since(now).as_secs() as i64);
            entry
        }))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let removed_entry = inner
            .blacklist
            .remove(key)
            .is_some_and(|e| e.is_live(now));
        let removed_lock = inner
            .locks
            .remove(key)
            .is_some_and(|l| l.expires_at > now);
        let removed_bucket = inner.buckets.remove(key).is_some();
        let removed_window = inner.windows.remove(key).is_some();

        Ok(removed_entry || removed_lock || removed_bucket || removed_window)
    }

    async fn acquire_lock(
        &self,
        key: &str,
        owner: &str,
        ttl_secs: u64,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.prune(crate::store::now_millis(), now);

        if inner.locks.get(key).is_some_and(|l| l.expires_at > now) {
            return Ok(false);
        }
        inner.locks.insert(
            key.to_string(),
            StoredLock {
                owner: owner.to_string(),
                expires_at: now + Duration::from_secs(ttl_secs),
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let owned = inner
            .locks
            .get(key)
            .is_some_and(|l| l.expires_at > now && l.owner == owner);
        if owned {
            inner.locks.remove(key);
        }
        Ok(owned)
    }

    async fn ping(&self) -> Result<bool, StoreError> {
        Ok(true)
    }
}
