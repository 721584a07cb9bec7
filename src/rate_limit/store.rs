use crate::clock::{Clock, MonotonicClock};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Failure talking to the shared counter store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store did not answer within the configured timeout.
    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),
    /// The backend reported an error.
    #[error("counter store unavailable: {0}")]
    Backend(#[source] Arc<dyn std::error::Error + Send + Sync>),
    /// The backend answered with something that is not a counter value.
    #[error("counter store returned an unexpected reply: {0}")]
    Protocol(String),
}

impl StoreError {
    /// Wrap any backend error.
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Backend(Arc::new(err))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::backend(err)
    }
}

/// Shared counter store holding one integer per rate-limit key.
///
/// The single operation must be indivisible: increment the counter for `key` and, when
/// the incremented value is 1 (the first hit of a fresh window), set its expiry to
/// `window` in the same step. A get-then-set sequence is racy and does not satisfy this
/// contract.
#[async_trait]
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Returns the counter value after the increment.
    async fn increment_and_maybe_expire(&self, key: &str, window: Duration)
        -> Result<u64, StoreError>;
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    expires_at_millis: u64,
}

/// Process-local counter store.
///
/// Each key lives in its own `DashMap` shard entry; the entry lock makes the
/// increment-and-expire step atomic for concurrent callers in this process. Use a
/// shared backend (see `RedisCounterStore`) when several processes must agree.
#[derive(Debug, Clone)]
pub struct InMemoryCounterStore {
    counters: Arc<DashMap<String, Counter>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::default())
    }

    /// Drive expiry from a custom clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self { counters: Arc::new(DashMap::new()), clock: Arc::new(clock) }
    }

    /// Number of live or not-yet-purged counters.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Drop every counter whose window has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.counters.len();
        self.counters.retain(|_, counter| counter.expires_at_millis > now);
        before.saturating_sub(self.counters.len())
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment_and_maybe_expire(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let ttl = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);

        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert(Counter { count: 0, expires_at_millis: 0 });

        if entry.expires_at_millis <= now {
            entry.count = 0;
        }
        entry.count += 1;
        if entry.count == 1 {
            entry.expires_at_millis = now.saturating_add(ttl);
        }
        Ok(entry.count)
    }
}
