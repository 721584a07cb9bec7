use crate::rate_limit::store::{CounterStore, StoreError};
use crate::rate_limit::{Decision, DenyReason, RateLimitConfigError, StoreFailurePolicy};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on a single store round-trip unless configured otherwise.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// Fixed-window counter limiter over a shared [`CounterStore`].
///
/// Clones share the same store handle.
#[derive(Debug, Clone)]
pub struct FixedWindowLimiter {
    store: Arc<dyn CounterStore>,
    store_timeout: Duration,
    on_store_failure: StoreFailurePolicy,
}

impl FixedWindowLimiter {
    /// Limiter over `store` with a 250ms store timeout, failing closed.
    pub fn new<S: CounterStore + 'static>(store: S) -> Self {
        Self::from_shared(Arc::new(store))
    }

    /// Limiter over an already shared store.
    pub fn from_shared(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            on_store_failure: StoreFailurePolicy::default(),
        }
    }

    /// Bound every store round-trip; must be > 0.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Result<Self, RateLimitConfigError> {
        if timeout.is_zero() {
            return Err(RateLimitConfigError::ZeroStoreTimeout);
        }
        self.store_timeout = timeout;
        Ok(self)
    }

    /// Choose what happens when the store errors or times out.
    pub fn with_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.on_store_failure = policy;
        self
    }

    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    pub fn failure_policy(&self) -> StoreFailurePolicy {
        self.on_store_failure
    }

    /// Count one call against `key` and decide whether it may proceed.
    ///
    /// Allowed iff the post-increment counter is `<= limit`. A `limit` of zero denies
    /// without touching the store.
    pub async fn try_acquire(&self, key: &str, limit: u64, window: Duration) -> Decision {
        if limit == 0 {
            tracing::debug!(key, "rate limit denied: limit is zero");
            return Decision::Denied { reason: DenyReason::ZeroLimit };
        }

        let count = match self.increment(key, window).await {
            Ok(count) => count,
            Err(err) => return self.on_failure(key, err),
        };

        if count <= limit {
            Decision::Allowed { remaining: Some(limit - count) }
        } else {
            tracing::debug!(key, count, limit, "rate limit denied");
            Decision::Denied { reason: DenyReason::LimitExceeded { count, limit } }
        }
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        match tokio::time::timeout(
            self.store_timeout,
            self.store.increment_and_maybe_expire(key, window),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }

    fn on_failure(&self, key: &str, err: StoreError) -> Decision {
        match self.on_store_failure {
            StoreFailurePolicy::FailOpen => {
                tracing::warn!(key, error = %err, "counter store failed; admitting (fail-open)");
                Decision::Allowed { remaining: None }
            }
            StoreFailurePolicy::FailClosed => {
                tracing::warn!(key, error = %err, "counter store failed; denying (fail-closed)");
                Decision::Denied { reason: DenyReason::StoreUnavailable(err) }
            }
        }
    }
}
