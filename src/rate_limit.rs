//! Distributed fixed-window rate limiting.
//!
//! - [`FixedWindowLimiter`]: decides allow/deny per key per window.
//! - [`CounterStore`](store::CounterStore): the one atomic operation the limiter needs
//!   from a shared store; in-memory and Redis (feature `redis`) backends are provided.
//! - [`Decision`]: the result of a limiter check.
//!
//! # Architecture
//!
//! The limiter never reads a counter and writes it back. Every check is a single
//! `increment_and_maybe_expire` round-trip, bounded by a timeout; when the store fails
//! the configured [`StoreFailurePolicy`] decides the outcome.

use std::time::Duration;

pub mod fixed_window;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;

pub use fixed_window::FixedWindowLimiter;
#[cfg(feature = "redis")]
pub use redis_store::RedisCounterStore;
pub use store::{CounterStore, InMemoryCounterStore, StoreError};

/// Prefix prepended to every counter key unless configured otherwise.
pub const DEFAULT_KEY_PREFIX: &str = "rate:limit:";

/// Errors produced when validating rate-limit configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitConfigError {
    /// Window must be at least one second.
    #[error("window_seconds must be > 0")]
    ZeroWindow,
    /// Store timeout must be non-zero.
    #[error("store timeout must be > 0")]
    ZeroStoreTimeout,
    /// A non-empty key prefix must end with ':'.
    #[error("key prefix {0:?} must be empty or end with ':'")]
    InvalidKeyPrefix(String),
}

/// Per-operation limit: at most `limit` admissions per fixed `window`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    key_prefix: String,
    limit: u64,
    window: Duration,
}

impl RateLimitConfig {
    /// Create a config with validation. `limit == 0` is accepted and denies every call.
    ///
    /// A non-empty `key_prefix` must end with ':' so it stays separate from the
    /// operation identity that follows it.
    pub fn new(
        key_prefix: impl Into<String>,
        limit: u64,
        window_seconds: u64,
    ) -> Result<Self, RateLimitConfigError> {
        if window_seconds == 0 {
            return Err(RateLimitConfigError::ZeroWindow);
        }
        let key_prefix = key_prefix.into();
        if !key_prefix.is_empty() && !key_prefix.ends_with(':') {
            return Err(RateLimitConfigError::InvalidKeyPrefix(key_prefix));
        }
        Ok(Self {
            key_prefix,
            limit,
            window: Duration::from_secs(window_seconds),
        })
    }

    /// `limit` calls per `window_seconds`, default key prefix.
    pub fn per_window(limit: u64, window_seconds: u64) -> Result<Self, RateLimitConfigError> {
        Self::new(DEFAULT_KEY_PREFIX, limit, window_seconds)
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { key_prefix: DEFAULT_KEY_PREFIX.to_string(), limit: 10, window: Duration::from_secs(60) }
    }
}

/// What to do when the counter store cannot be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreFailurePolicy {
    /// Deny the call.
    #[default]
    FailClosed,
    /// Admit the call without counting it.
    FailOpen,
}

/// Why the limiter denied a call.
#[derive(Debug, Clone)]
pub enum DenyReason {
    /// The counter passed the limit for the current window.
    LimitExceeded {
        /// Counter value after this call's increment.
        count: u64,
        /// Configured limit.
        limit: u64,
    },
    /// The operation is configured with a limit of zero.
    ZeroLimit,
    /// The store failed and the policy is [`StoreFailurePolicy::FailClosed`].
    StoreUnavailable(StoreError),
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::LimitExceeded { count, limit } => {
                write!(f, "limit exceeded ({count}/{limit})")
            }
            DenyReason::ZeroLimit => write!(f, "limit is zero"),
            DenyReason::StoreUnavailable(err) => write!(f, "store unavailable: {err}"),
        }
    }
}

/// The decision returned by the rate limiter.
#[derive(Debug, Clone)]
pub enum Decision {
    /// The call may proceed.
    Allowed {
        /// Admissions left in this window; `None` when the store failed open and the
        /// call was not counted.
        remaining: Option<u64>,
    },
    /// The call is denied.
    Denied {
        /// Why.
        reason: DenyReason,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}
