//! Error types surfaced to callers of a guarded operation.
use crate::fallback::FallbackError;
use crate::key::OperationKey;
use crate::rate_limit::store::StoreError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Boxed error used at dynamic seams (fallback handlers, store backends).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared, cloneable error used as the `cause` of a denial.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Default message for rate-limit denials.
pub const RATE_LIMITED_MESSAGE: &str = "Too many requests, please try again later";

/// Default message for circuit-open denials.
pub const CIRCUIT_OPEN_MESSAGE: &str = "Service temporarily unavailable, please try again later";

/// Unified error returned by [`Guard::call`](crate::Guard::call).
///
/// Two admission denials plus the protected operation's own error, passed through
/// untouched in `Inner`.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The fixed-window counter denied admission and no fallback produced a value.
    RateLimited {
        /// Operation that was denied.
        key: OperationKey,
        /// Human-readable message.
        message: String,
        /// Why the fallback could not answer, or why the store could not be consulted.
        cause: Option<SharedError>,
    },
    /// The circuit breaker for this operation is open.
    CircuitOpen {
        /// Operation that was rejected.
        key: OperationKey,
        /// Human-readable message.
        message: String,
        /// Failures recorded in the window that tripped the breaker.
        failure_count: u64,
        /// Time left before the breaker admits probe calls.
        retry_after: Duration,
    },
    /// The underlying operation failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { key, message, cause } => match cause {
                Some(cause) => write!(f, "{} ({}; cause: {})", message, key, cause),
                None => write!(f, "{} ({})", message, key),
            },
            Self::CircuitOpen { key, message, failure_count, retry_after } => write!(
                f,
                "{} ({}; circuit open after {} failures, retry in {:?})",
                message, key, failure_count, retry_after
            ),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RateLimited { cause, .. } => {
                cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
            }
            Self::CircuitOpen { .. } => None,
        }
    }
}

impl<E> ResilienceError<E> {
    pub(crate) fn rate_limited(key: OperationKey, cause: Option<SharedError>) -> Self {
        Self::RateLimited { key, message: RATE_LIMITED_MESSAGE.to_string(), cause }
    }

    pub(crate) fn circuit_open(key: OperationKey, failure_count: u64, retry_after: Duration) -> Self {
        Self::CircuitOpen {
            key,
            message: CIRCUIT_OPEN_MESSAGE.to_string(),
            failure_count,
            retry_after,
        }
    }

    /// Check if admission was denied by the rate limiter.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Check if admission was denied by the circuit breaker.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an Inner variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Operation the denial refers to; `None` for inner errors.
    pub fn key(&self) -> Option<&OperationKey> {
        match self {
            Self::RateLimited { key, .. } | Self::CircuitOpen { key, .. } => Some(key),
            Self::Inner(_) => None,
        }
    }

    /// Denial message; `None` for inner errors.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::RateLimited { message, .. } | Self::CircuitOpen { message, .. } => Some(message),
            Self::Inner(_) => None,
        }
    }

    /// Stable machine-readable code for denials, for transport layers to map onto their
    /// own status codes.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::RateLimited { .. } => Some("TOO_MANY_REQUESTS"),
            Self::CircuitOpen { .. } => Some("CIRCUIT_BREAKER_OPEN"),
            Self::Inner(_) => None,
        }
    }

    /// Cause attached to a rate-limit denial.
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::RateLimited { cause, .. } => cause.as_deref(),
            _ => None,
        }
    }

    /// The fallback failure behind a rate-limit denial, if that is what happened.
    pub fn fallback_error(&self) -> Option<&FallbackError> {
        self.cause().and_then(|c| c.downcast_ref::<FallbackError>())
    }

    /// The store failure behind a fail-closed denial, if that is what happened.
    pub fn store_error(&self) -> Option<&StoreError> {
        self.cause().and_then(|c| c.downcast_ref::<StoreError>())
    }

    /// Time left before probes are admitted, for circuit-open denials.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}
