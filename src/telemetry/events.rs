use crate::circuit_breaker::CircuitState;
use crate::key::OperationKey;
use crate::rate_limit::StoreFailurePolicy;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Events emitted while guarding an operation.
///
/// Every event carries the [`OperationKey`] it concerns, so a single sink can
/// aggregate across operations.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    /// Circuit breaker events
    CircuitBreaker {
        /// Guarded operation
        key: OperationKey,
        /// What happened
        event: CircuitBreakerEvent,
    },
    /// Rate limiter events
    RateLimit {
        /// Guarded operation
        key: OperationKey,
        /// What happened
        event: RateLimitEvent,
    },
    /// Fallback events
    Fallback {
        /// Guarded operation
        key: OperationKey,
        /// What happened
        event: FallbackEvent,
    },
    /// Outcome of an operation that was admitted and ran to completion
    Request {
        /// Guarded operation
        key: OperationKey,
        /// How it ended
        outcome: RequestOutcome,
    },
}

impl PolicyEvent {
    /// The operation this event concerns.
    pub fn key(&self) -> &OperationKey {
        match self {
            PolicyEvent::CircuitBreaker { key, .. }
            | PolicyEvent::RateLimit { key, .. }
            | PolicyEvent::Fallback { key, .. }
            | PolicyEvent::Request { key, .. } => key,
        }
    }
}

/// Events emitted by the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    /// Circuit transitioned to open.
    ///
    /// Emitted both when the failure ratio trips a closed circuit and when a
    /// half-open probe fails.
    Opened {
        /// State the circuit left
        from: CircuitState,
        /// Failures in the window at the time of opening
        failure_count: u64,
        /// Calls in the window at the time of opening
        total_count: u64,
    },
    /// The open duration elapsed; probe calls are admitted.
    HalfOpen,
    /// Enough consecutive probes succeeded; normal operation resumes.
    Closed,
    /// A call was rejected because the circuit is open.
    Rejected {
        /// Time left before probes are admitted
        retry_after: Duration,
    },
}

/// Events emitted by the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitEvent {
    /// The call was counted and admitted.
    Allowed {
        /// Admissions left in the window, when the call was counted
        remaining: Option<u64>,
    },
    /// The call was denied.
    Denied {
        /// Configured limit
        limit: u64,
    },
    /// The counter store failed or timed out.
    StoreFailure {
        /// How the failure was resolved
        policy: StoreFailurePolicy,
    },
}

/// Events emitted when a rate-limit denial is answered by a fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackEvent {
    /// The fallback produced the caller's value.
    Invoked {
        /// Handler name
        name: Arc<str>,
    },
    /// The fallback errored or panicked; the caller got a rate-limit error.
    Failed {
        /// Handler name
        name: Arc<str>,
    },
}

/// Request outcome events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Request completed successfully.
    Success {
        /// Time taken to complete the request
        duration: Duration,
    },
    /// Request failed with an error.
    Failure {
        /// Time taken before failure
        duration: Duration,
    },
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::CircuitBreaker { key, event } => write!(f, "CircuitBreaker[{}]::{}", key, event),
            PolicyEvent::RateLimit { key, event } => write!(f, "RateLimit[{}]::{}", key, event),
            PolicyEvent::Fallback { key, event } => write!(f, "Fallback[{}]::{}", key, event),
            PolicyEvent::Request { key, outcome } => write!(f, "Request[{}]::{}", key, outcome),
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { from, failure_count, total_count } => {
                write!(f, "Opened(from={}, failures={}/{})", from, failure_count, total_count)
            }
            CircuitBreakerEvent::HalfOpen => write!(f, "HalfOpen"),
            CircuitBreakerEvent::Closed => write!(f, "Closed"),
            CircuitBreakerEvent::Rejected { retry_after } => {
                write!(f, "Rejected(retry_after={:?})", retry_after)
            }
        }
    }
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitEvent::Allowed { remaining: Some(remaining) } => {
                write!(f, "Allowed(remaining={})", remaining)
            }
            RateLimitEvent::Allowed { remaining: None } => write!(f, "Allowed(uncounted)"),
            RateLimitEvent::Denied { limit } => write!(f, "Denied(limit={})", limit),
            RateLimitEvent::StoreFailure { policy } => write!(f, "StoreFailure({:?})", policy),
        }
    }
}

impl fmt::Display for FallbackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackEvent::Invoked { name } => write!(f, "Invoked({})", name),
            FallbackEvent::Failed { name } => write!(f, "Failed({})", name),
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { duration } => write!(f, "Success(duration={:?})", duration),
            RequestOutcome::Failure { duration } => write!(f, "Failure(duration={:?})", duration),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> OperationKey {
        OperationKey::new("billing", "charge").unwrap()
    }

    #[test]
    fn display_includes_key_and_detail() {
        let event = PolicyEvent::CircuitBreaker {
            key: key(),
            event: CircuitBreakerEvent::Opened {
                from: CircuitState::Closed,
                failure_count: 3,
                total_count: 5,
            },
        };
        assert_eq!(event.to_string(), "CircuitBreaker[billing.charge]::Opened(from=closed, failures=3/5)");

        let event = PolicyEvent::RateLimit { key: key(), event: RateLimitEvent::Denied { limit: 3 } };
        assert_eq!(event.to_string(), "RateLimit[billing.charge]::Denied(limit=3)");
    }

    #[test]
    fn fail_open_admission_reads_as_uncounted() {
        let event = RateLimitEvent::Allowed { remaining: None };
        assert_eq!(event.to_string(), "Allowed(uncounted)");
    }

    #[test]
    fn key_accessor_covers_every_variant() {
        let events = [
            PolicyEvent::CircuitBreaker { key: key(), event: CircuitBreakerEvent::HalfOpen },
            PolicyEvent::RateLimit {
                key: key(),
                event: RateLimitEvent::StoreFailure { policy: StoreFailurePolicy::FailOpen },
            },
            PolicyEvent::Fallback { key: key(), event: FallbackEvent::Invoked { name: "queued".into() } },
            PolicyEvent::Request {
                key: key(),
                outcome: RequestOutcome::Success { duration: Duration::from_millis(3) },
            },
        ];
        for event in &events {
            assert_eq!(event.key().as_str(), "billing.charge");
        }
    }
}
