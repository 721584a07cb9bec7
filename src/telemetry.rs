//! Telemetry for guarded operations.
//!
//! Every decision a guard makes is reported as a [`PolicyEvent`] to the configured
//! [`TelemetrySink`]. Sinks are `tower::Service<PolicyEvent>`s, so they compose with
//! standard tower combinators. Emission is best-effort: it never fails a call and
//! never waits on a slow sink.
//!
//! # Event Types
//!
//! - **Circuit Breaker**: `Opened`, `HalfOpen`, `Closed`, `Rejected`
//! - **Rate Limit**: `Allowed`, `Denied`, `StoreFailure`
//! - **Fallback**: `Invoked`, `Failed`
//! - **Request**: `Success`, `Failure`
//!
//! ```rust
//! use tollgate::telemetry::{PolicyEvent, RateLimitEvent};
//! use tollgate::OperationKey;
//!
//! let key = OperationKey::new("api::OrdersController", "place").unwrap();
//! let event = PolicyEvent::RateLimit { key, event: RateLimitEvent::Denied { limit: 3 } };
//! assert_eq!(event.to_string(), "RateLimit[api::OrdersController.place]::Denied(limit=3)");
//! ```

pub mod events;
pub mod sinks;

pub use events::{CircuitBreakerEvent, FallbackEvent, PolicyEvent, RateLimitEvent, RequestOutcome};
pub use sinks::{LogSink, MemorySink, NullSink, SharedSink, TelemetrySink};
