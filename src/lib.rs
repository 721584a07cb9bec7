#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tollgate
//!
//! Admission control for async Rust: decide, per named operation, whether a call may
//! proceed.
//!
//! ## Features
//!
//! - **Distributed rate limiting**: fixed-window counters behind one atomic
//!   increment-and-expire round-trip, in memory or on Redis (feature `redis`)
//! - **Circuit breakers**: failure-ratio trips with lazy half-open probing, one
//!   breaker per operation in a sharded registry
//! - **Fallbacks** answering rate-limit denials, bound at configuration time
//! - **Tower middleware** via [`GuardLayer`]
//! - **Telemetry events** through tower-based sinks, plus `tracing` logs
//!
//! ## Quick Start
//!
//! ```rust
//! use tollgate::{
//!     CircuitConfig, Fallback, Gatekeeper, InMemoryCounterStore, OperationKey, RateLimitConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let gatekeeper = Gatekeeper::new(InMemoryCounterStore::new());
//!     let guard = gatekeeper
//!         .guard(OperationKey::new("api::TestController", "test").unwrap())
//!         .rate_limit(RateLimitConfig::per_window(3, 60).unwrap())
//!         .circuit_breaker(CircuitConfig::default())
//!         .fallback(Fallback::value("queued", "Please wait, your request is queued...".to_string()))
//!         .build()
//!         .unwrap();
//!
//!     for _ in 0..3 {
//!         let reply = guard.call(|| async { Ok::<_, std::io::Error>("ok".to_string()) }).await;
//!         assert_eq!(reply.unwrap(), "ok");
//!     }
//!     let reply = guard.call(|| async { Ok::<_, std::io::Error>("ok".to_string()) }).await;
//!     assert_eq!(reply.unwrap(), "Please wait, your request is queued...");
//! }
//! ```

pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
#[cfg(feature = "serde")]
pub mod config;
pub mod error;
pub mod fallback;
pub mod guard;
pub mod key;
pub mod middleware;
pub mod rate_limit;
pub mod telemetry;

// Re-exports
pub use circuit_breaker::{CircuitConfig, CircuitConfigError, CircuitRecord, CircuitState};
pub use circuit_breaker_registry::{CircuitBreakerRegistry, CircuitBreakerRegistryError, Outcome};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{BoxError, ResilienceError};
pub use fallback::{Fallback, FallbackError, FallbackTable};
pub use guard::{Gatekeeper, GatekeeperBuilder, Guard, GuardBuilder, GuardConfigError};
pub use key::{KeyError, OperationKey};
pub use middleware::{GuardLayer, GuardService};
#[cfg(feature = "redis")]
pub use rate_limit::RedisCounterStore;
pub use rate_limit::{
    CounterStore, Decision, FixedWindowLimiter, InMemoryCounterStore, RateLimitConfig,
    RateLimitConfigError, StoreError, StoreFailurePolicy,
};
