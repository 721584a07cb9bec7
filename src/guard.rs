//! Admission control around a protected operation.
//!
//! A [`Gatekeeper`] owns the process-wide state: the breaker registry and the limiter
//! over a shared counter store. Each protected operation gets a [`Guard`], configured
//! once through [`GuardBuilder`] and then called as many times as needed:
//!
//! ```text
//! call ─▶ breaker.check ──open──▶ Err(CircuitOpen)
//!              │
//!           admitted
//!              ▼
//!         limiter.try_acquire ──denied──▶ fallback? ─▶ Ok(fallback value)
//!              │                              └──────▶ Err(RateLimited)
//!           allowed
//!              ▼
//!         operation ─▶ breaker.record(outcome) ─▶ Ok(value) | Err(Inner(e))
//! ```
//!
//! The breaker is consulted first so an open circuit never spends a counter round-trip.
//! Only outcomes of the operation itself reach the breaker; limiter denials and fallback
//! answers are not recorded.

use crate::circuit_breaker::{Admission, CircuitConfig, CircuitConfigError, CircuitState, Transition};
use crate::circuit_breaker_registry::{CircuitBreakerRegistry, Outcome};
use crate::clock::{Clock, MonotonicClock};
use crate::error::{ResilienceError, SharedError};
use crate::fallback::{Fallback, FallbackTable};
use crate::key::{KeyError, OperationKey};
use crate::rate_limit::fixed_window::DEFAULT_STORE_TIMEOUT;
use crate::rate_limit::{
    CounterStore, Decision, DenyReason, FixedWindowLimiter, RateLimitConfig, RateLimitConfigError,
    StoreFailurePolicy,
};
use crate::telemetry::{
    CircuitBreakerEvent, FallbackEvent, PolicyEvent, RateLimitEvent, RequestOutcome, SharedSink,
    TelemetrySink,
};
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Errors raised while configuring a gatekeeper or a guard.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GuardConfigError {
    /// A named fallback was not present in the table it was resolved against.
    #[error("operation '{key}': fallback '{name}' is not registered")]
    UnknownFallback {
        /// Operation being configured.
        key: OperationKey,
        /// Name that failed to resolve.
        name: String,
    },
    /// A fallback only answers rate-limit denials, so it needs a rate limit.
    #[error("operation '{key}': a fallback requires a rate limit")]
    FallbackWithoutRateLimit {
        /// Operation being configured.
        key: OperationKey,
    },
    /// Neither a rate limit nor a circuit breaker was configured.
    #[error("operation '{key}': no rate limit or circuit breaker configured")]
    NoPolicy {
        /// Operation being configured.
        key: OperationKey,
    },
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    RateLimit(#[from] RateLimitConfigError),
    #[error(transparent)]
    Circuit(#[from] CircuitConfigError),
}

/// Shared admission state for a set of protected operations.
///
/// Cheap to clone; clones share the breaker registry, the counter store and the sink.
#[derive(Clone, Debug)]
pub struct Gatekeeper {
    inner: Arc<GatekeeperInner>,
}

#[derive(Debug)]
struct GatekeeperInner {
    registry: CircuitBreakerRegistry,
    limiter: FixedWindowLimiter,
    telemetry: SharedSink,
}

impl Gatekeeper {
    /// Gatekeeper over `store` with every default: 250ms store timeout, fail-closed,
    /// monotonic clock, no telemetry.
    pub fn new<S: CounterStore + 'static>(store: S) -> Self {
        let limiter = FixedWindowLimiter::new(store);
        Self::from_parts(CircuitBreakerRegistry::new(), limiter, SharedSink::default())
    }

    pub fn builder<S: CounterStore + 'static>(store: S) -> GatekeeperBuilder {
        GatekeeperBuilder::from_shared(Arc::new(store))
    }

    fn from_parts(registry: CircuitBreakerRegistry, limiter: FixedWindowLimiter, telemetry: SharedSink) -> Self {
        Self { inner: Arc::new(GatekeeperInner { registry, limiter, telemetry }) }
    }

    /// Start configuring the guard for `key`.
    pub fn guard<T>(&self, key: OperationKey) -> GuardBuilder<T> {
        GuardBuilder {
            gatekeeper: self.clone(),
            key,
            rate_limit: None,
            circuit_breaker: None,
            fallback: None,
        }
    }

    /// Breaker state for inspection and manual resets.
    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.inner.registry
    }

    pub fn limiter(&self) -> &FixedWindowLimiter {
        &self.inner.limiter
    }

    /// Telemetry events dropped because the sink was not ready to take them.
    pub fn dropped_events(&self) -> u64 {
        self.inner.telemetry.dropped()
    }

    fn emit(&self, event: PolicyEvent) {
        self.inner.telemetry.emit(event)
    }
}

/// Builder for [`Gatekeeper`].
pub struct GatekeeperBuilder {
    store: Arc<dyn CounterStore>,
    store_timeout: Duration,
    store_failure_policy: StoreFailurePolicy,
    clock: Arc<dyn Clock>,
    telemetry: SharedSink,
}

impl GatekeeperBuilder {
    /// Builder over an already shared store.
    pub fn from_shared(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            store_failure_policy: StoreFailurePolicy::default(),
            clock: Arc::new(MonotonicClock::default()),
            telemetry: SharedSink::default(),
        }
    }

    /// Bound on each counter store round-trip; must be non-zero.
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn store_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.store_failure_policy = policy;
        self
    }

    /// Shorthand for `store_failure_policy(StoreFailurePolicy::FailOpen)`.
    pub fn fail_open(self) -> Self {
        self.store_failure_policy(StoreFailurePolicy::FailOpen)
    }

    /// Clock driving the circuit breakers.
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Sink for policy events. Guards never wait on it: events it cannot take
    /// immediately are dropped and counted in [`Gatekeeper::dropped_events`].
    pub fn telemetry<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink + Sync,
        S::Future: Send + 'static,
    {
        self.telemetry = SharedSink::new(sink);
        self
    }

    pub fn build(self) -> Result<Gatekeeper, GuardConfigError> {
        let limiter = FixedWindowLimiter::from_shared(self.store)
            .with_store_timeout(self.store_timeout)?
            .with_failure_policy(self.store_failure_policy);
        let registry = CircuitBreakerRegistry::with_shared_clock(self.clock);
        Ok(Gatekeeper::from_parts(registry, limiter, self.telemetry))
    }
}

impl fmt::Debug for GatekeeperBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatekeeperBuilder")
            .field("store", &self.store)
            .field("store_timeout", &self.store_timeout)
            .field("store_failure_policy", &self.store_failure_policy)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

enum FallbackChoice<T> {
    Resolved(Fallback<T>),
    Missing(String),
}

/// Per-operation configuration, produced by [`Gatekeeper::guard`].
pub struct GuardBuilder<T> {
    gatekeeper: Gatekeeper,
    key: OperationKey,
    rate_limit: Option<RateLimitConfig>,
    circuit_breaker: Option<CircuitConfig>,
    fallback: Option<FallbackChoice<T>>,
}

impl<T: Send + 'static> GuardBuilder<T> {
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Answer rate-limit denials with `fallback` instead of an error.
    pub fn fallback(mut self, fallback: Fallback<T>) -> Self {
        self.fallback = Some(FallbackChoice::Resolved(fallback));
        self
    }

    /// Like [`fallback`](Self::fallback), looked up in `table` by name. A missing name
    /// fails [`build`](Self::build).
    pub fn fallback_named(mut self, table: &FallbackTable<T>, name: &str) -> Self {
        self.fallback = Some(match table.resolve(name) {
            Some(fallback) => FallbackChoice::Resolved(fallback),
            None => FallbackChoice::Missing(name.to_string()),
        });
        self
    }

    pub fn build(self) -> Result<Guard<T>, GuardConfigError> {
        let key = self.key;
        if self.rate_limit.is_none() && self.circuit_breaker.is_none() {
            return Err(GuardConfigError::NoPolicy { key });
        }
        let fallback = match self.fallback {
            None => None,
            Some(_) if self.rate_limit.is_none() => {
                return Err(GuardConfigError::FallbackWithoutRateLimit { key })
            }
            Some(FallbackChoice::Missing(name)) => {
                return Err(GuardConfigError::UnknownFallback { key, name })
            }
            Some(FallbackChoice::Resolved(fallback)) => Some(fallback),
        };
        let rate_limit = self.rate_limit.map(|config| {
            let counter_key = key.with_prefix(config.key_prefix());
            RateLimitSpec { config, counter_key }
        });
        Ok(Guard {
            inner: Arc::new(GuardInner {
                key,
                rate_limit,
                circuit_breaker: self.circuit_breaker,
                fallback,
                gatekeeper: self.gatekeeper,
            }),
        })
    }
}

impl<T> fmt::Debug for GuardBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardBuilder")
            .field("key", &self.key)
            .field("rate_limit", &self.rate_limit)
            .field("circuit_breaker", &self.circuit_breaker)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct RateLimitSpec {
    config: RateLimitConfig,
    counter_key: Arc<str>,
}

/// A configured, reusable gate for one operation.
///
/// Cheap to clone; clones share configuration and state.
pub struct Guard<T> {
    inner: Arc<GuardInner<T>>,
}

struct GuardInner<T> {
    key: OperationKey,
    rate_limit: Option<RateLimitSpec>,
    circuit_breaker: Option<CircuitConfig>,
    fallback: Option<Fallback<T>>,
    gatekeeper: Gatekeeper,
}

impl<T> Clone for Guard<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> fmt::Debug for Guard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard")
            .field("key", &self.inner.key)
            .field("rate_limit", &self.inner.rate_limit)
            .field("circuit_breaker", &self.inner.circuit_breaker)
            .field("fallback", &self.inner.fallback)
            .finish()
    }
}

impl<T: Send + 'static> Guard<T> {
    pub fn key(&self) -> &OperationKey {
        &self.inner.key
    }

    pub fn rate_limit_config(&self) -> Option<&RateLimitConfig> {
        self.inner.rate_limit.as_ref().map(|spec| &spec.config)
    }

    pub fn circuit_config(&self) -> Option<&CircuitConfig> {
        self.inner.circuit_breaker.as_ref()
    }

    /// Counter key used in the shared store: prefix followed by the operation key.
    pub fn counter_key(&self) -> Option<&str> {
        self.inner.rate_limit.as_ref().map(|spec| &*spec.counter_key)
    }

    /// Run `op` if admitted.
    ///
    /// The operation's own error comes back unchanged as [`ResilienceError::Inner`]
    /// after being recorded as a breaker failure. A panic inside `op` is recorded as a
    /// failure and then resumed. Dropping the returned future before `op` completes
    /// records nothing.
    pub async fn call<E, F, Fut>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(config) = &self.inner.circuit_breaker {
            self.admit(config)?;
        }

        if let Some(spec) = &self.inner.rate_limit {
            let limiter = self.gatekeeper().limiter();
            match limiter.try_acquire(&spec.counter_key, spec.config.limit(), spec.config.window()).await {
                Decision::Allowed { remaining } => {
                    if remaining.is_none() {
                        self.emit_rate_limit(RateLimitEvent::StoreFailure {
                            policy: StoreFailurePolicy::FailOpen,
                        });
                    }
                    self.emit_rate_limit(RateLimitEvent::Allowed { remaining });
                }
                Decision::Denied { reason } => return self.denied(&spec.config, reason).await,
            }
        }

        let started = Instant::now();
        let result = AssertUnwindSafe(async move { op().await }).catch_unwind().await;
        let duration = started.elapsed();

        match result {
            Ok(Ok(value)) => {
                self.record(Outcome::Success);
                self.emit(PolicyEvent::Request {
                    key: self.inner.key.clone(),
                    outcome: RequestOutcome::Success { duration },
                });
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure(duration);
                Err(ResilienceError::Inner(err))
            }
            Err(panic) => {
                self.record_failure(duration);
                std::panic::resume_unwind(panic)
            }
        }
    }

    fn gatekeeper(&self) -> &Gatekeeper {
        &self.inner.gatekeeper
    }

    fn admit<E>(&self, config: &CircuitConfig) -> Result<(), ResilienceError<E>> {
        let key = &self.inner.key;
        match self.gatekeeper().circuit_breakers().check(key, config) {
            Admission::Admitted { transition, .. } => {
                if let Some(transition) = transition {
                    self.emit_transition(transition);
                }
                Ok(())
            }
            Admission::Rejected { failure_count, retry_after } => {
                self.emit_circuit(CircuitBreakerEvent::Rejected { retry_after });
                Err(ResilienceError::circuit_open(key.clone(), failure_count, retry_after))
            }
        }
    }

    async fn denied<E>(&self, config: &RateLimitConfig, reason: DenyReason) -> Result<T, ResilienceError<E>> {
        let key = &self.inner.key;
        let mut cause: Option<SharedError> = None;
        if let DenyReason::StoreUnavailable(err) = reason {
            self.emit_rate_limit(RateLimitEvent::StoreFailure { policy: StoreFailurePolicy::FailClosed });
            cause = Some(Arc::new(err));
        }
        self.emit_rate_limit(RateLimitEvent::Denied { limit: config.limit() });

        let Some(fallback) = &self.inner.fallback else {
            return Err(ResilienceError::rate_limited(key.clone(), cause));
        };
        let name: Arc<str> = Arc::from(fallback.name());
        match fallback.invoke().await {
            Ok(value) => {
                tracing::debug!(key = %key, fallback = %name, "rate limited; answered by fallback");
                self.emit(PolicyEvent::Fallback { key: key.clone(), event: FallbackEvent::Invoked { name } });
                Ok(value)
            }
            Err(err) => {
                tracing::warn!(key = %key, fallback = %name, error = %err, "fallback failed");
                self.emit(PolicyEvent::Fallback { key: key.clone(), event: FallbackEvent::Failed { name } });
                Err(ResilienceError::rate_limited(key.clone(), Some(Arc::new(err))))
            }
        }
    }

    fn record_failure(&self, duration: Duration) {
        self.record(Outcome::Failure);
        self.emit(PolicyEvent::Request {
            key: self.inner.key.clone(),
            outcome: RequestOutcome::Failure { duration },
        });
    }

    fn record(&self, outcome: Outcome) {
        let Some(config) = &self.inner.circuit_breaker else {
            return;
        };
        let transition = self.gatekeeper().circuit_breakers().record(&self.inner.key, config, outcome);
        if let Some(transition) = transition {
            self.emit_transition(transition);
        }
    }

    fn emit_transition(&self, transition: Transition) {
        let event = match transition.to {
            CircuitState::Open => CircuitBreakerEvent::Opened {
                from: transition.from,
                failure_count: transition.failure_count,
                total_count: transition.total_count,
            },
            CircuitState::HalfOpen => CircuitBreakerEvent::HalfOpen,
            CircuitState::Closed => CircuitBreakerEvent::Closed,
        };
        self.emit_circuit(event);
    }

    fn emit_circuit(&self, event: CircuitBreakerEvent) {
        self.emit(PolicyEvent::CircuitBreaker { key: self.inner.key.clone(), event })
    }

    fn emit_rate_limit(&self, event: RateLimitEvent) {
        self.emit(PolicyEvent::RateLimit { key: self.inner.key.clone(), event })
    }

    fn emit(&self, event: PolicyEvent) {
        self.gatekeeper().emit(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::InMemoryCounterStore;
    use crate::telemetry::MemorySink;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(name: &str) -> OperationKey {
        OperationKey::new("tests::GuardSvc", name).unwrap()
    }

    fn gatekeeper(clock: &ManualClock) -> Gatekeeper {
        Gatekeeper::builder(InMemoryCounterStore::with_clock(clock.clone()))
            .clock(clock.clone())
            .build()
            .unwrap()
    }

    #[test]
    fn build_requires_a_policy() {
        let gk = gatekeeper(&ManualClock::new());
        let err = gk.guard::<u32>(key("bare")).build().unwrap_err();
        assert_eq!(err, GuardConfigError::NoPolicy { key: key("bare") });
    }

    #[test]
    fn fallback_without_rate_limit_is_rejected() {
        let gk = gatekeeper(&ManualClock::new());
        let err = gk
            .guard(key("cb"))
            .circuit_breaker(CircuitConfig::default())
            .fallback(Fallback::value("zero", 0u32))
            .build()
            .unwrap_err();
        assert!(matches!(err, GuardConfigError::FallbackWithoutRateLimit { .. }));
    }

    #[test]
    fn unknown_named_fallback_fails_at_build() {
        let gk = gatekeeper(&ManualClock::new());
        let table: FallbackTable<String> = FallbackTable::new();
        let err = gk
            .guard(key("named"))
            .rate_limit(RateLimitConfig::default())
            .fallback_named(&table, "nonExistentMethod")
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            GuardConfigError::UnknownFallback { key: key("named"), name: "nonExistentMethod".into() }
        );
    }

    #[test]
    fn zero_store_timeout_is_rejected() {
        let err = Gatekeeper::builder(InMemoryCounterStore::new())
            .store_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(err, GuardConfigError::RateLimit(RateLimitConfigError::ZeroStoreTimeout));
    }

    #[test]
    fn counter_key_combines_prefix_and_identity() {
        let gk = gatekeeper(&ManualClock::new());
        let guard = gk
            .guard::<u32>(key("limited"))
            .rate_limit(RateLimitConfig::new("api:", 3, 60).unwrap())
            .build()
            .unwrap();
        assert_eq!(guard.counter_key(), Some("api:tests::GuardSvc.limited"));
    }

    #[tokio::test]
    async fn limiter_denial_is_not_recorded_by_breaker() {
        let clock = ManualClock::new();
        let gk = gatekeeper(&clock);
        let guard = gk
            .guard::<u32>(key("both"))
            .rate_limit(RateLimitConfig::per_window(1, 60).unwrap())
            .circuit_breaker(CircuitConfig::new(0.5, 60, 30, 1).unwrap())
            .build()
            .unwrap();

        assert_eq!(guard.call(|| async { Ok::<_, io::Error>(1) }).await.unwrap(), 1);
        let err = guard.call(|| async { Ok::<_, io::Error>(2) }).await.unwrap_err();
        assert!(err.is_rate_limited());

        let record = gk.circuit_breakers().get(&key("both")).unwrap();
        assert_eq!(record.total_count(), 1);
        assert_eq!(record.failure_count(), 0);
    }

    #[tokio::test]
    async fn panicking_operation_counts_as_failure() {
        let clock = ManualClock::new();
        let gk = gatekeeper(&clock);
        let guard = gk
            .guard::<u32>(key("panics"))
            .circuit_breaker(CircuitConfig::new(0.5, 60, 30, 1).unwrap())
            .build()
            .unwrap();

        let task = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard
                    .call(|| async {
                        if true {
                            panic!("boom");
                        }
                        Ok::<u32, io::Error>(0)
                    })
                    .await
            })
        };
        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(gk.circuit_breakers().state(&key("panics")), Some(CircuitState::Open));
    }

    #[tokio::test]
    async fn dropped_call_records_nothing() {
        let clock = ManualClock::new();
        let gk = gatekeeper(&clock);
        let guard = gk
            .guard::<u32>(key("cancelled"))
            .circuit_breaker(CircuitConfig::default())
            .build()
            .unwrap();

        let started = Arc::new(AtomicUsize::new(0));
        let seen = started.clone();
        let call = guard.call(move || async move {
            seen.fetch_add(1, Ordering::SeqCst);
            futures::future::pending::<Result<u32, io::Error>>().await
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(10), call).await;
        assert!(timed_out.is_err());
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(gk.circuit_breakers().get(&key("cancelled")).unwrap().total_count(), 0);
    }

    #[tokio::test]
    async fn emits_request_and_limit_events() {
        let clock = ManualClock::new();
        let sink = MemorySink::new();
        let gk = Gatekeeper::builder(InMemoryCounterStore::with_clock(clock.clone()))
            .clock(clock.clone())
            .telemetry(sink.clone())
            .build()
            .unwrap();
        let guard = gk
            .guard::<u32>(key("observed"))
            .rate_limit(RateLimitConfig::per_window(1, 60).unwrap())
            .build()
            .unwrap();

        guard.call(|| async { Ok::<_, io::Error>(1) }).await.unwrap();
        let _ = guard.call(|| async { Ok::<_, io::Error>(1) }).await;

        let events = sink.events();
        assert_eq!(
            events[0],
            PolicyEvent::RateLimit {
                key: key("observed"),
                event: RateLimitEvent::Allowed { remaining: Some(0) },
            }
        );
        assert!(matches!(
            events[1],
            PolicyEvent::Request { outcome: RequestOutcome::Success { .. }, .. }
        ));
        assert_eq!(
            events[2],
            PolicyEvent::RateLimit { key: key("observed"), event: RateLimitEvent::Denied { limit: 1 } }
        );
        assert_eq!(events.len(), 3);
    }
}
