mod common;

use async_trait::async_trait;
use common::{key, Harness, TestError};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tollgate::telemetry::{
    CircuitBreakerEvent, FallbackEvent, PolicyEvent, RateLimitEvent, RequestOutcome, TelemetrySink,
};
use tollgate::{
    CircuitConfig, CircuitState, CounterStore, Fallback, Gatekeeper, RateLimitConfig, StoreError,
    StoreFailurePolicy,
};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedWriter;
    fn make_writer(&'a self) -> Self::Writer {
        CapturedWriter(self.0.clone())
    }
}

struct CapturedWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for CapturedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .without_time()
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (logs, guard)
}

#[derive(Debug)]
struct DownStore;

#[async_trait]
impl CounterStore for DownStore {
    async fn increment_and_maybe_expire(&self, _: &str, _: Duration) -> Result<u64, StoreError> {
        Err(StoreError::Protocol("unexpected reply".into()))
    }
}

fn circuit_events(events: &[PolicyEvent]) -> Vec<CircuitBreakerEvent> {
    events
        .iter()
        .filter_map(|event| match event {
            PolicyEvent::CircuitBreaker { event, .. } => Some(*event),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn breaker_lifecycle_is_reported() {
    let h = Harness::new();
    let guard = h
        .gatekeeper
        .guard::<u32>(key("lifecycle"))
        .circuit_breaker(CircuitConfig::new(0.5, 60, 1, 2).unwrap())
        .build()
        .unwrap();
    let fail = || async { Err::<u32, _>(TestError("down")) };
    let ok = || async { Ok::<_, TestError>(1) };

    let _ = guard.call(fail).await;
    let _ = guard.call(fail).await;
    let _ = guard.call(ok).await;
    h.clock.advance(Duration::from_secs(1));
    for _ in 0..3 {
        guard.call(ok).await.unwrap();
    }

    assert_eq!(
        circuit_events(&h.sink.events()),
        vec![
            CircuitBreakerEvent::Opened { from: CircuitState::Closed, failure_count: 2, total_count: 2 },
            CircuitBreakerEvent::Rejected { retry_after: Duration::from_secs(1) },
            CircuitBreakerEvent::HalfOpen,
            CircuitBreakerEvent::Closed,
        ]
    );
    let failures = h
        .sink
        .events()
        .iter()
        .filter(|e| matches!(e, PolicyEvent::Request { outcome: RequestOutcome::Failure { .. }, .. }))
        .count();
    assert_eq!(failures, 2);
}

#[tokio::test]
async fn failed_probe_reports_probe_counts() {
    let h = Harness::new();
    let guard = h
        .gatekeeper
        .guard::<u32>(key("relapse"))
        .circuit_breaker(CircuitConfig::new(0.5, 60, 1, 2).unwrap())
        .build()
        .unwrap();
    let fail = || async { Err::<u32, _>(TestError("down")) };

    let _ = guard.call(fail).await;
    let _ = guard.call(fail).await;
    h.clock.advance(Duration::from_secs(1));
    guard.call(|| async { Ok::<_, TestError>(1) }).await.unwrap();
    let _ = guard.call(fail).await;

    let opened: Vec<_> = circuit_events(&h.sink.events())
        .into_iter()
        .filter(|e| matches!(e, CircuitBreakerEvent::Opened { .. }))
        .collect();
    assert_eq!(
        opened,
        vec![
            CircuitBreakerEvent::Opened { from: CircuitState::Closed, failure_count: 2, total_count: 2 },
            CircuitBreakerEvent::Opened { from: CircuitState::HalfOpen, failure_count: 1, total_count: 2 },
        ]
    );
}

#[tokio::test]
async fn fallback_answers_are_reported() {
    let h = Harness::new();
    let guard = h
        .gatekeeper
        .guard(key("fallbackEvents"))
        .rate_limit(RateLimitConfig::per_window(1, 60).unwrap())
        .fallback(Fallback::value("queued", 0u32))
        .build()
        .unwrap();

    guard.call(|| async { Ok::<_, TestError>(1) }).await.unwrap();
    assert_eq!(guard.call(|| async { Ok::<_, TestError>(1) }).await.unwrap(), 0);

    let events = h.sink.events();
    let tail = &events[events.len() - 2..];
    assert_eq!(
        tail,
        &[
            PolicyEvent::RateLimit { key: key("fallbackEvents"), event: RateLimitEvent::Denied { limit: 1 } },
            PolicyEvent::Fallback {
                key: key("fallbackEvents"),
                event: FallbackEvent::Invoked { name: "queued".into() },
            },
        ]
    );
}

#[tokio::test]
async fn store_failure_is_logged_and_reported() {
    let (logs, _guard) = capture_logs();
    let sink = tollgate::telemetry::MemorySink::new();
    let gatekeeper = Gatekeeper::builder(DownStore).telemetry(sink.clone()).build().unwrap();
    let guard = gatekeeper
        .guard::<u32>(key("storeDown"))
        .rate_limit(RateLimitConfig::default())
        .build()
        .unwrap();

    let err = guard.call(|| async { Ok::<_, TestError>(1) }).await.unwrap_err();
    assert!(err.is_rate_limited());

    assert_eq!(
        sink.events()[0],
        PolicyEvent::RateLimit {
            key: key("storeDown"),
            event: RateLimitEvent::StoreFailure { policy: StoreFailurePolicy::FailClosed },
        }
    );
    let output = logs.contents();
    assert!(output.contains("WARN"), "logs: {output}");
    assert!(output.contains("fail-closed"), "logs: {output}");
    assert!(output.contains("rate:limit:api::TestController.storeDown"), "logs: {output}");
}

#[tokio::test]
async fn opening_and_recovery_are_logged() {
    let (logs, _guard) = capture_logs();
    let h = Harness::new();
    let guard = h
        .gatekeeper
        .guard::<u32>(key("logged"))
        .circuit_breaker(CircuitConfig::new(0.5, 60, 1, 2).unwrap())
        .build()
        .unwrap();

    let _ = guard.call(|| async { Err::<u32, _>(TestError("down")) }).await;
    let _ = guard.call(|| async { Err::<u32, _>(TestError("down")) }).await;
    h.clock.advance(Duration::from_secs(1));
    for _ in 0..3 {
        guard.call(|| async { Ok::<_, TestError>(1) }).await.unwrap();
    }

    let output = logs.contents();
    assert!(output.contains("ERROR"), "logs: {output}");
    assert!(output.contains("circuit breaker → open"), "logs: {output}");
    assert!(output.contains("circuit breaker → half-open"), "logs: {output}");
    assert!(output.contains("circuit breaker → closed"), "logs: {output}");
    assert!(output.contains("api::TestController.logged"), "logs: {output}");
}

#[derive(Clone)]
struct BackedUpSink;

impl tower::Service<PolicyEvent> for BackedUpSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Pending
    }

    fn call(&mut self, _event: PolicyEvent) -> Self::Future {
        ready(Ok(()))
    }
}

impl TelemetrySink for BackedUpSink {
    type SinkError = Infallible;
}

#[tokio::test]
async fn unready_sink_never_stalls_guarded_calls() {
    let gatekeeper = Gatekeeper::builder(tollgate::InMemoryCounterStore::new())
        .telemetry(BackedUpSink)
        .build()
        .unwrap();
    let guard = gatekeeper
        .guard::<u32>(key("backedUp"))
        .rate_limit(RateLimitConfig::per_window(5, 60).unwrap())
        .circuit_breaker(CircuitConfig::default())
        .build()
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), guard.call(|| async { Ok::<_, TestError>(1) }))
        .await
        .expect("guarded call stalled on telemetry");
    assert_eq!(reply.unwrap(), 1);

    // Allowed and Request events were both turned away.
    assert_eq!(gatekeeper.dropped_events(), 2);
}
