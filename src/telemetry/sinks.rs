use super::events::PolicyEvent;
use futures::future::FutureExt;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::future::{ready, Ready};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tower::{Service, ServiceExt};

/// A telemetry sink that consumes policy events.
pub trait TelemetrySink:
    tower::Service<PolicyEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

trait DynSink: Send + Sync {
    fn offer(&self, event: PolicyEvent) -> bool;
}

struct Erased<S>(S);

impl<S> DynSink for Erased<S>
where
    S: TelemetrySink + Sync,
    S::Future: Send + 'static,
{
    // Readiness is polled exactly once. A delivery that does not finish on its first
    // poll moves to the runtime.
    fn offer(&self, event: PolicyEvent) -> bool {
        let mut sink = self.0.clone();
        match sink.ready().now_or_never() {
            Some(Ok(_)) => {}
            _ => return false,
        }
        let mut delivery = Box::pin(sink.call(event));
        if delivery.as_mut().now_or_never().is_some() {
            return true;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let _ = delivery.await;
                });
                true
            }
            Err(_) => false,
        }
    }
}

/// Type-erased, cloneable handle to any [`TelemetrySink`].
///
/// Emission never waits on the sink. An event is dropped, and counted, when the sink
/// is not ready on the first poll. Deliveries that are still pending after one poll
/// finish on the tokio runtime, off the caller's path.
#[derive(Clone)]
pub struct SharedSink {
    inner: Arc<dyn DynSink>,
    dropped: Arc<AtomicU64>,
}

impl SharedSink {
    pub fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink + Sync,
        S::Future: Send + 'static,
    {
        Self { inner: Arc::new(Erased(sink)), dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Offer `event` to the sink without blocking.
    pub fn emit(&self, event: PolicyEvent) {
        if !self.inner.offer(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Events dropped because the sink was not ready.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for SharedSink {
    fn default() -> Self {
        Self::new(NullSink)
    }
}

impl fmt::Debug for SharedSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSink").field("dropped", &self.dropped()).finish_non_exhaustive()
    }
}

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<PolicyEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: PolicyEvent) -> Self::Future {
        ready(Ok(()))
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Writes each event as an `info` record through `tracing`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<PolicyEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        tracing::info!(key = %event.key(), event = %event, "policy_event");
        ready(Ok(()))
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

const MEMORY_SINK_CAPACITY: usize = 10_000;

/// Keeps the most recent events in memory; the oldest is discarded once full.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<PolicyEvent>>>,
    capacity: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(MEMORY_SINK_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { events: Arc::default(), capacity: capacity.max(1) }
    }

    /// Recorded events, oldest first.
    pub fn events(&self) -> Vec<PolicyEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PolicyEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<PolicyEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        let mut events = self.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
        ready(Ok(()))
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::OperationKey;
    use crate::telemetry::events::{CircuitBreakerEvent, RateLimitEvent};
    use futures::future::BoxFuture;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn key() -> OperationKey {
        OperationKey::new("orders", "place").unwrap()
    }

    fn denied() -> PolicyEvent {
        PolicyEvent::RateLimit { key: key(), event: RateLimitEvent::Denied { limit: 3 } }
    }

    #[derive(Clone)]
    struct Fails;

    impl TelemetrySink for Fails {
        type SinkError = std::io::Error;
    }

    impl Service<PolicyEvent> for Fails {
        type Response = ();
        type Error = std::io::Error;
        type Future = Ready<Result<(), std::io::Error>>;
        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn call(&mut self, _req: PolicyEvent) -> Self::Future {
            ready(Err(std::io::Error::new(std::io::ErrorKind::Other, "fail")))
        }
    }

    #[derive(Clone)]
    struct NeverReady;

    impl TelemetrySink for NeverReady {
        type SinkError = Infallible;
    }

    impl Service<PolicyEvent> for NeverReady {
        type Response = ();
        type Error = Infallible;
        type Future = Ready<Result<(), Infallible>>;
        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
        fn call(&mut self, _req: PolicyEvent) -> Self::Future {
            ready(Ok(()))
        }
    }

    #[derive(Clone, Default)]
    struct Slow {
        release: Arc<Notify>,
        delivered: Arc<AtomicUsize>,
    }

    impl TelemetrySink for Slow {
        type SinkError = Infallible;
    }

    impl Service<PolicyEvent> for Slow {
        type Response = ();
        type Error = Infallible;
        type Future = BoxFuture<'static, Result<(), Infallible>>;
        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn call(&mut self, _req: PolicyEvent) -> Self::Future {
            let (release, delivered) = (self.release.clone(), self.delivered.clone());
            Box::pin(async move {
                release.notified().await;
                delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[test]
    fn memory_sink_keeps_most_recent() {
        let mut sink = MemorySink::with_capacity(2);
        assert!(sink.is_empty());

        let half_open = PolicyEvent::CircuitBreaker { key: key(), event: CircuitBreakerEvent::HalfOpen };
        let closed = PolicyEvent::CircuitBreaker { key: key(), event: CircuitBreakerEvent::Closed };
        for event in [denied(), half_open.clone(), closed.clone()] {
            sink.call(event).now_or_never().unwrap().unwrap();
        }

        assert_eq!(sink.events(), vec![half_open, closed]);
        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn sink_errors_are_swallowed() {
        let shared = SharedSink::new(Fails);
        shared.emit(denied());
        assert_eq!(shared.dropped(), 0);
    }

    #[test]
    fn shared_sink_forwards_to_memory_sink() {
        let memory = MemorySink::new();
        let shared = SharedSink::new(memory.clone());
        shared.emit(denied());
        shared.clone().emit(denied());
        assert_eq!(memory.len(), 2);
    }

    #[test]
    fn unready_sink_drops_instead_of_waiting() {
        let shared = SharedSink::new(NeverReady);
        shared.emit(denied());
        shared.emit(denied());
        assert_eq!(shared.dropped(), 2);
    }

    #[tokio::test]
    async fn slow_delivery_finishes_in_background() {
        let slow = Slow::default();
        let shared = SharedSink::new(slow.clone());

        shared.emit(denied());
        assert_eq!(slow.delivered.load(Ordering::SeqCst), 0);
        assert_eq!(shared.dropped(), 0);

        slow.release.notify_one();
        for _ in 0..100 {
            if slow.delivered.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(slow.delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn slow_delivery_without_runtime_is_dropped() {
        let shared = SharedSink::new(Slow::default());
        shared.emit(denied());
        assert_eq!(shared.dropped(), 1);
    }

    #[test]
    fn log_sink_accepts_events() {
        let mut sink = LogSink;
        sink.call(denied()).now_or_never().unwrap().unwrap();
    }
}
