//! Tower integration: gate every request to an inner service through a [`Guard`].
//!
//! ```rust
//! use tollgate::{Gatekeeper, GuardLayer, InMemoryCounterStore, OperationKey, RateLimitConfig};
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let gatekeeper = Gatekeeper::new(InMemoryCounterStore::new());
//! let guard = gatekeeper
//!     .guard::<String>(OperationKey::new("api::Echo", "echo").unwrap())
//!     .rate_limit(RateLimitConfig::per_window(3, 60).unwrap())
//!     .build()
//!     .unwrap();
//!
//! let svc = GuardLayer::new(guard)
//!     .layer(service_fn(|req: String| async move { Ok::<_, std::io::Error>(req) }));
//! assert_eq!(svc.oneshot("hi".to_string()).await.unwrap(), "hi");
//! # }
//! ```

use crate::error::ResilienceError;
use crate::guard::Guard;
use futures::future::BoxFuture;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that gates an inner service through a [`Guard`].
#[derive(Debug)]
pub struct GuardLayer<T> {
    guard: Guard<T>,
}

impl<T> Clone for GuardLayer<T> {
    fn clone(&self) -> Self {
        Self { guard: self.guard.clone() }
    }
}

impl<T> GuardLayer<T> {
    pub fn new(guard: Guard<T>) -> Self {
        Self { guard }
    }
}

impl<S, T> Layer<S> for GuardLayer<T> {
    type Service = GuardService<S, T>;

    fn layer(&self, service: S) -> Self::Service {
        GuardService { inner: service, guard: self.guard.clone() }
    }
}

/// Middleware service produced by [`GuardLayer`].
///
/// Readiness of the inner service is passed through; its `poll_ready` errors surface as
/// [`ResilienceError::Inner`] without touching the breaker or the limiter.
#[derive(Debug)]
pub struct GuardService<S, T> {
    inner: S,
    guard: Guard<T>,
}

impl<S: Clone, T> Clone for GuardService<S, T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), guard: self.guard.clone() }
    }
}

impl<S, T> GuardService<S, T> {
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn guard(&self) -> &Guard<T> {
        &self.guard
    }
}

impl<S, T, Req> Service<Req> for GuardService<S, T>
where
    S: Service<Req, Response = T> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    T: Send + 'static,
    Req: Send + 'static,
{
    type Response = T;
    type Error = ResilienceError<S::Error>;
    type Future = BoxFuture<'static, Result<T, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // Keep the service that was driven to readiness; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let guard = self.guard.clone();

        Box::pin(async move { guard.call(move || inner.call(req)).await })
    }
}
