//! Fallback handlers answered in place of a rate-limit denial.
//!
//! A fallback is a zero-argument async handler bound at configuration time: a closure
//! that captures whatever receiver it needs. Handlers can also be registered by name in
//! a [`FallbackTable`] and resolved once when the guard is built, so a missing handler is
//! a configuration error rather than a per-call failure.

use crate::error::{BoxError, SharedError};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Why a configured fallback could not produce a value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FallbackError {
    /// The handler returned an error.
    #[error("fallback '{name}' failed: {source}")]
    Failed {
        /// Handler name.
        name: Arc<str>,
        /// What the handler returned.
        source: SharedError,
    },
    /// The handler panicked.
    #[error("fallback '{name}' panicked: {message}")]
    Panicked {
        /// Handler name.
        name: Arc<str>,
        /// Panic payload, when it was a string.
        message: String,
    },
}

type Handler<T> = dyn Fn() -> BoxFuture<'static, Result<T, BoxError>> + Send + Sync;

/// A named, zero-argument async handler producing a `T`.
pub struct Fallback<T> {
    name: Arc<str>,
    handler: Arc<Handler<T>>,
}

impl<T> Clone for Fallback<T> {
    fn clone(&self) -> Self {
        Self { name: self.name.clone(), handler: self.handler.clone() }
    }
}

impl<T> fmt::Debug for Fallback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fallback").field("name", &self.name).finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Fallback<T> {
    /// Wrap an async handler.
    ///
    /// ```
    /// use tollgate::Fallback;
    /// let queued = Fallback::new("queued", || async {
    ///     Ok::<_, std::convert::Infallible>("Please wait, your request is queued...".to_string())
    /// });
    /// assert_eq!(queued.name(), "queued");
    /// ```
    pub fn new<F, Fut, E>(name: impl Into<Arc<str>>, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let handler = move || -> BoxFuture<'static, Result<T, BoxError>> {
            let fut = handler();
            Box::pin(async move { fut.await.map_err(Into::into) })
        };
        Self { name: name.into(), handler: Arc::new(handler) }
    }

    /// A fallback that always answers with a clone of `value`.
    pub fn value(name: impl Into<Arc<str>>, value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::new(name, move || {
            let value = value.clone();
            async move { Ok::<_, std::convert::Infallible>(value) }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the handler. Errors and panics are both converted into [`FallbackError`].
    pub async fn invoke(&self) -> Result<T, FallbackError> {
        let outcome = AssertUnwindSafe(async { (self.handler)().await }).catch_unwind().await;
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(FallbackError::Failed { name: self.name.clone(), source: Arc::from(err) }),
            Err(payload) => Err(FallbackError::Panicked {
                name: self.name.clone(),
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Fallback handlers addressable by name.
pub struct FallbackTable<T> {
    handlers: HashMap<String, Fallback<T>>,
}

impl<T> Default for FallbackTable<T> {
    fn default() -> Self {
        Self { handlers: HashMap::new() }
    }
}

impl<T> Clone for FallbackTable<T> {
    fn clone(&self) -> Self {
        Self { handlers: self.handlers.clone() }
    }
}

impl<T> fmt::Debug for FallbackTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("FallbackTable").field("handlers", &names).finish()
    }
}

impl<T: Send + 'static> FallbackTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler under its own name, replacing any previous one.
    pub fn insert(&mut self, fallback: Fallback<T>) -> Option<Fallback<T>> {
        self.handlers.insert(fallback.name().to_string(), fallback)
    }

    /// Builder-style [`insert`](Self::insert) of a new handler.
    pub fn with<F, Fut, E>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.insert(Fallback::new(name, handler));
        self
    }

    /// Look up a handler by name.
    pub fn resolve(&self, name: &str) -> Option<Fallback<T>> {
        self.handlers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
