#![allow(dead_code)]

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tollgate::telemetry::MemorySink;
use tollgate::{Gatekeeper, InMemoryCounterStore, ManualClock, OperationKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError(pub &'static str);

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "test error: {}", self.0)
    }
}

impl std::error::Error for TestError {}

pub fn key(name: &str) -> OperationKey {
    OperationKey::new("api::TestController", name).unwrap()
}

/// Gatekeeper wired to one manual clock, an inspectable store and a memory sink.
pub struct Harness {
    pub clock: ManualClock,
    pub store: InMemoryCounterStore,
    pub sink: MemorySink,
    pub gatekeeper: Gatekeeper,
}

impl Harness {
    pub fn new() -> Self {
        let clock = ManualClock::new();
        let store = InMemoryCounterStore::with_clock(clock.clone());
        let sink = MemorySink::new();
        let gatekeeper = Gatekeeper::builder(store.clone())
            .clock(clock.clone())
            .telemetry(sink.clone())
            .build()
            .unwrap();
        Self { clock, store, sink, gatekeeper }
    }
}

/// Counts how many times the protected operation actually ran.
#[derive(Clone, Default)]
pub struct Invocations(Arc<AtomicUsize>);

impl Invocations {
    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
