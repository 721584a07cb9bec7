//! Registry of per-operation circuit breakers.
//!
//! One [`CircuitRecord`] per [`OperationKey`], created lazily on first use. Records are
//! never evicted implicitly; [`CircuitBreakerRegistry::remove`] exists for callers that
//! retire operations.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::circuit_breaker::{
    Admission, CircuitConfig, CircuitRecord, CircuitState, Transition,
};
use crate::clock::{Clock, MonotonicClock};
use crate::key::OperationKey;

/// Outcome of an admitted call, as reported to the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Errors from breaker registries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerRegistryError {
    /// The requested circuit breaker was never used or has been removed.
    #[error("circuit breaker '{key}' not found")]
    NotFound {
        /// Identifier that could not be located.
        key: OperationKey,
    },
}

type Slot = Arc<Mutex<CircuitRecord>>;

/// Concurrent map of breaker records.
///
/// The map is sharded, and each record sits behind its own mutex: calls on different
/// operations never wait on each other, and calls on the same operation see a
/// serialized state machine. Locks are only held for the bookkeeping, never across the
/// protected call.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    records: DashMap<OperationKey, Slot>,
    clock: Arc<dyn Clock>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::with_shared_clock(Arc::new(MonotonicClock::default()))
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self::with_shared_clock(Arc::new(clock))
    }

    pub(crate) fn with_shared_clock(clock: Arc<dyn Clock>) -> Self {
        Self { records: DashMap::new(), clock }
    }

    /// Ask whether a call on `key` may proceed, applying the time-triggered
    /// Open → Half-Open transition first.
    pub fn check(&self, key: &OperationKey, config: &CircuitConfig) -> Admission {
        let slot = self.slot(key);
        let admission = {
            let mut record = lock(&slot);
            record.admit(self.clock.now_millis(), config)
        };
        match admission {
            Admission::Admitted { transition: Some(transition), .. } => log_transition(key, transition),
            Admission::Rejected { failure_count, retry_after } => {
                tracing::debug!(key = %key, failure_count, ?retry_after, "circuit open; call rejected");
            }
            Admission::Admitted { .. } => {}
        }
        admission
    }

    /// Report the outcome of an admitted call.
    pub fn record(
        &self,
        key: &OperationKey,
        config: &CircuitConfig,
        outcome: Outcome,
    ) -> Option<Transition> {
        let slot = self.slot(key);
        let transition = {
            let mut record = lock(&slot);
            let now = self.clock.now_millis();
            match outcome {
                Outcome::Success => record.record_success(now, config),
                Outcome::Failure => record.record_failure(now, config),
            }
        };
        if let Some(transition) = transition {
            log_transition(key, transition);
        }
        transition
    }

    /// Current state of `key`'s breaker; `None` if it has never been used.
    pub fn state(&self, key: &OperationKey) -> Option<CircuitState> {
        self.get(key).map(|record| record.state())
    }

    /// Copy of `key`'s record.
    pub fn get(&self, key: &OperationKey) -> Option<CircuitRecord> {
        let slot = self.records.get(key).map(|entry| entry.value().clone())?;
        let record = lock(&slot).clone();
        Some(record)
    }

    /// Reset a breaker to Closed, clearing its counters.
    pub fn reset(&self, key: &OperationKey) -> Result<(), CircuitBreakerRegistryError> {
        let slot = self
            .records
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CircuitBreakerRegistryError::NotFound { key: key.clone() })?;
        let transition = lock(&slot).reset(self.clock.now_millis());
        if let Some(transition) = transition {
            log_transition(key, transition);
        }
        Ok(())
    }

    /// Forget `key`'s breaker. Returns whether it existed.
    pub fn remove(&self, key: &OperationKey) -> bool {
        self.records.remove(key).is_some()
    }

    /// Snapshot every record, sorted by key.
    pub fn snapshot(&self) -> Vec<(OperationKey, CircuitRecord)> {
        let slots: Vec<(OperationKey, Slot)> = self
            .records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let mut entries: Vec<(OperationKey, CircuitRecord)> =
            slots.into_iter().map(|(key, slot)| (key, lock(&slot).clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn slot(&self, key: &OperationKey) -> Slot {
        if let Some(entry) = self.records.get(key) {
            return entry.value().clone();
        }
        let now = self.clock.now_millis();
        self.records
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitRecord::new(now))))
            .value()
            .clone()
    }
}

// A panic while holding the lock cannot leave a record half-updated: every mutation
// is a handful of integer stores. Recover the guard instead of propagating poison.
fn lock(slot: &Mutex<CircuitRecord>) -> MutexGuard<'_, CircuitRecord> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn log_transition(key: &OperationKey, transition: Transition) {
    let (failures, total) = (transition.failure_count, transition.total_count);
    match (transition.from, transition.to) {
        (CircuitState::Closed, CircuitState::Open) => {
            error!(key = %key, failures, total, "circuit breaker → open")
        }
        (CircuitState::HalfOpen, CircuitState::Open) => {
            warn!(key = %key, failures, total, "circuit breaker: probe failed → open")
        }
        (_, CircuitState::HalfOpen) => info!(key = %key, "circuit breaker → half-open"),
        (_, CircuitState::Closed) => info!(key = %key, "circuit breaker → closed"),
        (from, to) => info!(key = %key, %from, %to, "circuit breaker transition"),
    }
}
