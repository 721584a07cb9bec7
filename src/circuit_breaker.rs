//! Failure-ratio circuit breaker state machine.
//!
//! [`CircuitRecord`] holds the per-operation state and implements every transition as a
//! plain method taking `now` explicitly, so the machine has no timers and no interior
//! locking of its own. The [`registry`](crate::circuit_breaker_registry) owns one record
//! per operation and serializes access to it.
//!
//! ```text
//! CLOSED ──(total >= min_requests && failures/total > threshold)──▶ OPEN
//! OPEN ──(now - opened_at >= open_duration, checked on admission)──▶ HALF_OPEN
//! HALF_OPEN ──(3 consecutive successes)──▶ CLOSED
//! HALF_OPEN ──(any failure)──▶ OPEN
//! ```

use std::fmt;
use std::time::Duration;

/// Consecutive half-open successes needed to close the circuit.
pub const HALF_OPEN_SUCCESS_THRESHOLD: u32 = 3;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operating mode; outcomes are counted.
    Closed,
    /// Short-circuits calls until the open duration elapses.
    Open,
    /// Probe mode; successes count toward closing, any failure reopens.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CircuitConfigError {
    /// Failure threshold must lie in `[0.0, 1.0]`.
    #[error("failure_threshold must be within 0.0..=1.0 (got {provided})")]
    InvalidFailureThreshold {
        /// Value provided by caller.
        provided: f64,
    },
    /// Statistics window must be > 0.
    #[error("window_seconds must be > 0")]
    ZeroWindow,
    /// Open duration must be > 0.
    #[error("open_seconds must be > 0")]
    ZeroOpenDuration,
}

/// Validated configuration for one operation's breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    failure_threshold: f64,
    window: Duration,
    open_duration: Duration,
    min_requests: u64,
}

impl CircuitConfig {
    /// Create a config with validation.
    ///
    /// # Examples
    /// ```
    /// use tollgate::CircuitConfig;
    /// // Open when more than half of at least 2 calls fail within a minute; stay open 1s.
    /// let config = CircuitConfig::new(0.5, 60, 1, 2).unwrap();
    /// assert_eq!(config.min_requests(), 2);
    /// ```
    pub fn new(
        failure_threshold: f64,
        window_seconds: u64,
        open_seconds: u64,
        min_requests: u64,
    ) -> Result<Self, CircuitConfigError> {
        if !(0.0..=1.0).contains(&failure_threshold) {
            return Err(CircuitConfigError::InvalidFailureThreshold { provided: failure_threshold });
        }
        if window_seconds == 0 {
            return Err(CircuitConfigError::ZeroWindow);
        }
        if open_seconds == 0 {
            return Err(CircuitConfigError::ZeroOpenDuration);
        }
        Ok(Self {
            failure_threshold,
            window: Duration::from_secs(window_seconds),
            open_duration: Duration::from_secs(open_seconds),
            min_requests,
        })
    }

    /// Failure ratio that must be exceeded to open.
    pub fn failure_threshold(&self) -> f64 {
        self.failure_threshold
    }

    /// Length of the fixed statistics window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Duration to stay Open before Half-Open probes.
    pub fn open_duration(&self) -> Duration {
        self.open_duration
    }

    /// Calls needed in the window before the ratio is evaluated.
    pub fn min_requests(&self) -> u64 {
        self.min_requests
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
            min_requests: 5,
        }
    }
}

/// A state change, reported so callers can log or emit telemetry after releasing locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    /// Failures that tripped the breaker. Zero unless `to` is Open.
    pub failure_count: u64,
    /// Calls counted alongside `failure_count`. For a failed probe this is the probes
    /// run since Half-Open, including the failed one.
    pub total_count: u64,
}

/// Result of asking the breaker whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The call may proceed in `state`.
    Admitted {
        /// State the call was admitted in.
        state: CircuitState,
        /// Set when this check moved the breaker from Open to Half-Open.
        transition: Option<Transition>,
    },
    /// The circuit is open.
    Rejected {
        /// Failures in the window that tripped the breaker.
        failure_count: u64,
        /// Time left until probes are admitted.
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

/// `true` once an open circuit has waited out its open duration.
pub fn probe_due(opened_at_millis: u64, now_millis: u64, open_duration: Duration) -> bool {
    now_millis.saturating_sub(opened_at_millis) >= millis(open_duration)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Per-operation breaker state. Times are milliseconds from the owning registry's clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitRecord {
    state: CircuitState,
    failure_count: u64,
    total_count: u64,
    window_start_millis: u64,
    opened_at_millis: u64,
    half_open_successes: u32,
    tripped_failures: u64,
    tripped_total: u64,
}

impl CircuitRecord {
    /// A closed circuit whose first window starts at `now_millis`.
    pub fn new(now_millis: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            total_count: 0,
            window_start_millis: now_millis,
            opened_at_millis: 0,
            half_open_successes: 0,
            tripped_failures: 0,
            tripped_total: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn window_start_millis(&self) -> u64 {
        self.window_start_millis
    }

    pub fn opened_at_millis(&self) -> u64 {
        self.opened_at_millis
    }

    /// Failures and total calls behind the most recent trip to Open; zero once closed.
    pub fn tripped_counts(&self) -> (u64, u64) {
        (self.tripped_failures, self.tripped_total)
    }

    /// Consecutive successes while Half-Open; zero in any other state.
    pub fn half_open_successes(&self) -> u32 {
        self.half_open_successes
    }

    /// Admission check. Applies the lazy Open → Half-Open transition first.
    pub fn admit(&mut self, now_millis: u64, config: &CircuitConfig) -> Admission {
        let mut transition = None;
        if self.state == CircuitState::Open
            && probe_due(self.opened_at_millis, now_millis, config.open_duration)
        {
            transition = Some(self.enter(CircuitState::HalfOpen));
            self.half_open_successes = 0;
        }

        match self.state {
            CircuitState::Open => {
                let elapsed = now_millis.saturating_sub(self.opened_at_millis);
                let remaining = millis(config.open_duration).saturating_sub(elapsed);
                Admission::Rejected {
                    failure_count: self.tripped_failures,
                    retry_after: Duration::from_millis(remaining),
                }
            }
            state => Admission::Admitted { state, transition },
        }
    }

    /// Record a successful call.
    ///
    /// Outcomes arriving while Open belong to calls admitted before the circuit tripped;
    /// they are ignored so Open never accumulates statistics.
    pub fn record_success(&mut self, now_millis: u64, config: &CircuitConfig) -> Option<Transition> {
        match self.state {
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= HALF_OPEN_SUCCESS_THRESHOLD {
                    let transition = self.enter(CircuitState::Closed);
                    self.half_open_successes = 0;
                    self.tripped_failures = 0;
                    self.tripped_total = 0;
                    self.reset_window(now_millis);
                    return Some(transition);
                }
                None
            }
            CircuitState::Closed => {
                self.roll_window(now_millis, config);
                self.total_count += 1;
                None
            }
            CircuitState::Open => None,
        }
    }

    /// Record a failed call.
    pub fn record_failure(&mut self, now_millis: u64, config: &CircuitConfig) -> Option<Transition> {
        match self.state {
            CircuitState::HalfOpen => {
                let probes = u64::from(self.half_open_successes) + 1;
                let transition = self.trip(now_millis, 1, probes);
                self.half_open_successes = 0;
                self.reset_window(now_millis);
                Some(transition)
            }
            CircuitState::Closed => {
                self.roll_window(now_millis, config);
                self.total_count += 1;
                self.failure_count += 1;

                if self.total_count >= config.min_requests && self.failure_ratio() > config.failure_threshold {
                    return Some(self.trip(now_millis, self.failure_count, self.total_count));
                }
                None
            }
            CircuitState::Open => None,
        }
    }

    /// Force the circuit closed and clear every counter.
    pub fn reset(&mut self, now_millis: u64) -> Option<Transition> {
        let transition = (self.state != CircuitState::Closed).then(|| self.enter(CircuitState::Closed));
        self.half_open_successes = 0;
        self.opened_at_millis = 0;
        self.tripped_failures = 0;
        self.tripped_total = 0;
        self.reset_window(now_millis);
        transition
    }

    /// Failures over total calls in the current window; 0 when nothing was recorded.
    pub fn failure_ratio(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.failure_count as f64 / self.total_count as f64
        }
    }

    fn enter(&mut self, to: CircuitState) -> Transition {
        let from = std::mem::replace(&mut self.state, to);
        Transition { from, to, failure_count: 0, total_count: 0 }
    }

    fn trip(&mut self, now_millis: u64, failures: u64, total: u64) -> Transition {
        self.tripped_failures = failures;
        self.tripped_total = total;
        self.opened_at_millis = now_millis;
        let from = std::mem::replace(&mut self.state, CircuitState::Open);
        Transition { from, to: CircuitState::Open, failure_count: failures, total_count: total }
    }

    fn roll_window(&mut self, now_millis: u64, config: &CircuitConfig) {
        if now_millis.saturating_sub(self.window_start_millis) >= millis(config.window) {
            self.reset_window(now_millis);
        }
    }

    fn reset_window(&mut self, now_millis: u64) {
        self.failure_count = 0;
        self.total_count = 0;
        self.window_start_millis = now_millis;
    }
}
