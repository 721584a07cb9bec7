//! Declarative guard configuration (feature `serde`).
//!
//! Settings deserialize from any serde format, with field names in either `snake_case`
//! or `camelCase`. Durations are whole seconds, except the store timeout which is in
//! milliseconds. Every setting is validated when converted into the runtime config
//! types, and named fallbacks are resolved once, when the guard is built.
//!
//! ```rust
//! use tollgate::config::GuardSettings;
//! use tollgate::{FallbackTable, Gatekeeper, InMemoryCounterStore};
//!
//! let settings: GuardSettings = serde_json::from_str(r#"{
//!     "scope": "api::TestController",
//!     "name": "test",
//!     "rateLimit": { "limit": 3, "windowSeconds": 60, "fallbackMethod": "queued" },
//!     "circuitBreaker": { "failureThreshold": 0.5, "minRequests": 2, "openSeconds": 1 }
//! }"#).unwrap();
//!
//! let fallbacks = FallbackTable::new()
//!     .with("queued", || async { Ok::<_, std::io::Error>("queued".to_string()) });
//! let gatekeeper = Gatekeeper::new(InMemoryCounterStore::new());
//! let guard = settings.build(&gatekeeper, &fallbacks).unwrap();
//! assert_eq!(guard.key().as_str(), "api::TestController.test");
//! ```

use crate::circuit_breaker::{CircuitConfig, CircuitConfigError};
use crate::fallback::FallbackTable;
use crate::guard::{Gatekeeper, GatekeeperBuilder, Guard, GuardConfigError};
use crate::key::{KeyError, OperationKey};
use crate::rate_limit::fixed_window::DEFAULT_STORE_TIMEOUT;
use crate::rate_limit::{RateLimitConfig, RateLimitConfigError, StoreFailurePolicy, DEFAULT_KEY_PREFIX};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rate-limit settings for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    #[serde(alias = "keyPrefix")]
    pub key_prefix: String,
    pub limit: u64,
    #[serde(alias = "windowSeconds")]
    pub window_seconds: u64,
    /// Name of a handler in the [`FallbackTable`] passed to [`GuardSettings::build`].
    #[serde(alias = "fallbackMethod", skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self { key_prefix: DEFAULT_KEY_PREFIX.to_string(), limit: 10, window_seconds: 60, fallback: None }
    }
}

impl TryFrom<&RateLimitSettings> for RateLimitConfig {
    type Error = RateLimitConfigError;

    fn try_from(settings: &RateLimitSettings) -> Result<Self, Self::Error> {
        RateLimitConfig::new(settings.key_prefix.clone(), settings.limit, settings.window_seconds)
    }
}

/// Circuit-breaker settings for one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    #[serde(alias = "failureThreshold")]
    pub failure_threshold: f64,
    #[serde(alias = "windowSeconds")]
    pub window_seconds: u64,
    #[serde(alias = "openSeconds")]
    pub open_seconds: u64,
    #[serde(alias = "minRequests")]
    pub min_requests: u64,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self { failure_threshold: 0.5, window_seconds: 60, open_seconds: 30, min_requests: 5 }
    }
}

impl TryFrom<&CircuitSettings> for CircuitConfig {
    type Error = CircuitConfigError;

    fn try_from(settings: &CircuitSettings) -> Result<Self, Self::Error> {
        CircuitConfig::new(
            settings.failure_threshold,
            settings.window_seconds,
            settings.open_seconds,
            settings.min_requests,
        )
    }
}

/// Everything needed to build the guard for one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardSettings {
    pub scope: String,
    pub name: String,
    #[serde(default, alias = "rateLimit", skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSettings>,
    #[serde(default, alias = "circuitBreaker", skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitSettings>,
}

impl GuardSettings {
    pub fn key(&self) -> Result<OperationKey, KeyError> {
        OperationKey::new(&self.scope, &self.name)
    }

    /// Validate the settings and build a guard on `gatekeeper`, resolving a named
    /// fallback against `fallbacks`.
    pub fn build<T: Send + 'static>(
        &self,
        gatekeeper: &Gatekeeper,
        fallbacks: &FallbackTable<T>,
    ) -> Result<Guard<T>, GuardConfigError> {
        let mut builder = gatekeeper.guard(self.key()?);
        if let Some(rate_limit) = &self.rate_limit {
            builder = builder.rate_limit(RateLimitConfig::try_from(rate_limit)?);
            if let Some(name) = &rate_limit.fallback {
                builder = builder.fallback_named(fallbacks, name);
            }
        }
        if let Some(circuit) = &self.circuit_breaker {
            builder = builder.circuit_breaker(CircuitConfig::try_from(circuit)?);
        }
        builder.build()
    }
}

/// Limiter-wide settings applied to a [`GatekeeperBuilder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatekeeperSettings {
    #[serde(alias = "storeTimeoutMillis")]
    pub store_timeout_millis: u64,
    /// Admit calls when the counter store fails instead of denying them.
    #[serde(alias = "failOpen")]
    pub fail_open: bool,
}

impl Default for GatekeeperSettings {
    fn default() -> Self {
        Self {
            store_timeout_millis: u64::try_from(DEFAULT_STORE_TIMEOUT.as_millis()).unwrap_or(250),
            fail_open: false,
        }
    }
}

impl GatekeeperSettings {
    pub fn apply(&self, builder: GatekeeperBuilder) -> GatekeeperBuilder {
        let policy = if self.fail_open { StoreFailurePolicy::FailOpen } else { StoreFailurePolicy::FailClosed };
        builder
            .store_timeout(Duration::from_millis(self.store_timeout_millis))
            .store_failure_policy(policy)
    }
}
