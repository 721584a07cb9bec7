//! Stable identities for protected operations.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Errors produced when building an [`OperationKey`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// The declaring scope was empty.
    #[error("operation scope must not be empty")]
    EmptyScope,
    /// The declaring scope started with ':', which would blur the prefix boundary in
    /// counter keys.
    #[error("operation scope {0:?} must not start with ':'")]
    InvalidScope(String),
    /// The operation name was empty.
    #[error("operation name must not be empty")]
    EmptyName,
    /// The operation name contained a separator or whitespace.
    #[error("operation name {0:?} must not contain '.', ':' or whitespace")]
    InvalidName(String),
}

/// Identity of a protected operation: `<scope>.<name>`.
///
/// The scope is free-form (module paths like `billing::Invoices` are fine) but the
/// name may not contain `.` or `:`, so the last `.` always splits the two halves and
/// distinct `(scope, name)` pairs never render to the same key.
///
/// Cloning is cheap; the rendered string is shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationKey(Arc<str>);

impl OperationKey {
    /// Build a key from the declaring scope and the operation name.
    ///
    /// ```
    /// use tollgate::OperationKey;
    /// let key = OperationKey::new("api::TestController", "test").unwrap();
    /// assert_eq!(key.as_str(), "api::TestController.test");
    /// ```
    pub fn new(scope: impl AsRef<str>, name: impl AsRef<str>) -> Result<Self, KeyError> {
        let scope = scope.as_ref();
        let name = name.as_ref();
        if scope.is_empty() {
            return Err(KeyError::EmptyScope);
        }
        if scope.starts_with(':') {
            return Err(KeyError::InvalidScope(scope.to_string()));
        }
        if name.is_empty() {
            return Err(KeyError::EmptyName);
        }
        if name.contains(['.', ':']) || name.chars().any(char::is_whitespace) {
            return Err(KeyError::InvalidName(name.to_string()));
        }
        Ok(Self(Arc::from(format!("{scope}.{name}"))))
    }

    /// Rendered key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The declaring scope half.
    pub fn scope(&self) -> &str {
        self.0.rsplit_once('.').map(|(scope, _)| scope).unwrap_or_default()
    }

    /// The operation name half.
    pub fn name(&self) -> &str {
        self.0.rsplit_once('.').map(|(_, name)| name).unwrap_or_default()
    }

    /// Counter key used by the rate limiter: the configured prefix followed by the
    /// full operation identity.
    ///
    /// Prefixes end in ':' and scopes never start with one, so a prefix cannot absorb
    /// the start of a scope. Two prefixes where one extends the other (`a:` and `a:b:`)
    /// still share keys for scopes starting with the extra segment; keep prefixes
    /// disjoint.
    pub(crate) fn with_prefix(&self, prefix: &str) -> Arc<str> {
        Arc::from(format!("{prefix}{}", self.0))
    }
}

impl Deref for OperationKey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
