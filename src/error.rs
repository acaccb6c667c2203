//! Error types for the admission engine.
//!
//! A policy denial is not an error: it is an [`AdmissionResult`](crate::AdmissionResult)
//! with `allowed == false`. The types here cover misconfiguration, failing
//! collaborators, and the tower middleware's error surface.

use std::fmt;
use std::time::Duration;

use crate::admission::AdmissionResult;

/// Error shape returned by every collaborator trait (ledger, blacklist store, ...).
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Names the external dependency a fault came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Collaborator {
    SessionProvider,
    AddressLookup,
    Ledger,
    BlacklistStore,
    ViolationLog,
}

impl Collaborator {
    /// Stable snake_case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collaborator::SessionProvider => "session_provider",
            Collaborator::AddressLookup => "address_lookup",
            Collaborator::Ledger => "ledger",
            Collaborator::BlacklistStore => "blacklist_store",
            Collaborator::ViolationLog => "violation_log",
        }
    }
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A collaborator failed or did not answer in time.
///
/// Inside `admit()` these are caught at the call site and converted to a permissive
/// default for the check that needed the answer. Operator calls return them.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum CollaboratorError {
    /// The call exceeded the configured store timeout.
    #[error("{collaborator} timed out after {after:?}")]
    Timeout {
        /// Which dependency stalled.
        collaborator: Collaborator,
        /// The bound that was exceeded.
        after: Duration,
    },
    /// The call returned an error.
    #[error("{collaborator} failed: {source}")]
    Failed {
        /// Which dependency failed.
        collaborator: Collaborator,
        /// Underlying error reported by the backend.
        #[source]
        source: StoreError,
    },
}

impl CollaboratorError {
    pub fn collaborator(&self) -> Collaborator {
        match self {
            CollaboratorError::Timeout { collaborator, .. } => *collaborator,
            CollaboratorError::Failed { collaborator, .. } => *collaborator,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CollaboratorError::Timeout { .. })
    }
}

/// Rejected configuration. Raised at construction time, never per request.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A limit that must be positive was zero.
    #[error("{field} must be > 0 (got 0)")]
    Zero {
        /// Name of the offending field.
        field: &'static str,
    },
    /// A duration was outside the accepted range.
    #[error("{field} must be non-zero and finite (got {value:?})")]
    InvalidDuration {
        /// Name of the offending field.
        field: &'static str,
        /// Value provided by caller.
        value: Duration,
    },
    /// A required builder component was not supplied.
    #[error("missing {0}")]
    Missing(&'static str),
    /// The configuration document could not be parsed.
    #[error("invalid configuration document: {0}")]
    Parse(String),
}

/// Error returned by [`AdmissionService`](crate::middleware::AdmissionService).
#[derive(Debug)]
pub enum GuardError<E> {
    /// The admission engine denied the request; the wrapped service was not called.
    Denied(Box<AdmissionResult>),
    /// The wrapped service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for GuardError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardError::Denied(result) => write!(f, "request denied: {}", result.message()),
            GuardError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GuardError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GuardError::Inner(e) => Some(e),
            GuardError::Denied(_) => None,
        }
    }
}

impl<E> GuardError<E> {
    pub fn is_denied(&self) -> bool {
        matches!(self, GuardError::Denied(_))
    }

    /// The denial details, if this is a denial.
    pub fn denial(&self) -> Option<&AdmissionResult> {
        match self {
            GuardError::Denied(result) => Some(result),
            GuardError::Inner(_) => None,
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            GuardError::Inner(e) => Some(e),
            GuardError::Denied(_) => None,
        }
    }
}
