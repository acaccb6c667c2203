//! Multi-horizon request caps counted against the ledger.
//!
//! Horizons are checked in a fixed order, tightest bound first, and the first
//! breach wins. A failed count lets that one horizon pass (fail-open) and is
//! reported back to the caller; the remaining horizons are still checked.

use std::fmt;
use std::sync::Arc;

use crate::config::{PolicyThresholds, DAY_MS, HOUR_MS, MINUTE_MS};
use crate::error::{Collaborator, CollaboratorError};
use crate::ledger::{RequestEvent, RequestLedger, Scope};
use crate::timeout::CallTimeout;
use crate::violation::ViolationKind;

/// One capped trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Horizon {
    GlobalMinute,
    GlobalHour,
    GlobalDay,
    IdentityMinute,
    IdentityHour,
}

impl Horizon {
    /// Evaluation order.
    pub const ORDER: [Horizon; 5] = [
        Horizon::GlobalMinute,
        Horizon::GlobalHour,
        Horizon::GlobalDay,
        Horizon::IdentityMinute,
        Horizon::IdentityHour,
    ];

    pub fn span_ms(&self) -> u64 {
        match self {
            Horizon::GlobalMinute | Horizon::IdentityMinute => MINUTE_MS,
            Horizon::GlobalHour | Horizon::IdentityHour => HOUR_MS,
            Horizon::GlobalDay => DAY_MS,
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Horizon::GlobalMinute | Horizon::GlobalHour | Horizon::GlobalDay)
    }

    pub fn limit(&self, thresholds: &PolicyThresholds) -> u64 {
        match self {
            Horizon::GlobalMinute => thresholds.max_requests_per_minute,
            Horizon::GlobalHour => thresholds.max_requests_per_hour,
            Horizon::GlobalDay => thresholds.max_requests_per_day,
            Horizon::IdentityMinute => thresholds.max_identity_requests_per_minute,
            Horizon::IdentityHour => thresholds.max_identity_requests_per_hour,
        }
    }

    pub fn violation(&self) -> ViolationKind {
        match self {
            Horizon::GlobalMinute => ViolationKind::RateLimitMinute,
            Horizon::GlobalHour => ViolationKind::RateLimitHour,
            Horizon::GlobalDay => ViolationKind::RateLimitDay,
            Horizon::IdentityMinute => ViolationKind::IdentityLimitMinute,
            Horizon::IdentityHour => ViolationKind::IdentityLimitHour,
        }
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Horizon::GlobalMinute => "global/minute",
            Horizon::GlobalHour => "global/hour",
            Horizon::GlobalDay => "global/day",
            Horizon::IdentityMinute => "identity/minute",
            Horizon::IdentityHour => "identity/hour",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOutcome {
    /// Every horizon is under its cap.
    Within {
        /// Global per-minute headroom; `None` if that count failed.
        remaining: Option<u64>,
        /// When the minute window resets, epoch milliseconds.
        reset_at: u64,
    },
    /// `horizon` already holds `count` requests against a cap of `limit`.
    Exceeded { horizon: Horizon, count: u64, limit: u64 },
}

#[derive(Debug)]
pub struct WindowVerdict {
    pub outcome: WindowOutcome,
    pub faults: Vec<CollaboratorError>,
}

/// Counts ledger rows for each horizon.
#[derive(Clone)]
pub struct WindowCounter {
    ledger: Arc<dyn RequestLedger>,
    timeout: CallTimeout,
}

impl fmt::Debug for WindowCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowCounter").field("timeout", &self.timeout).finish()
    }
}

impl WindowCounter {
    pub fn new(ledger: Arc<dyn RequestLedger>, timeout: CallTimeout) -> Self {
        Self { ledger, timeout }
    }

    pub async fn count_since(
        &self,
        scope: Scope<'_>,
        endpoint: Option<&str>,
        since: u64,
    ) -> Result<u64, CollaboratorError> {
        self.timeout
            .call(Collaborator::Ledger, self.ledger.count_since(scope, endpoint, since))
            .await
    }

    pub async fn evaluate(
        &self,
        identity: &str,
        endpoint: &str,
        now: u64,
        thresholds: &PolicyThresholds,
    ) -> WindowVerdict {
        let mut faults = Vec::new();
        let mut remaining = None;

        for horizon in Horizon::ORDER {
            let scope = if horizon.is_global() { Scope::All } else { Scope::Identity(identity) };
            let since = now.saturating_sub(horizon.span_ms());
            let limit = horizon.limit(thresholds);

            match self.count_since(scope, Some(endpoint), since).await {
                Ok(count) if count >= limit => {
                    return WindowVerdict {
                        outcome: WindowOutcome::Exceeded { horizon, count, limit },
                        faults,
                    };
                }
                Ok(count) => {
                    if horizon == Horizon::GlobalMinute {
                        remaining = Some(limit.saturating_sub(count));
                    }
                }
                Err(fault) => {
                    tracing::warn!(
                        target: "gatekeeper::window",
                        %horizon,
                        error = %fault,
                        "window count failed; horizon skipped"
                    );
                    faults.push(fault);
                }
            }
        }

        WindowVerdict {
            outcome: WindowOutcome::Within { remaining, reset_at: now.saturating_add(MINUTE_MS) },
            faults,
        }
    }

    /// Append an admitted request to the ledger.
    pub async fn record(&self, event: RequestEvent) -> Result<(), CollaboratorError> {
        self.timeout.call(Collaborator::Ledger, self.ledger.append(event)).await
    }

    pub async fn purge_older_than(&self, cutoff: u64) -> Result<u64, CollaboratorError> {
        self.timeout.call(Collaborator::Ledger, self.ledger.purge_older_than(cutoff)).await
    }
}
