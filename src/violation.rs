//! Violation tracking and automatic escalation to a ban.
//!
//! Violations are counted per identity over a trailing window
//! ([`PolicyThresholds::violation_window_ms`]), so old breaches decay instead of
//! accumulating for the whole process lifetime. Reaching
//! [`PolicyThresholds::auto_blacklist_threshold`] inside the window writes a ban
//! and clears the identity's history.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::blacklist::{BlacklistEntry, BlacklistStore};
use crate::config::{PolicyThresholds, DAY_MS, HOUR_MS, MINUTE_MS};
use crate::error::{Collaborator, CollaboratorError, StoreError};
use crate::timeout::CallTimeout;

/// Which policy was breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ViolationKind {
    #[cfg_attr(feature = "serde", serde(rename = "burst"))]
    Burst,
    #[cfg_attr(feature = "serde", serde(rename = "rate-limit-minute"))]
    RateLimitMinute,
    #[cfg_attr(feature = "serde", serde(rename = "rate-limit-hour"))]
    RateLimitHour,
    #[cfg_attr(feature = "serde", serde(rename = "rate-limit-day"))]
    RateLimitDay,
    #[cfg_attr(feature = "serde", serde(rename = "ip-limit-minute"))]
    IdentityLimitMinute,
    #[cfg_attr(feature = "serde", serde(rename = "ip-limit-hour"))]
    IdentityLimitHour,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::Burst => "burst",
            ViolationKind::RateLimitMinute => "rate-limit-minute",
            ViolationKind::RateLimitHour => "rate-limit-hour",
            ViolationKind::RateLimitDay => "rate-limit-day",
            ViolationKind::IdentityLimitMinute => "ip-limit-minute",
            ViolationKind::IdentityLimitHour => "ip-limit-hour",
        }
    }

    /// Retry hint handed back to the caller.
    pub fn retry_after(&self) -> Duration {
        let ms = match self {
            ViolationKind::Burst => 1_000,
            ViolationKind::RateLimitMinute | ViolationKind::IdentityLimitMinute => MINUTE_MS,
            ViolationKind::RateLimitHour | ViolationKind::IdentityLimitHour => HOUR_MS,
            ViolationKind::RateLimitDay => DAY_MS,
        };
        Duration::from_millis(ms)
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record of one denied request. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Violation {
    pub identity: String,
    pub kind: ViolationKind,
    /// Epoch milliseconds.
    pub occurred_at: u64,
    /// Violations for this identity inside the window, this one included.
    pub running_count: u32,
}

/// Durable audit log for violation records.
#[async_trait]
pub trait ViolationLog: Send + Sync {
    async fn record(&self, violation: &Violation) -> Result<(), StoreError>;
}

/// Bounded in-memory violation log, newest last.
#[derive(Debug)]
pub struct InMemoryViolationLog {
    records: Mutex<VecDeque<Violation>>,
    capacity: usize,
}

impl InMemoryViolationLog {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { records: Mutex::new(VecDeque::new()), capacity: capacity.max(1) }
    }

    /// Up to `limit` most recent records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Violation> {
        match self.records.lock() {
            Ok(records) => records.iter().rev().take(limit).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryViolationLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ViolationLog for InMemoryViolationLog {
    async fn record(&self, violation: &Violation) -> Result<(), StoreError> {
        let mut records = self.records.lock().map_err(|_| "violation log lock poisoned")?;
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(violation.clone());
        Ok(())
    }
}

/// What recording a violation produced.
#[derive(Debug)]
pub struct ViolationOutcome {
    pub violation: Violation,
    /// Set when this violation reached the auto-ban threshold.
    pub ban: Option<BlacklistEntry>,
    /// Collaborator faults hit while persisting; enforcement still happened locally.
    pub faults: Vec<CollaboratorError>,
}

/// Per-identity windowed violation counter with auto-escalation.
pub struct ViolationTracker {
    history: DashMap<String, VecDeque<u64>>,
    blacklist: Arc<BlacklistStore>,
    log: Arc<dyn ViolationLog>,
    timeout: CallTimeout,
}

impl fmt::Debug for ViolationTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViolationTracker").field("tracked", &self.history.len()).finish()
    }
}

impl ViolationTracker {
    pub fn new(
        blacklist: Arc<BlacklistStore>,
        log: Arc<dyn ViolationLog>,
        timeout: CallTimeout,
    ) -> Self {
        Self { history: DashMap::new(), blacklist, log, timeout }
    }

    /// Count the violation, persist its record, and ban the identity if the
    /// threshold is reached.
    pub async fn record_violation(
        &self,
        identity: &str,
        kind: ViolationKind,
        now: u64,
        thresholds: &PolicyThresholds,
    ) -> ViolationOutcome {
        let running_count = self.bump(identity, now, thresholds.violation_window_ms);
        let violation =
            Violation { identity: identity.to_string(), kind, occurred_at: now, running_count };
        let mut faults = Vec::new();

        if let Err(fault) =
            self.timeout.call(Collaborator::ViolationLog, self.log.record(&violation)).await
        {
            faults.push(fault);
        }

        let mut ban = None;
        if running_count >= thresholds.auto_blacklist_threshold {
            let entry = BlacklistEntry::new(
                identity,
                format!("auto-blacklisted after {running_count} violations"),
                now.saturating_add(thresholds.blacklist_duration_ms),
            );
            tracing::warn!(
                target: "gatekeeper::violation",
                identity,
                violations = running_count,
                expires_at = entry.expires_at,
                "auto-blacklisting identity"
            );
            if let Err(fault) = self.blacklist.ban(entry.clone(), now).await {
                faults.push(fault);
            }
            self.clear(identity);
            ban = Some(entry);
        }

        ViolationOutcome { violation, ban, faults }
    }

    fn bump(&self, identity: &str, now: u64, window_ms: u64) -> u32 {
        let mut stamps = self.history.entry(identity.to_string()).or_default();
        prune(&mut stamps, now, window_ms);
        stamps.push_back(now);
        u32::try_from(stamps.len()).unwrap_or(u32::MAX)
    }

    /// Violations for `identity` inside the window ending at `now`.
    pub fn count(&self, identity: &str, now: u64, window_ms: u64) -> u32 {
        self.history
            .get(identity)
            .map(|stamps| stamps.iter().filter(|&&t| in_window(t, now, window_ms)).count())
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(0)
    }

    /// Violations across all identities inside the window.
    pub fn total_recent(&self, now: u64, window_ms: u64) -> u64 {
        self.history
            .iter()
            .map(|entry| entry.value().iter().filter(|&&t| in_window(t, now, window_ms)).count() as u64)
            .sum()
    }

    /// Forget an identity's history.
    pub fn clear(&self, identity: &str) {
        self.history.remove(identity);
    }

    /// Decay old violations; returns the number of identities dropped entirely.
    pub fn sweep(&self, now: u64, window_ms: u64) -> usize {
        let before = self.history.len();
        self.history.retain(|_, stamps| {
            prune(stamps, now, window_ms);
            !stamps.is_empty()
        });
        before.saturating_sub(self.history.len())
    }

    pub fn tracked(&self) -> usize {
        self.history.len()
    }
}

fn in_window(stamp: u64, now: u64, window_ms: u64) -> bool {
    now.saturating_sub(stamp) < window_ms
}

fn prune(stamps: &mut VecDeque<u64>, now: u64, window_ms: u64) {
    while let Some(&front) = stamps.front() {
        if in_window(front, now, window_ms) {
            break;
        }
        stamps.pop_front();
    }
}
