//! In-process burst detection.
//!
//! Keeps each identity's request timestamps from the last second and rejects a
//! request when the second is already full or when it follows the previous one
//! too closely. Never touches a collaborator, so it cannot fail.

use std::collections::VecDeque;

use dashmap::DashMap;

/// Length of the burst window.
pub const BURST_WINDOW_MS: u64 = 1_000;

/// Result of a burst check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstVerdict {
    /// Request recorded.
    Allowed,
    /// The last second already holds `in_window` requests.
    TooMany { in_window: usize },
    /// Only `gap_ms` since the previous request.
    TooSoon { gap_ms: u64 },
}

impl BurstVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, BurstVerdict::Allowed)
    }
}

/// Per-identity sliding one-second window.
///
/// Each identity's list lives in its own map shard entry, so concurrent checks for
/// the same identity are serialized and never lose an update.
#[derive(Debug, Default)]
pub struct BurstGuard {
    windows: DashMap<String, VecDeque<u64>>,
}

impl BurstGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(
        &self,
        identity: &str,
        now: u64,
        max_burst_requests: u32,
        min_request_interval_ms: u64,
    ) -> BurstVerdict {
        let mut stamps = self.windows.entry(identity.to_string()).or_default();

        while let Some(&front) = stamps.front() {
            if now.saturating_sub(front) < BURST_WINDOW_MS {
                break;
            }
            stamps.pop_front();
        }

        if stamps.len() >= max_burst_requests as usize {
            return BurstVerdict::TooMany { in_window: stamps.len() };
        }
        if let Some(&last) = stamps.back() {
            let gap_ms = now.saturating_sub(last);
            if gap_ms < min_request_interval_ms {
                return BurstVerdict::TooSoon { gap_ms };
            }
        }

        stamps.push_back(now);
        BurstVerdict::Allowed
    }

    /// Drop identities whose latest request is older than `idle_after_ms` (never
    /// less than the burst window). Returns how many were dropped.
    pub fn sweep(&self, now: u64, idle_after_ms: u64) -> usize {
        let idle_after_ms = idle_after_ms.max(BURST_WINDOW_MS);
        let before = self.windows.len();
        self.windows.retain(|_, stamps| {
            stamps.back().is_some_and(|&last| now.saturating_sub(last) < idle_after_ms)
        });
        before.saturating_sub(self.windows.len())
    }

    /// Number of identities currently tracked.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}
