//! Policy thresholds and operational settings.
//!
//! Both are validated before the engine sees them; a bad value is a
//! [`ConfigError`] at construction time, never a per-request surprise.
//! [`ThresholdsHandle`] allows thresholds to be swapped live while every
//! decision still works from one immutable snapshot.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::error::ConfigError;

pub const MINUTE_MS: u64 = 60_000;
pub const HOUR_MS: u64 = 60 * MINUTE_MS;
pub const DAY_MS: u64 = 24 * HOUR_MS;

/// Limits applied to every admission decision.
///
/// Global caps count all identities on one endpoint; identity caps count a single
/// identity on one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, deny_unknown_fields))]
pub struct PolicyThresholds {
    /// Requests one identity may make inside any 1 s window.
    pub max_burst_requests: u32,
    /// Minimum gap between two requests of one identity. Zero disables the rule.
    pub min_request_interval_ms: u64,
    pub max_requests_per_minute: u64,
    pub max_requests_per_hour: u64,
    pub max_requests_per_day: u64,
    pub max_identity_requests_per_minute: u64,
    pub max_identity_requests_per_hour: u64,
    /// Length of an automatic ban.
    pub blacklist_duration_ms: u64,
    /// Violations inside `violation_window_ms` that trigger an automatic ban.
    pub auto_blacklist_threshold: u32,
    /// Trailing window over which violations are counted.
    pub violation_window_ms: u64,
}

impl Default for PolicyThresholds {
    fn default() -> Self {
        Self {
            max_burst_requests: 10,
            min_request_interval_ms: 100,
            max_requests_per_minute: 60,
            max_requests_per_hour: 1_000,
            max_requests_per_day: 10_000,
            max_identity_requests_per_minute: 10,
            max_identity_requests_per_hour: 100,
            blacklist_duration_ms: HOUR_MS,
            auto_blacklist_threshold: 3,
            violation_window_ms: HOUR_MS,
        }
    }
}

impl PolicyThresholds {
    /// Reject zero caps, durations and thresholds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required: [(&'static str, u64); 9] = [
            ("max_burst_requests", u64::from(self.max_burst_requests)),
            ("max_requests_per_minute", self.max_requests_per_minute),
            ("max_requests_per_hour", self.max_requests_per_hour),
            ("max_requests_per_day", self.max_requests_per_day),
            ("max_identity_requests_per_minute", self.max_identity_requests_per_minute),
            ("max_identity_requests_per_hour", self.max_identity_requests_per_hour),
            ("blacklist_duration_ms", self.blacklist_duration_ms),
            ("auto_blacklist_threshold", u64::from(self.auto_blacklist_threshold)),
            ("violation_window_ms", self.violation_window_ms),
        ];
        match required.iter().find(|&&(_, value)| value == 0) {
            Some(&(field, _)) => Err(ConfigError::Zero { field }),
            None => Ok(()),
        }
    }

    pub fn blacklist_duration(&self) -> Duration {
        Duration::from_millis(self.blacklist_duration_ms)
    }

    /// Parse a JSON document (missing fields take defaults) and validate it.
    #[cfg(feature = "serde")]
    pub fn from_json_str(doc: &str) -> Result<Self, ConfigError> {
        let thresholds: Self =
            serde_json::from_str(doc).map_err(|e| ConfigError::Parse(e.to_string()))?;
        thresholds.validate()?;
        Ok(thresholds)
    }
}

/// Operational knobs that do not change what is allowed, only how it is enforced.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, deny_unknown_fields))]
pub struct EngineSettings {
    /// Upper bound for any single collaborator call.
    pub store_timeout_ms: u64,
    /// How long a cached ban is trusted before it is re-checked against the store.
    pub cache_revalidate_after_ms: u64,
    /// Ledger rows older than this are purged by the maintenance task.
    pub ledger_retention_ms: u64,
    /// Burst lists untouched for this long are dropped by the maintenance task.
    pub burst_idle_after_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            store_timeout_ms: 250,
            cache_revalidate_after_ms: 30_000,
            ledger_retention_ms: 7 * DAY_MS,
            burst_idle_after_ms: MINUTE_MS,
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_timeout_ms == 0 || self.store_timeout_ms == u64::MAX {
            return Err(ConfigError::InvalidDuration {
                field: "store_timeout_ms",
                value: self.store_timeout(),
            });
        }
        if self.ledger_retention_ms == 0 {
            return Err(ConfigError::Zero { field: "ledger_retention_ms" });
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn ledger_retention(&self) -> Duration {
        Duration::from_millis(self.ledger_retention_ms)
    }

    #[cfg(feature = "serde")]
    pub fn from_json_str(doc: &str) -> Result<Self, ConfigError> {
        let settings: Self =
            serde_json::from_str(doc).map_err(|e| ConfigError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }
}

/// Live-updatable thresholds with lock-free reads.
///
/// Clones share the same underlying value.
#[derive(Debug, Clone)]
pub struct ThresholdsHandle {
    inner: Arc<ArcSwap<PolicyThresholds>>,
}

impl ThresholdsHandle {
    pub fn new(thresholds: PolicyThresholds) -> Result<Self, ConfigError> {
        thresholds.validate()?;
        Ok(Self { inner: Arc::new(ArcSwap::from_pointee(thresholds)) })
    }

    /// Snapshot the current thresholds (cheap clone of Arc).
    pub fn get(&self) -> Arc<PolicyThresholds> {
        self.inner.load_full()
    }

    /// Replace the thresholds; invalid values leave the current ones in place.
    pub fn set(&self, thresholds: PolicyThresholds) -> Result<(), ConfigError> {
        thresholds.validate()?;
        self.inner.store(Arc::new(thresholds));
        Ok(())
    }

    /// Update via closure, validating the result.
    pub fn update<F>(&self, f: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&PolicyThresholds) -> PolicyThresholds,
    {
        let next = f(&self.inner.load_full());
        self.set(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(PolicyThresholds::default().validate().is_ok());
        assert!(EngineSettings::default().validate().is_ok());
    }

    #[test]
    fn zero_caps_are_rejected() {
        let thresholds =
            PolicyThresholds { max_requests_per_hour: 0, ..PolicyThresholds::default() };
        assert_eq!(
            thresholds.validate(),
            Err(ConfigError::Zero { field: "max_requests_per_hour" })
        );

        let thresholds =
            PolicyThresholds { auto_blacklist_threshold: 0, ..PolicyThresholds::default() };
        assert!(thresholds.validate().is_err());
    }

    #[test]
    fn zero_interval_is_allowed() {
        let thresholds =
            PolicyThresholds { min_request_interval_ms: 0, ..PolicyThresholds::default() };
        assert!(thresholds.validate().is_ok());
    }

    #[test]
    fn zero_store_timeout_is_rejected() {
        let settings = EngineSettings { store_timeout_ms: 0, ..EngineSettings::default() };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidDuration { field: "store_timeout_ms", .. })
        ));
    }

    #[test]
    fn handle_refuses_invalid_update() {
        let handle = ThresholdsHandle::new(PolicyThresholds::default()).unwrap();
        let err = handle.update(|t| PolicyThresholds { max_burst_requests: 0, ..t.clone() });
        assert!(err.is_err());
        assert_eq!(handle.get().max_burst_requests, 10);

        handle.update(|t| PolicyThresholds { max_burst_requests: 3, ..t.clone() }).unwrap();
        assert_eq!(handle.get().max_burst_requests, 3);
    }

    #[test]
    fn snapshot_is_stable_across_set() {
        let handle = ThresholdsHandle::new(PolicyThresholds::default()).unwrap();
        let snapshot = handle.get();
        handle
            .set(PolicyThresholds { max_requests_per_minute: 1, ..PolicyThresholds::default() })
            .unwrap();
        assert_eq!(snapshot.max_requests_per_minute, 60);
        assert_eq!(handle.get().max_requests_per_minute, 1);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_fills_defaults_and_validates() {
        let parsed =
            PolicyThresholds::from_json_str(r#"{"max_burst_requests": 4, "auto_blacklist_threshold": 5}"#)
                .unwrap();
        assert_eq!(parsed.max_burst_requests, 4);
        assert_eq!(parsed.auto_blacklist_threshold, 5);
        assert_eq!(parsed.max_requests_per_minute, 60);

        let err = PolicyThresholds::from_json_str(r#"{"max_requests_per_day": 0}"#).unwrap_err();
        assert_eq!(err, ConfigError::Zero { field: "max_requests_per_day" });
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_rejects_negative_and_unknown_fields() {
        assert!(matches!(
            PolicyThresholds::from_json_str(r#"{"max_burst_requests": -1}"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            EngineSettings::from_json_str(r#"{"store_timeout": 10}"#),
            Err(ConfigError::Parse(_))
        ));
    }
}
