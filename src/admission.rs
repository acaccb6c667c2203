//! The admission controller: one allow/deny decision per request.
//!
//! Checks run in a fixed order and the first denial wins:
//!
//! ```text
//! START → BLACKLIST → BURST → GLOBAL_MINUTE → GLOBAL_HOUR → GLOBAL_DAY
//!       → IDENTITY_MINUTE → IDENTITY_HOUR → ALLOW (append to ledger)
//! ```
//!
//! Every denial except the blacklist one is recorded as a violation and may
//! escalate to a ban. Collaborator faults never surface to the caller: the check
//! that needed the collaborator passes and a
//! [`SecurityEventKind::CollaboratorUnavailable`] event is emitted instead.
//!
//! The window counts and the ledger append for one endpoint run under a per-endpoint
//! lock, so two concurrent requests cannot both see `limit - 1` and both pass.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::blacklist::{BlacklistDurableStore, BlacklistEntry, BlacklistStore};
use crate::burst::{BurstGuard, BurstVerdict};
use crate::clock::{Clock, SystemClock};
use crate::config::{EngineSettings, PolicyThresholds, ThresholdsHandle, MINUTE_MS};
use crate::error::{CollaboratorError, ConfigError};
use crate::events::{emit_best_effort, NullSink, SecurityEvent, SecurityEventKind, SecurityEventSink};
use crate::identity::{ClientIdentity, IdentityResolver};
use crate::ledger::{RequestEvent, RequestLedger, Scope};
use crate::timeout::CallTimeout;
use crate::violation::{InMemoryViolationLog, ViolationKind, ViolationLog, ViolationTracker};
use crate::window::{WindowCounter, WindowOutcome};

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The identity has an active ban.
    Blacklisted,
    /// A policy check failed.
    Policy(ViolationKind),
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Blacklisted => "blacklisted",
            DenyReason::Policy(kind) => kind.as_str(),
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`AdmissionController::admit`]. Times are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionResult {
    pub allowed: bool,
    /// Identity key the decision was made for.
    pub identity: String,
    pub reason: Option<DenyReason>,
    /// Global per-minute headroom on ALLOW, when known.
    pub remaining: Option<u64>,
    /// When the minute window resets, on ALLOW.
    pub reset_at: Option<u64>,
    /// How long the caller should wait before retrying, on DENY.
    pub retry_after: Option<Duration>,
    /// Set when the identity is (or just became) banned.
    pub banned_until: Option<u64>,
}

impl AdmissionResult {
    fn allowed(identity: String, remaining: Option<u64>, reset_at: u64) -> Self {
        Self {
            allowed: true,
            identity,
            reason: None,
            remaining,
            reset_at: Some(reset_at),
            retry_after: None,
            banned_until: None,
        }
    }

    fn denied(
        identity: String,
        reason: DenyReason,
        retry_after: Duration,
        banned_until: Option<u64>,
    ) -> Self {
        Self {
            allowed: false,
            identity,
            reason: Some(reason),
            remaining: None,
            reset_at: None,
            retry_after: Some(retry_after),
            banned_until,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Human-readable explanation suitable for an end user.
    pub fn message(&self) -> String {
        let Some(reason) = self.reason else {
            return "allowed".to_string();
        };
        let text = match reason {
            DenyReason::Blacklisted => "access temporarily blocked",
            DenyReason::Policy(ViolationKind::Burst) => "too many requests in a short burst",
            DenyReason::Policy(ViolationKind::RateLimitMinute) => "service is busy this minute",
            DenyReason::Policy(ViolationKind::RateLimitHour) => "service is busy this hour",
            DenyReason::Policy(ViolationKind::RateLimitDay) => "daily capacity reached",
            DenyReason::Policy(ViolationKind::IdentityLimitMinute) => {
                "too many requests from you this minute"
            }
            DenyReason::Policy(ViolationKind::IdentityLimitHour) => {
                "too many requests from you this hour"
            }
        };
        match self.retry_after {
            Some(wait) => format!("{text}; retry after {}s", wait.as_secs().max(1)),
            None => text.to_string(),
        }
    }
}

/// Snapshot for operator dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AdmissionStatus {
    /// Identities with an active ban.
    pub banned_count: u64,
    /// Violations inside the violation window, all identities.
    pub recent_violations: u64,
    /// Admitted requests in the last minute, all identities and endpoints.
    pub active_requests_last_minute: u64,
}

/// Per-endpoint async locks serializing the count-then-append section.
#[derive(Debug, Default)]
struct AdmissionLanes {
    lanes: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl AdmissionLanes {
    async fn enter(&self, endpoint: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lane = self.lanes.entry(endpoint.to_string()).or_default().clone();
        lane.lock_owned().await
    }

    /// Drop lanes nobody is waiting on; returns how many were dropped.
    fn prune(&self) -> usize {
        let before = self.lanes.len();
        self.lanes.retain(|_, lane| Arc::strong_count(lane) > 1);
        before.saturating_sub(self.lanes.len())
    }
}

/// Composes the blacklist, burst guard, window counter and violation tracker.
pub struct AdmissionController<S = NullSink> {
    resolver: IdentityResolver,
    blacklist: Arc<BlacklistStore>,
    burst: BurstGuard,
    windows: WindowCounter,
    violations: ViolationTracker,
    thresholds: ThresholdsHandle,
    settings: EngineSettings,
    timeout: CallTimeout,
    clock: Arc<dyn Clock>,
    lanes: AdmissionLanes,
    sink: S,
}

impl<S> fmt::Debug for AdmissionController<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("resolver", &self.resolver)
            .field("blacklist", &self.blacklist)
            .field("violations", &self.violations)
            .field("settings", &self.settings)
            .finish()
    }
}

impl AdmissionController<NullSink> {
    pub fn builder() -> AdmissionControllerBuilder<NullSink> {
        AdmissionControllerBuilder::new()
    }
}

impl<S> AdmissionController<S>
where
    S: SecurityEventSink + Sync,
    S::Future: Send + 'static,
{
    /// Resolve the caller and decide.
    ///
    /// Each distinct `endpoint` gets its own admission lane. Lanes are dropped by
    /// maintenance once idle, so the name set only needs to be bounded between passes.
    pub async fn admit(&self, endpoint: &str) -> AdmissionResult {
        self.admit_with(endpoint, None, None).await
    }

    /// Decide for a caller whose identity is already known.
    pub async fn admit_as(&self, endpoint: &str, identity: &ClientIdentity) -> AdmissionResult {
        self.admit_with(endpoint, Some(identity), None).await
    }

    /// Full form: optional pre-resolved identity and an informational user agent.
    pub async fn admit_with(
        &self,
        endpoint: &str,
        identity: Option<&ClientIdentity>,
        user_agent: Option<&str>,
    ) -> AdmissionResult {
        let identity = match identity {
            Some(identity) => identity.key(),
            None => {
                let resolution = self.resolver.resolve(&self.timeout).await;
                let key = resolution.identity.key();
                for fault in resolution.faults {
                    self.report_fault(&key, fault).await;
                }
                key
            }
        };
        self.decide(endpoint, identity, user_agent).await
    }

    async fn decide(
        &self,
        endpoint: &str,
        identity: String,
        user_agent: Option<&str>,
    ) -> AdmissionResult {
        let thresholds = self.thresholds.get();
        let now = self.clock.now_millis();

        let lookup = self.blacklist.is_banned(&identity, now).await;
        if let Some(fault) = lookup.fault {
            self.report_fault(&identity, fault).await;
        }
        if lookup.status.banned {
            let until = lookup.status.until.unwrap_or(now);
            tracing::debug!(target: "gatekeeper::admission", %identity, endpoint, until, "blocked");
            self.emit(SecurityEvent::new(
                SecurityEventKind::Blocked,
                identity.as_str(),
                format!("{endpoint}: banned until {until}"),
                now,
            ))
            .await;
            let wait = Duration::from_millis(until.saturating_sub(now));
            return AdmissionResult::denied(identity, DenyReason::Blacklisted, wait, Some(until));
        }

        match self.burst.check(
            &identity,
            now,
            thresholds.max_burst_requests,
            thresholds.min_request_interval_ms,
        ) {
            BurstVerdict::Allowed => {}
            BurstVerdict::TooMany { in_window } => {
                let detail = format!("{endpoint}: {in_window} requests in the last second");
                return self.deny(identity, ViolationKind::Burst, detail, now, &thresholds).await;
            }
            BurstVerdict::TooSoon { gap_ms } => {
                let detail = format!("{endpoint}: {gap_ms}ms since previous request");
                return self.deny(identity, ViolationKind::Burst, detail, now, &thresholds).await;
            }
        }

        // Re-read the clock inside the lane so ledger timestamps never run backwards.
        let lane = self.lanes.enter(endpoint).await;
        let now = self.clock.now_millis();
        let verdict = self.windows.evaluate(&identity, endpoint, now, &thresholds).await;
        let mut faults = verdict.faults;
        let admitted = match verdict.outcome {
            WindowOutcome::Exceeded { horizon, count, limit } => Err((horizon, count, limit)),
            WindowOutcome::Within { remaining, reset_at } => {
                let event = RequestEvent {
                    identity: identity.clone(),
                    endpoint: endpoint.to_string(),
                    timestamp: now,
                    user_agent: user_agent.map(str::to_string),
                };
                if let Err(fault) = self.windows.record(event).await {
                    faults.push(fault);
                }
                Ok((remaining, reset_at))
            }
        };
        drop(lane);

        for fault in faults {
            self.report_fault(&identity, fault).await;
        }
        match admitted {
            Err((horizon, count, limit)) => {
                let detail = format!("{endpoint}: {horizon} at {count}/{limit}");
                self.deny(identity, horizon.violation(), detail, now, &thresholds).await
            }
            Ok((remaining, reset_at)) => {
                tracing::debug!(target: "gatekeeper::admission", %identity, endpoint, ?remaining, "allowed");
                AdmissionResult::allowed(identity, remaining, reset_at)
            }
        }
    }

    async fn deny(
        &self,
        identity: String,
        kind: ViolationKind,
        detail: String,
        now: u64,
        thresholds: &PolicyThresholds,
    ) -> AdmissionResult {
        let outcome = self.violations.record_violation(&identity, kind, now, thresholds).await;
        tracing::debug!(
            target: "gatekeeper::admission",
            %identity,
            %kind,
            violations = outcome.violation.running_count,
            "denied"
        );

        self.emit(SecurityEvent::new(SecurityEventKind::Denied(kind), identity.as_str(), detail, now))
            .await;
        for fault in outcome.faults {
            self.report_fault(&identity, fault).await;
        }

        let banned_until = outcome.ban.as_ref().map(|ban| ban.expires_at);
        if let Some(ban) = outcome.ban {
            self.emit(SecurityEvent::new(
                SecurityEventKind::AutoBanned,
                identity.as_str(),
                format!("{} (expires {})", ban.reason, ban.expires_at),
                now,
            ))
            .await;
        }

        AdmissionResult::denied(identity, DenyReason::Policy(kind), kind.retry_after(), banned_until)
    }

    /// Operator ban. The ban is enforced by this process even if the durable write
    /// fails; the error tells the operator to retry.
    pub async fn ban(
        &self,
        identity: &str,
        reason: &str,
        duration: Duration,
    ) -> Result<BlacklistEntry, CollaboratorError> {
        let now = self.clock.now_millis();
        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let entry = BlacklistEntry::new(identity, reason, now.saturating_add(duration_ms));
        tracing::info!(target: "gatekeeper::admission", identity, reason, expires_at = entry.expires_at, "manual ban");

        let written = self.blacklist.ban(entry.clone(), now).await;
        self.emit(SecurityEvent::new(SecurityEventKind::ManualBan, identity, reason, now)).await;
        if let Err(fault) = written {
            self.emit(fault_event(identity, &fault, now)).await;
            return Err(fault);
        }
        Ok(entry)
    }

    /// Operator unban; clears the identity's violation history too. Unbanning an
    /// identity that was never banned succeeds.
    pub async fn unban(&self, identity: &str) -> Result<(), CollaboratorError> {
        let now = self.clock.now_millis();
        tracing::info!(target: "gatekeeper::admission", identity, "manual unban");
        self.violations.clear(identity);
        let removed = self.blacklist.unban(identity).await;
        self.emit(SecurityEvent::new(SecurityEventKind::Unban, identity, "operator", now)).await;
        if let Err(fault) = &removed {
            self.emit(fault_event(identity, fault, now)).await;
        }
        removed
    }

    pub async fn status(&self) -> Result<AdmissionStatus, CollaboratorError> {
        let now = self.clock.now_millis();
        let thresholds = self.thresholds.get();
        let banned_count = self.blacklist.count_active(now).await?;
        let active_requests_last_minute =
            self.windows.count_since(Scope::All, None, now.saturating_sub(MINUTE_MS)).await?;
        Ok(AdmissionStatus {
            banned_count,
            recent_violations: self.violations.total_recent(now, thresholds.violation_window_ms),
            active_requests_last_minute,
        })
    }

    /// Live thresholds; updates apply from the next decision on.
    pub fn thresholds(&self) -> &ThresholdsHandle {
        &self.thresholds
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub(crate) fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    pub(crate) fn burst_guard(&self) -> &BurstGuard {
        &self.burst
    }

    pub(crate) fn violation_tracker(&self) -> &ViolationTracker {
        &self.violations
    }

    pub(crate) fn blacklist(&self) -> &BlacklistStore {
        &self.blacklist
    }

    pub(crate) fn prune_lanes(&self) -> usize {
        self.lanes.prune()
    }

    pub(crate) fn window_counter(&self) -> &WindowCounter {
        &self.windows
    }

    pub(crate) async fn report_fault(&self, identity: &str, fault: CollaboratorError) {
        tracing::warn!(
            target: "gatekeeper::admission",
            identity,
            collaborator = %fault.collaborator(),
            error = %fault,
            "collaborator unavailable; failing open"
        );
        self.emit(fault_event(identity, &fault, self.clock.now_millis())).await;
    }

    async fn emit(&self, event: SecurityEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }
}

fn fault_event(identity: &str, fault: &CollaboratorError, now: u64) -> SecurityEvent {
    SecurityEvent::new(
        SecurityEventKind::CollaboratorUnavailable(fault.collaborator()),
        identity,
        fault.to_string(),
        now,
    )
}

/// Builder for [`AdmissionController`].
pub struct AdmissionControllerBuilder<S> {
    ledger: Option<Arc<dyn RequestLedger>>,
    blacklist: Option<Arc<dyn BlacklistDurableStore>>,
    violation_log: Option<Arc<dyn ViolationLog>>,
    resolver: Option<IdentityResolver>,
    thresholds: PolicyThresholds,
    settings: EngineSettings,
    clock: Option<Arc<dyn Clock>>,
    sink: S,
}

impl AdmissionControllerBuilder<NullSink> {
    pub fn new() -> Self {
        Self {
            ledger: None,
            blacklist: None,
            violation_log: None,
            resolver: None,
            thresholds: PolicyThresholds::default(),
            settings: EngineSettings::default(),
            clock: None,
            sink: NullSink,
        }
    }
}

impl Default for AdmissionControllerBuilder<NullSink> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> AdmissionControllerBuilder<S> {
    /// Required.
    pub fn ledger<L: RequestLedger + 'static>(self, ledger: L) -> Self {
        self.shared_ledger(Arc::new(ledger))
    }

    pub fn shared_ledger(mut self, ledger: Arc<dyn RequestLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Required.
    pub fn blacklist_store<B: BlacklistDurableStore + 'static>(self, store: B) -> Self {
        self.shared_blacklist_store(Arc::new(store))
    }

    pub fn shared_blacklist_store(mut self, store: Arc<dyn BlacklistDurableStore>) -> Self {
        self.blacklist = Some(store);
        self
    }

    /// Defaults to a bounded in-memory log.
    pub fn violation_log<V: ViolationLog + 'static>(self, log: V) -> Self {
        self.shared_violation_log(Arc::new(log))
    }

    pub fn shared_violation_log(mut self, log: Arc<dyn ViolationLog>) -> Self {
        self.violation_log = Some(log);
        self
    }

    /// Defaults to the session-token fallback only.
    pub fn identity_resolver(mut self, resolver: IdentityResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn thresholds(mut self, thresholds: PolicyThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Defaults to [`SystemClock`].
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Where security events go. Defaults to [`NullSink`].
    pub fn sink<S2>(self, sink: S2) -> AdmissionControllerBuilder<S2> {
        AdmissionControllerBuilder {
            ledger: self.ledger,
            blacklist: self.blacklist,
            violation_log: self.violation_log,
            resolver: self.resolver,
            thresholds: self.thresholds,
            settings: self.settings,
            clock: self.clock,
            sink,
        }
    }

    /// Validate configuration and assemble the controller.
    pub fn build(self) -> Result<AdmissionController<S>, ConfigError> {
        self.settings.validate()?;
        let thresholds = ThresholdsHandle::new(self.thresholds)?;
        let ledger = self.ledger.ok_or(ConfigError::Missing("request ledger"))?;
        let durable = self.blacklist.ok_or(ConfigError::Missing("blacklist store"))?;
        let timeout = CallTimeout::new(self.settings.store_timeout())?;

        let blacklist =
            Arc::new(BlacklistStore::new(durable, timeout, self.settings.cache_revalidate_after_ms));
        let log = self
            .violation_log
            .unwrap_or_else(|| Arc::new(InMemoryViolationLog::new()) as Arc<dyn ViolationLog>);

        Ok(AdmissionController {
            resolver: self.resolver.unwrap_or_default(),
            violations: ViolationTracker::new(blacklist.clone(), log, timeout),
            blacklist,
            burst: BurstGuard::new(),
            windows: WindowCounter::new(ledger, timeout),
            thresholds,
            settings: self.settings,
            timeout,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock::new())),
            lanes: AdmissionLanes::default(),
            sink: self.sink,
        })
    }
}
