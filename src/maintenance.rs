//! Periodic housekeeping: drop idle burst windows, decay violations, evict expired
//! cached bans, release idle endpoint lanes and purge old ledger rows.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::admission::AdmissionController;
use crate::events::SecurityEventSink;

/// Identity attached to faults raised by a maintenance pass.
pub const MAINTENANCE_IDENTITY: &str = "maintenance";

/// What one maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub burst_identities_dropped: usize,
    pub violation_identities_dropped: usize,
    pub cached_bans_evicted: usize,
    pub idle_lanes_dropped: usize,
    /// `None` if the purge failed; the failure is reported as a security event.
    pub ledger_rows_purged: Option<u64>,
}

/// Run a single pass against `controller`.
pub async fn run_maintenance_once<S>(controller: &AdmissionController<S>) -> MaintenanceReport
where
    S: SecurityEventSink + Sync,
    S::Future: Send + 'static,
{
    let now = controller.now_millis();
    let thresholds = controller.thresholds().get();
    let settings = controller.settings();

    let idle_after = settings.burst_idle_after_ms.max(thresholds.min_request_interval_ms);
    let burst_identities_dropped = controller.burst_guard().sweep(now, idle_after);
    let violation_identities_dropped =
        controller.violation_tracker().sweep(now, thresholds.violation_window_ms);
    let cached_bans_evicted = controller.blacklist().sweep(now);
    let idle_lanes_dropped = controller.prune_lanes();

    let cutoff = now.saturating_sub(settings.ledger_retention_ms);
    let ledger_rows_purged = match controller.window_counter().purge_older_than(cutoff).await {
        Ok(purged) => Some(purged),
        Err(fault) => {
            controller.report_fault(MAINTENANCE_IDENTITY, fault).await;
            None
        }
    };

    let report = MaintenanceReport {
        burst_identities_dropped,
        violation_identities_dropped,
        cached_bans_evicted,
        idle_lanes_dropped,
        ledger_rows_purged,
    };
    tracing::debug!(target: "gatekeeper::maintenance", ?report, "maintenance pass complete");
    report
}

/// Handle to a running maintenance task.
#[derive(Debug)]
pub struct MaintenanceHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Stop the task and wait for the in-flight pass, if any, to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!(target: "gatekeeper::maintenance", error = %e, "maintenance task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn a task running [`run_maintenance_once`] every `every`. The first pass runs
/// one period after spawning. Dropping the handle stops the task as well, without
/// waiting for it.
pub fn spawn_maintenance<S>(
    controller: Arc<AdmissionController<S>>,
    every: Duration,
) -> MaintenanceHandle
where
    S: SecurityEventSink + Sync,
    S::Future: Send + 'static,
{
    let (tx, mut rx) = oneshot::channel::<()>();
    let every = every.max(Duration::from_millis(1));
    let task = tokio::spawn(async move {
        let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut rx => break,
                _ = ticks.tick() => {
                    run_maintenance_once(&controller).await;
                }
            }
        }
        tracing::debug!(target: "gatekeeper::maintenance", "maintenance task stopped");
    });
    MaintenanceHandle { shutdown: Some(tx), task }
}
