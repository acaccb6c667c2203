#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Gatekeeper
//!
//! Application-layer admission control for public write endpoints.
//!
//! Every request is checked, in order, against:
//!
//! - an **expiring blacklist** (durable store plus revalidated cache)
//! - a **burst guard** (at most N requests per second, minimum gap between requests)
//! - **sliding-window caps** per minute, hour and day, globally and per identity
//!
//! Denials are recorded as violations; repeated violations escalate to an automatic
//! ban. Collaborator failures fail open and are reported as security events.
//!
//! ## Quick Start
//!
//! ```rust
//! use gatekeeper::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let controller = AdmissionController::builder()
//!         .ledger(InMemoryLedger::new())
//!         .blacklist_store(InMemoryBlacklistStore::new())
//!         .sink(LogSink)
//!         .build()
//!         .expect("default thresholds are valid");
//!
//!     let caller = ClientIdentity::NetworkAddress("203.0.113.7".into());
//!     let result = controller.admit_as("/qr/create", &caller).await;
//!     assert!(result.is_allowed());
//! }
//! ```

pub mod admission;
pub mod blacklist;
pub mod burst;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod ledger;
pub mod maintenance;
pub mod middleware;
pub mod prelude;
pub mod timeout;
pub mod violation;
pub mod window;

// Re-exports
pub use admission::{
    AdmissionController, AdmissionControllerBuilder, AdmissionResult, AdmissionStatus, DenyReason,
};
pub use blacklist::{BlacklistDurableStore, BlacklistEntry, BlacklistStore, InMemoryBlacklistStore};
pub use burst::{BurstGuard, BurstVerdict};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineSettings, PolicyThresholds, ThresholdsHandle};
pub use error::{Collaborator, CollaboratorError, ConfigError, GuardError, StoreError};
pub use identity::{ClientIdentity, IdentityResolver};
pub use ledger::{InMemoryLedger, RequestEvent, RequestLedger, Scope};
pub use maintenance::{
    run_maintenance_once, spawn_maintenance, MaintenanceHandle, MaintenanceReport,
    MAINTENANCE_IDENTITY,
};
pub use middleware::{AdmissionLayer, AdmissionService, RequestIdentity};
pub use violation::{InMemoryViolationLog, Violation, ViolationKind, ViolationLog, ViolationTracker};
pub use window::{Horizon, WindowCounter, WindowOutcome};
