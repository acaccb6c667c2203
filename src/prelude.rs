//! Convenient re-exports for common Gatekeeper types.
pub use crate::{
    admission::{AdmissionController, AdmissionResult, AdmissionStatus, DenyReason},
    blacklist::{BlacklistDurableStore, BlacklistEntry, InMemoryBlacklistStore},
    clock::{Clock, ManualClock, SystemClock},
    config::{EngineSettings, PolicyThresholds},
    error::{CollaboratorError, ConfigError, GuardError, StoreError},
    events::{LogSink, MemorySink, NullSink, SecurityEvent, SecurityEventKind, SecurityEventSink},
    identity::{
        AddressLookup, ClientIdentity, IdentityResolver, SessionProvider, StaticAddressLookup,
        StaticSessionProvider,
    },
    ledger::{InMemoryLedger, RequestEvent, RequestLedger},
    maintenance::spawn_maintenance,
    middleware::{AdmissionLayer, RequestIdentity},
    violation::{InMemoryViolationLog, ViolationKind, ViolationLog},
};
