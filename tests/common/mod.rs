#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gatekeeper::ledger::Scope;
use gatekeeper::violation::Violation;
use gatekeeper::prelude::*;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

pub const ENDPOINT: &str = "/create";

pub fn addr(key: &str) -> ClientIdentity {
    ClientIdentity::NetworkAddress(key.to_string())
}

/// Thresholds used by the worked examples: burst 10, interval 100 ms, 60/min,
/// auto-ban after 3 violations.
pub fn example_thresholds() -> PolicyThresholds {
    PolicyThresholds::default()
}

pub struct Harness {
    pub controller: AdmissionController<MemorySink>,
    pub clock: ManualClock,
    pub sink: MemorySink,
    pub ledger: Arc<InMemoryLedger>,
    pub violations: Arc<InMemoryViolationLog>,
}

pub fn harness(thresholds: PolicyThresholds) -> Harness {
    let clock = ManualClock::new(1_700_000_000_000);
    let sink = MemorySink::new();
    let ledger = Arc::new(InMemoryLedger::new());
    let violations = Arc::new(InMemoryViolationLog::new());
    let controller = AdmissionController::builder()
        .shared_ledger(ledger.clone())
        .blacklist_store(InMemoryBlacklistStore::new())
        .shared_violation_log(violations.clone())
        .thresholds(thresholds)
        .clock(clock.clone())
        .sink(sink.clone())
        .build()
        .expect("valid configuration");
    Harness { controller, clock, sink, ledger, violations }
}

/// Ledger whose reads can be switched to fail or hang, and whose writes can be
/// switched to fail.
#[derive(Default)]
pub struct FlakyLedger {
    pub inner: InMemoryLedger,
    pub fail_counts: AtomicBool,
    pub hang_counts: AtomicBool,
    pub fail_appends: AtomicBool,
    pub fail_purges: AtomicBool,
}

#[async_trait]
impl RequestLedger for FlakyLedger {
    async fn append(&self, event: RequestEvent) -> Result<(), StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err("disk full".into());
        }
        self.inner.append(event).await
    }

    async fn count_since(
        &self,
        scope: Scope<'_>,
        endpoint: Option<&str>,
        since: u64,
    ) -> Result<u64, StoreError> {
        if self.hang_counts.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.fail_counts.load(Ordering::SeqCst) {
            return Err("connection refused".into());
        }
        self.inner.count_since(scope, endpoint, since).await
    }

    async fn purge_older_than(&self, cutoff: u64) -> Result<u64, StoreError> {
        if self.fail_purges.load(Ordering::SeqCst) {
            return Err("connection refused".into());
        }
        self.inner.purge_older_than(cutoff).await
    }
}

/// Violation log that rejects every record.
#[derive(Debug, Default)]
pub struct BrokenViolationLog;

#[async_trait]
impl ViolationLog for BrokenViolationLog {
    async fn record(&self, _violation: &Violation) -> Result<(), StoreError> {
        Err("violation table locked".into())
    }
}

/// Blacklist store that can be switched into failure mode.
#[derive(Default)]
pub struct FlakyBlacklist {
    pub inner: InMemoryBlacklistStore,
    pub failing: AtomicBool,
}

impl FlakyBlacklist {
    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err("blacklist store offline".into());
        }
        Ok(())
    }
}

#[async_trait]
impl BlacklistDurableStore for FlakyBlacklist {
    async fn find(&self, identity: &str, now: u64) -> Result<Option<BlacklistEntry>, StoreError> {
        self.check()?;
        self.inner.find(identity, now).await
    }

    async fn insert(&self, entry: BlacklistEntry) -> Result<(), StoreError> {
        self.check()?;
        self.inner.insert(entry).await
    }

    async fn delete_all(&self, identity: &str) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.delete_all(identity).await
    }

    async fn count_active(&self, now: u64) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.count_active(now).await
    }
}

#[derive(Clone)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Captures formatted log output for the current thread while the guard lives.
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    _guard: tracing::subscriber::DefaultGuard,
}

impl LogCapture {
    pub fn start() -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .with_target(true)
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        Self { buffer, _guard: guard }
    }

    pub fn contents(&self) -> String {
        String::from_utf8(self.buffer.lock().unwrap().clone()).unwrap()
    }
}
