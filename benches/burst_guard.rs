use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gatekeeper::burst::BurstGuard;
use gatekeeper::maintenance::run_maintenance_once;
use gatekeeper::prelude::*;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn burst_guard_distinct_identities(c: &mut Criterion) {
    let guard = BurstGuard::new();
    let keys: Vec<String> = (0..1_024).map(|i| format!("10.1.{}.{}", i / 256, i % 256)).collect();
    let mut now = 0u64;
    let mut i = 0usize;

    c.bench_function("burst_guard_check_1k_identities", |b| {
        b.iter(|| {
            now += 1;
            i = (i + 1) % keys.len();
            black_box(guard.check(black_box(&keys[i]), now, 10, 100));
        });
    });
}

fn burst_guard_hot_identity(c: &mut Criterion) {
    let guard = BurstGuard::new();
    let mut now = 0u64;

    // Mostly denials: one key hammered far above the ceiling.
    c.bench_function("burst_guard_check_hot_identity", |b| {
        b.iter(|| {
            now += 1;
            black_box(guard.check(black_box("hot"), now, 10, 0));
        });
    });
}

fn admit_in_memory(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let thresholds = PolicyThresholds {
        max_requests_per_minute: u64::MAX,
        max_requests_per_hour: u64::MAX,
        max_requests_per_day: u64::MAX,
        ..PolicyThresholds::default()
    };
    let clock = ManualClock::new(0);
    let controller = Arc::new(
        AdmissionController::builder()
            .ledger(InMemoryLedger::new())
            .blacklist_store(InMemoryBlacklistStore::new())
            .thresholds(thresholds)
            .settings(EngineSettings { ledger_retention_ms: 1, ..EngineSettings::default() })
            .clock(clock.clone())
            .build()
            .unwrap(),
    );
    let seq = Arc::new(AtomicU64::new(0));

    c.bench_function("admission_admit_in_memory", |b| {
        b.to_async(&rt).iter(|| {
            let controller = controller.clone();
            let n = seq.fetch_add(1, Ordering::Relaxed);
            clock.advance(1);
            async move {
                let who = ClientIdentity::NetworkAddress(format!("198.18.{}.{}", (n / 256) % 256, n % 256));
                black_box(controller.admit_as("/create", &who).await);
                if n % 1_024 == 0 {
                    run_maintenance_once(&controller).await;
                }
            }
        });
    });
}

criterion_group!(benches, burst_guard_distinct_identities, burst_guard_hot_identity, admit_in_memory);
criterion_main!(benches);
