use gatekeeper::error::Collaborator;
use gatekeeper::events::{SecurityEvent, SecurityEventKind};
use gatekeeper::prelude::*;
use gatekeeper_prometheus::{PrometheusSink, METRIC_NAME};
use prometheus::Registry;
use std::time::Duration;
use tower_service::Service;

fn event(kind: SecurityEventKind) -> SecurityEvent {
    SecurityEvent::new(kind, "203.0.113.1", "test", 0)
}

#[tokio::test]
async fn test_denial_variants() {
    let registry = Registry::new();
    let mut sink = PrometheusSink::new(registry.clone()).expect("Failed to create PrometheusSink");

    let cases = [
        ViolationKind::Burst,
        ViolationKind::RateLimitMinute,
        ViolationKind::RateLimitHour,
        ViolationKind::RateLimitDay,
        ViolationKind::IdentityLimitMinute,
        ViolationKind::IdentityLimitHour,
    ];

    for kind in cases {
        sink.call(event(SecurityEventKind::Denied(kind))).await.expect("denied event");
        assert_eq!(sink.count("denied", kind.as_str()), 1);
    }
}

#[tokio::test]
async fn test_ban_lifecycle_variants() {
    let registry = Registry::new();
    let mut sink = PrometheusSink::new(registry.clone()).expect("Failed to create PrometheusSink");

    let cases = [
        (SecurityEventKind::Blocked, "blocked"),
        (SecurityEventKind::AutoBanned, "auto_banned"),
        (SecurityEventKind::ManualBan, "manual_ban"),
        (SecurityEventKind::Unban, "unban"),
    ];

    for (kind, label) in cases {
        sink.call(event(kind)).await.expect("lifecycle event");
        assert_eq!(sink.count(label, "none"), 1);
    }
}

#[tokio::test]
async fn test_collaborator_faults_increment() {
    let registry = Registry::new();
    let mut sink = PrometheusSink::new(registry.clone()).expect("Failed to create PrometheusSink");

    let fault = event(SecurityEventKind::CollaboratorUnavailable(Collaborator::Ledger));
    assert_eq!(sink.count("collaborator_unavailable", "ledger"), 0);
    sink.call(fault.clone()).await.expect("fault event");
    sink.call(fault).await.expect("fault event");
    assert_eq!(sink.count("collaborator_unavailable", "ledger"), 2);
}

#[test]
fn test_duplicate_registration_is_rejected() {
    let registry = Registry::new();
    let _first = PrometheusSink::new(registry.clone()).expect("first registration");
    assert!(PrometheusSink::new(registry).is_err());
}

#[tokio::test]
async fn test_metric_is_gathered() {
    let registry = Registry::new();
    let mut sink = PrometheusSink::new(registry.clone()).expect("Failed to create PrometheusSink");
    sink.call(event(SecurityEventKind::Unban)).await.unwrap();

    let encoded = prometheus::TextEncoder::new()
        .encode_to_string(&sink.registry().gather())
        .expect("encode");
    assert!(encoded.contains(METRIC_NAME));
}

#[tokio::test]
async fn test_controller_feeds_counters() {
    let registry = Registry::new();
    let sink = PrometheusSink::new(registry).expect("Failed to create PrometheusSink");
    let controller = AdmissionController::builder()
        .ledger(InMemoryLedger::new())
        .blacklist_store(InMemoryBlacklistStore::new())
        .clock(ManualClock::new(0))
        .sink(sink.clone())
        .build()
        .unwrap();

    controller.ban("203.0.113.9", "abuse report", Duration::from_secs(60)).await.unwrap();
    let blocked = controller.admit_as("/qr/create", &ClientIdentity::NetworkAddress("203.0.113.9".into())).await;
    assert!(!blocked.is_allowed());

    assert_eq!(sink.count("manual_ban", "none"), 1);
    assert_eq!(sink.count("blocked", "none"), 1);
    assert_eq!(sink.count("denied", "burst"), 0);
}
