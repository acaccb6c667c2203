mod common;

use std::time::Duration;

use common::{addr, example_thresholds, harness, ENDPOINT};
use gatekeeper::prelude::*;

#[tokio::test]
async fn unban_takes_effect_immediately() {
    let h = harness(example_thresholds());
    let entry = h.controller.ban("E", "manual", Duration::from_millis(3_600_000)).await.unwrap();
    assert_eq!(entry.expires_at, 1_700_000_000_000 + 3_600_000);
    assert_eq!(entry.reason, "manual");
    assert!(!h.controller.admit_as(ENDPOINT, &addr("E")).await.is_allowed());

    h.controller.unban("E").await.unwrap();
    h.clock.advance(1);
    let result = h.controller.admit_as(ENDPOINT, &addr("E")).await;
    assert!(result.is_allowed(), "reached the burst check and passed");
}

#[tokio::test]
async fn unban_of_unknown_identity_is_a_no_op() {
    let h = harness(example_thresholds());
    h.controller.unban("never-seen").await.unwrap();
    h.controller.unban("never-seen").await.unwrap();
    assert_eq!(h.sink.events_labelled("unban").len(), 2);
    assert_eq!(h.controller.status().await.unwrap().banned_count, 0);
}

#[tokio::test]
async fn unban_clears_violation_history() {
    let h = harness(example_thresholds());
    let who = addr("forgiven");
    assert!(h.controller.admit_as(ENDPOINT, &who).await.is_allowed());
    for _ in 0..2 {
        h.clock.advance(10);
        assert!(!h.controller.admit_as(ENDPOINT, &who).await.is_allowed());
    }

    h.controller.unban("forgiven").await.unwrap();
    h.clock.advance(10);
    let next = h.controller.admit_as(ENDPOINT, &who).await;
    assert_eq!(next.reason, Some(DenyReason::Policy(ViolationKind::Burst)));
    assert_eq!(next.banned_until, None, "counter restarted at zero");
}

#[tokio::test]
async fn status_reports_bans_violations_and_traffic() {
    let h = harness(example_thresholds());
    for who in ["s1", "s2", "s3"] {
        assert!(h.controller.admit_as(ENDPOINT, &addr(who)).await.is_allowed());
    }
    assert!(h.controller.admit_as("/other", &addr("s4")).await.is_allowed());
    assert!(!h.controller.admit_as(ENDPOINT, &addr("s1")).await.is_allowed());
    h.controller.ban("x", "manual", Duration::from_secs(60)).await.unwrap();
    h.controller.ban("y", "manual", Duration::from_secs(60)).await.unwrap();

    let status = h.controller.status().await.unwrap();
    assert_eq!(
        status,
        AdmissionStatus { banned_count: 2, recent_violations: 1, active_requests_last_minute: 4 }
    );

    h.clock.advance(61_000);
    let later = h.controller.status().await.unwrap();
    assert_eq!(later.banned_count, 0);
    assert_eq!(later.active_requests_last_minute, 0);
    assert_eq!(later.recent_violations, 1, "violation window is an hour");
}

#[tokio::test]
async fn threshold_updates_apply_to_the_next_decision() {
    let h = harness(example_thresholds());
    h.controller
        .thresholds()
        .update(|t| PolicyThresholds { max_identity_requests_per_minute: 1, ..t.clone() })
        .unwrap();

    let who = addr("tuned");
    assert!(h.controller.admit_as(ENDPOINT, &who).await.is_allowed());
    h.clock.advance(500);
    let denied = h.controller.admit_as(ENDPOINT, &who).await;
    assert_eq!(denied.reason, Some(DenyReason::Policy(ViolationKind::IdentityLimitMinute)));
}

#[tokio::test]
async fn invalid_threshold_update_is_rejected() {
    let h = harness(example_thresholds());
    let err = h
        .controller
        .thresholds()
        .set(PolicyThresholds { auto_blacklist_threshold: 0, ..example_thresholds() })
        .unwrap_err();
    assert_eq!(err, ConfigError::Zero { field: "auto_blacklist_threshold" });
    assert_eq!(h.controller.thresholds().get().auto_blacklist_threshold, 3);
}

#[cfg(feature = "serde")]
#[tokio::test]
async fn thresholds_load_from_json() {
    let thresholds = PolicyThresholds::from_json_str(
        r#"{ "max_burst_requests": 2, "min_request_interval_ms": 0 }"#,
    )
    .unwrap();
    let h = harness(thresholds);
    let who = addr("json");
    assert!(h.controller.admit_as(ENDPOINT, &who).await.is_allowed());
    assert!(h.controller.admit_as(ENDPOINT, &who).await.is_allowed());
    assert!(!h.controller.admit_as(ENDPOINT, &who).await.is_allowed());
}
