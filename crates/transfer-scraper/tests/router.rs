//! Hybrid router: ordering, fallback, caching, coalescing and drift handling.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{post, posts, target, ScriptedMethod};
use transfer_scraper::backoff::ExponentialBackoff;
use transfer_scraper::methods::{AcquisitionMethod, FetchRequest};
use transfer_scraper::{
    AcquisitionCache, AcquisitionError, AttemptFailure, AttemptOutcome, DriftPolicy, DriftState,
    FailureKind, HybridRouter, MethodKind, RouterSettings, ScraperConfig,
};

// ─────────────────────── helpers ───────────────────────

fn settings() -> RouterSettings {
    RouterSettings {
        exploration_rate: 0.0,
        min_cache_reliability: 0.7,
        drift_policy: DriftPolicy::Alert,
        method_attempts: 1,
        backoff: ExponentialBackoff::new(1, 5),
        method_timeout: Duration::from_secs(2),
    }
}

fn cache() -> Arc<AcquisitionCache> {
    Arc::new(AcquisitionCache::new(
        Duration::from_secs(300),
        Duration::from_secs(3600),
        64,
    ))
}

fn router(methods: &[Arc<ScriptedMethod>], settings: RouterSettings) -> HybridRouter {
    let methods = methods
        .iter()
        .map(|m| Arc::clone(m) as Arc<dyn AcquisitionMethod>)
        .collect();
    HybridRouter::new(methods, cache(), settings)
}

fn failing(kind: MethodKind, failure: FailureKind) -> ScriptedMethod {
    ScriptedMethod::new(kind, move |_, _| {
        AttemptFailure::new(failure, format!("{failure} from {kind}")).into()
    })
}

#[test]
fn test_settings_from_extreme_config_saturate() {
    let config = ScraperConfig {
        max_retries: u32::MAX,
        attempt_timeout_ms: u64::MAX,
        retry_backoff_max_ms: u64::MAX,
        queue_timeout_ms: u64::MAX,
        ..Default::default()
    };
    let settings = RouterSettings::from_config(&config);
    assert_eq!(settings.method_timeout, Duration::MAX);
    assert!(config.validate().is_err());
}

// ─────────────────────── fallback ───────────────────────

#[tokio::test]
async fn test_falls_back_to_next_method() {
    let api = Arc::new(failing(MethodKind::Api, FailureKind::RateLimited));
    let browser = Arc::new(ScriptedMethod::healthy(MethodKind::Browser));
    let router = router(&[Arc::clone(&api), Arc::clone(&browser)], settings());

    let result = router.fetch(&target("FabrizioRomano"), 10).await.unwrap();
    assert_eq!(result.method, MethodKind::Browser);
    assert_eq!(result.accepted, 3);
    assert!(!result.from_cache);
    assert_eq!(api.calls(), 1);

    let status = router.get_status();
    assert_eq!(status.methods[0].failures, 1);
    assert_eq!(status.methods[1].successes, 1);
    assert_eq!(status.preferred, Some(MethodKind::Browser));
}

#[tokio::test]
async fn test_retries_within_method_before_falling_back() {
    let api = Arc::new(ScriptedMethod::new(MethodKind::Api, |call, req| {
        if call == 0 {
            AttemptFailure::timeout(50).into()
        } else {
            AttemptOutcome::Succeeded(posts(req.target.handle(), 1_800_000_000_000_000_100))
        }
    }));
    let browser = Arc::new(ScriptedMethod::healthy(MethodKind::Browser));
    let mut s = settings();
    s.method_attempts = 2;
    let router = router(&[Arc::clone(&api), Arc::clone(&browser)], s);

    let result = router.fetch(&target("SamLee"), 10).await.unwrap();
    assert_eq!(result.method, MethodKind::Api);
    assert_eq!(api.calls(), 2);
    assert_eq!(browser.calls(), 0);
}

#[tokio::test]
async fn test_all_methods_failed() {
    let api = Arc::new(failing(MethodKind::Api, FailureKind::Auth));
    let browser = Arc::new(failing(MethodKind::Browser, FailureKind::Blocked));
    let router = router(&[api, browser], settings());

    match router.fetch(&target("DiMarzio"), 10).await.unwrap_err() {
        AcquisitionError::AllMethodsFailed { failures } => {
            let kinds: Vec<_> = failures.iter().map(|(m, f)| (*m, f.kind)).collect();
            assert_eq!(
                kinds,
                vec![
                    (MethodKind::Api, FailureKind::Auth),
                    (MethodKind::Browser, FailureKind::Blocked)
                ]
            );
        }
        other => panic!("expected AllMethodsFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_target_stops_routing() {
    let api = Arc::new(failing(MethodKind::Api, FailureKind::InvalidTarget));
    let browser = Arc::new(ScriptedMethod::healthy(MethodKind::Browser));
    let router = router(&[api, Arc::clone(&browser)], settings());

    let err = router.fetch(&target("no_such_user"), 10).await.unwrap_err();
    assert!(matches!(err, AcquisitionError::InvalidTarget(_)));
    assert_eq!(browser.calls(), 0);
}

#[tokio::test]
async fn test_better_performer_is_tried_first() {
    let api = Arc::new(ScriptedMethod::new(MethodKind::Api, |call, req| {
        if call == 0 {
            AttemptFailure::new(FailureKind::Network, "connection reset").into()
        } else {
            AttemptOutcome::Succeeded(posts(req.target.handle(), 1_800_000_000_000_000_000))
        }
    }));
    let browser = Arc::new(ScriptedMethod::healthy(MethodKind::Browser));
    let router = router(&[Arc::clone(&api), Arc::clone(&browser)], settings());

    router.fetch(&target("acct_one"), 5).await.unwrap();
    let second = router.fetch(&target("acct_two"), 5).await.unwrap();
    assert_eq!(second.method, MethodKind::Browser);
    assert_eq!(api.calls(), 1);
}

// ─────────────────────── validation ───────────────────────

#[tokio::test]
async fn test_invalid_records_are_rejected_not_returned() {
    let browser = Arc::new(ScriptedMethod::new(MethodKind::Browser, |_, _| {
        AttemptOutcome::Succeeded(vec![
            post("1800000000000000001", "David_Ornstein", "Exclusive: deal agreed"),
            json!({ "id": "1800000000000000002", "author": { "handle": "David_Ornstein" } }),
            post("1800000000000000001", "David_Ornstein", "Exclusive: deal agreed"),
        ])
    }));
    let router = router(&[browser], settings());

    let result = router.fetch(&target("David_Ornstein"), 10).await.unwrap();
    assert_eq!(result.rejected, 1);
    assert_eq!(result.records.len(), 1);
    assert_eq!(result.accepted, 1);
    assert!(result.average_confidence > 0.9);
}

#[tokio::test]
async fn test_rate_limit_payload_is_not_success() {
    let api = Arc::new(ScriptedMethod::new(MethodKind::Api, |_, _| {
        AttemptOutcome::Succeeded(vec![post(
            "1800000000000000001",
            "SamLee",
            "Rate limit exceeded. Please try again later.",
        )])
    }));
    let browser = Arc::new(ScriptedMethod::healthy(MethodKind::Browser));
    let router = router(&[Arc::clone(&api), browser], settings());

    let result = router.fetch(&target("SamLee"), 10).await.unwrap();
    assert_eq!(result.method, MethodKind::Browser);
    let api_status = &router.get_status().methods[0];
    assert!(api_status.last_error.as_deref().unwrap().starts_with("rate_limited"));
}

// ─────────────────────── caching ───────────────────────

#[tokio::test]
async fn test_second_fetch_served_from_cache() {
    let browser = Arc::new(ScriptedMethod::healthy(MethodKind::Browser));
    let router = router(&[Arc::clone(&browser)], settings());

    let first = router.fetch(&target("honigstein"), 10).await.unwrap();
    let second = router.fetch(&target("HONIGSTEIN"), 10).await.unwrap();
    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(second.records, first.records);
    assert_eq!(browser.calls(), 1);
    assert_eq!(router.get_status().cache.hits, 1);
}

#[tokio::test]
async fn test_concurrent_fetches_are_coalesced() {
    let browser = Arc::new(ScriptedMethod::healthy(MethodKind::Browser).with_delay(Duration::from_millis(100)));
    let router = Arc::new(router(&[Arc::clone(&browser)], settings()));

    let fetches = (0..5).map(|_| {
        let router = Arc::clone(&router);
        async move { router.fetch(&target("CraigHope_DM"), 10).await }
    });
    let results = futures::future::join_all(fetches).await;

    assert_eq!(browser.calls(), 1);
    let fresh = results
        .iter()
        .filter(|r| !r.as_ref().unwrap().from_cache)
        .count();
    assert_eq!(fresh, 1);
}

#[tokio::test]
async fn test_incremental_read_does_not_poison_cache() {
    let browser = Arc::new(ScriptedMethod::new(MethodKind::Browser, |_, req| {
        if req.since_id.is_some() {
            AttemptOutcome::Succeeded(Vec::new())
        } else {
            AttemptOutcome::Succeeded(posts(req.target.handle(), 1_800_000_000_000_000_000))
        }
    }));
    let router = router(&[Arc::clone(&browser)], settings());

    let request = FetchRequest::new(target("David_Ornstein"), 20)
        .since(Some("1800000000000000003".to_string()));
    let incremental = router.fetch_with(request).await.unwrap();
    assert!(incremental.records.is_empty());

    let full = router.fetch(&target("David_Ornstein"), 20).await.unwrap();
    assert!(!full.from_cache);
    assert_eq!(full.records.len(), 3);
    assert_eq!(browser.calls(), 2);

    let again = router.fetch(&target("David_Ornstein"), 20).await.unwrap();
    assert!(again.from_cache);
    assert_eq!(browser.calls(), 2);
}

#[tokio::test]
async fn test_small_entry_does_not_answer_larger_request() {
    let browser = Arc::new(ScriptedMethod::new(MethodKind::Browser, |_, req| {
        let all = posts(req.target.handle(), 1_800_000_000_000_000_000);
        AttemptOutcome::Succeeded(all.into_iter().take(req.count).collect())
    }));
    let router = router(&[Arc::clone(&browser)], settings());

    let one = router.fetch(&target("SamiMokbel_BBC"), 1).await.unwrap();
    assert_eq!(one.records.len(), 1);

    let three = router.fetch(&target("SamiMokbel_BBC"), 3).await.unwrap();
    assert!(!three.from_cache);
    assert_eq!(three.records.len(), 3);
    assert_eq!(browser.calls(), 2);

    let two = router.fetch(&target("SamiMokbel_BBC"), 2).await.unwrap();
    assert!(two.from_cache);
    assert_eq!(two.records.len(), 2);
    assert_eq!(browser.calls(), 2);
}

#[tokio::test]
async fn test_stale_entry_served_when_everything_fails() {
    let browser = Arc::new(ScriptedMethod::new(MethodKind::Browser, |call, req| {
        if call == 0 {
            AttemptOutcome::Succeeded(posts(req.target.handle(), 1_800_000_000_000_000_000))
        } else {
            AttemptFailure::new(FailureKind::Blocked, "access denied").into()
        }
    }));
    let cache = Arc::new(AcquisitionCache::new(
        Duration::from_millis(50),
        Duration::from_secs(3600),
        16,
    ));
    let router = HybridRouter::new(
        vec![Arc::clone(&browser) as Arc<dyn AcquisitionMethod>],
        cache,
        settings(),
    );

    router.fetch(&target("JPercyTelegraph"), 10).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let result = router.fetch(&target("JPercyTelegraph"), 10).await.unwrap();
    assert!(result.from_cache);
    assert!(result.stale);
    assert_eq!(result.records.len(), 3);
    assert_eq!(browser.calls(), 2);
}

// ─────────────────────── drift ───────────────────────

fn drifting(kind: MethodKind) -> ScriptedMethod {
    ScriptedMethod::new(kind, |_, req| {
        AttemptOutcome::Succeeded(
            (0..5)
                .map(|i| {
                    json!({
                        "id": format!("18000000000000000{i:02}"),
                        "created_at": "2024-07-01T10:00:00Z",
                        "author": { "handle": req.target.handle() }
                    })
                })
                .collect(),
        )
    })
}

#[tokio::test]
async fn test_confirmed_drift_disables_path() {
    let broken = Arc::new(drifting(MethodKind::Browser));
    let mut s = settings();
    s.drift_policy = DriftPolicy::DisablePath;
    let router = router(&[Arc::clone(&broken)], s);

    for i in 0..3 {
        let err = router.fetch(&target(&format!("acct_{i}")), 5).await.unwrap_err();
        assert!(matches!(err, AcquisitionError::AllMethodsFailed { .. }));
    }
    assert_eq!(broken.calls(), 3);

    let reports = router.detect_structural_changes();
    let (kind, report) = &reports[0];
    assert_eq!(*kind, MethodKind::Browser);
    assert!(report.has_changes);
    assert_eq!(report.dominant_pattern.as_deref(), Some("missing_field:text"));
    assert!(report.recommendation.is_some());

    match router.fetch(&target("acct_9"), 5).await.unwrap_err() {
        AcquisitionError::AllMethodsFailed { failures } => {
            assert_eq!(failures[0].1.kind, FailureKind::Structural);
        }
        other => panic!("expected AllMethodsFailed, got {other:?}"),
    }
    assert_eq!(broken.calls(), 3);
    let status = router.get_status();
    assert!(status.methods[0].disabled);
    assert_eq!(status.preferred, None);

    assert!(router.reset_drift(MethodKind::Browser));
    assert!(!router.reset_drift(MethodKind::Api));
    assert!(!router.get_status().methods[0].disabled);
    let _ = router.fetch(&target("acct_10"), 5).await;
    assert_eq!(broken.calls(), 4);
}

#[tokio::test]
async fn test_alert_policy_keeps_path_in_use() {
    let broken = Arc::new(drifting(MethodKind::Browser));
    let router = router(&[Arc::clone(&broken)], settings());

    for i in 0..4 {
        let _ = router.fetch(&target(&format!("acct_{i}")), 5).await;
    }
    assert_eq!(broken.calls(), 4);
    let status = router.get_status();
    assert_eq!(status.methods[0].drift, DriftState::DriftConfirmed);
    assert!(!status.methods[0].disabled);
    assert_eq!(status.methods[0].trends.success_rate, 0.0);
}
