//! Capture passes over monitored accounts with persisted last-seen ids.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{post, posts, ScriptedMethod};
use transfer_scraper::backoff::ExponentialBackoff;
use transfer_scraper::collector::RelevanceScorer;
use transfer_scraper::methods::AcquisitionMethod;
use transfer_scraper::{
    AccountRegistry, AcquisitionCache, AttemptFailure, AttemptOutcome, Collector, DriftPolicy,
    FailureKind, HybridRouter, MethodKind, RouterSettings, ScrapedRecord, SeenState,
};

const BASE: u64 = 1_800_000_000_000_000_000;

fn router_over(method: ScriptedMethod) -> Arc<HybridRouter> {
    Arc::new(HybridRouter::new(
        vec![Arc::new(method) as Arc<dyn AcquisitionMethod>],
        // ttl of zero so every pass goes to the source
        Arc::new(AcquisitionCache::new(Duration::ZERO, Duration::from_secs(60), 16)),
        RouterSettings {
            exploration_rate: 0.0,
            min_cache_reliability: 0.7,
            drift_policy: DriftPolicy::Alert,
            method_attempts: 1,
            backoff: ExponentialBackoff::new(1, 5),
            method_timeout: Duration::from_secs(2),
        },
    ))
}

fn handles(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_collect_filters_seen_and_advances_state() {
    let router = router_over(ScriptedMethod::healthy(MethodKind::Browser));
    let registry = AccountRegistry::insiders().select(&handles(&["SamLee", "DiMarzio"]));
    let collector = Collector::new(router, registry).per_account(10);

    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("last_seen.json");
    let mut state = SeenState::load(&state_path).unwrap();
    state.advance("SamLee", &(BASE + 1).to_string());

    let batch = collector.collect(&mut state).await;
    assert!(batch.failures.is_empty());
    assert_eq!(batch.accounts_monitored, handles(&["SamLee", "DiMarzio"]));
    // SamLee: ids 2 and 3 are new; DiMarzio: all three
    assert_eq!(batch.record_count, 5);
    assert_eq!(batch.records.len(), 5);
    assert!(batch
        .records
        .iter()
        .all(|r| r.author.tier == Some(1) && r.author.reliability.is_some()));

    let newest = (BASE + 3).to_string();
    assert_eq!(state.get("samlee"), Some(newest.as_str()));
    assert_eq!(state.get("DiMarzio"), Some(newest.as_str()));
    state.save(&state_path).unwrap();

    let mut reloaded = SeenState::load(&state_path).unwrap();
    let second = collector.collect(&mut reloaded).await;
    assert_eq!(second.record_count, 0);
}

#[tokio::test]
async fn test_collect_reports_failed_accounts() {
    let method = ScriptedMethod::new(MethodKind::Api, |_, req| {
        if req.target.handle() == "honigstein" {
            AttemptFailure::new(FailureKind::Blocked, "access denied").into()
        } else {
            AttemptOutcome::Succeeded(posts(req.target.handle(), BASE))
        }
    });
    let registry = AccountRegistry::insiders().select(&handles(&["honigstein", "_pauljoyce"]));
    let collector = Collector::new(router_over(method), registry).concurrency(1);

    let mut state = SeenState::default();
    let batch = collector.collect(&mut state).await;
    assert_eq!(batch.record_count, 3);
    assert_eq!(batch.failures.len(), 1);
    assert_eq!(batch.failures[0].handle, "honigstein");
    assert!(state.get("honigstein").is_none());
    assert!(state.get("_pauljoyce").is_some());
}

#[tokio::test]
async fn test_collect_dedupes_and_orders_newest_first() {
    let method = ScriptedMethod::new(MethodKind::Browser, |_, req| {
        let handle = req.target.handle();
        let mut early = post(&(BASE + 1).to_string(), handle, "Talks ongoing");
        early["created_at"] = "2024-07-01T08:00:00Z".into();
        let mut late = post(&(BASE + 2).to_string(), handle, "Done deal");
        late["created_at"] = "2024-07-01T12:00:00Z".into();
        AttemptOutcome::Succeeded(vec![early.clone(), late, early])
    });
    let registry = AccountRegistry::insiders().select(&handles(&["LukeEdwardsTele"]));
    let collector = Collector::new(router_over(method), registry);

    let batch = collector.collect(&mut SeenState::default()).await;
    let ids: Vec<_> = batch.records.iter().map(|r| r.id.clone()).collect();
    assert_eq!(ids, vec![(BASE + 2).to_string(), (BASE + 1).to_string()]);
}

struct KeywordScorer(&'static str);

impl RelevanceScorer for KeywordScorer {
    fn score(&self, record: &ScrapedRecord) -> f64 {
        if record.text.to_lowercase().contains(self.0) {
            1.0
        } else {
            0.0
        }
    }
}

#[tokio::test]
async fn test_relevance_filter_drops_low_scores() {
    let method = ScriptedMethod::new(MethodKind::Browser, |_, req| {
        let handle = req.target.handle();
        AttemptOutcome::Succeeded(vec![
            post(&(BASE + 1).to_string(), handle, "Here we go! Contract signed."),
            post(&(BASE + 2).to_string(), handle, "Great atmosphere at the stadium tonight"),
        ])
    });
    let registry = AccountRegistry::insiders().select(&handles(&["RobDawsonESPN"]));
    let collector = Collector::new(router_over(method), registry)
        .with_relevance(Arc::new(KeywordScorer("here we go")), 0.5);

    let mut state = SeenState::default();
    let batch = collector.collect(&mut state).await;
    assert_eq!(batch.record_count, 1);
    assert_eq!(batch.records[0].id, (BASE + 1).to_string());
    // filtered records still count as seen
    assert_eq!(state.get("RobDawsonESPN"), Some((BASE + 2).to_string().as_str()));
}
