//! One capture pass over every monitored account.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::accounts::{is_newer, AccountRegistry, MonitoredAccount, SeenState};
use crate::methods::FetchRequest;
use crate::router::HybridRouter;
use crate::types::{dedup_records, ScrapedRecord};

/// Scores a record's relevance; supplied by the embedding application.
pub trait RelevanceScorer: Send + Sync {
    fn score(&self, record: &ScrapedRecord) -> f64;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountFailure {
    pub handle: String,
    pub error: String,
    pub retryable: bool,
}

/// Records gathered in one pass, ready for the persistence layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureBatch {
    pub captured_at: DateTime<Utc>,
    pub accounts_monitored: Vec<String>,
    pub record_count: usize,
    /// Unique by (id, author), newest first.
    pub records: Vec<ScrapedRecord>,
    pub failures: Vec<AccountFailure>,
}

pub struct Collector {
    router: Arc<HybridRouter>,
    registry: AccountRegistry,
    per_account: usize,
    concurrency: usize,
    relevance: Option<(Arc<dyn RelevanceScorer>, f64)>,
}

impl Collector {
    pub fn new(router: Arc<HybridRouter>, registry: AccountRegistry) -> Self {
        Self {
            router,
            registry,
            per_account: 20,
            concurrency: 2,
            relevance: None,
        }
    }

    pub fn per_account(mut self, count: usize) -> Self {
        self.per_account = count.max(1);
        self
    }

    /// Accounts fetched at once.
    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    /// Drop records scoring below `threshold`.
    pub fn with_relevance(mut self, scorer: Arc<dyn RelevanceScorer>, threshold: f64) -> Self {
        self.relevance = Some((scorer, threshold));
        self
    }

    /// Fetch new posts for every account and advance `state` past them.
    pub async fn collect(&self, state: &mut SeenState) -> CaptureBatch {
        let captured_at = Utc::now();
        let jobs: Vec<(MonitoredAccount, Option<String>)> = self
            .registry
            .accounts()
            .iter()
            .map(|a| (a.clone(), state.get(&a.handle).map(String::from)))
            .collect();

        let outcomes: Vec<_> = stream::iter(jobs)
            .map(|(account, since)| async move {
                let outcome = self.fetch_account(&account, since.clone()).await;
                (account, since, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut records = Vec::new();
        let mut failures = Vec::new();
        for (account, since, outcome) in outcomes {
            match outcome {
                Ok(fresh) => {
                    let fresh: Vec<ScrapedRecord> = fresh
                        .into_iter()
                        .filter(|r| since.as_deref().map_or(true, |s| is_newer(&r.id, s)))
                        .collect();
                    if let Some(newest) = fresh
                        .iter()
                        .filter(|r| r.author.handle.eq_ignore_ascii_case(&account.handle))
                        .reduce(|best, r| if is_newer(&r.id, &best.id) { r } else { best })
                    {
                        state.advance(&account.handle, &newest.id);
                    }
                    tracing::info!(account = %account.handle, new = fresh.len(), "collected posts");
                    records.extend(fresh);
                }
                Err(failure) => {
                    tracing::warn!(account = %account.handle, "collection failed: {}", failure.error);
                    failures.push(failure);
                }
            }
        }

        for record in &mut records {
            self.registry.enrich(record);
        }
        if let Some((scorer, threshold)) = &self.relevance {
            records.retain(|r| scorer.score(r) >= *threshold);
        }
        let mut records = dedup_records(records);
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        CaptureBatch {
            captured_at,
            accounts_monitored: self
                .registry
                .accounts()
                .iter()
                .map(|a| a.handle.clone())
                .collect(),
            record_count: records.len(),
            records,
            failures,
        }
    }

    async fn fetch_account(
        &self,
        account: &MonitoredAccount,
        since: Option<String>,
    ) -> Result<Vec<ScrapedRecord>, AccountFailure> {
        let failure = |error: String, retryable: bool| AccountFailure {
            handle: account.handle.clone(),
            error,
            retryable,
        };
        let target = account.target().map_err(|e| failure(e.to_string(), false))?;
        let request = FetchRequest::new(target, self.per_account).since(since);
        self.router
            .fetch_with(request)
            .await
            .map(|result| result.records)
            .map_err(|e| failure(e.to_string(), e.is_retryable()))
    }
}
