//! Top-level acquisition façade.
//!
//! Checks the cache, then tries the configured methods in adaptive order
//! until one produces valid records. Order is by rolling success rate with
//! configured priority breaking ties; with probability `exploration_rate` a
//! non-leading method is tried first so a recovered method can win back
//! its place. When every method fails, a stale cache entry is served if
//! one is still resident.
//!
//! Cache entries hold full timeline reads. An entry answers a later request
//! only when it was produced for at least as many posts; incremental
//! (`since_id`) reads neither read nor populate the cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::accounts::is_newer;
use crate::backoff::ExponentialBackoff;
use crate::cache::{AcquisitionCache, CacheAnalytics, CacheMetadata, CachedRecords};
use crate::config::{DriftPolicy, ScraperConfig};
use crate::error::{AcquisitionError, ScraperResult};
use crate::methods::{AcquisitionMethod, FetchRequest};
use crate::rolling::RollingRate;
use crate::types::{
    dedup_records, AcquisitionResult, AttemptFailure, AttemptOutcome, FailureKind, IssueKind,
    MethodKind, RawRecord, Target,
};
use crate::validator::{
    normalize_record, ContentValidator, DriftState, StructuralChangeReport, ValidationTrends,
};

/// Outcomes kept per method for routing.
const METHOD_WINDOW: usize = 50;

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub exploration_rate: f64,
    pub min_cache_reliability: f64,
    pub drift_policy: DriftPolicy,
    /// Attempts per method before falling through to the next one.
    pub method_attempts: u32,
    pub backoff: ExponentialBackoff,
    /// Outer bound on a single method attempt.
    pub method_timeout: Duration,
}

impl RouterSettings {
    pub fn from_config(config: &ScraperConfig) -> Self {
        // covers the pool's own retries and queue wait
        let tries = config.max_retries.saturating_add(1);
        let method_timeout = config
            .attempt_timeout()
            .saturating_mul(tries)
            .saturating_add(Duration::from_millis(config.retry_backoff_max_ms).saturating_mul(config.max_retries))
            .saturating_add(config.queue_timeout());
        Self {
            exploration_rate: config.exploration_rate,
            min_cache_reliability: config.min_cache_reliability,
            drift_policy: config.drift_policy,
            method_attempts: config.method_attempts.max(1),
            backoff: ExponentialBackoff::new(config.retry_backoff_ms, config.retry_backoff_max_ms),
            method_timeout,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodStatus {
    pub kind: MethodKind,
    pub priority: usize,
    pub success_rate: f64,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    pub drift: DriftState,
    /// Skipped in routing because of confirmed drift.
    pub disabled: bool,
    pub trends: ValidationTrends,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterStatus {
    pub preferred: Option<MethodKind>,
    pub methods: Vec<MethodStatus>,
    pub cache: CacheAnalytics,
}

#[derive(Debug)]
struct MethodTracker {
    window: RollingRate,
    attempts: u64,
    successes: u64,
    failures: u64,
    last_error: Option<String>,
}

struct MethodSlot {
    method: Arc<dyn AcquisitionMethod>,
    priority: usize,
    tracker: Mutex<MethodTracker>,
    validator: ContentValidator,
}

impl MethodSlot {
    fn success_rate(&self) -> f64 {
        self.tracker.lock().window.rate()
    }

    fn record(&self, failure: Option<&AttemptFailure>) {
        let mut t = self.tracker.lock();
        t.attempts += 1;
        t.window.record(failure.is_none());
        match failure {
            None => t.successes += 1,
            Some(f) => {
                t.failures += 1;
                t.last_error = Some(f.to_string());
            }
        }
    }
}

/// Multi-method acquisition with caching, validation and adaptive fallback.
pub struct HybridRouter {
    methods: Vec<MethodSlot>,
    cache: Arc<AcquisitionCache>,
    settings: RouterSettings,
}

impl HybridRouter {
    /// `methods` are given in priority order, highest first.
    pub fn new(
        methods: Vec<Arc<dyn AcquisitionMethod>>,
        cache: Arc<AcquisitionCache>,
        settings: RouterSettings,
    ) -> Self {
        let methods = methods
            .into_iter()
            .enumerate()
            .map(|(priority, method)| MethodSlot {
                method,
                priority,
                tracker: Mutex::new(MethodTracker {
                    window: RollingRate::new(METHOD_WINDOW),
                    attempts: 0,
                    successes: 0,
                    failures: 0,
                    last_error: None,
                }),
                validator: ContentValidator::new(),
            })
            .collect();
        Self {
            methods,
            cache,
            settings,
        }
    }

    pub fn cache(&self) -> &Arc<AcquisitionCache> {
        &self.cache
    }

    pub fn method_kinds(&self) -> Vec<MethodKind> {
        self.methods.iter().map(|m| m.method.kind()).collect()
    }

    pub async fn fetch(&self, target: &Target, count: usize) -> ScraperResult<AcquisitionResult> {
        self.fetch_with(FetchRequest::new(target.clone(), count)).await
    }

    /// Acquire validated records for `request.target`.
    ///
    /// Concurrent fetches of the same target are serialized; followers are
    /// answered from the entry the leader cached.
    pub async fn fetch_with(&self, request: FetchRequest) -> ScraperResult<AcquisitionResult> {
        let key = request.target.cache_key();
        let started = Instant::now();
        let _flight = self.cache.lock_target(&key).await;

        if request.since_id.is_none() {
            if let Some(hit) = self.cache.get(&key) {
                if !covers(&hit, request.count) {
                    tracing::debug!(
                        account = %request.target,
                        cached_for = hit.metadata.requested_count,
                        wanted = request.count,
                        "cache entry too small, refetching"
                    );
                } else if self.cache.is_trustworthy(&key, self.settings.min_cache_reliability) {
                    tracing::debug!(account = %request.target, method = %hit.metadata.method, "served from cache");
                    return Ok(from_cache(&request, hit, started));
                } else {
                    tracing::debug!(account = %request.target, "cache entry below reliability floor, refetching");
                }
            }
        }

        let mut failures = Vec::new();
        for idx in self.method_order(true) {
            let slot = &self.methods[idx];
            let kind = slot.method.kind();
            if self.is_disabled(slot) {
                tracing::debug!(method = %kind, "skipping method with confirmed drift");
                failures.push((
                    kind,
                    AttemptFailure::new(FailureKind::Structural, "path disabled after confirmed drift"),
                ));
                continue;
            }

            match self.try_method(slot, &request).await {
                Ok(result) => {
                    tracing::info!(
                        account = %request.target,
                        method = %kind,
                        accepted = result.accepted,
                        rejected = result.rejected,
                        latency_ms = result.latency_ms,
                        "acquired records"
                    );
                    return Ok(result);
                }
                Err(failure) => {
                    tracing::warn!(account = %request.target, method = %kind, "method failed: {failure}");
                    if failure.kind == FailureKind::InvalidTarget {
                        return Err(AcquisitionError::InvalidTarget(failure.message));
                    }
                    failures.push((kind, failure));
                }
            }
        }

        if let Some(stale) = self.cache.get_stale(&key) {
            tracing::warn!(account = %request.target, "all methods failed, serving cached records");
            let mut result = from_cache(&request, stale, started);
            result.stale = true;
            return Ok(result);
        }
        Err(AcquisitionError::AllMethodsFailed { failures })
    }

    async fn try_method(
        &self,
        slot: &MethodSlot,
        request: &FetchRequest,
    ) -> Result<AcquisitionResult, AttemptFailure> {
        let mut last = AttemptFailure::new(FailureKind::Unavailable, "method was not attempted");
        for attempt in 0..self.settings.method_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.settings.backoff.delay(attempt - 1)).await;
            }
            let started = Instant::now();
            let timeout = self.settings.method_timeout;
            let outcome = tokio::time::timeout(timeout, slot.method.attempt(request))
                .await
                .unwrap_or_else(|_| {
                    AttemptOutcome::RetryableFailed(AttemptFailure::timeout(timeout.as_millis() as u64))
                });
            let latency_ms = started.elapsed().as_millis() as u64;

            let (failure, fatal) = match outcome {
                AttemptOutcome::Succeeded(raws) => match self.accept(slot, request, raws, latency_ms) {
                    Ok(result) => {
                        slot.record(None);
                        return Ok(result);
                    }
                    Err(failure) => {
                        let fatal = !failure.kind.is_retryable();
                        (failure, fatal)
                    }
                },
                AttemptOutcome::RetryableFailed(f) => (f, false),
                AttemptOutcome::FatalFailed(f) => (f, true),
            };
            slot.record(Some(&failure));
            // throttled: hammering the same resource will not help
            if fatal || failure.kind == FailureKind::RateLimited {
                return Err(failure);
            }
            last = failure;
        }
        Err(last)
    }

    /// Validate, normalize, dedupe and cache a successful attempt.
    fn accept(
        &self,
        slot: &MethodSlot,
        request: &FetchRequest,
        raws: Vec<RawRecord>,
        latency_ms: u64,
    ) -> Result<AcquisitionResult, AttemptFailure> {
        let captured_at = Utc::now();
        let mut records = Vec::with_capacity(raws.len());
        let mut confidence_sum = 0.0;
        let mut rejected = 0usize;
        let mut rate_limited = false;

        for raw in &raws {
            let validation = slot.validator.validate_and_record(raw);
            if validation.is_valid {
                if let Some(record) = normalize_record(raw, captured_at) {
                    confidence_sum += validation.confidence;
                    records.push(record);
                    continue;
                }
            }
            rate_limited |= validation.has_issue(IssueKind::RateLimit);
            rejected += 1;
        }

        if !raws.is_empty() && records.is_empty() {
            let kind = if rate_limited {
                FailureKind::RateLimited
            } else {
                FailureKind::Structural
            };
            return Err(AttemptFailure::new(
                kind,
                format!("all {} records failed validation", raws.len()),
            ));
        }

        let valid = records.len();
        let average_confidence = if valid == 0 {
            1.0
        } else {
            confidence_sum / valid as f64
        };
        let records = dedup_records(records);
        let kind = slot.method.kind();

        if request.since_id.is_none() {
            self.cache.set(
                &request.target.cache_key(),
                records.clone(),
                CacheMetadata {
                    method: kind,
                    latency_ms,
                    validation_score: average_confidence,
                    requested_count: request.count,
                },
            );
        }

        Ok(AcquisitionResult {
            target: request.target.handle().to_string(),
            accepted: records.len(),
            records,
            method: kind,
            latency_ms,
            from_cache: false,
            stale: false,
            rejected,
            average_confidence,
        })
    }

    fn is_disabled(&self, slot: &MethodSlot) -> bool {
        self.settings.drift_policy == DriftPolicy::DisablePath
            && slot.validator.drift_state() == DriftState::DriftConfirmed
    }

    /// Method indices in the order they should be tried.
    fn method_order(&self, explore: bool) -> Vec<usize> {
        let rates: Vec<f64> = self.methods.iter().map(|m| m.success_rate()).collect();
        let mut order: Vec<usize> = (0..self.methods.len()).collect();
        order.sort_by(|&a, &b| {
            rates[b]
                .partial_cmp(&rates[a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.methods[a].priority.cmp(&self.methods[b].priority))
        });
        if explore && order.len() > 1 && self.settings.exploration_rate > 0.0 {
            let mut rng = rand::thread_rng();
            if rng.gen_bool(self.settings.exploration_rate.min(1.0)) {
                let pick = rng.gen_range(1..order.len());
                let chosen = order.remove(pick);
                tracing::debug!(method = %self.methods[chosen].method.kind(), "exploring non-preferred method");
                order.insert(0, chosen);
            }
        }
        order
    }

    pub fn get_status(&self) -> RouterStatus {
        let preferred = self
            .method_order(false)
            .into_iter()
            .find(|&i| !self.is_disabled(&self.methods[i]))
            .map(|i| self.methods[i].method.kind());
        let methods = self
            .methods
            .iter()
            .map(|slot| {
                let t = slot.tracker.lock();
                MethodStatus {
                    kind: slot.method.kind(),
                    priority: slot.priority,
                    success_rate: t.window.rate(),
                    attempts: t.attempts,
                    successes: t.successes,
                    failures: t.failures,
                    last_error: t.last_error.clone(),
                    drift: slot.validator.drift_state(),
                    disabled: self.is_disabled(slot),
                    trends: slot.validator.get_validation_trends(),
                }
            })
            .collect();
        RouterStatus {
            preferred,
            methods,
            cache: self.cache.get_analytics(),
        }
    }

    /// Drift report for every method's extraction path.
    pub fn detect_structural_changes(&self) -> Vec<(MethodKind, StructuralChangeReport)> {
        self.methods
            .iter()
            .map(|slot| (slot.method.kind(), slot.validator.detect_structural_changes()))
            .collect()
    }

    /// Clear drift tracking for `kind`, re-enabling a disabled path.
    pub fn reset_drift(&self, kind: MethodKind) -> bool {
        match self.methods.iter().find(|m| m.method.kind() == kind) {
            Some(slot) => {
                slot.validator.reset();
                tracing::info!(method = %kind, "drift state reset");
                true
            }
            None => false,
        }
    }
}

/// The entry was fetched for at least `count` posts, or already holds that many.
fn covers(hit: &CachedRecords, count: usize) -> bool {
    hit.metadata.requested_count >= count || hit.records.len() >= count
}

/// Answer `request` from a cached full read: newer than `since_id` when set,
/// at most `count` posts.
fn from_cache(request: &FetchRequest, hit: CachedRecords, started: Instant) -> AcquisitionResult {
    let mut records = hit.records;
    if let Some(since) = &request.since_id {
        records.retain(|r| is_newer(&r.id, since));
    }
    records.truncate(request.count);
    AcquisitionResult {
        target: request.target.handle().to_string(),
        accepted: records.len(),
        records,
        method: hit.metadata.method,
        latency_ms: started.elapsed().as_millis() as u64,
        from_cache: true,
        stale: hit.stale,
        rejected: 0,
        average_confidence: hit.metadata.validation_score,
    }
}
