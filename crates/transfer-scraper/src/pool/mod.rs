//! Bounded pool of browser-backed extraction workers.
//!
//! ## Dispatch
//!
//! A request takes an idle worker chosen by the configured
//! [`RotationStrategy`]. With no idle worker it waits in a FIFO queue.
//! `queue_bound` caps outstanding requests, leased plus waiting: once that
//! many are outstanding a request fails immediately with
//! [`AcquisitionError::Overloaded`]. Waiters that gave up are pruned before
//! the bound is checked. Waiting is bounded by `queue_timeout`. Released
//! workers are handed straight to the oldest live waiter.
//!
//! Every worker status transition happens under the dispatch lock, so a
//! worker can never be leased twice.
//!
//! ## Sessions
//!
//! Each worker owns one browser session with its own fingerprint and proxy.
//! Sessions rotate when they get too old, have served too many scrapes, or
//! their proxy was quarantined. Workers that keep failing are taken out of
//! rotation and restarted by the health check.

pub mod worker;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};

use crate::backoff::ExponentialBackoff;
use crate::config::ScraperConfig;
use crate::error::{AcquisitionError, ScraperResult};
use crate::extract::extract_timeline;
use crate::fingerprint::Fingerprint;
use crate::proxy::{ProxyEndpoint, ProxyManager};
use crate::renderer::{BrowserSession, Renderer, SessionProfile};
use crate::strategy::RotationStrategy;
use crate::types::{AttemptFailure, FailureKind, RawRecord, Target};

pub use worker::{WorkerInstance, WorkerStatus};
use worker::{IdleWorker, WorkerState};

/// Pool tuning, usually derived from [`ScraperConfig`].
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_instances: usize,
    pub max_retries: u32,
    pub backoff: ExponentialBackoff,
    pub attempt_timeout: Duration,
    pub queue_bound: usize,
    pub queue_timeout: Duration,
    pub session_rotation_interval: Duration,
    pub max_scrapes_per_session: u32,
    pub strategy: RotationStrategy,
    pub headless: bool,
    /// Failures after which a worker leaves rotation until restarted.
    pub error_threshold: u32,
    pub health_check_interval: Duration,
    pub platform_base_url: String,
}

impl PoolSettings {
    pub fn from_config(config: &ScraperConfig) -> Self {
        Self {
            max_instances: config.max_instances.max(1),
            max_retries: config.max_retries,
            backoff: ExponentialBackoff::new(config.retry_backoff_ms, config.retry_backoff_max_ms),
            attempt_timeout: config.attempt_timeout(),
            queue_bound: config.queue_bound,
            queue_timeout: config.queue_timeout(),
            session_rotation_interval: config.session_rotation_interval(),
            max_scrapes_per_session: config.max_scrapes_per_session.max(1),
            strategy: config.rotation_strategy,
            headless: config.headless_mode,
            error_threshold: config.worker_error_threshold.max(1),
            health_check_interval: config.health_check_interval(),
            platform_base_url: config.platform_base_url.clone(),
        }
    }
}

/// What one health-check pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckReport {
    pub checked: usize,
    /// Workers restarted after leaving rotation.
    pub restarted: Vec<usize>,
    /// Idle workers whose session was rotated ahead of use.
    pub rotated: Vec<usize>,
    /// Restarts that failed; those workers stay in error.
    pub failed: Vec<usize>,
}

struct QueuedRequest {
    id: u64,
    target: String,
    enqueued_at: Instant,
    completion: oneshot::Sender<ScraperResult<WorkerLease>>,
}

#[derive(Default)]
struct Dispatch {
    queue: VecDeque<QueuedRequest>,
    rr_cursor: usize,
    next_id: u64,
}

/// Exclusive use of one worker. Dropping it returns the worker as idle.
pub struct WorkerLease {
    pool: Arc<WorkerPool>,
    slot: usize,
    armed: bool,
}

impl WorkerLease {
    fn new(pool: Arc<WorkerPool>, slot: usize) -> Self {
        Self {
            pool,
            slot,
            armed: true,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    fn release(mut self, status: WorkerStatus) {
        self.armed = false;
        self.pool.release(self.slot, status);
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release(self.slot, WorkerStatus::Idle);
        }
    }
}

/// Bounded set of browser workers with queueing, rotation and retries.
pub struct WorkerPool {
    settings: PoolSettings,
    renderer: Arc<dyn Renderer>,
    proxies: Arc<ProxyManager>,
    workers: DashMap<usize, WorkerState>,
    sessions: Vec<tokio::sync::Mutex<Option<Box<dyn BrowserSession>>>>,
    dispatch: parking_lot::Mutex<Dispatch>,
    shut_down: AtomicBool,
}

impl WorkerPool {
    /// Create `max_instances` workers and launch their sessions concurrently.
    ///
    /// Workers whose launch fails start in error and are retried by the
    /// health check. Fails only when no session could be launched at all.
    pub async fn initialize(
        settings: PoolSettings,
        renderer: Arc<dyn Renderer>,
        proxies: Arc<ProxyManager>,
    ) -> ScraperResult<Arc<Self>> {
        let n = settings.max_instances.max(1);
        let workers = DashMap::new();
        for id in 0..n {
            workers.insert(id, WorkerState::new(id));
        }
        let pool = Arc::new(Self {
            sessions: (0..n).map(|_| tokio::sync::Mutex::new(None)).collect(),
            settings,
            renderer,
            proxies,
            workers,
            dispatch: parking_lot::Mutex::new(Dispatch::default()),
            shut_down: AtomicBool::new(false),
        });

        let launches = (0..n).map(|slot| {
            let pool = Arc::clone(&pool);
            async move {
                let mut guard = pool.sessions[slot].lock().await;
                let result = pool.start_session(slot, &mut guard).await;
                (slot, result)
            }
        });
        let results = futures::future::join_all(launches).await;

        let mut last_error = None;
        {
            let _dispatch = pool.dispatch.lock();
            for (slot, result) in &results {
                if let Some(mut w) = pool.workers.get_mut(slot) {
                    match result {
                        Ok(()) => w.status = WorkerStatus::Idle,
                        Err(failure) => {
                            tracing::warn!(worker = slot, "worker failed to start: {failure}");
                            w.status = WorkerStatus::Error;
                            w.error_count += 1;
                            last_error = Some(failure.clone());
                        }
                    }
                }
            }
        }

        let started = results.iter().filter(|(_, r)| r.is_ok()).count();
        if started == 0 {
            let reason = last_error
                .map(|f| f.message)
                .unwrap_or_else(|| "no workers".to_string());
            return Err(AcquisitionError::Browser(format!(
                "no browser session could be started: {reason}"
            )));
        }
        tracing::info!(
            workers = n,
            started,
            strategy = pool.settings.strategy.as_str(),
            proxies = pool.proxies.len(),
            "worker pool initialized"
        );
        Ok(pool)
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn proxies(&self) -> &Arc<ProxyManager> {
        &self.proxies
    }

    /// Extract up to `count` raw posts for `target`.
    ///
    /// Retryable failures are retried with backoff, preferring a worker that
    /// has not failed this request yet.
    pub async fn acquire(self: &Arc<Self>, target: &Target, count: usize) -> ScraperResult<Vec<RawRecord>> {
        let mut avoid = HashSet::new();
        let mut last_failure = None;

        for attempt in 0..=self.settings.max_retries {
            if attempt > 0 {
                let delay = self.settings.backoff.delay(attempt - 1);
                tracing::debug!(account = %target, attempt, delay_ms = delay.as_millis() as u64, "retrying acquisition");
                tokio::time::sleep(delay).await;
            }

            let lease = self.checkout(target, &avoid).await?;
            let slot = lease.slot();
            match self.run_attempt(slot, target, count).await {
                Ok(records) => {
                    lease.release(WorkerStatus::Idle);
                    tracing::debug!(account = %target, worker = slot, records = records.len(), "acquisition succeeded");
                    return Ok(records);
                }
                Err(failure) => {
                    let status = self.status_after_failure(slot, &failure);
                    lease.release(status);
                    tracing::warn!(account = %target, worker = slot, attempt, "attempt failed: {failure}");
                    if !failure.kind.is_retryable() {
                        return Err(AcquisitionError::Fatal(failure));
                    }
                    avoid.insert(slot);
                    last_failure = Some(failure);
                }
            }
        }

        let attempts = self.settings.max_retries.saturating_add(1);
        match last_failure {
            Some(f) if f.kind == FailureKind::ProxyExhausted => Err(AcquisitionError::ProxiesExhausted),
            Some(last) => Err(AcquisitionError::RetriesExhausted { attempts, last }),
            None => Err(AcquisitionError::PoolExhausted),
        }
    }

    fn status_after_failure(&self, slot: usize, failure: &AttemptFailure) -> WorkerStatus {
        if failure.kind == FailureKind::Unavailable {
            return WorkerStatus::Error;
        }
        let errors = self.workers.get(&slot).map(|w| w.error_count).unwrap_or(0);
        if errors >= self.settings.error_threshold {
            WorkerStatus::Error
        } else {
            WorkerStatus::Idle
        }
    }

    /// Lease an idle worker, queueing if none is free.
    async fn checkout(self: &Arc<Self>, target: &Target, avoid: &HashSet<usize>) -> ScraperResult<WorkerLease> {
        let (id, mut rx) = {
            let mut dispatch = self.dispatch.lock();
            if self.shut_down.load(Ordering::Acquire) {
                return Err(AcquisitionError::ShutDown);
            }
            if let Some(slot) = self.pick_idle(&mut dispatch, avoid) {
                self.set_status(slot, WorkerStatus::Busy);
                return Ok(WorkerLease::new(Arc::clone(self), slot));
            }
            if self.all_in_error() {
                return Err(AcquisitionError::PoolExhausted);
            }
            dispatch.queue.retain(|q| !q.completion.is_closed());
            let leased = self.workers.iter().filter(|w| w.status == WorkerStatus::Busy).count();
            let outstanding = leased + dispatch.queue.len();
            if outstanding >= self.settings.queue_bound {
                tracing::warn!(account = %target, outstanding, "worker pool overloaded");
                return Err(AcquisitionError::Overloaded {
                    outstanding,
                    bound: self.settings.queue_bound,
                });
            }
            let (tx, rx) = oneshot::channel();
            let id = dispatch.next_id;
            dispatch.next_id += 1;
            dispatch.queue.push_back(QueuedRequest {
                id,
                target: target.cache_key(),
                enqueued_at: Instant::now(),
                completion: tx,
            });
            (id, rx)
        };

        let waited = tokio::time::timeout(self.settings.queue_timeout, &mut rx).await;
        match waited {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AcquisitionError::ShutDown),
            Err(_) => {
                let removed = {
                    let mut dispatch = self.dispatch.lock();
                    let before = dispatch.queue.len();
                    dispatch.queue.retain(|q| q.id != id);
                    before != dispatch.queue.len()
                };
                if removed {
                    let waited_ms = self.settings.queue_timeout.as_millis() as u64;
                    tracing::warn!(account = %target, waited_ms, "timed out waiting for a worker");
                    return Err(AcquisitionError::Timeout { waited_ms });
                }
                // handed a worker just as the wait expired
                rx.try_recv().unwrap_or(Err(AcquisitionError::ShutDown))
            }
        }
    }

    fn pick_idle(&self, dispatch: &mut Dispatch, avoid: &HashSet<usize>) -> Option<usize> {
        let idle: Vec<IdleWorker> = self
            .workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Idle)
            .map(|w| IdleWorker {
                slot: w.id,
                success_rate: w.window.rate(),
            })
            .collect();
        let fresh: Vec<IdleWorker> = idle
            .iter()
            .filter(|w| !avoid.contains(&w.slot))
            .map(|w| IdleWorker {
                slot: w.slot,
                success_rate: w.success_rate,
            })
            .collect();
        let pool = if fresh.is_empty() { &idle } else { &fresh };
        let slot = self
            .settings
            .strategy
            .select_instance(pool, dispatch.rr_cursor)?
            .slot;
        dispatch.rr_cursor = (slot + 1) % self.sessions.len();
        Some(slot)
    }

    fn all_in_error(&self) -> bool {
        self.workers.iter().all(|w| w.status == WorkerStatus::Error)
    }

    fn set_status(&self, slot: usize, status: WorkerStatus) {
        if let Some(mut w) = self.workers.get_mut(&slot) {
            w.status = status;
        }
    }

    /// Return a worker to the pool with its new status.
    fn release(self: &Arc<Self>, slot: usize, status: WorkerStatus) {
        let mut dispatch = self.dispatch.lock();
        match status {
            WorkerStatus::Idle if !self.shut_down.load(Ordering::Acquire) => {
                self.hand_off(&mut dispatch, slot);
            }
            WorkerStatus::Error => {
                self.set_status(slot, WorkerStatus::Error);
                tracing::warn!(worker = slot, "worker taken out of rotation");
                if self.all_in_error() {
                    let drained = dispatch.queue.len();
                    for request in dispatch.queue.drain(..) {
                        let _ = request.completion.send(Err(AcquisitionError::PoolExhausted));
                    }
                    if drained > 0 {
                        tracing::warn!(drained, "all workers in error, drained waiting requests");
                    }
                }
            }
            other => self.set_status(slot, other),
        }
    }

    /// Give `slot` to the oldest live waiter, or mark it idle.
    fn hand_off(self: &Arc<Self>, dispatch: &mut Dispatch, slot: usize) {
        while let Some(request) = dispatch.queue.pop_front() {
            self.set_status(slot, WorkerStatus::Busy);
            let lease = WorkerLease::new(Arc::clone(self), slot);
            match request.completion.send(Ok(lease)) {
                Ok(()) => {
                    tracing::debug!(
                        worker = slot,
                        account = %request.target,
                        waited_ms = request.enqueued_at.elapsed().as_millis() as u64,
                        "dispatched queued request"
                    );
                    return;
                }
                Err(returned) => {
                    // waiter is gone
                    if let Ok(lease) = returned {
                        lease.disarm();
                    }
                }
            }
        }
        self.set_status(slot, WorkerStatus::Idle);
    }

    /// One extraction on the leased worker `slot`.
    async fn run_attempt(&self, slot: usize, target: &Target, count: usize) -> Result<Vec<RawRecord>, AttemptFailure> {
        let mut guard = self.sessions[slot].lock().await;

        let rotate = {
            let w = self
                .workers
                .get(&slot)
                .ok_or_else(|| AttemptFailure::new(FailureKind::Unavailable, "unknown worker"))?;
            let proxy_blocked = w
                .proxy
                .as_ref()
                .map(|p| !self.proxies.is_available(p.id))
                .unwrap_or(false);
            guard.is_none()
                || proxy_blocked
                || w.needs_rotation(
                    self.settings.session_rotation_interval,
                    self.settings.max_scrapes_per_session,
                )
        };
        if rotate {
            self.start_session(slot, &mut guard).await?;
        }

        let proxy = self.workers.get(&slot).and_then(|w| w.proxy.clone());
        let session = guard
            .as_deref_mut()
            .ok_or_else(|| AttemptFailure::new(FailureKind::Unavailable, "worker has no session"))?;

        let timeout = self.settings.attempt_timeout;
        let timeout_ms = timeout.as_millis() as u64;
        let started = Instant::now();
        let result = match tokio::time::timeout(
            timeout,
            extract_timeline(session, &self.settings.platform_base_url, target, count, timeout_ms),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AttemptFailure::timeout(timeout_ms)),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        if let Some(proxy) = &proxy {
            self.proxies
                .record_request(proxy.id, result.is_ok(), latency_ms, result.as_ref().err());
        }
        if let Some(mut w) = self.workers.get_mut(&slot) {
            w.record_scrape(result.is_ok());
        }

        // a blocked identity is burned
        if matches!(&result, Err(f) if f.kind == FailureKind::Blocked) {
            self.stop_session(slot, &mut guard).await;
        }
        result
    }

    /// Replace the session in `guard` with a freshly launched one.
    async fn start_session(
        &self,
        slot: usize,
        guard: &mut Option<Box<dyn BrowserSession>>,
    ) -> Result<(), AttemptFailure> {
        self.stop_session(slot, guard).await;

        let proxy: Option<ProxyEndpoint> = if self.proxies.is_empty() {
            None
        } else {
            match self.proxies.get_next_proxy() {
                Some(p) => Some(p),
                None => {
                    return Err(AttemptFailure::new(
                        FailureKind::ProxyExhausted,
                        "no proxy available for a new session",
                    ))
                }
            }
        };

        let generation = self.workers.get(&slot).map(|w| w.generation + 1).unwrap_or(1);
        let profile = SessionProfile {
            worker_id: slot,
            generation,
            fingerprint: Fingerprint::random(),
            proxy: proxy.clone(),
            headless: self.settings.headless,
        };

        let launched = tokio::time::timeout(self.settings.attempt_timeout, self.renderer.launch(&profile)).await;
        let session = match launched {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                return Err(AttemptFailure::new(
                    FailureKind::Unavailable,
                    format!("failed to launch session: {e:#}"),
                ))
            }
            Err(_) => {
                return Err(AttemptFailure::new(
                    FailureKind::Unavailable,
                    "session launch timed out",
                ))
            }
        };

        *guard = Some(session);
        if let Some(mut w) = self.workers.get_mut(&slot) {
            w.begin_session(proxy, profile.fingerprint);
        }
        tracing::info!(
            worker = slot,
            generation,
            proxy = profile.proxy.as_ref().map(|p| p.address.as_str()),
            "worker session started"
        );
        Ok(())
    }

    async fn stop_session(&self, slot: usize, guard: &mut Option<Box<dyn BrowserSession>>) {
        if let Some(old) = guard.take() {
            if let Err(e) = old.close().await {
                tracing::debug!(worker = slot, "error closing session: {e}");
            }
        }
        if let Some(mut w) = self.workers.get_mut(&slot) {
            w.end_session();
        }
    }

    /// Restart workers in error and rotate idle sessions that are due.
    pub async fn run_health_check(self: &Arc<Self>) -> HealthCheckReport {
        let mut report = HealthCheckReport::default();
        let mut restarts = Vec::new();
        let mut rotations = Vec::new();
        {
            let _dispatch = self.dispatch.lock();
            for mut w in self.workers.iter_mut() {
                report.checked += 1;
                let due = w.needs_rotation(
                    self.settings.session_rotation_interval,
                    self.settings.max_scrapes_per_session,
                );
                match w.status {
                    WorkerStatus::Error => {
                        w.status = WorkerStatus::Restarting;
                        restarts.push(w.id);
                    }
                    WorkerStatus::Idle if due => {
                        w.status = WorkerStatus::Restarting;
                        rotations.push(w.id);
                    }
                    _ => {}
                }
            }
        }

        for slot in restarts.iter().chain(rotations.iter()).copied() {
            let restarted = restarts.contains(&slot);
            let mut guard = self.sessions[slot].lock().await;
            match self.start_session(slot, &mut guard).await {
                Ok(()) => {
                    if restarted {
                        if let Some(mut w) = self.workers.get_mut(&slot) {
                            w.reset_health();
                        }
                        report.restarted.push(slot);
                    } else {
                        report.rotated.push(slot);
                    }
                    drop(guard);
                    self.release(slot, WorkerStatus::Idle);
                }
                Err(failure) => {
                    tracing::warn!(worker = slot, "worker restart failed: {failure}");
                    report.failed.push(slot);
                    drop(guard);
                    self.release(slot, WorkerStatus::Error);
                }
            }
        }

        if !report.restarted.is_empty() || !report.failed.is_empty() {
            tracing::info!(
                restarted = ?report.restarted,
                rotated = ?report.rotated,
                failed = ?report.failed,
                "health check finished"
            );
        }
        report
    }

    /// Spawn the periodic health check until `shutdown` is notified.
    pub fn spawn_health_check(self: &Arc<Self>, shutdown: Arc<Notify>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        let every = self.settings.health_check_interval;
        tokio::spawn(async move {
            tracing::info!("health check loop started: interval={}s", every.as_secs());
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        tracing::info!("health check loop stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if pool.shut_down.load(Ordering::Acquire) {
                            break;
                        }
                        pool.run_health_check().await;
                    }
                }
            }
        })
    }

    pub fn snapshot(&self) -> Vec<WorkerInstance> {
        let mut workers: Vec<WorkerInstance> = self.workers.iter().map(|w| w.snapshot()).collect();
        workers.sort_by_key(|w| w.id);
        workers
    }

    /// Requests still waiting for a worker.
    pub fn queue_len(&self) -> usize {
        self.dispatch
            .lock()
            .queue
            .iter()
            .filter(|q| !q.completion.is_closed())
            .count()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Reject waiters and close every session.
    pub async fn shutdown(&self) {
        {
            let mut dispatch = self.dispatch.lock();
            self.shut_down.store(true, Ordering::Release);
            for request in dispatch.queue.drain(..) {
                let _ = request.completion.send(Err(AcquisitionError::ShutDown));
            }
        }
        for slot in 0..self.sessions.len() {
            let mut guard = self.sessions[slot].lock().await;
            self.stop_session(slot, &mut guard).await;
        }
        tracing::info!("worker pool shut down");
    }
}
