//! Per-worker bookkeeping.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::proxy::ProxyEndpoint;
use crate::rolling::RollingRate;
use crate::strategy::Candidate;

/// Outcomes kept per worker for its success rate.
const WORKER_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    /// Out of rotation until the health check restarts it.
    Error,
    Restarting,
}

/// Immutable view of a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInstance {
    pub id: usize,
    pub generation: u64,
    pub status: WorkerStatus,
    pub error_count: u32,
    pub success_rate: f64,
    pub session_age_secs: Option<u64>,
    pub scrapes_since_rotation: u32,
    pub total_scrapes: u64,
    pub proxy: Option<String>,
}

#[derive(Debug)]
pub(crate) struct WorkerState {
    pub(crate) id: usize,
    pub(crate) generation: u64,
    pub(crate) status: WorkerStatus,
    pub(crate) error_count: u32,
    pub(crate) window: RollingRate,
    pub(crate) session_started: Option<Instant>,
    pub(crate) scrapes_since_rotation: u32,
    pub(crate) total_scrapes: u64,
    pub(crate) proxy: Option<ProxyEndpoint>,
    pub(crate) fingerprint: Option<Fingerprint>,
}

impl WorkerState {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            generation: 0,
            status: WorkerStatus::Restarting,
            error_count: 0,
            window: RollingRate::new(WORKER_WINDOW),
            session_started: None,
            scrapes_since_rotation: 0,
            total_scrapes: 0,
            proxy: None,
            fingerprint: None,
        }
    }

    /// Session is too old, has served too many scrapes, or does not exist.
    pub(crate) fn needs_rotation(&self, max_age: Duration, max_scrapes: u32) -> bool {
        match self.session_started {
            None => true,
            Some(started) => {
                started.elapsed() >= max_age || self.scrapes_since_rotation >= max_scrapes
            }
        }
    }

    /// Record that a fresh session was launched for this worker.
    pub(crate) fn begin_session(&mut self, proxy: Option<ProxyEndpoint>, fingerprint: Fingerprint) {
        self.generation += 1;
        self.session_started = Some(Instant::now());
        self.scrapes_since_rotation = 0;
        self.proxy = proxy;
        self.fingerprint = Some(fingerprint);
    }

    pub(crate) fn end_session(&mut self) {
        self.session_started = None;
        self.proxy = None;
    }

    pub(crate) fn record_scrape(&mut self, success: bool) {
        self.scrapes_since_rotation = self.scrapes_since_rotation.saturating_add(1);
        self.total_scrapes += 1;
        self.window.record(success);
        if !success {
            self.error_count += 1;
        }
    }

    /// Clear health counters after a restart.
    pub(crate) fn reset_health(&mut self) {
        self.error_count = 0;
        self.window.clear();
    }

    pub(crate) fn snapshot(&self) -> WorkerInstance {
        WorkerInstance {
            id: self.id,
            generation: self.generation,
            status: self.status,
            error_count: self.error_count,
            success_rate: self.window.rate(),
            session_age_secs: self.session_started.map(|t| t.elapsed().as_secs()),
            scrapes_since_rotation: self.scrapes_since_rotation,
            total_scrapes: self.total_scrapes,
            proxy: self.proxy.as_ref().map(|p| p.address.clone()),
        }
    }
}

/// A worker eligible for dispatch.
pub(crate) struct IdleWorker {
    pub(crate) slot: usize,
    pub(crate) success_rate: f64,
}

impl Candidate for IdleWorker {
    fn slot(&self) -> usize {
        self.slot
    }

    fn score(&self) -> f64 {
        self.success_rate
    }
}
