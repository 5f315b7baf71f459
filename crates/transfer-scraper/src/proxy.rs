//! Egress proxy pool with rotation, health scoring and quarantine.
//!
//! ## Quarantine
//!
//! An endpoint that returns `block_threshold` consecutive block signatures
//! (explicit access-denied responses) is marked `blocked` and skipped until
//! its cool-down elapses. After that it becomes eligible again as a re-probe:
//! a successful request reinstates it, a further block re-quarantines it.
//! Endpoints are never removed from the registry.
//!
//! ## Credentials
//!
//! Entries may carry `user:pass@`. The credentials are split off at parse
//! time: [`ProxyEndpoint::address`] never contains them, and sessions answer
//! the proxy's auth challenge from [`ProxyEndpoint::credentials`]. Chromium
//! cannot authenticate to SOCKS proxies, so credentialed `socks5` entries
//! are rejected.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::ScraperConfig;
use crate::error::{AcquisitionError, ScraperResult};
use crate::rolling::RollingRate;
use crate::strategy::{Candidate, RotationStrategy};
use crate::types::{AttemptFailure, FailureKind};

/// Outcomes kept per endpoint for the rolling success rate.
const SUCCESS_WINDOW: usize = 20;
/// Samples required before an endpoint can be marked degraded.
const MIN_SAMPLES_FOR_DEGRADED: usize = 5;
const DEGRADED_BELOW: f64 = 0.5;

/// Prefix marking a residential endpoint in a proxy list entry.
const RESIDENTIAL_PREFIX: &str = "residential+";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    Datacenter,
    Residential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStatus {
    Healthy,
    Degraded,
    Blocked,
}

/// Username and password for an authenticating proxy.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A parsed proxy list entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEndpoint {
    /// `scheme://host:port`, without credentials.
    pub address: String,
    pub kind: ProxyKind,
    pub credentials: Option<ProxyCredentials>,
}

/// Immutable snapshot of one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub id: usize,
    /// `scheme://host:port`; safe to log.
    pub address: String,
    #[serde(skip)]
    pub credentials: Option<ProxyCredentials>,
    pub kind: ProxyKind,
    pub status: ProxyStatus,
    pub success_rate: f64,
    pub last_latency_ms: Option<u64>,
}

/// Counts by status, for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyHealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub blocked: usize,
}

struct ProxyState {
    address: String,
    credentials: Option<ProxyCredentials>,
    kind: ProxyKind,
    status: ProxyStatus,
    window: RollingRate,
    last_latency_ms: Option<u64>,
    consecutive_blocks: u32,
    blocked_until: Option<Instant>,
}

impl ProxyState {
    fn snapshot(&self, id: usize) -> ProxyEndpoint {
        ProxyEndpoint {
            id,
            address: self.address.clone(),
            credentials: self.credentials.clone(),
            kind: self.kind,
            status: self.status,
            success_rate: self.window.rate(),
            last_latency_ms: self.last_latency_ms,
        }
    }

    fn eligible(&self, now: Instant) -> bool {
        match self.status {
            ProxyStatus::Blocked => self.blocked_until.is_some_and(|until| now >= until),
            _ => true,
        }
    }

    fn refresh_status(&mut self) {
        if self.status == ProxyStatus::Blocked {
            return;
        }
        self.status = if self.window.len() >= MIN_SAMPLES_FOR_DEGRADED
            && self.window.rate() < DEGRADED_BELOW
        {
            ProxyStatus::Degraded
        } else {
            ProxyStatus::Healthy
        };
    }
}

struct ProxyCandidate {
    id: usize,
    score: f64,
}

impl Candidate for ProxyCandidate {
    fn slot(&self) -> usize {
        self.id
    }
    fn score(&self) -> f64 {
        self.score
    }
}

/// Pool of egress endpoints keyed by stable id.
pub struct ProxyManager {
    states: DashMap<usize, ProxyState>,
    len: usize,
    cursor: AtomicUsize,
    strategy: RotationStrategy,
    block_threshold: u32,
    cooldown: Duration,
}

impl ProxyManager {
    /// Build the pool from `scheme://[user:pass@]host:port` entries.
    pub fn new(
        entries: &[String],
        strategy: RotationStrategy,
        block_threshold: u32,
        cooldown: Duration,
    ) -> ScraperResult<Self> {
        let states = DashMap::new();
        for (id, raw) in entries.iter().enumerate() {
            let parsed = parse_endpoint(raw)?;
            states.insert(
                id,
                ProxyState {
                    address: parsed.address,
                    credentials: parsed.credentials,
                    kind: parsed.kind,
                    status: ProxyStatus::Healthy,
                    window: RollingRate::new(SUCCESS_WINDOW),
                    last_latency_ms: None,
                    consecutive_blocks: 0,
                    blocked_until: None,
                },
            );
        }
        tracing::debug!("ProxyManager initialized with {} endpoint(s)", entries.len());
        Ok(Self {
            states,
            len: entries.len(),
            cursor: AtomicUsize::new(0),
            strategy,
            block_threshold: block_threshold.max(1),
            cooldown,
        })
    }

    pub fn from_config(config: &ScraperConfig) -> ScraperResult<Self> {
        Self::new(
            &config.proxy_list,
            config.rotation_strategy,
            config.proxy_block_threshold,
            config.proxy_cooldown(),
        )
    }

    /// A manager with no endpoints; every request goes out directly.
    pub fn direct() -> Self {
        Self {
            states: DashMap::new(),
            len: 0,
            cursor: AtomicUsize::new(0),
            strategy: RotationStrategy::RoundRobin,
            block_threshold: 1,
            cooldown: Duration::ZERO,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Next endpoint per the configured strategy, or `None` when every
    /// endpoint is quarantined. Never blocks.
    pub fn get_next_proxy(&self) -> Option<ProxyEndpoint> {
        if self.len == 0 {
            return None;
        }
        let now = Instant::now();
        let candidates: Vec<ProxyCandidate> = (0..self.len)
            .filter_map(|id| {
                let state = self.states.get(&id)?;
                if !state.eligible(now) {
                    return None;
                }
                let score = match state.status {
                    ProxyStatus::Healthy => 2.0 + state.window.rate(),
                    ProxyStatus::Degraded => 1.0 + state.window.rate(),
                    // cooled-down re-probe
                    ProxyStatus::Blocked => 0.0,
                };
                Some(ProxyCandidate { id, score })
            })
            .collect();

        // advance past the slot actually chosen
        let mut cursor = self.cursor.load(Ordering::Acquire);
        let chosen = loop {
            let chosen = self.strategy.select_instance(&candidates, cursor % self.len)?.id;
            match self
                .cursor
                .compare_exchange_weak(cursor, chosen + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break chosen,
                Err(actual) => cursor = actual,
            }
        };
        self.states.get(&chosen).map(|s| s.snapshot(chosen))
    }

    /// Record the outcome of a request made through `proxy_id`.
    pub fn record_request(
        &self,
        proxy_id: usize,
        success: bool,
        latency_ms: u64,
        error: Option<&AttemptFailure>,
    ) {
        let Some(mut state) = self.states.get_mut(&proxy_id) else {
            tracing::warn!(proxy_id, "outcome recorded for unknown proxy");
            return;
        };
        state.window.record(success);
        state.last_latency_ms = Some(latency_ms);

        if success {
            state.consecutive_blocks = 0;
            if state.status == ProxyStatus::Blocked {
                state.status = ProxyStatus::Healthy;
                state.blocked_until = None;
                tracing::info!(proxy = %state.address, "proxy reinstated after re-probe");
            }
            state.refresh_status();
            return;
        }

        let is_block = error.is_some_and(|e| e.kind == FailureKind::Blocked);
        if is_block {
            state.consecutive_blocks += 1;
            if state.status == ProxyStatus::Blocked {
                state.blocked_until = Some(Instant::now() + self.cooldown);
                tracing::warn!(proxy = %state.address, "proxy re-probe blocked, quarantined again");
                return;
            }
            if state.consecutive_blocks >= self.block_threshold {
                state.status = ProxyStatus::Blocked;
                state.blocked_until = Some(Instant::now() + self.cooldown);
                tracing::warn!(
                    proxy = %state.address,
                    blocks = state.consecutive_blocks,
                    cooldown_secs = self.cooldown.as_secs(),
                    "proxy quarantined"
                );
                return;
            }
        }
        state.refresh_status();
    }

    /// Whether `proxy_id` may carry traffic now: not quarantined, or
    /// quarantined with its cool-down elapsed (a re-probe).
    pub fn is_available(&self, proxy_id: usize) -> bool {
        self.states
            .get(&proxy_id)
            .is_some_and(|s| s.eligible(Instant::now()))
    }

    pub fn get_health_summary(&self) -> ProxyHealthSummary {
        let mut summary = ProxyHealthSummary {
            total: self.len,
            ..Default::default()
        };
        for entry in self.states.iter() {
            match entry.status {
                ProxyStatus::Healthy => summary.healthy += 1,
                ProxyStatus::Degraded => summary.degraded += 1,
                ProxyStatus::Blocked => summary.blocked += 1,
            }
        }
        summary
    }

    /// Snapshots of every endpoint, ordered by id.
    pub fn snapshot(&self) -> Vec<ProxyEndpoint> {
        (0..self.len)
            .filter_map(|id| self.states.get(&id).map(|s| s.snapshot(id)))
            .collect()
    }
}

/// Parse a proxy list entry, splitting off any credentials.
pub fn parse_endpoint(raw: &str) -> ScraperResult<ParsedEndpoint> {
    let raw = raw.trim();
    let (kind, address) = match raw.strip_prefix(RESIDENTIAL_PREFIX) {
        Some(rest) => (ProxyKind::Residential, rest),
        None => (ProxyKind::Datacenter, raw),
    };
    let url = url::Url::parse(address).map_err(|e| {
        // userinfo stays out of the message
        let shown = raw.rsplit('@').next().unwrap_or_default();
        AcquisitionError::Config(format!("invalid proxy `{shown}`: {e}"))
    })?;
    if !matches!(url.scheme(), "http" | "https" | "socks5") {
        return Err(AcquisitionError::Config(format!(
            "unsupported proxy scheme `{}` in `{}`",
            url.scheme(),
            redact(&url)
        )));
    }
    let (Some(host), Some(port)) = (url.host_str(), url.port_or_known_default()) else {
        return Err(AcquisitionError::Config(format!(
            "proxy `{}` needs a host and port",
            redact(&url)
        )));
    };
    let credentials = if url.username().is_empty() {
        None
    } else {
        Some(ProxyCredentials {
            username: url.username().to_string(),
            password: url.password().unwrap_or_default().to_string(),
        })
    };
    if credentials.is_some() && url.scheme() == "socks5" {
        return Err(AcquisitionError::Config(format!(
            "proxy `{}` has credentials, which browsers cannot send to SOCKS proxies",
            redact(&url)
        )));
    }
    Ok(ParsedEndpoint {
        address: format!("{}://{host}:{port}", url.scheme()),
        kind,
        credentials,
    })
}

/// `url` with any password masked, for error messages.
fn redact(url: &url::Url) -> String {
    let mut shown = url.clone();
    if shown.password().is_some() {
        let _ = shown.set_password(Some("***"));
    }
    shown.to_string()
}
