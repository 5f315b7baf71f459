//! Shared fixtures: a scriptable renderer and a scriptable acquisition method.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use transfer_scraper::methods::{AcquisitionMethod, FetchRequest};
use transfer_scraper::renderer::{BrowserSession, NavigationResult, Renderer, SessionProfile};
use transfer_scraper::{AttemptOutcome, MethodKind, Target};

// ─────────────────────── records ───────────────────────

/// A well-formed raw post in the canonical shape.
pub fn post(id: &str, handle: &str, text: &str) -> Value {
    json!({
        "id": id,
        "text": text,
        "created_at": "2024-07-01T10:00:00Z",
        "author": { "handle": handle, "name": handle, "verified": true },
        "media": [],
        "metrics": { "like_count": 10, "retweet_count": 2, "reply_count": 1 }
    })
}

/// Three posts for `handle` with ids `base+1..=base+3`.
pub fn posts(handle: &str, base: u64) -> Vec<Value> {
    (1..=3)
        .map(|i| post(&(base + i).to_string(), handle, "Here we go! Medical booked."))
        .collect()
}

pub fn target(handle: &str) -> Target {
    Target::parse(handle).unwrap()
}

/// Poll `condition` every 10ms, failing the test after 5s.
pub async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

// ─────────────────────── renderer ───────────────────────

/// How a mock session behaves on navigation.
#[derive(Clone)]
pub enum Behavior {
    Succeed,
    /// Never finishes loading.
    Hang,
    /// Waits for a permit before loading.
    Gated(Arc<Semaphore>),
    /// Navigation fails with this message.
    Fail(&'static str),
    /// Loads an access-denied page with no posts.
    Blocked,
}

pub struct MockRenderer {
    script: Arc<dyn Fn(usize) -> Behavior + Send + Sync>,
    pub launches: AtomicUsize,
    active: Arc<AtomicUsize>,
    pub fail_launch: AtomicBool,
}

impl MockRenderer {
    pub fn new(script: impl Fn(usize) -> Behavior + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            launches: AtomicUsize::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            fail_launch: AtomicBool::new(false),
        }
    }

    pub fn uniform(behavior: Behavior) -> Self {
        Self::new(move |_| behavior.clone())
    }
}

#[async_trait]
impl Renderer for MockRenderer {
    async fn launch(&self, profile: &SessionProfile) -> Result<Box<dyn BrowserSession>> {
        if self.fail_launch.load(Ordering::SeqCst) {
            anyhow::bail!("chromium exited during startup");
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            behavior: (self.script)(profile.worker_id),
            handle: String::new(),
            active: Arc::clone(&self.active),
        }))
    }

    fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

struct MockSession {
    behavior: Behavior,
    handle: String,
    active: Arc<AtomicUsize>,
}

#[async_trait]
impl BrowserSession for MockSession {
    async fn navigate(&mut self, url: &str, _timeout_ms: u64) -> Result<NavigationResult> {
        match &self.behavior {
            Behavior::Succeed => {}
            Behavior::Hang => tokio::time::sleep(Duration::from_secs(3600)).await,
            Behavior::Gated(gate) => {
                let _permit = gate.acquire().await?;
            }
            Behavior::Fail(message) => anyhow::bail!("{message}"),
            Behavior::Blocked => {}
        }
        self.handle = url.rsplit('/').next().unwrap_or_default().to_string();
        Ok(NavigationResult {
            final_url: url.to_string(),
            load_time_ms: 5,
        })
    }

    async fn execute_js(&self, script: &str) -> Result<Value> {
        if script.contains("scrollBy") {
            return Ok(json!(100));
        }
        if matches!(self.behavior, Behavior::Blocked) {
            return Ok(json!([]));
        }
        Ok(Value::Array(posts(&self.handle, 1_800_000_000_000_000_000)))
    }

    async fn page_text(&self) -> Result<String> {
        match self.behavior {
            Behavior::Blocked => Ok("Access denied".to_string()),
            _ => Ok("Home Explore Notifications".to_string()),
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

// ─────────────────────── methods ───────────────────────

type Respond = dyn Fn(usize, &FetchRequest) -> AttemptOutcome + Send + Sync;

/// An acquisition method answering from a closure of (call index, request).
pub struct ScriptedMethod {
    kind: MethodKind,
    delay: Duration,
    respond: Box<Respond>,
    calls: AtomicUsize,
}

impl ScriptedMethod {
    pub fn new(
        kind: MethodKind,
        respond: impl Fn(usize, &FetchRequest) -> AttemptOutcome + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            delay: Duration::ZERO,
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
        }
    }

    /// Answers every request with three valid posts.
    pub fn healthy(kind: MethodKind) -> Self {
        Self::new(kind, |_, req| {
            AttemptOutcome::Succeeded(posts(req.target.handle(), 1_800_000_000_000_000_000))
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AcquisitionMethod for ScriptedMethod {
    fn kind(&self) -> MethodKind {
        self.kind
    }

    async fn attempt(&self, request: &FetchRequest) -> AttemptOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.respond)(call, request)
    }
}
