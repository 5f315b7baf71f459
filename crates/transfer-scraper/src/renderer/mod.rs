//! Renderer abstraction for browser-backed extraction sessions.
//!
//! Defines the `Renderer` and `BrowserSession` traits that abstract over
//! the browser engine (currently Chromium via chromiumoxide). Each session
//! is an isolated browser with its own fingerprint and optional proxy, so a
//! worker can rotate identity by closing one session and launching another.

pub mod chromium;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::proxy::ProxyEndpoint;

/// Everything a renderer needs to launch one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionProfile {
    pub worker_id: usize,
    /// Incremented each time the worker's session is recreated.
    pub generation: u64,
    pub fingerprint: Fingerprint,
    pub proxy: Option<ProxyEndpoint>,
    pub headless: bool,
}

/// Result of navigating to a URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationResult {
    /// The final URL after any redirects.
    pub final_url: String,
    /// Time taken to load the page in milliseconds.
    pub load_time_ms: u64,
}

/// A browser engine that can launch isolated sessions.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Launch a new session for `profile`.
    async fn launch(&self, profile: &SessionProfile) -> Result<Box<dyn BrowserSession>>;
    /// Number of currently open sessions.
    fn active_sessions(&self) -> usize;
}

/// A single isolated browser session.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Navigate to a URL with a timeout.
    async fn navigate(&mut self, url: &str, timeout_ms: u64) -> Result<NavigationResult>;
    /// Execute JavaScript in the page context and return the result.
    async fn execute_js(&self, script: &str) -> Result<serde_json::Value>;
    /// Visible text of the current page.
    async fn page_text(&self) -> Result<String>;
    /// Close this session and release its browser.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// A no-op renderer used when Chromium is unavailable.
///
/// API and extraction-service methods work without a browser; this stub
/// makes worker initialization fail so the browser path is left out.
pub struct NoopRenderer;

#[async_trait]
impl Renderer for NoopRenderer {
    async fn launch(&self, _profile: &SessionProfile) -> Result<Box<dyn BrowserSession>> {
        Err(anyhow::anyhow!("Browser not available, running without the browser path"))
    }
    fn active_sessions(&self) -> usize {
        0
    }
}
