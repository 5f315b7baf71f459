//! Wiring of the full acquisition stack from a [`ScraperConfig`].

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::cache::AcquisitionCache;
use crate::config::ScraperConfig;
use crate::error::{AcquisitionError, ScraperResult};
use crate::methods::{AcquisitionMethod, ApiMethod, BrowserMethod, ExtractionServiceMethod};
use crate::pool::{PoolSettings, WorkerPool};
use crate::proxy::ProxyManager;
use crate::renderer::Renderer;
use crate::router::{HybridRouter, RouterSettings};

/// A running acquisition stack with its background loops.
pub struct ScraperStack {
    pub config: ScraperConfig,
    pub proxies: Arc<ProxyManager>,
    pub cache: Arc<AcquisitionCache>,
    pub pool: Option<Arc<WorkerPool>>,
    pub router: Arc<HybridRouter>,
    shutdown: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

impl ScraperStack {
    /// Build every configured method, in priority order: API, browser pool,
    /// extraction service.
    ///
    /// The browser path is skipped, with a warning, when `renderer` is
    /// `None` or no session could be started.
    pub async fn build(
        config: ScraperConfig,
        renderer: Option<Arc<dyn Renderer>>,
    ) -> ScraperResult<Self> {
        config.validate()?;
        let proxies = Arc::new(ProxyManager::from_config(&config)?);
        let cache = Arc::new(AcquisitionCache::from_config(&config));

        let pool = match renderer {
            Some(renderer) => {
                match WorkerPool::initialize(
                    PoolSettings::from_config(&config),
                    renderer,
                    Arc::clone(&proxies),
                )
                .await
                {
                    Ok(pool) => Some(pool),
                    Err(e) => {
                        tracing::warn!("browser path unavailable: {e}");
                        None
                    }
                }
            }
            None => None,
        };

        let mut methods: Vec<Arc<dyn AcquisitionMethod>> = Vec::new();
        if let Some(api) = ApiMethod::from_config(&config) {
            methods.push(Arc::new(api));
        }
        if let Some(pool) = &pool {
            methods.push(Arc::new(BrowserMethod::new(Arc::clone(pool))));
        }
        if let Some(service) = ExtractionServiceMethod::from_config(&config) {
            methods.push(Arc::new(service));
        }
        if methods.is_empty() {
            return Err(AcquisitionError::Config(
                "no acquisition method available: set an API token, an extraction service, or install Chromium"
                    .into(),
            ));
        }

        let router = Arc::new(HybridRouter::new(
            methods,
            Arc::clone(&cache),
            RouterSettings::from_config(&config),
        ));
        tracing::info!(methods = ?router.method_kinds(), "acquisition stack ready");

        let shutdown = Arc::new(Notify::new());
        let mut tasks = Vec::new();
        if let Some(pool) = &pool {
            tasks.push(pool.spawn_health_check(Arc::clone(&shutdown)));
        }
        tasks.push(spawn_cache_cleanup(
            Arc::clone(&cache),
            config.health_check_interval(),
            Arc::clone(&shutdown),
        ));

        Ok(Self {
            config,
            proxies,
            cache,
            pool,
            router,
            shutdown,
            tasks,
        })
    }

    /// Stop background loops and close browser sessions.
    pub async fn shutdown(self) {
        self.shutdown.notify_waiters();
        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }
        for task in self.tasks {
            task.abort();
            let _ = task.await;
        }
    }
}

fn spawn_cache_cleanup(
    cache: Arc<AcquisitionCache>,
    every: std::time::Duration,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = ticker.tick() => {
                    cache.cleanup_expired();
                }
            }
        }
    })
}
