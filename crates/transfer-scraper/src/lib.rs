//! Transfer scraper: resilient acquisition of football-transfer posts from
//! a social platform, with a browser worker pool, proxy rotation, caching,
//! structural drift detection and multi-method routing.

pub mod accounts;
pub mod backoff;
pub mod cache;
pub mod collector;
pub mod config;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod methods;
pub mod pool;
pub mod proxy;
pub mod renderer;
pub mod rolling;
pub mod router;
pub mod stack;
pub mod strategy;
pub mod types;
pub mod validator;

pub use accounts::{AccountRegistry, MonitoredAccount, SeenState};
pub use cache::{AcquisitionCache, CacheAnalytics, CacheMetadata, CachedRecords};
pub use collector::{CaptureBatch, Collector, RelevanceScorer};
pub use config::{DriftPolicy, ScraperConfig};
pub use error::{AcquisitionError, ScraperResult};
pub use methods::{AcquisitionMethod, ApiMethod, BrowserMethod, ExtractionServiceMethod, FetchRequest};
pub use pool::{HealthCheckReport, PoolSettings, WorkerInstance, WorkerPool, WorkerStatus};
pub use proxy::{ProxyEndpoint, ProxyHealthSummary, ProxyManager};
pub use renderer::chromium::ChromiumRenderer;
pub use renderer::{BrowserSession, NoopRenderer, Renderer};
pub use router::{HybridRouter, RouterSettings, RouterStatus};
pub use stack::ScraperStack;
pub use strategy::RotationStrategy;
pub use types::*;
pub use validator::{ContentValidator, DriftState, StructuralChangeReport};
