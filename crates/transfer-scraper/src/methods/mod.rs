//! Acquisition methods driven by the router.
//!
//! Every method answers one [`FetchRequest`] with an [`AttemptOutcome`];
//! retries, ordering and fallback live in the router.

pub mod api;
pub mod browser;
pub mod http;
pub mod service;

use async_trait::async_trait;

use crate::types::{AttemptOutcome, MethodKind, Target};

pub use api::ApiMethod;
pub use browser::BrowserMethod;
pub use service::ExtractionServiceMethod;

/// One acquisition request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub target: Target,
    /// Maximum number of posts wanted.
    pub count: usize,
    /// Only posts newer than this id, when the method supports it.
    pub since_id: Option<String>,
}

impl FetchRequest {
    pub fn new(target: Target, count: usize) -> Self {
        Self {
            target,
            count,
            since_id: None,
        }
    }

    pub fn since(mut self, since_id: Option<String>) -> Self {
        self.since_id = since_id;
        self
    }
}

/// A way of getting raw posts for a target.
#[async_trait]
pub trait AcquisitionMethod: Send + Sync {
    fn kind(&self) -> MethodKind;

    /// Make a single attempt.
    async fn attempt(&self, request: &FetchRequest) -> AttemptOutcome;
}
