//! Browser extraction through the worker pool.

use std::sync::Arc;

use async_trait::async_trait;

use super::{AcquisitionMethod, FetchRequest};
use crate::pool::WorkerPool;
use crate::types::{AttemptOutcome, MethodKind};

/// Adapter exposing a [`WorkerPool`] as an acquisition method.
///
/// The pool already retries on other workers, so one router attempt here
/// may cover several browser attempts.
pub struct BrowserMethod {
    pool: Arc<WorkerPool>,
}

impl BrowserMethod {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }
}

#[async_trait]
impl AcquisitionMethod for BrowserMethod {
    fn kind(&self) -> MethodKind {
        MethodKind::Browser
    }

    async fn attempt(&self, request: &FetchRequest) -> AttemptOutcome {
        match self.pool.acquire(&request.target, request.count).await {
            Ok(records) => AttemptOutcome::Succeeded(records),
            Err(e) => e.into_outcome(),
        }
    }
}
