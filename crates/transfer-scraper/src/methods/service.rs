//! Third-party scraping-as-a-service: submit a job, poll it, fetch results.
//!
//! Endpoints, relative to the configured base URL:
//!
//! - `POST /jobs` with `{ "target", "max_items", "since_id" }` returns `{ "id" }`
//! - `GET /jobs/{id}` returns `{ "status": queued|running|succeeded|failed, "error"? }`
//! - `GET /jobs/{id}/results` returns `{ "items": [..] }`

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::http::{classify_status, HttpClient};
use super::{AcquisitionMethod, FetchRequest};
use crate::config::ScraperConfig;
use crate::types::{AttemptFailure, AttemptOutcome, FailureKind, MethodKind, RawRecord};

const SERVICE: &str = "extraction service";

pub struct ExtractionServiceMethod {
    http: HttpClient,
    base_url: String,
    token: String,
    poll_interval: Duration,
    max_polls: u32,
}

impl ExtractionServiceMethod {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout_ms: u64,
        poll_interval: Duration,
        max_polls: u32,
    ) -> Self {
        Self {
            http: HttpClient::new(timeout_ms),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            poll_interval,
            max_polls: max_polls.max(1),
        }
    }

    /// `None` unless both a base URL and a token are configured.
    pub fn from_config(config: &ScraperConfig) -> Option<Self> {
        let base = config.service_base_url.as_deref()?.trim();
        let token = config.service_token.as_deref()?.trim();
        if base.is_empty() || token.is_empty() {
            return None;
        }
        Some(Self::new(
            base,
            token,
            config.attempt_timeout_ms,
            config.service_poll_interval(),
            config.service_max_polls,
        ))
    }

    async fn submit(&self, request: &FetchRequest) -> Result<String, AttemptFailure> {
        let body = json!({
            "target": request.target.handle(),
            "max_items": request.count,
            "since_id": request.since_id,
        });
        let url = format!("{}/jobs", self.base_url);
        let response = self.http.post_json(&url, Some(self.token.as_str()), &body).await?;
        if let Some(failure) = classify_status(SERVICE, &response) {
            return Err(failure);
        }
        response
            .body
            .get("id")
            .or_else(|| response.body.get("job_id"))
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| AttemptFailure::new(FailureKind::Structural, "job submission returned no id"))
    }

    async fn wait_for(&self, job_id: &str) -> Result<(), AttemptFailure> {
        let url = format!("{}/jobs/{}", self.base_url, job_id);
        for poll in 0..self.max_polls {
            if poll > 0 {
                tokio::time::sleep(self.poll_interval).await;
            }
            let response = self.http.get_json(&url, Some(self.token.as_str()), &[]).await?;
            if let Some(failure) = classify_status(SERVICE, &response) {
                return Err(failure);
            }
            let status = response
                .body
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_ascii_lowercase();
            match status.as_str() {
                "succeeded" | "completed" | "done" => return Ok(()),
                "failed" | "error" => {
                    let reason = response
                        .body
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("no reason given");
                    return Err(classify_job_error(job_id, reason));
                }
                "queued" | "pending" | "running" => {
                    tracing::debug!(job = job_id, poll, status = %status, "extraction job pending");
                }
                other => {
                    return Err(AttemptFailure::new(
                        FailureKind::Structural,
                        format!("job {job_id} reported unknown status `{other}`"),
                    ))
                }
            }
        }
        Err(AttemptFailure::new(
            FailureKind::Timeout,
            format!("job {job_id} still pending after {} polls", self.max_polls),
        ))
    }

    async fn results(&self, job_id: &str) -> Result<Vec<RawRecord>, AttemptFailure> {
        let url = format!("{}/jobs/{}/results", self.base_url, job_id);
        let response = self.http.get_json(&url, Some(self.token.as_str()), &[]).await?;
        if let Some(failure) = classify_status(SERVICE, &response) {
            return Err(failure);
        }
        match response.body.get("items") {
            Some(Value::Array(items)) => Ok(items.iter().map(normalize_item).collect()),
            _ => Err(AttemptFailure::new(
                FailureKind::Structural,
                format!("results for job {job_id} have no items list"),
            )),
        }
    }

    async fn run(&self, request: &FetchRequest) -> Result<Vec<RawRecord>, AttemptFailure> {
        let job_id = self.submit(request).await?;
        tracing::debug!(job = %job_id, account = %request.target, "submitted extraction job");
        self.wait_for(&job_id).await?;
        let mut records = self.results(&job_id).await?;
        records.truncate(request.count);
        Ok(records)
    }
}

#[async_trait]
impl AcquisitionMethod for ExtractionServiceMethod {
    fn kind(&self) -> MethodKind {
        MethodKind::ExtractionService
    }

    async fn attempt(&self, request: &FetchRequest) -> AttemptOutcome {
        self.run(request).await.into()
    }
}

fn classify_job_error(job_id: &str, reason: &str) -> AttemptFailure {
    let lowered = reason.to_ascii_lowercase();
    let kind = if lowered.contains("not found") || lowered.contains("does not exist") {
        FailureKind::InvalidTarget
    } else if lowered.contains("rate") || lowered.contains("throttl") {
        FailureKind::RateLimited
    } else if lowered.contains("blocked") || lowered.contains("denied") {
        FailureKind::Blocked
    } else {
        FailureKind::Network
    };
    AttemptFailure::new(kind, format!("job {job_id} failed: {reason}"))
}

/// Map an item into the canonical raw shape, accepting the legacy
/// `full_text` / `user.screen_name` / `favorite_count` naming.
pub fn normalize_item(item: &Value) -> RawRecord {
    if item.get("author").is_some() && item.get("metrics").is_some() {
        return item.clone();
    }
    let pick = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| item.pointer(k).filter(|v| !v.is_null()))
            .cloned()
            .unwrap_or(Value::Null)
    };
    json!({
        "id": pick(&["/id_str", "/id"]),
        "text": pick(&["/full_text", "/text"]),
        "created_at": pick(&["/created_at"]),
        "author": {
            "handle": pick(&["/author/handle", "/user/screen_name", "/username"]),
            "name": pick(&["/author/name", "/user/name"]),
            "verified": pick(&["/author/verified", "/user/verified"]),
        },
        "media": pick(&["/media"]),
        "metrics": {
            "like_count": pick(&["/favorite_count", "/like_count"]),
            "retweet_count": pick(&["/retweet_count"]),
            "reply_count": pick(&["/reply_count"]),
            "quote_count": pick(&["/quote_count"]),
            "impression_count": pick(&["/view_count", "/impression_count"]),
        },
    })
}
