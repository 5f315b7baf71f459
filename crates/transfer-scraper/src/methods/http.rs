//! Async HTTP client wrapping reqwest for JSON collaborators.
//!
//! Single attempts only: retries and backoff are the router's job. Protocol
//! errors fall back to HTTP/1.1, since some edges reject HTTP/2.

use std::time::Duration;

use crate::types::{AttemptFailure, FailureKind};

/// A JSON response.
#[derive(Debug, Clone)]
pub struct JsonResponse {
    pub status: u16,
    pub body: serde_json::Value,
    /// Seconds from a `retry-after` header, when present.
    pub retry_after: Option<u64>,
}

/// HTTP client shared by the API and extraction-service methods.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    /// HTTP/1.1-only fallback client for hosts that reject HTTP/2.
    h1_client: reqwest::Client,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(timeout_ms: u64) -> Self {
        let ua = concat!("transfer-scraper/", env!("CARGO_PKG_VERSION"));
        let timeout = Duration::from_millis(timeout_ms);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(ua)
            .build()
            .unwrap_or_default();

        let h1_client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(ua)
            .http1_only()
            .build()
            .unwrap_or_default();

        Self {
            client,
            h1_client,
            timeout,
        }
    }

    /// GET `url` with bearer auth and query parameters.
    pub async fn get_json(
        &self,
        url: &str,
        bearer: Option<&str>,
        query: &[(&str, String)],
    ) -> Result<JsonResponse, AttemptFailure> {
        let build = |client: &reqwest::Client| {
            let mut builder = client.get(url).query(query);
            if let Some(token) = bearer {
                builder = builder.bearer_auth(token);
            }
            builder
        };
        let result = match self.send(build(&self.client)).await {
            Err(e) if is_protocol_error(&e) => self.send(build(&self.h1_client)).await,
            other => other,
        };
        result.map_err(|e| self.classify_transport(url, e))
    }

    /// POST a JSON body to `url` with bearer auth.
    pub async fn post_json(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<JsonResponse, AttemptFailure> {
        let build = |client: &reqwest::Client| {
            let mut builder = client.post(url).json(body);
            if let Some(token) = bearer {
                builder = builder.bearer_auth(token);
            }
            builder
        };
        let result = match self.send(build(&self.client)).await {
            Err(e) if is_protocol_error(&e) => self.send(build(&self.h1_client)).await,
            other => other,
        };
        result.map_err(|e| self.classify_transport(url, e))
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<JsonResponse, reqwest::Error> {
        let r = builder.send().await?;
        let status = r.status().as_u16();
        let retry_after = r
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let text = r.text().await?;
        let body = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
        Ok(JsonResponse {
            status,
            body,
            retry_after,
        })
    }

    fn classify_transport(&self, url: &str, e: reqwest::Error) -> AttemptFailure {
        if e.is_timeout() {
            AttemptFailure::timeout(self.timeout.as_millis() as u64)
        } else {
            AttemptFailure::new(FailureKind::Network, format!("request to {url} failed: {e}"))
        }
    }
}

fn is_protocol_error(e: &reqwest::Error) -> bool {
    let err_str = format!("{e}");
    err_str.contains("http2") || err_str.contains("protocol") || err_str.contains("connection closed")
}

/// Classify a non-success HTTP status.
///
/// A bare 404 means the route is gone, not the account, so it stays
/// retryable and routing falls through. Callers that can tell a missing
/// account apart check for it first.
pub fn classify_status(service: &str, response: &JsonResponse) -> Option<AttemptFailure> {
    let status = response.status;
    let kind = match status {
        200..=299 => return None,
        429 => FailureKind::RateLimited,
        401 | 403 => FailureKind::Auth,
        404 => FailureKind::Unavailable,
        500..=599 => FailureKind::Network,
        _ => FailureKind::Structural,
    };
    let detail = response
        .body
        .get("detail")
        .or_else(|| response.body.get("title"))
        .or_else(|| response.body.get("error"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let mut message = format!("{service} answered HTTP {status}");
    if !detail.is_empty() {
        message.push_str(&format!(": {detail}"));
    }
    if let Some(secs) = response.retry_after {
        message.push_str(&format!(" (retry after {secs}s)"));
    }
    Some(AttemptFailure::new(kind, message))
}
