//! Core data types for acquired posts, validation results and attempt outcomes.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AcquisitionError, ScraperResult};

/// Raw record as produced by an acquisition method, before validation.
///
/// Every method emits the same canonical shape:
/// `{ id, text, created_at, author: { handle, name, verified }, media: [..], metrics: {..} }`.
pub type RawRecord = serde_json::Value;

/// Maximum handle length accepted by the platform.
const MAX_HANDLE_LEN: usize = 15;

/// A validated account handle being acquired from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Target(String);

impl Target {
    /// Parse a handle, stripping an optional leading `@`.
    pub fn parse(raw: &str) -> ScraperResult<Self> {
        let handle = raw.trim().trim_start_matches('@');
        if handle.is_empty() {
            return Err(AcquisitionError::InvalidTarget("empty handle".to_string()));
        }
        if handle.len() > MAX_HANDLE_LEN {
            return Err(AcquisitionError::InvalidTarget(format!(
                "handle `{handle}` exceeds {MAX_HANDLE_LEN} characters"
            )));
        }
        if !handle
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(AcquisitionError::InvalidTarget(format!(
                "handle `{handle}` contains characters outside [A-Za-z0-9_]"
            )));
        }
        Ok(Self(handle.to_string()))
    }

    /// The handle as written.
    pub fn handle(&self) -> &str {
        &self.0
    }

    /// Case-insensitive identity used for cache keys and coalescing.
    pub fn cache_key(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

impl TryFrom<String> for Target {
    type Error = AcquisitionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Target::parse(&value)
    }
}

impl From<Target> for String {
    fn from(value: Target) -> Self {
        value.0
    }
}

/// Author identity attached to a post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub handle: String,
    pub display_name: String,
    pub verified: bool,
    /// Reliability score from the account registry, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliability: Option<f32>,
    /// Source tier from the account registry, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<u8>,
}

/// A media attachment reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: String,
    pub url: Option<String>,
    pub preview_url: Option<String>,
    pub alt_text: Option<String>,
}

/// Public engagement counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Engagement {
    pub likes: u64,
    pub reposts: u64,
    pub replies: u64,
    pub quotes: u64,
    pub views: Option<u64>,
}

/// A validated post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedRecord {
    pub id: String,
    pub author: Author,
    pub text: String,
    pub media: Vec<MediaRef>,
    pub engagement: Engagement,
    pub created_at: DateTime<Utc>,
    pub captured_at: DateTime<Utc>,
}

impl ScrapedRecord {
    /// Identity of a record within one capture batch.
    pub fn dedup_key(&self) -> (String, String) {
        (self.id.clone(), self.author.handle.to_ascii_lowercase())
    }

    /// Numeric post id, when the id is numeric.
    pub fn numeric_id(&self) -> Option<u128> {
        self.id.parse().ok()
    }
}

/// Drop records whose (id, author) pair was already seen, keeping the first.
pub fn dedup_records(records: Vec<ScrapedRecord>) -> Vec<ScrapedRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(r.dedup_key()))
        .collect()
}

/// Category of a validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingField,
    RateLimit,
    StructuralAnomaly,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingField => "missing_field",
            Self::RateLimit => "rate_limit",
            Self::StructuralAnomaly => "structural_anomaly",
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One problem found while validating a raw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    /// Field path or anomaly code the issue refers to.
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    /// Key used by drift detection to group recurring issues.
    pub fn pattern(&self) -> String {
        if self.field.is_empty() {
            self.kind.as_str().to_string()
        } else {
            format!("{}:{}", self.kind, self.field)
        }
    }
}

/// Outcome of validating a single raw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub confidence: f64,
    pub issues: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn has_issue(&self, kind: IssueKind) -> bool {
        self.issues.iter().any(|i| i.kind == kind)
    }
}

/// The acquisition methods the router can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    /// Structured platform API.
    Api,
    /// Browser extraction through the worker pool.
    Browser,
    /// Third-party scraping-as-a-service.
    ExtractionService,
}

impl MethodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Browser => "browser",
            Self::ExtractionService => "extraction_service",
        }
    }
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a failed acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    RateLimited,
    /// Explicit access-denied / block signature from the source.
    Blocked,
    Network,
    Structural,
    /// Credentials rejected by a collaborator.
    Auth,
    InvalidTarget,
    /// A browser session or other resource could not be created.
    Unavailable,
    /// Proxies are configured but every one is quarantined.
    ProxyExhausted,
    /// The worker pool rejected the request because its queue is full.
    Overloaded,
}

impl FailureKind {
    /// Whether an attempt failing this way may succeed if retried elsewhere.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::RateLimited
                | Self::Blocked
                | Self::Network
                | Self::Unavailable
                | Self::ProxyExhausted
                | Self::Overloaded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Blocked => "blocked",
            Self::Network => "network",
            Self::Structural => "structural",
            Self::Auth => "auth",
            Self::InvalidTarget => "invalid_target",
            Self::Unavailable => "unavailable",
            Self::ProxyExhausted => "proxy_exhausted",
            Self::Overloaded => "overloaded",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified attempt failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl AttemptFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(waited_ms: u64) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("attempt timed out after {waited_ms}ms"),
        )
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Uniform result of one attempt by an acquisition method.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Succeeded(Vec<RawRecord>),
    RetryableFailed(AttemptFailure),
    FatalFailed(AttemptFailure),
}

impl From<AttemptFailure> for AttemptOutcome {
    fn from(failure: AttemptFailure) -> Self {
        if failure.kind.is_retryable() {
            Self::RetryableFailed(failure)
        } else {
            Self::FatalFailed(failure)
        }
    }
}

impl From<Result<Vec<RawRecord>, AttemptFailure>> for AttemptOutcome {
    fn from(result: Result<Vec<RawRecord>, AttemptFailure>) -> Self {
        match result {
            Ok(records) => Self::Succeeded(records),
            Err(failure) => failure.into(),
        }
    }
}

/// What the router hands back to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionResult {
    pub target: String,
    pub records: Vec<ScrapedRecord>,
    pub method: MethodKind,
    pub latency_ms: u64,
    pub from_cache: bool,
    /// Served from an expired cache entry because every live method failed.
    pub stale: bool,
    pub accepted: usize,
    pub rejected: usize,
    pub average_confidence: f64,
}
