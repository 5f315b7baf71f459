//! Record validation, rate-limit detection and structural-drift tracking.
//!
//! [`ContentValidator::validate_record`] is pure. Drift tracking only sees
//! results that are explicitly recorded with [`ContentValidator::record`] (or
//! [`ContentValidator::validate_and_record`]).
//!
//! ## Drift states
//!
//! The last [`DRIFT_WINDOW`] results are kept. For each issue pattern
//! (e.g. `missing_field:author.handle`) the share of windowed results carrying
//! it is computed; the most frequent one drives the state machine:
//!
//! - `stable → suspect` once the share reaches [`SUSPECT_THRESHOLD`]
//! - `suspect → drift_confirmed` once it reaches [`CONFIRM_THRESHOLD`]
//! - `drift_confirmed → suspect` below the suspect threshold
//! - `suspect → stable` below [`RECOVERY_THRESHOLD`]
//!
//! Nothing moves before [`MIN_DRIFT_SAMPLES`] results are windowed.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::{
    Author, Engagement, FailureKind, IssueKind, MediaRef, RawRecord, ScrapedRecord,
    ValidationIssue, ValidationResult,
};

pub const REQUIRED_FIELDS: [&str; 4] = ["id", "text", "author.handle", "created_at"];
pub const DRIFT_WINDOW: usize = 30;
pub const MIN_DRIFT_SAMPLES: usize = 10;
pub const SUSPECT_THRESHOLD: f64 = 0.3;
pub const CONFIRM_THRESHOLD: f64 = 0.6;
pub const RECOVERY_THRESHOLD: f64 = 0.15;
/// Confidence below which a record is rejected even without hard issues.
pub const MIN_CONFIDENCE: f64 = 0.5;
/// Confidence multiplier applied per structural anomaly.
const ANOMALY_PENALTY: f64 = 0.85;

const METRIC_FIELDS: [&str; 5] = [
    "like_count",
    "retweet_count",
    "reply_count",
    "quote_count",
    "impression_count",
];

/// Notices the platform shows in place of content when throttling.
const RATE_LIMIT_NOTICES: &str = r"rate limit exceeded|you are being rate limited|too many requests|something went wrong\. try reloading|your account is temporarily limited";

/// Notices shown when access is refused outright.
const BLOCK_NOTICES: &str = r"access denied|403 forbidden|verify you are (?:a )?human|your account is (?:temporarily )?locked|we've detected unusual activity|suspicious login (?:attempt|prevented)";

/// A notice opening a line of page text.
fn page_notice_regex(notices: &str) -> Regex {
    Regex::new(&format!(r"(?im)^[\s\W]*({notices})")).expect("static regex")
}

fn rate_limit_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| page_notice_regex(RATE_LIMIT_NOTICES))
}

fn block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| page_notice_regex(BLOCK_NOTICES))
}

/// A payload whose whole text is a notice, optionally followed by a retry hint.
fn notice_payload_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?i)^\s*({RATE_LIMIT_NOTICES}|{BLOCK_NOTICES})[\s.!]*(?:(?:please )?try again later[\s.!]*)?$"
        ))
        .expect("static regex")
    })
}

fn first_group(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Rate-limit notice opening a line of `text`, if any.
pub fn detect_rate_limit(text: &str) -> Option<String> {
    first_group(rate_limit_regex(), text)
}

/// Block or access-denied notice opening a line of `text`, if any.
pub fn detect_block(text: &str) -> Option<String> {
    first_group(block_regex(), text)
}

/// A record whose entire text is a throttling or block notice.
pub fn detect_notice_payload(text: &str) -> Option<String> {
    first_group(notice_payload_regex(), text)
}

/// Classify a page's visible text as a throttling or block response.
pub fn classify_page_text(text: &str) -> Option<(FailureKind, String)> {
    if let Some(phrase) = detect_block(text) {
        return Some((FailureKind::Blocked, phrase));
    }
    detect_rate_limit(text).map(|phrase| (FailureKind::RateLimited, phrase))
}

fn lookup<'a>(raw: &'a RawRecord, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = raw;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

fn as_id_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_time(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftState {
    Stable,
    Suspect,
    DriftConfirmed,
}

/// Output of [`ContentValidator::detect_structural_changes`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralChangeReport {
    pub has_changes: bool,
    pub state: DriftState,
    pub dominant_pattern: Option<String>,
    pub frequency: f64,
    pub samples: usize,
    pub recommendation: Option<String>,
}

/// Output of [`ContentValidator::get_validation_trends`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationTrends {
    pub samples: usize,
    pub success_rate: f64,
    pub average_confidence: f64,
    pub issue_histogram: BTreeMap<IssueKind, usize>,
}

#[derive(Debug)]
struct Sample {
    valid: bool,
    confidence: f64,
    kinds: Vec<IssueKind>,
    patterns: Vec<String>,
}

#[derive(Debug)]
struct DriftTracker {
    window: VecDeque<Sample>,
    state: DriftState,
}

impl DriftTracker {
    fn dominant(&self) -> Option<(String, f64)> {
        if self.window.is_empty() {
            return None;
        }
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for sample in &self.window {
            for pattern in &sample.patterns {
                *counts.entry(pattern.as_str()).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(p, n)| (p.to_string(), n as f64 / self.window.len() as f64))
    }

    fn advance(&mut self) {
        let freq = if self.window.len() < MIN_DRIFT_SAMPLES {
            0.0
        } else {
            self.dominant().map(|(_, f)| f).unwrap_or(0.0)
        };
        let next = match self.state {
            DriftState::Stable if freq >= SUSPECT_THRESHOLD => DriftState::Suspect,
            DriftState::Suspect if freq >= CONFIRM_THRESHOLD => DriftState::DriftConfirmed,
            DriftState::Suspect if freq < RECOVERY_THRESHOLD => DriftState::Stable,
            DriftState::DriftConfirmed if freq < SUSPECT_THRESHOLD => DriftState::Suspect,
            state => state,
        };
        if next != self.state {
            match next {
                DriftState::DriftConfirmed => tracing::warn!(
                    frequency = freq,
                    pattern = ?self.dominant().map(|(p, _)| p),
                    "structural drift confirmed"
                ),
                DriftState::Suspect => tracing::info!(frequency = freq, "structural drift suspected"),
                DriftState::Stable => tracing::info!("extraction structure stable again"),
            }
            self.state = next;
        }
    }
}

/// Validates raw records and tracks drift for one extraction path.
#[derive(Debug)]
pub struct ContentValidator {
    tracker: Mutex<DriftTracker>,
}

impl Default for ContentValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentValidator {
    pub fn new() -> Self {
        Self {
            tracker: Mutex::new(DriftTracker {
                window: VecDeque::with_capacity(DRIFT_WINDOW),
                state: DriftState::Stable,
            }),
        }
    }

    /// Check presence and shape of required fields. Pure.
    pub fn validate_record(&self, raw: &RawRecord) -> ValidationResult {
        let mut issues = Vec::new();
        let mut warnings = Vec::new();

        if !raw.is_object() {
            issues.push(ValidationIssue {
                kind: IssueKind::StructuralAnomaly,
                field: "record".into(),
                message: "record is not a JSON object".into(),
            });
            return ValidationResult {
                is_valid: false,
                confidence: 0.0,
                issues,
                warnings,
            };
        }

        let mut present = 0usize;
        for field in REQUIRED_FIELDS {
            if lookup(raw, field).is_some() {
                present += 1;
            } else {
                issues.push(ValidationIssue {
                    kind: IssueKind::MissingField,
                    field: field.into(),
                    message: format!("required field `{field}` is missing"),
                });
            }
        }
        let mut confidence = present as f64 / REQUIRED_FIELDS.len() as f64;

        let text = lookup(raw, "text").and_then(|v| v.as_str()).unwrap_or("");
        if let Some(phrase) = detect_notice_payload(text) {
            issues.push(ValidationIssue {
                kind: IssueKind::RateLimit,
                field: String::new(),
                message: format!("throttling phrasing in payload: `{phrase}`"),
            });
            warnings.push(format!(
                "payload looks like a rate-limit response (`{phrase}`); do not retry on the same resource"
            ));
            confidence = 0.0;
        }

        let mut anomaly = |field: &str, message: String| {
            warnings.push(message.clone());
            issues.push(ValidationIssue {
                kind: IssueKind::StructuralAnomaly,
                field: field.into(),
                message,
            });
        };

        if let Some(id) = lookup(raw, "id") {
            match as_id_string(id) {
                Some(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {}
                _ => anomaly("id_format", format!("post id {id} is not numeric")),
            }
        }
        if let Some(text_value) = lookup(raw, "text") {
            match text_value.as_str() {
                Some(s) if s.trim().is_empty() => anomaly("text_empty", "post text is empty".into()),
                Some(_) => {}
                None => anomaly("text_type", "post text is not a string".into()),
            }
        }
        if let Some(created) = lookup(raw, "created_at") {
            if parse_time(created).is_none() {
                anomaly(
                    "created_at_format",
                    format!("created_at {created} is not an RFC 3339 timestamp"),
                );
            }
        }
        if let Some(verified) = lookup(raw, "author.verified") {
            if !verified.is_boolean() {
                anomaly("author_verified_type", "author.verified is not a boolean".into());
            }
        }
        if let Some(metrics) = lookup(raw, "metrics") {
            for name in METRIC_FIELDS {
                if let Some(v) = metrics.get(name) {
                    if !v.is_null() && v.as_u64().is_none() {
                        anomaly(
                            "metrics_value",
                            format!("metric `{name}` is not a non-negative integer: {v}"),
                        );
                    }
                }
            }
        }

        let anomalies = issues
            .iter()
            .filter(|i| i.kind == IssueKind::StructuralAnomaly)
            .count();
        confidence *= ANOMALY_PENALTY.powi(anomalies as i32);
        let confidence = (confidence.clamp(0.0, 1.0) * 1000.0).round() / 1000.0;

        let hard_failure = issues
            .iter()
            .any(|i| matches!(i.kind, IssueKind::MissingField | IssueKind::RateLimit));
        ValidationResult {
            is_valid: !hard_failure && confidence >= MIN_CONFIDENCE,
            confidence,
            issues,
            warnings,
        }
    }

    /// Feed a result into the drift window.
    pub fn record(&self, result: &ValidationResult) {
        let mut kinds: Vec<IssueKind> = result.issues.iter().map(|i| i.kind).collect();
        kinds.sort();
        kinds.dedup();
        let mut patterns: Vec<String> = result.issues.iter().map(|i| i.pattern()).collect();
        patterns.sort();
        patterns.dedup();

        let mut tracker = self.tracker.lock();
        if tracker.window.len() == DRIFT_WINDOW {
            tracker.window.pop_front();
        }
        tracker.window.push_back(Sample {
            valid: result.is_valid,
            confidence: result.confidence,
            kinds,
            patterns,
        });
        tracker.advance();
    }

    pub fn validate_and_record(&self, raw: &RawRecord) -> ValidationResult {
        let result = self.validate_record(raw);
        self.record(&result);
        result
    }

    pub fn drift_state(&self) -> DriftState {
        self.tracker.lock().state
    }

    pub fn detect_structural_changes(&self) -> StructuralChangeReport {
        let tracker = self.tracker.lock();
        let dominant = tracker.dominant();
        let (pattern, frequency) = match dominant {
            Some((p, f)) => (Some(p), f),
            None => (None, 0.0),
        };
        let has_changes = tracker.state == DriftState::DriftConfirmed;
        let recommendation = if tracker.state == DriftState::Stable {
            None
        } else {
            pattern.as_deref().map(recommend)
        };
        StructuralChangeReport {
            has_changes,
            state: tracker.state,
            dominant_pattern: pattern,
            frequency,
            samples: tracker.window.len(),
            recommendation,
        }
    }

    pub fn get_validation_trends(&self) -> ValidationTrends {
        let tracker = self.tracker.lock();
        let samples = tracker.window.len();
        let mut issue_histogram = BTreeMap::new();
        let mut valid = 0usize;
        let mut confidence_sum = 0.0;
        for sample in &tracker.window {
            if sample.valid {
                valid += 1;
            }
            confidence_sum += sample.confidence;
            for kind in &sample.kinds {
                *issue_histogram.entry(*kind).or_insert(0) += 1;
            }
        }
        let (success_rate, average_confidence) = if samples == 0 {
            (1.0, 1.0)
        } else {
            (valid as f64 / samples as f64, confidence_sum / samples as f64)
        };
        ValidationTrends {
            samples,
            success_rate,
            average_confidence,
            issue_histogram,
        }
    }

    /// Clear the drift window, e.g. after the extraction path was fixed.
    pub fn reset(&self) {
        let mut tracker = self.tracker.lock();
        tracker.window.clear();
        tracker.state = DriftState::Stable;
    }
}

fn recommend(pattern: &str) -> String {
    let (kind, field) = pattern.split_once(':').unwrap_or((pattern, ""));
    match kind {
        "missing_field" => format!(
            "field `{field}` no longer appears in extracted posts; update the extraction selectors or field mapping"
        ),
        "rate_limit" => "source is throttling this path; lower the request rate and rotate sessions and proxies".to_string(),
        "structural_anomaly" => format!(
            "`{field}` changed shape; review the parser for that field"
        ),
        _ => format!("investigate recurring issue `{pattern}`"),
    }
}

/// Convert a validated raw record into a [`ScrapedRecord`].
///
/// Returns `None` when required fields cannot be read; callers should only
/// pass records whose [`ValidationResult::is_valid`] is true.
pub fn normalize_record(raw: &RawRecord, captured_at: DateTime<Utc>) -> Option<ScrapedRecord> {
    let id = lookup(raw, "id").and_then(as_id_string)?;
    let text = lookup(raw, "text")?.as_str()?.trim().to_string();
    let handle = lookup(raw, "author.handle")?
        .as_str()?
        .trim_start_matches('@')
        .to_string();
    let created_at = lookup(raw, "created_at").and_then(parse_time)?;

    let display_name = lookup(raw, "author.name")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| handle.clone());
    let verified = lookup(raw, "author.verified")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let media = lookup(raw, "media")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .map(|m| {
                    let s = |key: &str| m.get(key).and_then(|v| v.as_str()).map(String::from);
                    MediaRef {
                        kind: s("type").unwrap_or_else(|| "unknown".into()),
                        url: s("url"),
                        preview_url: s("preview_url"),
                        alt_text: s("alt_text"),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let metric = |name: &str| {
        lookup(raw, "metrics")
            .and_then(|m| m.get(name))
            .and_then(|v| v.as_u64())
    };
    let engagement = Engagement {
        likes: metric("like_count").unwrap_or(0),
        reposts: metric("retweet_count").unwrap_or(0),
        replies: metric("reply_count").unwrap_or(0),
        quotes: metric("quote_count").unwrap_or(0),
        views: metric("impression_count"),
    };

    Some(ScrapedRecord {
        id,
        author: Author {
            handle,
            display_name,
            verified,
            reliability: None,
            tier: None,
        },
        text,
        media,
        engagement,
        created_at,
        captured_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn good() -> RawRecord {
        json!({
            "id": "1790000000000000001",
            "text": "Here we go! Deal agreed.",
            "created_at": "2024-07-01T10:00:00Z",
            "author": {"handle": "FabrizioRomano", "name": "Fabrizio Romano", "verified": true},
            "media": [{"type": "photo", "url": "https://pbs.example/1.jpg"}],
            "metrics": {"like_count": 120, "retweet_count": 30, "reply_count": 4, "quote_count": 1}
        })
    }

    fn missing_handle() -> RawRecord {
        let mut raw = good();
        raw["author"].as_object_mut().unwrap().remove("handle");
        raw
    }

    #[test]
    fn test_well_formed_record() {
        let v = ContentValidator::new();
        let r = v.validate_record(&good());
        assert!(r.is_valid);
        assert_eq!(r.confidence, 1.0);
        assert!(r.issues.is_empty());
    }

    #[test]
    fn test_missing_field_reduces_confidence() {
        let v = ContentValidator::new();
        let r = v.validate_record(&missing_handle());
        assert!(!r.is_valid);
        assert_eq!(r.confidence, 0.75);
        assert_eq!(r.issues.len(), 1);
        assert_eq!(r.issues[0].kind, IssueKind::MissingField);
        assert_eq!(r.issues[0].field, "author.handle");
    }

    #[test]
    fn test_validate_is_pure() {
        let v = ContentValidator::new();
        let raw = missing_handle();
        let a = v.validate_record(&raw);
        let b = v.validate_record(&raw);
        assert_eq!(a, b);
        // pure validation does not touch the drift window
        assert_eq!(v.get_validation_trends().samples, 0);
    }

    #[test]
    fn test_rate_limit_detected() {
        let v = ContentValidator::new();
        let mut raw = good();
        raw["text"] = json!("Rate limit exceeded. Please try again later.");
        let r = v.validate_record(&raw);
        assert!(!r.is_valid);
        assert!(r.has_issue(IssueKind::RateLimit));
        assert!(!r.warnings.is_empty());
        assert_eq!(r.confidence, 0.0);
    }

    #[test]
    fn test_structural_anomalies() {
        let v = ContentValidator::new();
        let mut raw = good();
        raw["created_at"] = json!("yesterday");
        raw["id"] = json!("abc");
        let r = v.validate_record(&raw);
        assert!(r.has_issue(IssueKind::StructuralAnomaly));
        assert_eq!(r.issues.len(), 2);
        assert!(r.confidence < 1.0);
        // anomalies alone do not reject
        assert!(r.is_valid);
    }

    #[test]
    fn test_non_object_rejected() {
        let v = ContentValidator::new();
        let r = v.validate_record(&json!("just a string"));
        assert!(!r.is_valid);
        assert_eq!(r.confidence, 0.0);
    }

    #[test]
    fn test_drift_confirmed_on_repeated_missing_field() {
        let v = ContentValidator::new();
        for _ in 0..30 {
            v.validate_and_record(&missing_handle());
        }
        let report = v.detect_structural_changes();
        assert!(report.has_changes);
        assert_eq!(report.state, DriftState::DriftConfirmed);
        assert_eq!(
            report.dominant_pattern.as_deref(),
            Some("missing_field:author.handle")
        );
        assert!(report.recommendation.unwrap().contains("author.handle"));
    }

    #[test]
    fn test_no_drift_on_good_records() {
        let v = ContentValidator::new();
        for _ in 0..30 {
            v.validate_and_record(&good());
        }
        let report = v.detect_structural_changes();
        assert!(!report.has_changes);
        assert_eq!(report.state, DriftState::Stable);
        assert!(report.recommendation.is_none());
    }

    #[test]
    fn test_drift_steps_through_suspect() {
        let v = ContentValidator::new();
        for _ in 0..MIN_DRIFT_SAMPLES - 1 {
            v.validate_and_record(&missing_handle());
        }
        assert_eq!(v.drift_state(), DriftState::Stable);
        v.validate_and_record(&missing_handle());
        assert_eq!(v.drift_state(), DriftState::Suspect);
        v.validate_and_record(&missing_handle());
        assert_eq!(v.drift_state(), DriftState::DriftConfirmed);
    }

    #[test]
    fn test_drift_recovers() {
        let v = ContentValidator::new();
        for _ in 0..30 {
            v.validate_and_record(&missing_handle());
        }
        for _ in 0..30 {
            v.validate_and_record(&good());
        }
        assert_eq!(v.drift_state(), DriftState::Stable);
    }

    #[test]
    fn test_trends() {
        let v = ContentValidator::new();
        for _ in 0..3 {
            v.validate_and_record(&good());
        }
        v.validate_and_record(&missing_handle());
        let t = v.get_validation_trends();
        assert_eq!(t.samples, 4);
        assert_eq!(t.success_rate, 0.75);
        assert_eq!(t.issue_histogram.get(&IssueKind::MissingField), Some(&1));
        assert!(t.average_confidence > 0.9);
    }

    #[test]
    fn test_classify_page_text() {
        assert_eq!(
            classify_page_text("Access Denied - your IP was flagged").map(|(k, _)| k),
            Some(FailureKind::Blocked)
        );
        assert_eq!(
            classify_page_text("Something went wrong. Try reloading.").map(|(k, _)| k),
            Some(FailureKind::RateLimited)
        );
        assert!(classify_page_text("Here we go! Medical booked.").is_none());
        assert_eq!(
            classify_page_text("Home\nRate limit exceeded\nExplore").map(|(k, _)| k),
            Some(FailureKind::RateLimited)
        );
    }

    #[test]
    fn test_notice_words_inside_prose_are_not_notices() {
        let prose = "Barcelona will try again later this summer after too many requests were rejected. \
                     Club insiders saw unusual activity around the deal; access denied to the medical for now.";
        assert!(classify_page_text(prose).is_none());
        assert!(detect_notice_payload(prose).is_none());

        let v = ContentValidator::new();
        let mut raw = good();
        raw["text"] = json!(prose);
        let r = v.validate_record(&raw);
        assert!(r.is_valid);
        assert!(!r.has_issue(IssueKind::RateLimit));
    }

    #[test]
    fn test_notice_payloads() {
        assert!(detect_notice_payload("Too many requests").is_some());
        assert!(detect_notice_payload("  Access denied. ").is_some());
        assert!(detect_notice_payload("Rate limit exceeded! Try again later.").is_some());
        assert!(detect_notice_payload("Too many requests for Osimhen, Napoli say").is_none());
    }

    #[test]
    fn test_normalize_record() {
        let rec = normalize_record(&good(), Utc::now()).unwrap();
        assert_eq!(rec.author.handle, "FabrizioRomano");
        assert!(rec.author.verified);
        assert_eq!(rec.engagement.likes, 120);
        assert_eq!(rec.media.len(), 1);
        assert_eq!(rec.media[0].kind, "photo");
        assert!(normalize_record(&missing_handle(), Utc::now()).is_none());
    }
}
