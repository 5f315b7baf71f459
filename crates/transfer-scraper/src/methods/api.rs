//! Structured platform API (v2) with a bearer token.
//!
//! Two calls per target: a username lookup (cached for the process
//! lifetime) and the user timeline, filtered with `since_id` when known.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Map, Value};

use super::http::{classify_status, HttpClient};
use super::{AcquisitionMethod, FetchRequest};
use crate::config::ScraperConfig;
use crate::types::{AttemptFailure, AttemptOutcome, FailureKind, MethodKind, RawRecord};

const TWEET_FIELDS: &str = "created_at,text,author_id,conversation_id,entities,public_metrics,context_annotations,referenced_tweets,possibly_sensitive";
const EXPANSIONS: &str = "attachments.media_keys,author_id,referenced_tweets.id";
const MEDIA_FIELDS: &str = "url,preview_image_url,type,alt_text,width,height";
const USER_FIELDS: &str = "username,name,verified,public_metrics";

/// The API accepts 5..=100 results per timeline page.
const MIN_RESULTS: usize = 5;
const MAX_RESULTS: usize = 100;

pub struct ApiMethod {
    http: HttpClient,
    base_url: String,
    token: String,
    /// Lowercase handle to user id.
    user_ids: DashMap<String, String>,
}

impl ApiMethod {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            http: HttpClient::new(timeout_ms),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            user_ids: DashMap::new(),
        }
    }

    /// `None` when no bearer token is configured.
    pub fn from_config(config: &ScraperConfig) -> Option<Self> {
        let token = config.api_bearer_token.as_deref()?.trim();
        if token.is_empty() {
            return None;
        }
        Some(Self::new(
            config.api_base_url.clone(),
            token,
            config.attempt_timeout_ms,
        ))
    }

    async fn user_id(&self, handle: &str) -> Result<String, AttemptFailure> {
        let key = handle.to_ascii_lowercase();
        if let Some(id) = self.user_ids.get(&key) {
            return Ok(id.clone());
        }

        let url = format!("{}/users/by/username/{}", self.base_url, handle);
        let response = self
            .http
            .get_json(&url, Some(self.token.as_str()), &[("user.fields", USER_FIELDS.to_string())])
            .await?;
        if response.status == 404 && reports_missing_user(&response.body) {
            return Err(AttemptFailure::new(
                FailureKind::InvalidTarget,
                format!("platform API has no user @{handle}"),
            ));
        }
        if let Some(failure) = classify_status("platform API", &response) {
            return Err(failure);
        }

        match response.body.pointer("/data/id").and_then(Value::as_str) {
            Some(id) => {
                self.user_ids.insert(key, id.to_string());
                Ok(id.to_string())
            }
            None if response.body.get("errors").is_some() => Err(AttemptFailure::new(
                FailureKind::InvalidTarget,
                format!("platform API has no user @{handle}"),
            )),
            None => Err(AttemptFailure::new(
                FailureKind::Structural,
                "user lookup response has no data.id",
            )),
        }
    }

    async fn timeline(&self, request: &FetchRequest) -> Result<Vec<RawRecord>, AttemptFailure> {
        let user_id = self.user_id(request.target.handle()).await?;
        let url = format!("{}/users/{}/tweets", self.base_url, user_id);
        let mut query = vec![
            ("tweet.fields", TWEET_FIELDS.to_string()),
            ("expansions", EXPANSIONS.to_string()),
            ("media.fields", MEDIA_FIELDS.to_string()),
            ("user.fields", USER_FIELDS.to_string()),
            ("exclude", "retweets,replies".to_string()),
            (
                "max_results",
                request.count.clamp(MIN_RESULTS, MAX_RESULTS).to_string(),
            ),
        ];
        if let Some(since) = &request.since_id {
            query.push(("since_id", since.clone()));
        }

        let response = self.http.get_json(&url, Some(self.token.as_str()), &query).await?;
        if let Some(failure) = classify_status("platform API", &response) {
            return Err(failure);
        }

        let mut records = map_timeline(&response.body)?;
        records.truncate(request.count);
        Ok(records)
    }
}

#[async_trait]
impl AcquisitionMethod for ApiMethod {
    fn kind(&self) -> MethodKind {
        MethodKind::Api
    }

    async fn attempt(&self, request: &FetchRequest) -> AttemptOutcome {
        self.timeline(request).await.into()
    }
}

/// The error payload names a user as the missing resource.
fn reports_missing_user(body: &Value) -> bool {
    let Some(errors) = body.get("errors").and_then(Value::as_array) else {
        return false;
    };
    errors.iter().any(|e| {
        e.get("resource_type").and_then(Value::as_str) == Some("user")
            || e.get("detail")
                .and_then(Value::as_str)
                .is_some_and(|d| d.to_ascii_lowercase().contains("could not find user"))
    })
}

/// Convert a v2 timeline payload into canonical raw records.
pub fn map_timeline(body: &Value) -> Result<Vec<RawRecord>, AttemptFailure> {
    let tweets = match body.get("data") {
        Some(Value::Array(tweets)) => tweets,
        Some(_) => {
            return Err(AttemptFailure::new(
                FailureKind::Structural,
                "timeline data is not a list",
            ))
        }
        // no new posts
        None if body.pointer("/meta/result_count").is_some() => return Ok(Vec::new()),
        None => {
            return Err(AttemptFailure::new(
                FailureKind::Structural,
                "timeline response has neither data nor meta",
            ))
        }
    };

    let users: Map<String, Value> = body
        .pointer("/includes/users")
        .and_then(Value::as_array)
        .map(|users| {
            users
                .iter()
                .filter_map(|u| Some((u.get("id")?.as_str()?.to_string(), u.clone())))
                .collect()
        })
        .unwrap_or_default();
    let media: Map<String, Value> = body
        .pointer("/includes/media")
        .and_then(Value::as_array)
        .map(|media| {
            media
                .iter()
                .filter_map(|m| Some((m.get("media_key")?.as_str()?.to_string(), m.clone())))
                .collect()
        })
        .unwrap_or_default();

    Ok(tweets
        .iter()
        .map(|tweet| {
            let author = tweet
                .get("author_id")
                .and_then(Value::as_str)
                .and_then(|id| users.get(id));
            let attachments: Vec<Value> = tweet
                .pointer("/attachments/media_keys")
                .and_then(Value::as_array)
                .map(|keys| {
                    keys.iter()
                        .filter_map(|k| media.get(k.as_str()?))
                        .map(|m| {
                            json!({
                                "type": m.get("type"),
                                "url": m.get("url"),
                                "preview_url": m.get("preview_image_url"),
                                "alt_text": m.get("alt_text"),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            let metrics = tweet.get("public_metrics").cloned().unwrap_or(Value::Null);
            json!({
                "id": tweet.get("id"),
                "text": tweet.get("text"),
                "created_at": tweet.get("created_at"),
                "author": {
                    "handle": author.and_then(|a| a.get("username")),
                    "name": author.and_then(|a| a.get("name")),
                    "verified": author.and_then(|a| a.get("verified")),
                },
                "media": attachments,
                "metrics": {
                    "like_count": metrics.get("like_count"),
                    "retweet_count": metrics.get("retweet_count"),
                    "reply_count": metrics.get("reply_count"),
                    "quote_count": metrics.get("quote_count"),
                    "impression_count": metrics.get("impression_count"),
                },
            })
        })
        .collect())
}
