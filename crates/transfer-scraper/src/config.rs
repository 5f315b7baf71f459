//! Scraper configuration: defaults, JSON config file and environment overlay.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AcquisitionError, ScraperResult};
use crate::proxy::parse_endpoint;
use crate::strategy::RotationStrategy;

/// Upper bound on retry and per-method attempt counts.
const MAX_RETRY_COUNT: u32 = 20;
/// Upper bound on any single configured wait, one hour.
const MAX_WAIT_MS: u64 = 3_600_000;

/// What to do with an extraction path once drift is confirmed on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftPolicy {
    /// Keep using the path; drift is reported as a monitoring signal only.
    #[default]
    Alert,
    /// Skip the path in routing until its drift state is reset.
    DisablePath,
}

impl FromStr for DriftPolicy {
    type Err = AcquisitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alert" => Ok(Self::Alert),
            "disable_path" | "disable" => Ok(Self::DisablePath),
            other => Err(AcquisitionError::Config(format!(
                "unknown drift policy `{other}` (expected alert or disable_path)"
            ))),
        }
    }
}

/// Full configuration of the acquisition layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub max_instances: usize,
    pub session_rotation_interval_secs: u64,
    pub max_scrapes_per_session: u32,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub attempt_timeout_ms: u64,
    pub queue_bound: usize,
    pub queue_timeout_ms: u64,
    pub cache_ttl_secs: u64,
    pub cache_stale_grace_secs: u64,
    pub cache_capacity: usize,
    pub proxy_list: Vec<String>,
    pub rotation_strategy: RotationStrategy,
    pub headless_mode: bool,
    pub health_check_interval_secs: u64,
    pub worker_error_threshold: u32,
    pub proxy_block_threshold: u32,
    pub proxy_cooldown_secs: u64,
    pub exploration_rate: f64,
    pub min_cache_reliability: f64,
    pub drift_policy: DriftPolicy,
    pub method_attempts: u32,
    pub platform_base_url: String,
    pub api_base_url: String,
    #[serde(skip_serializing)]
    pub api_bearer_token: Option<String>,
    pub service_base_url: Option<String>,
    #[serde(skip_serializing)]
    pub service_token: Option<String>,
    pub service_poll_interval_ms: u64,
    pub service_max_polls: u32,
    pub chromium_path: Option<String>,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            max_instances: 2,
            session_rotation_interval_secs: 30 * 60,
            max_scrapes_per_session: 50,
            max_retries: 3,
            retry_backoff_ms: 500,
            retry_backoff_max_ms: 10_000,
            attempt_timeout_ms: 30_000,
            queue_bound: 16,
            queue_timeout_ms: 120_000,
            cache_ttl_secs: 300,
            cache_stale_grace_secs: 3600,
            cache_capacity: 256,
            proxy_list: Vec::new(),
            rotation_strategy: RotationStrategy::RoundRobin,
            headless_mode: true,
            health_check_interval_secs: 30,
            worker_error_threshold: 3,
            proxy_block_threshold: 3,
            proxy_cooldown_secs: 600,
            exploration_rate: 0.1,
            min_cache_reliability: 0.7,
            drift_policy: DriftPolicy::Alert,
            method_attempts: 1,
            platform_base_url: "https://x.com".to_string(),
            api_base_url: "https://api.twitter.com/2".to_string(),
            api_bearer_token: None,
            service_base_url: None,
            service_token: None,
            service_poll_interval_ms: 2000,
            service_max_polls: 30,
            chromium_path: None,
        }
    }
}

impl ScraperConfig {
    /// Defaults overlaid with the environment.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Load a JSON config file. Missing keys fall back to defaults.
    pub fn from_file(path: &Path) -> ScraperResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Overlay `TRANSFER_SCRAPER_*` variables (and the collaborator tokens) on top of `self`.
    pub fn with_env(mut self) -> Self {
        self.max_instances = read_env("TRANSFER_SCRAPER_MAX_INSTANCES", self.max_instances);
        self.session_rotation_interval_secs = read_env(
            "TRANSFER_SCRAPER_SESSION_ROTATION_SECS",
            self.session_rotation_interval_secs,
        );
        self.max_scrapes_per_session = read_env(
            "TRANSFER_SCRAPER_MAX_SCRAPES_PER_SESSION",
            self.max_scrapes_per_session,
        );
        self.max_retries = read_env("TRANSFER_SCRAPER_MAX_RETRIES", self.max_retries);
        self.retry_backoff_ms = read_env("TRANSFER_SCRAPER_RETRY_BACKOFF_MS", self.retry_backoff_ms);
        self.attempt_timeout_ms =
            read_env("TRANSFER_SCRAPER_ATTEMPT_TIMEOUT_MS", self.attempt_timeout_ms);
        self.queue_bound = read_env("TRANSFER_SCRAPER_QUEUE_BOUND", self.queue_bound);
        self.queue_timeout_ms = read_env("TRANSFER_SCRAPER_QUEUE_TIMEOUT_MS", self.queue_timeout_ms);
        self.cache_ttl_secs = read_env("TRANSFER_SCRAPER_CACHE_TTL_SECS", self.cache_ttl_secs);
        self.cache_capacity = read_env("TRANSFER_SCRAPER_CACHE_CAPACITY", self.cache_capacity);
        self.rotation_strategy =
            read_env("TRANSFER_SCRAPER_ROTATION_STRATEGY", self.rotation_strategy);
        self.headless_mode = read_env("TRANSFER_SCRAPER_HEADLESS", self.headless_mode);
        self.health_check_interval_secs = read_env(
            "TRANSFER_SCRAPER_HEALTH_CHECK_SECS",
            self.health_check_interval_secs,
        );
        self.exploration_rate =
            read_env("TRANSFER_SCRAPER_EXPLORATION_RATE", self.exploration_rate);
        self.drift_policy = read_env("TRANSFER_SCRAPER_DRIFT_POLICY", self.drift_policy);

        if let Some(list) = read_env_string("TRANSFER_SCRAPER_PROXIES") {
            self.proxy_list = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(url) = read_env_string("TRANSFER_SCRAPER_API_BASE_URL") {
            self.api_base_url = url;
        }
        if let Some(url) = read_env_string("TRANSFER_SCRAPER_SERVICE_URL") {
            self.service_base_url = Some(url);
        }
        if let Some(path) = read_env_string("TRANSFER_SCRAPER_CHROMIUM_PATH") {
            self.chromium_path = Some(path);
        }
        if let Some(token) = read_env_string("TWITTER_BEARER_TOKEN") {
            self.api_bearer_token = Some(token);
        }
        if let Some(token) = read_env_string("EXTRACTION_SERVICE_TOKEN") {
            self.service_token = Some(token);
        }
        self
    }

    /// Reject configurations the pool and router cannot run with.
    pub fn validate(&self) -> ScraperResult<()> {
        if self.max_instances == 0 {
            return Err(AcquisitionError::Config(
                "max_instances must be at least 1".into(),
            ));
        }
        if self.cache_capacity == 0 {
            return Err(AcquisitionError::Config(
                "cache_capacity must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.exploration_rate) {
            return Err(AcquisitionError::Config(format!(
                "exploration_rate {} is outside [0, 1]",
                self.exploration_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.min_cache_reliability) {
            return Err(AcquisitionError::Config(format!(
                "min_cache_reliability {} is outside [0, 1]",
                self.min_cache_reliability
            )));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(AcquisitionError::Config(
                "attempt_timeout_ms must be positive".into(),
            ));
        }
        if self.queue_bound == 0 {
            return Err(AcquisitionError::Config(
                "queue_bound must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("max_retries", self.max_retries),
            ("method_attempts", self.method_attempts),
        ] {
            if value > MAX_RETRY_COUNT {
                return Err(AcquisitionError::Config(format!(
                    "{name} {value} exceeds {MAX_RETRY_COUNT}"
                )));
            }
        }
        for (name, value) in [
            ("attempt_timeout_ms", self.attempt_timeout_ms),
            ("queue_timeout_ms", self.queue_timeout_ms),
            ("retry_backoff_ms", self.retry_backoff_ms),
            ("retry_backoff_max_ms", self.retry_backoff_max_ms),
        ] {
            if value > MAX_WAIT_MS {
                return Err(AcquisitionError::Config(format!(
                    "{name} {value} exceeds {MAX_WAIT_MS}"
                )));
            }
        }
        for entry in &self.proxy_list {
            parse_endpoint(entry)?;
        }
        Ok(())
    }

    pub fn session_rotation_interval(&self) -> Duration {
        Duration::from_secs(self.session_rotation_interval_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cache_stale_grace(&self) -> Duration {
        Duration::from_secs(self.cache_stale_grace_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn proxy_cooldown(&self) -> Duration {
        Duration::from_secs(self.proxy_cooldown_secs)
    }

    pub fn service_poll_interval(&self) -> Duration {
        Duration::from_millis(self.service_poll_interval_ms)
    }
}

fn read_env<T: FromStr>(name: &str, default_value: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default_value)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = ScraperConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.rotation_strategy, RotationStrategy::RoundRobin);
        assert!(cfg.headless_mode);
        assert_eq!(cfg.cache_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn test_validate_rejects_zero_instances() {
        let cfg = ScraperConfig {
            max_instances: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(AcquisitionError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_unbounded_retries_and_waits() {
        let cfg = ScraperConfig {
            max_retries: u32::MAX,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(AcquisitionError::Config(m)) if m.contains("max_retries")));
        let cfg = ScraperConfig {
            retry_backoff_max_ms: u64::MAX,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = ScraperConfig {
            queue_bound: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_exploration_out_of_range() {
        let cfg = ScraperConfig {
            exploration_rate: 1.5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_instances": 4, "rotation_strategy": "performance", "proxy_list": ["http://10.0.0.1:8080"]}}"#
        )
        .unwrap();
        let cfg = ScraperConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.max_instances, 4);
        assert_eq!(cfg.rotation_strategy, RotationStrategy::Performance);
        assert_eq!(cfg.proxy_list.len(), 1);
        // untouched keys keep their defaults
        assert_eq!(cfg.cache_capacity, 256);
    }

    #[test]
    fn test_tokens_not_serialized() {
        let cfg = ScraperConfig {
            api_bearer_token: Some("secret".into()),
            service_token: Some("also-secret".into()),
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn test_drift_policy_parse() {
        assert_eq!("alert".parse::<DriftPolicy>().unwrap(), DriftPolicy::Alert);
        assert_eq!(
            "DISABLE_PATH".parse::<DriftPolicy>().unwrap(),
            DriftPolicy::DisablePath
        );
        assert!("sometimes".parse::<DriftPolicy>().is_err());
    }
}
