//! Configuration loading and resolution.

use std::path::{Path, PathBuf};

use anyhow::Context;
use transfer_scraper::{DriftPolicy, RotationStrategy, ScraperConfig};

/// Settings given on the command line; they win over file and environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub max_instances: Option<usize>,
    pub headed: bool,
    pub proxies: Vec<String>,
    pub rotation_strategy: Option<RotationStrategy>,
    pub drift_policy: Option<DriftPolicy>,
    pub chromium_path: Option<String>,
}

impl Overrides {
    pub fn apply(&self, config: &mut ScraperConfig) {
        if let Some(n) = self.max_instances {
            config.max_instances = n;
        }
        if self.headed {
            config.headless_mode = false;
        }
        if !self.proxies.is_empty() {
            config.proxy_list = self.proxies.clone();
        }
        if let Some(strategy) = self.rotation_strategy {
            config.rotation_strategy = strategy;
        }
        if let Some(policy) = self.drift_policy {
            config.drift_policy = policy;
        }
        if let Some(path) = &self.chromium_path {
            config.chromium_path = Some(path.clone());
        }
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Resolve the config file: explicit flag, `TRANSFER_SCRAPER_CONFIG`,
/// `./transfer-scraper.json`, then `~/.transfer-scraper/config.json`.
///
/// Only an explicit or env path is returned when missing; the two implicit
/// locations are used only if they exist.
pub fn resolve_config_path(explicit: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(PathBuf::from(path));
    }

    if let Ok(env_path) = std::env::var("TRANSFER_SCRAPER_CONFIG") {
        if !env_path.trim().is_empty() {
            return Some(PathBuf::from(env_path));
        }
    }

    let cwd_config = PathBuf::from("transfer-scraper.json");
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    let home_config = home_dir().join(".transfer-scraper/config.json");
    home_config.exists().then_some(home_config)
}

/// Resolve the last-seen state file.
pub fn resolve_state_path(explicit: Option<&str>) -> PathBuf {
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }
    if let Ok(env_path) = std::env::var("TRANSFER_SCRAPER_STATE") {
        if !env_path.trim().is_empty() {
            return PathBuf::from(env_path);
        }
    }
    home_dir().join(".transfer-scraper/last_seen.json")
}

/// Defaults, then the config file, then the environment, then `overrides`.
pub fn load_config(path: Option<&Path>, overrides: &Overrides) -> anyhow::Result<ScraperConfig> {
    let base = match path {
        Some(path) => ScraperConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ScraperConfig::default(),
    };
    let mut config = base.with_env();
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}
