//! Monitored insider accounts and per-account last-seen post ids.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AcquisitionError, ScraperResult};
use crate::types::{ScrapedRecord, Target};

/// Reliability assumed for handles outside the registry.
pub const DEFAULT_RELIABILITY: f32 = 0.5;
/// Tier assumed for handles outside the registry.
pub const DEFAULT_TIER: u8 = 3;

/// An account whose posts are collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredAccount {
    pub handle: String,
    pub display_name: String,
    /// Track record of the source in `[0, 1]`.
    pub reliability: f32,
    /// 1 is the most trusted tier.
    pub tier: u8,
}

impl MonitoredAccount {
    pub fn new(handle: &str, display_name: &str, reliability: f32, tier: u8) -> Self {
        Self {
            handle: handle.to_string(),
            display_name: display_name.to_string(),
            reliability,
            tier,
        }
    }

    pub fn target(&self) -> ScraperResult<Target> {
        Target::parse(&self.handle)
    }
}

const INSIDERS: &[(&str, &str, f32)] = &[
    ("FabrizioRomano", "Fabrizio Romano", 0.95),
    ("David_Ornstein", "David Ornstein", 0.93),
    ("SamLee", "Sam Lee", 0.92),
    ("_pauljoyce", "Paul Joyce", 0.91),
    ("lauriewhitwell", "Laurie Whitwell", 0.90),
    ("RobDawsonESPN", "Rob Dawson", 0.89),
    ("LukeEdwardsTele", "Luke Edwards", 0.88),
    ("JPercyTelegraph", "John Percy", 0.90),
    ("CraigHope_DM", "Craig Hope", 0.87),
    ("DeanJonesSoccer", "Dean Jones", 0.86),
    ("SirayahShiraz", "Sirayah Shiraz", 0.85),
    ("BouhafsiMohamed", "Mohamed Bouhafsi", 0.90),
    ("DiMarzio", "Gianluca Di Marzio", 0.91),
    ("alfredopedulla", "Alfredo Pedulla", 0.88),
    ("honigstein", "Raphael Honigstein", 0.89),
];

/// The set of monitored accounts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountRegistry {
    accounts: Vec<MonitoredAccount>,
}

impl AccountRegistry {
    pub fn new(accounts: Vec<MonitoredAccount>) -> Self {
        Self { accounts }
    }

    /// The built-in tier-1 insider accounts.
    pub fn insiders() -> Self {
        Self::new(
            INSIDERS
                .iter()
                .map(|(handle, name, reliability)| MonitoredAccount::new(handle, name, *reliability, 1))
                .collect(),
        )
    }

    pub fn accounts(&self) -> &[MonitoredAccount] {
        &self.accounts
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Case-insensitive lookup, ignoring a leading `@`.
    pub fn get(&self, handle: &str) -> Option<&MonitoredAccount> {
        let handle = handle.trim_start_matches('@');
        self.accounts
            .iter()
            .find(|a| a.handle.eq_ignore_ascii_case(handle))
    }

    /// Keep only the given handles; unknown handles become default accounts.
    pub fn select(&self, handles: &[String]) -> Self {
        Self::new(
            handles
                .iter()
                .map(|h| {
                    self.get(h).cloned().unwrap_or_else(|| {
                        let handle = h.trim_start_matches('@');
                        MonitoredAccount::new(handle, handle, DEFAULT_RELIABILITY, DEFAULT_TIER)
                    })
                })
                .collect(),
        )
    }

    /// Attach reliability and tier to a record's author.
    pub fn enrich(&self, record: &mut ScrapedRecord) {
        let (reliability, tier) = self
            .get(&record.author.handle)
            .map(|a| (a.reliability, a.tier))
            .unwrap_or((DEFAULT_RELIABILITY, DEFAULT_TIER));
        record.author.reliability = Some(reliability);
        record.author.tier = Some(tier);
    }
}

/// Most recent post id seen per account, keyed by lowercase handle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeenState {
    last_seen: BTreeMap<String, String>,
}

impl SeenState {
    /// Load from `path`; a missing file is an empty state.
    pub fn load(path: &Path) -> ScraperResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let state: Self = serde_json::from_str(&data).map_err(|e| {
            AcquisitionError::Config(format!("invalid seen-state file {}: {e}", path.display()))
        })?;
        Ok(state)
    }

    /// Write atomically (temp file then rename).
    pub fn save(&self, path: &Path) -> ScraperResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn get(&self, handle: &str) -> Option<&str> {
        self.last_seen
            .get(&handle.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Record `id` for `handle` if it is newer than the stored one.
    pub fn advance(&mut self, handle: &str, id: &str) -> bool {
        let key = handle.to_ascii_lowercase();
        let newer = match self.last_seen.get(&key) {
            Some(current) => is_newer(id, current),
            None => true,
        };
        if newer {
            self.last_seen.insert(key, id.to_string());
        }
        newer
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

/// Post ids grow monotonically; compare numerically when both parse.
pub fn is_newer(id: &str, than: &str) -> bool {
    match (id.parse::<u128>(), than.parse::<u128>()) {
        (Ok(a), Ok(b)) => a > b,
        _ => id.len() > than.len() || (id.len() == than.len() && id > than),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Author, Engagement};
    use chrono::Utc;

    #[test]
    fn test_insiders() {
        let registry = AccountRegistry::insiders();
        assert_eq!(registry.len(), 15);
        let fab = registry.get("@fabrizioromano").unwrap();
        assert_eq!(fab.display_name, "Fabrizio Romano");
        assert_eq!(fab.tier, 1);
        assert!(registry.accounts().iter().all(|a| a.target().is_ok()));
    }

    #[test]
    fn test_enrich_unknown_defaults() {
        let registry = AccountRegistry::insiders();
        let mut record = ScrapedRecord {
            id: "1".into(),
            author: Author {
                handle: "someone_else".into(),
                display_name: "Someone".into(),
                verified: false,
                reliability: None,
                tier: None,
            },
            text: "rumour".into(),
            media: vec![],
            engagement: Engagement::default(),
            created_at: Utc::now(),
            captured_at: Utc::now(),
        };
        registry.enrich(&mut record);
        assert_eq!(record.author.reliability, Some(DEFAULT_RELIABILITY));
        assert_eq!(record.author.tier, Some(DEFAULT_TIER));
    }

    #[test]
    fn test_select_keeps_known_metadata() {
        let registry = AccountRegistry::insiders();
        let picked = registry.select(&["DiMarzio".into(), "@new_source".into()]);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked.accounts()[0].reliability, 0.91);
        assert_eq!(picked.accounts()[1].handle, "new_source");
        assert_eq!(picked.accounts()[1].tier, DEFAULT_TIER);
    }

    #[test]
    fn test_seen_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/last_seen.json");
        let mut state = SeenState::load(&path).unwrap();
        assert!(state.is_empty());

        assert!(state.advance("SamLee", "1800000000000000010"));
        assert!(!state.advance("samlee", "999"));
        assert!(state.advance("samlee", "1800000000000000011"));
        state.save(&path).unwrap();

        let loaded = SeenState::load(&path).unwrap();
        assert_eq!(loaded.get("SAMLEE"), Some("1800000000000000011"));
    }

    #[test]
    fn test_is_newer() {
        assert!(is_newer("10", "9"));
        assert!(!is_newer("9", "10"));
        assert!(!is_newer("5", "5"));
    }
}
