//! Short-TTL cache for acquired records.
//!
//! Absorbs bursts of requests for the same target and provides a
//! degraded-mode answer when live acquisition fails. It is never the
//! system of record: entries only live in memory.
//!
//! ## LRU eviction
//!
//! When an insert would exceed `capacity`, entries past their stale grace
//! period are dropped first; otherwise the least-recently-accessed entry is
//! evicted. Expired entries still inside the grace period are evicted only
//! in LRU order.
//!
//! ## Stale reads
//!
//! An expired entry is kept for a grace period so that [`AcquisitionCache::get_stale`]
//! can still serve it when every live method has failed.
//!
//! Per-source statistics live exactly as long as the source's entry.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::config::ScraperConfig;
use crate::types::{MethodKind, ScrapedRecord};

/// Validation scores kept per source for reliability estimates.
const SCORE_HISTORY: usize = 20;

/// How an entry was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub method: MethodKind,
    pub latency_ms: u64,
    /// Average validation confidence of the cached records.
    pub validation_score: f64,
    /// Number of posts the producing fetch asked for.
    #[serde(default)]
    pub requested_count: usize,
}

/// A cache read.
#[derive(Debug, Clone)]
pub struct CachedRecords {
    pub records: Vec<ScrapedRecord>,
    pub metadata: CacheMetadata,
    pub inserted_at: DateTime<Utc>,
    /// True when served past its TTL by [`AcquisitionCache::get_stale`].
    pub stale: bool,
}

/// Per-source statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceAnalytics {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    /// Mean of recent validation scores stored for this source.
    pub reliability: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheAnalytics {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub sources: BTreeMap<String, SourceAnalytics>,
}

struct CacheEntry {
    records: Vec<ScrapedRecord>,
    metadata: CacheMetadata,
    inserted_at: DateTime<Utc>,
    cached_at: Instant,
    ttl: Duration,
    last_accessed: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() >= self.ttl
    }

    fn is_past_grace(&self, grace: Duration) -> bool {
        self.cached_at.elapsed() >= self.ttl.saturating_add(grace)
    }

    fn touch(&mut self) {
        self.last_accessed = Instant::now();
    }

    fn read(&self, stale: bool) -> CachedRecords {
        CachedRecords {
            records: self.records.clone(),
            metadata: self.metadata.clone(),
            inserted_at: self.inserted_at,
            stale,
        }
    }
}

#[derive(Default)]
struct SourceStats {
    hits: u64,
    misses: u64,
    scores: VecDeque<f64>,
}

impl SourceStats {
    fn reliability(&self) -> f64 {
        if self.scores.is_empty() {
            0.0
        } else {
            self.scores.iter().sum::<f64>() / self.scores.len() as f64
        }
    }
}

#[derive(Default)]
struct CacheInner {
    index: HashMap<String, CacheEntry>,
    sources: HashMap<String, SourceStats>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheInner {
    fn remove(&mut self, key: &str) -> bool {
        self.sources.remove(key);
        self.index.remove(key).is_some()
    }

    /// Drop every entry past its grace period; returns how many went.
    fn remove_past_grace(&mut self, grace: Duration) -> usize {
        let dead: Vec<String> = self
            .index
            .iter()
            .filter(|(_, entry)| entry.is_past_grace(grace))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &dead {
            self.remove(key);
        }
        dead.len()
    }

    fn evict_lru(&mut self, grace: Duration) {
        let dead = self.remove_past_grace(grace);
        if dead > 0 {
            self.evictions += dead as u64;
            return;
        }

        if let Some(lru_key) = self
            .index
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(key, _)| key.clone())
        {
            tracing::debug!("evicting LRU cache entry: {lru_key}");
            self.remove(&lru_key);
            self.evictions += 1;
        }
    }
}

/// In-memory record cache with TTL, LRU eviction and per-target flight locks.
pub struct AcquisitionCache {
    inner: Mutex<CacheInner>,
    flights: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    default_ttl: Duration,
    stale_grace: Duration,
    capacity: usize,
}

impl AcquisitionCache {
    pub fn new(default_ttl: Duration, stale_grace: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            flights: DashMap::new(),
            default_ttl,
            stale_grace,
            capacity: capacity.max(1),
        }
    }

    pub fn from_config(config: &ScraperConfig) -> Self {
        Self::new(
            config.cache_ttl(),
            config.cache_stale_grace(),
            config.cache_capacity,
        )
    }

    pub fn set(&self, key: &str, records: Vec<ScrapedRecord>, metadata: CacheMetadata) {
        self.set_with_ttl(key, records, metadata, self.default_ttl);
    }

    /// Insert with an explicit TTL, evicting if the cache is full.
    pub fn set_with_ttl(
        &self,
        key: &str,
        records: Vec<ScrapedRecord>,
        metadata: CacheMetadata,
        ttl: Duration,
    ) {
        let key = key.to_ascii_lowercase();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.index.len() >= self.capacity && !inner.index.contains_key(&key) {
            inner.evict_lru(self.stale_grace);
        }

        let stats = inner.sources.entry(key.clone()).or_default();
        if stats.scores.len() == SCORE_HISTORY {
            stats.scores.pop_front();
        }
        stats.scores.push_back(metadata.validation_score);

        let now = Instant::now();
        inner.index.insert(
            key,
            CacheEntry {
                records,
                metadata,
                inserted_at: Utc::now(),
                cached_at: now,
                ttl,
                last_accessed: now,
            },
        );
    }

    /// Unexpired entry for `key`, counting a hit or miss.
    ///
    /// Keys with no entry only count towards the global miss total.
    pub fn get(&self, key: &str) -> Option<CachedRecords> {
        let key = key.to_ascii_lowercase();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let found = match inner.index.get_mut(&key) {
            Some(entry) if !entry.is_expired() => {
                entry.touch();
                Some(entry.read(false))
            }
            _ => None,
        };

        if found.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        if let Some(stats) = inner.sources.get_mut(&key) {
            if found.is_some() {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
        }
        found
    }

    /// Entry for `key` even if expired, as long as it is within the stale
    /// grace period. Does not affect hit/miss counters.
    pub fn get_stale(&self, key: &str) -> Option<CachedRecords> {
        let key = key.to_ascii_lowercase();
        let inner = self.inner.lock();
        let entry = inner.index.get(&key)?;
        if entry.is_past_grace(self.stale_grace) {
            return None;
        }
        Some(entry.read(entry.is_expired()))
    }

    pub fn invalidate(&self, key: &str) {
        self.inner.lock().remove(&key.to_ascii_lowercase());
    }

    /// Drop entries past their stale grace period and idle flight locks.
    pub fn cleanup_expired(&self) -> usize {
        let removed = self.inner.lock().remove_past_grace(self.stale_grace);
        self.flights.retain(|_, lock| Arc::strong_count(lock) > 1);
        if removed > 0 {
            tracing::debug!(removed, "cleaned up expired cache entries");
        }
        removed
    }

    /// Number of entries, including expired ones still in their grace period.
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get_analytics(&self) -> CacheAnalytics {
        let inner = self.inner.lock();
        let rate = |hits: u64, misses: u64| {
            let total = hits + misses;
            if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            }
        };
        let sources = inner
            .sources
            .iter()
            .map(|(key, stats)| {
                (
                    key.clone(),
                    SourceAnalytics {
                        hits: stats.hits,
                        misses: stats.misses,
                        hit_rate: rate(stats.hits, stats.misses),
                        reliability: stats.reliability(),
                        samples: stats.scores.len(),
                    },
                )
            })
            .collect();
        CacheAnalytics {
            entries: inner.index.len(),
            capacity: self.capacity,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: rate(inner.hits, inner.misses),
            evictions: inner.evictions,
            sources,
        }
    }

    /// Whether stored validation scores for `key` are high enough to serve
    /// a cache hit without re-fetching.
    pub fn is_trustworthy(&self, key: &str, min_reliability: f64) -> bool {
        let inner = self.inner.lock();
        inner
            .sources
            .get(&key.to_ascii_lowercase())
            .map(|s| !s.scores.is_empty() && s.reliability() >= min_reliability)
            .unwrap_or(false)
    }

    /// Serialize live acquisitions of the same target.
    ///
    /// The second caller for a key waits here until the first releases the
    /// guard, and then usually finds the fresh entry with [`Self::get`].
    pub async fn lock_target(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .flights
            .entry(key.to_ascii_lowercase())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}
