//! In-process artifact cache
//!
//! LRU-bounded, TTL-aged mapping from request fingerprint to validated
//! artifact. Expired entries are evicted on lookup and by a periodic
//! sweep. An optional shared tier is consulted on miss and written
//! through on put, both best-effort.

use crate::fingerprint::Fingerprint;
use crate::shared::SharedCache;
use dream_common::config::CacheConfig;
use dream_common::types::{ArtifactSource, DreamArtifact, RequestQuality};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct CacheEntry {
    artifact: DreamArtifact,
    size_bytes: usize,
    created_at: Instant,
    ttl: Duration,
    source: ArtifactSource,
    quality_score: Option<f64>,
    hits: u64,
    last_access: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

/// A cache hit handed back to the caller
#[derive(Debug, Clone)]
pub struct CachedDream {
    pub artifact: DreamArtifact,
    pub source: ArtifactSource,
    pub hits: u64,
    pub age: Duration,
}

/// Invalidation strategies callable from the operational surface
#[derive(Debug, Clone, PartialEq)]
pub enum InvalidationStrategy {
    /// Purge every entry with fallback provenance
    FailedAi,
    /// Purge entries older than the given age
    ByAge(Duration),
    /// Purge entries with exactly this source
    BySource(ArtifactSource),
    All,
}

#[derive(Debug, Default)]
struct CacheCounters {
    requests: u64,
    hits: u64,
    misses: u64,
    shared_hits: u64,
    evictions: u64,
    expired: u64,
    invalidated: u64,
    get_latency_total_us: u64,
    get_count: u64,
}

/// Aggregate cache statistics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expired: u64,
    pub shared_hits: u64,
    pub average_get_latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_quality_score: Option<f64>,
    pub source_distribution: HashMap<String, u64>,
    pub memory_estimate_bytes: u64,
}

/// Result of an optimize pass
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeReport {
    pub expired_removed: usize,
    pub remaining: usize,
    pub memory_estimate_bytes: u64,
}

/// Read-path performance view of the cache
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CachePerformance {
    pub hit_rate: f64,
    pub average_get_latency_ms: f64,
    pub shared_hits: u64,
    pub evictions: u64,
    pub expired: u64,
}

/// The in-process cache tier
pub struct DreamCache {
    config: CacheConfig,
    entries: RwLock<LruCache<Fingerprint, CacheEntry>>,
    counters: RwLock<CacheCounters>,
    shared: Option<Arc<dyn SharedCache>>,
}

impl DreamCache {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_size.max(1))
            .unwrap_or_else(|| NonZeroUsize::new(1000).expect("nonzero"));
        info!("initializing dream cache, capacity {}", capacity);
        Self {
            config,
            entries: RwLock::new(LruCache::new(capacity)),
            counters: RwLock::new(CacheCounters::default()),
            shared: None,
        }
    }

    /// Attach a shared second tier
    pub fn with_shared(mut self, shared: Arc<dyn SharedCache>) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Look up a fingerprint. Expired entries are evicted on the way.
    /// On a local miss the shared tier is consulted and, on a hit,
    /// backfilled into the local tier.
    pub async fn get(&self, fingerprint: &Fingerprint, quality: RequestQuality) -> Option<CachedDream> {
        let started = Instant::now();

        let local = {
            let mut entries = self.entries.write().await;
            match entries.get_mut(fingerprint) {
                Some(entry) if entry.is_expired() => {
                    entries.pop(fingerprint);
                    let mut counters = self.counters.write().await;
                    counters.expired += 1;
                    None
                }
                Some(entry) => {
                    entry.hits += 1;
                    entry.last_access = Instant::now();
                    Some(CachedDream {
                        artifact: entry.artifact.clone(),
                        source: entry.source,
                        hits: entry.hits,
                        age: entry.created_at.elapsed(),
                    })
                }
                None => None,
            }
        };

        if let Some(hit) = local {
            self.record_get(started, true, false).await;
            debug!(%fingerprint, "cache hit");
            return Some(hit);
        }

        if let Some(shared) = &self.shared {
            if let Some(artifact) = shared.get(fingerprint).await {
                let source = artifact.metadata.source;
                self.insert_local(fingerprint.clone(), artifact.clone(), quality, source, None)
                    .await;
                self.record_get(started, true, true).await;
                debug!(%fingerprint, "shared cache hit");
                return Some(CachedDream {
                    artifact,
                    source,
                    hits: 1,
                    age: Duration::ZERO,
                });
            }
        }

        self.record_get(started, false, false).await;
        None
    }

    /// Store an artifact under its fingerprint. TTL follows the quality
    /// tier. The shared tier is written through without blocking the
    /// caller on its outcome.
    pub async fn put(
        &self,
        fingerprint: Fingerprint,
        artifact: DreamArtifact,
        quality: RequestQuality,
        quality_score: Option<f64>,
    ) {
        let source = artifact.metadata.source;
        self.insert_local(
            fingerprint.clone(),
            artifact.clone(),
            quality,
            source,
            quality_score,
        )
        .await;

        if let Some(shared) = self.shared.clone() {
            let ttl = self.config.ttl_for(quality);
            tokio::spawn(async move {
                if !shared.put(&fingerprint, &artifact, ttl).await {
                    warn!(%fingerprint, "shared cache write-through failed");
                }
            });
        }
    }

    async fn insert_local(
        &self,
        fingerprint: Fingerprint,
        artifact: DreamArtifact,
        quality: RequestQuality,
        source: ArtifactSource,
        quality_score: Option<f64>,
    ) {
        let size_bytes = serde_json::to_string(&artifact).map(|s| s.len()).unwrap_or(0);
        let entry = CacheEntry {
            artifact,
            size_bytes,
            created_at: Instant::now(),
            ttl: self.config.ttl_for(quality),
            source,
            quality_score,
            hits: 0,
            last_access: Instant::now(),
        };

        let mut entries = self.entries.write().await;
        let displaced = entries.push(fingerprint.clone(), entry);
        drop(entries);

        // push returns the displaced LRU entry when at capacity, or the
        // previous value for the same key; only the former is an eviction
        if displaced.is_some_and(|(old_key, _)| old_key != fingerprint) {
            let mut counters = self.counters.write().await;
            counters.evictions += 1;
        }
    }

    /// Purge entries matching the strategy; returns how many were removed
    pub async fn invalidate(&self, strategy: InvalidationStrategy) -> usize {
        let mut entries = self.entries.write().await;
        let victims: Vec<Fingerprint> = entries
            .iter()
            .filter(|(_, entry)| match &strategy {
                InvalidationStrategy::FailedAi => entry.source.is_fallback(),
                InvalidationStrategy::ByAge(age) => entry.created_at.elapsed() > *age,
                InvalidationStrategy::BySource(source) => entry.source == *source,
                InvalidationStrategy::All => true,
            })
            .map(|(fp, _)| fp.clone())
            .collect();

        for fp in &victims {
            entries.pop(fp);
        }
        drop(entries);

        let removed = victims.len();
        if removed > 0 {
            info!(removed, ?strategy, "cache invalidation");
            let mut counters = self.counters.write().await;
            counters.invalidated += removed as u64;
        }
        removed
    }

    /// Remove every expired entry; returns how many were evicted
    pub async fn evict_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let victims: Vec<Fingerprint> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(fp, _)| fp.clone())
            .collect();
        for fp in &victims {
            entries.pop(fp);
        }
        drop(entries);

        if !victims.is_empty() {
            let mut counters = self.counters.write().await;
            counters.expired += victims.len() as u64;
        }
        victims.len()
    }

    /// Sweep expired entries and report what remains
    pub async fn optimize(&self) -> OptimizeReport {
        let expired_removed = self.evict_expired().await;
        let entries = self.entries.read().await;
        let memory_estimate_bytes: u64 = entries.iter().map(|(_, e)| e.size_bytes as u64).sum();
        OptimizeReport {
            expired_removed,
            remaining: entries.len(),
            memory_estimate_bytes,
        }
    }

    /// Spawn the periodic expiry sweeper
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        let interval = Duration::from_millis(self.config.sweep_interval_ms.max(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let removed = cache.evict_expired().await;
                if removed > 0 {
                    debug!(removed, "cache sweep evicted expired entries");
                }
            }
        })
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        let counters = self.counters.read().await;

        let mut source_distribution: HashMap<String, u64> = HashMap::new();
        let mut memory_estimate_bytes = 0u64;
        let mut score_sum = 0.0f64;
        let mut score_count = 0u64;
        for (_, entry) in entries.iter() {
            *source_distribution
                .entry(entry.source.to_string())
                .or_insert(0) += 1;
            memory_estimate_bytes += entry.size_bytes as u64;
            if let Some(score) = entry.quality_score {
                score_sum += score;
                score_count += 1;
            }
        }
        let average_quality_score = (score_count > 0).then(|| score_sum / score_count as f64);

        let hit_rate = if counters.requests > 0 {
            counters.hits as f64 / counters.requests as f64
        } else {
            0.0
        };
        let average_get_latency_ms = if counters.get_count > 0 {
            counters.get_latency_total_us as f64 / counters.get_count as f64 / 1000.0
        } else {
            0.0
        };

        CacheStats {
            size: entries.len(),
            max_size: self.config.max_size,
            hit_rate,
            evictions: counters.evictions,
            expired: counters.expired,
            shared_hits: counters.shared_hits,
            average_get_latency_ms,
            average_quality_score,
            source_distribution,
            memory_estimate_bytes,
        }
    }

    /// Read-path performance counters
    pub async fn performance(&self) -> CachePerformance {
        let counters = self.counters.read().await;
        let hit_rate = if counters.requests > 0 {
            counters.hits as f64 / counters.requests as f64
        } else {
            0.0
        };
        let average_get_latency_ms = if counters.get_count > 0 {
            counters.get_latency_total_us as f64 / counters.get_count as f64 / 1000.0
        } else {
            0.0
        };
        CachePerformance {
            hit_rate,
            average_get_latency_ms,
            shared_hits: counters.shared_hits,
            evictions: counters.evictions,
            expired: counters.expired,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn record_get(&self, started: Instant, hit: bool, shared: bool) {
        let elapsed_us = started.elapsed().as_micros() as u64;
        let mut counters = self.counters.write().await;
        counters.requests += 1;
        counters.get_count += 1;
        counters.get_latency_total_us += elapsed_us;
        if hit {
            counters.hits += 1;
            if shared {
                counters.shared_hits += 1;
            }
        } else {
            counters.misses += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dream_common::types::*;

    fn artifact(id: &str, source: ArtifactSource) -> DreamArtifact {
        DreamArtifact {
            id: id.to_string(),
            title: "cached dream".to_string(),
            style: DreamStyle::Ethereal,
            seed: None,
            environment: Environment::default(),
            structures: vec![],
            entities: vec![],
            cinematography: Cinematography {
                duration_sec: 30.0,
                shots: vec![Shot {
                    shot_type: ShotType::Orbital,
                    target: None,
                    duration: 30.0,
                    start_pos: None,
                    end_pos: None,
                }],
            },
            render: None,
            assumptions: None,
            metadata: ArtifactMetadata::new(source),
            created: Utc::now(),
            modified: Utc::now(),
        }
    }

    fn fp(text: &str) -> Fingerprint {
        Fingerprint::compute(text, DreamStyle::Ethereal, &GenerateOptions::default())
    }

    fn config() -> CacheConfig {
        CacheConfig {
            max_size: 3,
            ..CacheConfig::default()
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let cache = DreamCache::new(config());
        let key = fp("one");
        cache
            .put(key.clone(), artifact("a", ArtifactSource::Ai), RequestQuality::Medium, None)
            .await;

        let hit = cache.get(&key, RequestQuality::Medium).await.expect("hit");
        assert_eq!(hit.artifact.id, "a");
        assert_eq!(hit.source, ArtifactSource::Ai);
        assert_eq!(hit.hits, 1);
    }

    #[tokio::test]
    async fn misses_are_counted() {
        let cache = DreamCache::new(config());
        assert!(cache.get(&fp("absent"), RequestQuality::Medium).await.is_none());
        let stats = cache.stats().await;
        assert_eq!(stats.hit_rate, 0.0);
    }

    #[tokio::test]
    async fn lru_eviction_keeps_size_bounded() {
        let cache = DreamCache::new(config());
        for i in 0..5 {
            cache
                .put(
                    fp(&format!("dream {i}")),
                    artifact(&i.to_string(), ArtifactSource::Ai),
                    RequestQuality::Medium,
                    None,
                )
                .await;
        }
        assert_eq!(cache.len().await, 3);
        let stats = cache.stats().await;
        assert!(stats.evictions >= 2);
        assert!(stats.size <= stats.max_size);
    }

    #[tokio::test]
    async fn expired_entries_are_evicted_on_lookup() {
        let mut cfg = config();
        cfg.ttl_draft_ms = 10;
        let cache = DreamCache::new(cfg);
        let key = fp("short lived");
        cache
            .put(key.clone(), artifact("a", ArtifactSource::Ai), RequestQuality::Draft, None)
            .await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get(&key, RequestQuality::Draft).await.is_none());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries() {
        let mut cfg = config();
        cfg.ttl_draft_ms = 10;
        let cache = DreamCache::new(cfg);
        cache
            .put(fp("a"), artifact("a", ArtifactSource::Ai), RequestQuality::Draft, None)
            .await;
        cache
            .put(fp("b"), artifact("b", ArtifactSource::Ai), RequestQuality::Medium, None)
            .await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let removed = cache.evict_expired().await;
        assert_eq!(removed, 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn invalidation_by_fallback_source() {
        let cache = DreamCache::new(config());
        cache
            .put(fp("ai"), artifact("a", ArtifactSource::Ai), RequestQuality::Medium, None)
            .await;
        cache
            .put(
                fp("fallback"),
                artifact("b", ArtifactSource::LocalFallback),
                RequestQuality::Medium,
                None,
            )
            .await;
        cache
            .put(
                fp("safe"),
                artifact("c", ArtifactSource::SafeFallback),
                RequestQuality::Medium,
                None,
            )
            .await;

        let removed = cache.invalidate(InvalidationStrategy::FailedAi).await;
        assert_eq!(removed, 2);
        assert!(cache.get(&fp("ai"), RequestQuality::Medium).await.is_some());
        assert!(cache.get(&fp("fallback"), RequestQuality::Medium).await.is_none());
    }

    #[tokio::test]
    async fn invalidate_all_clears_the_cache() {
        let cache = DreamCache::new(config());
        cache
            .put(fp("x"), artifact("x", ArtifactSource::Ai), RequestQuality::Medium, None)
            .await;
        let removed = cache.invalidate(InvalidationStrategy::All).await;
        assert_eq!(removed, 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn stats_track_sources_and_memory() {
        let cache = DreamCache::new(config());
        cache
            .put(fp("one"), artifact("a", ArtifactSource::Ai), RequestQuality::Medium, None)
            .await;
        cache
            .put(
                fp("two"),
                artifact("b", ArtifactSource::LocalFallback),
                RequestQuality::Medium,
                None,
            )
            .await;

        let _ = cache.get(&fp("one"), RequestQuality::Medium).await;
        let stats = cache.stats().await;
        assert_eq!(stats.size, 2);
        assert_eq!(stats.source_distribution.get("ai"), Some(&1));
        assert_eq!(stats.source_distribution.get("local_fallback"), Some(&1));
        assert!(stats.memory_estimate_bytes > 0);
        assert!(stats.hit_rate > 0.0);
    }

    #[tokio::test]
    async fn repeat_get_within_ttl_returns_identical_artifact() {
        let cache = DreamCache::new(config());
        let key = fp("stable");
        cache
            .put(key.clone(), artifact("stable", ArtifactSource::Ai), RequestQuality::High, None)
            .await;

        let first = cache.get(&key, RequestQuality::High).await.unwrap();
        let second = cache.get(&key, RequestQuality::High).await.unwrap();
        assert_eq!(first.artifact, second.artifact);
        assert_eq!(second.hits, 2);
    }
}
