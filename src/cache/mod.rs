// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Multi-namespace in-memory cache with TTL, transparent compression and
//! pressure-driven eviction.
//!
//! Namespaces (messages, notifications, user presence, social feed) are
//! logically independent key spaces sharing one byte budget. Contents are
//! best-effort: the cache lives in memory only, loss on restart is
//! acceptable. Durable state belongs to the local store.
//!
//! Eviction is tiered by memory pressure. Cleanup never surfaces as an error
//! to callers; a cache under pressure just gets smaller.

pub mod batch;
pub mod entry;
pub mod eviction;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::pressure::PressureLevel;

use batch::{Batch, BatchPlanner, SizedItem};
use entry::{CacheEntry, Namespace};
use eviction::{Candidate, CleanupTier, EvictionPolicy};

/// Per-put options.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Override the configured default TTL
    pub ttl: Option<Duration>,
}

/// Result of one cleanup pass.
#[derive(Debug, Clone, Copy)]
pub struct CleanupOutcome {
    pub freed_bytes: usize,
    pub items_removed: usize,
    pub tier: CleanupTier,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub used_bytes: usize,
    pub entries: usize,
}

impl CacheStats {
    /// Hit rate in [0, 1]; 1.0 when the cache has never been read.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            1.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Shared-budget namespaced cache.
pub struct TieredCache {
    entries: DashMap<(Namespace, String), CacheEntry>,
    used: AtomicUsize,
    budget: usize,
    default_ttl: Duration,
    compression_threshold: usize,
    pressure_threshold: f64,
    policy: EvictionPolicy,
    planner: BatchPlanner,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TieredCache {
    #[must_use]
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            entries: DashMap::new(),
            used: AtomicUsize::new(0),
            budget: config.cache_max_bytes.max(1),
            default_ttl: Duration::from_secs(config.cache_ttl_secs),
            compression_threshold: config.compression_threshold_bytes,
            pressure_threshold: config.cleanup_pressure_threshold,
            policy: EvictionPolicy::default(),
            planner: BatchPlanner::from_config(config),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a value. Expired entries are misses and are removed on sight.
    pub fn get(&self, namespace: Namespace, key: &str) -> Option<Value> {
        let map_key = (namespace, key.to_string());

        let data = match self.entries.get_mut(&map_key) {
            Some(mut entry) => {
                if entry.is_expired(Instant::now()) {
                    drop(entry);
                    self.remove_entry(&map_key);
                    return self.record_miss(namespace);
                }
                entry.record_access();
                entry.data().to_vec()
            }
            None => return self.record_miss(namespace),
        };

        let plain = match crate::compression::decompress_bytes(&data) {
            Ok(plain) => plain,
            Err(e) => {
                // Corrupt entry: drop it and treat as a miss
                warn!(namespace = %namespace, key = %key, error = %e, "Dropping unreadable cache entry");
                self.remove_entry(&map_key);
                return self.record_miss(namespace);
            }
        };
        match serde_json::from_slice(&plain) {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_op(namespace.as_str(), "get", "hit");
                Some(value)
            }
            Err(e) => {
                warn!(namespace = %namespace, key = %key, error = %e, "Dropping undecodable cache entry");
                self.remove_entry(&map_key);
                self.record_miss(namespace)
            }
        }
    }

    /// Store a value. Large payloads are compressed transparently; crossing
    /// the pressure threshold triggers a cleanup pass.
    pub fn put(&self, namespace: Namespace, key: &str, value: &Value, options: PutOptions) {
        let plain = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(namespace = %namespace, key = %key, error = %e, "Value not cacheable");
                return;
            }
        };

        let (data, compressed) = if plain.len() >= self.compression_threshold {
            match crate::compression::compress_bytes(&plain) {
                Ok(packed) if packed.len() < plain.len() => (packed, true),
                Ok(_) => (plain, false), // incompressible, keep plain
                Err(e) => {
                    warn!(key = %key, error = %e, "Compression failed, storing plain");
                    (plain, false)
                }
            }
        } else {
            (plain, false)
        };

        let ttl = options.ttl.unwrap_or(self.default_ttl);
        let entry = CacheEntry::new(key.len(), data, compressed, ttl);
        let added = entry.size_bytes;

        if let Some(previous) = self.entries.insert((namespace, key.to_string()), entry) {
            self.used.fetch_sub(previous.size_bytes, Ordering::AcqRel);
        }
        self.used.fetch_add(added, Ordering::AcqRel);
        crate::metrics::record_cache_op(namespace.as_str(), "put", "stored");
        self.publish_gauges();

        if self.pressure() >= self.pressure_threshold {
            self.perform_intelligent_cleanup();
        }
    }

    /// Remove one entry. Returns whether it existed.
    pub fn invalidate(&self, namespace: Namespace, key: &str) -> bool {
        let removed = self.remove_entry(&(namespace, key.to_string()));
        if removed {
            crate::metrics::record_cache_op(namespace.as_str(), "invalidate", "removed");
            self.publish_gauges();
        }
        removed
    }

    /// Drop every entry in one namespace. Returns how many were removed.
    pub fn invalidate_namespace(&self, namespace: Namespace) -> usize {
        let mut removed = 0usize;
        let mut freed = 0usize;
        self.entries.retain(|(ns, _), entry| {
            if *ns == namespace {
                removed += 1;
                freed += entry.size_bytes;
                false
            } else {
                true
            }
        });
        self.used.fetch_sub(freed, Ordering::AcqRel);
        if removed > 0 {
            info!(namespace = %namespace, removed, "Namespace invalidated");
            self.publish_gauges();
        }
        removed
    }

    /// Pressure-selected cleanup. Returns `None` when pressure is normal and
    /// no action was taken.
    pub fn perform_intelligent_cleanup(&self) -> Option<CleanupOutcome> {
        let tier = PressureLevel::from_pressure(self.pressure()).cleanup_tier()?;
        Some(self.cleanup(tier))
    }

    /// Run one cleanup at an explicit tier.
    ///
    /// Expired entries go first for free. Then victims are evicted by
    /// age-weighted LRU score; while usage exceeds the budget the tier's
    /// min-idle guard is waived and passes repeat until usage fits. Usage
    /// never increases.
    pub fn cleanup(&self, tier: CleanupTier) -> CleanupOutcome {
        let mut freed = self.purge_expired();
        let mut removed_total = 0usize;

        loop {
            let over_budget = self.used_bytes() > self.budget;
            let candidates = self.snapshot_candidates();
            let victims = self.policy.select_victims(&candidates, tier, over_budget);
            if victims.is_empty() {
                break;
            }

            let mut removed = 0usize;
            for (namespace, key) in victims {
                if let Some((_, entry)) = self.entries.remove(&(namespace, key)) {
                    freed += entry.size_bytes;
                    self.used.fetch_sub(entry.size_bytes, Ordering::AcqRel);
                    removed += 1;
                }
            }
            removed_total += removed;

            // One pass is enough unless we are still over budget
            if removed == 0 || self.used_bytes() <= self.budget {
                break;
            }
        }

        crate::metrics::record_eviction(removed_total, freed);
        self.publish_gauges();
        info!(tier = %tier, removed = removed_total, freed_bytes = freed, "Cache cleanup completed");
        CleanupOutcome {
            freed_bytes: freed,
            items_removed: removed_total,
            tier,
        }
    }

    /// Split items into fixed-cap batches for bulk transmission.
    pub fn batch<T: SizedItem>(&self, items: Vec<T>, conversation_id: &str) -> Vec<Batch<T>> {
        self.planner.plan(items, conversation_id)
    }

    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Used/budget ratio. Can exceed 1.0 between a burst of puts and the
    /// cleanup they trigger.
    #[must_use]
    pub fn pressure(&self) -> f64 {
        self.used_bytes() as f64 / self.budget as f64
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entry_count(&self, namespace: Namespace) -> usize {
        self.entries.iter().filter(|r| r.key().0 == namespace).count()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            used_bytes: self.used_bytes(),
            entries: self.len(),
        }
    }

    fn record_miss(&self, namespace: Namespace) -> Option<Value> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_op(namespace.as_str(), "get", "miss");
        None
    }

    fn remove_entry(&self, map_key: &(Namespace, String)) -> bool {
        match self.entries.remove(map_key) {
            Some((_, entry)) => {
                self.used.fetch_sub(entry.size_bytes, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut freed = 0usize;
        self.entries.retain(|_, entry| {
            if entry.is_expired(now) {
                freed += entry.size_bytes;
                false
            } else {
                true
            }
        });
        self.used.fetch_sub(freed, Ordering::AcqRel);
        if freed > 0 {
            debug!(freed_bytes = freed, "Expired entries purged");
        }
        freed
    }

    fn snapshot_candidates(&self) -> Vec<Candidate> {
        self.entries
            .iter()
            .map(|r| Candidate {
                namespace: r.key().0,
                key: r.key().1.clone(),
                idle_ms: r.value().idle_ms(),
                access_count: r.value().access_count,
                size_bytes: r.value().size_bytes,
            })
            .collect()
    }

    fn publish_gauges(&self) {
        crate::metrics::set_cache_bytes(self.used_bytes());
        crate::metrics::set_memory_pressure(self.pressure());
    }
}
