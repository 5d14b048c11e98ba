// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Age-weighted LRU eviction policy.
//!
//! Candidates are scored by `idle_ms * age_weight - access_count *
//! frequency_weight`; the highest-scoring entries (old and rarely touched)
//! are evicted first. How many go, and how idle they must be to qualify, is
//! set by the [`CleanupTier`], which is selected from the current pressure
//! level rather than by the caller.

use std::time::Duration;

use super::entry::Namespace;

/// Cleanup aggressiveness. Each tier removes a fraction of entries and only
/// touches entries idle for at least its minimum window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupTier {
    /// Bottom 10%, idle for 2+ minutes
    Gentle,
    /// Bottom 30%, idle for 1+ minute
    Moderate,
    /// Bottom 60%, idle for 30+ seconds
    Aggressive,
}

impl CleanupTier {
    /// Fraction of total entries to remove.
    #[must_use]
    pub fn fraction(&self) -> f64 {
        match self {
            Self::Gentle => 0.10,
            Self::Moderate => 0.30,
            Self::Aggressive => 0.60,
        }
    }

    /// Entries idle for less than this are spared. Waived while the cache is
    /// over its byte budget, usage must come back under budget first.
    #[must_use]
    pub fn min_idle(&self) -> Duration {
        match self {
            Self::Gentle => Duration::from_secs(120),
            Self::Moderate => Duration::from_secs(60),
            Self::Aggressive => Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gentle => "gentle",
            Self::Moderate => "moderate",
            Self::Aggressive => "aggressive",
        }
    }
}

impl std::fmt::Display for CleanupTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of one entry's eviction-relevant metadata.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub namespace: Namespace,
    pub key: String,
    pub idle_ms: f64,
    pub access_count: u64,
    pub size_bytes: usize,
}

/// Age-weighted LRU scoring.
pub struct EvictionPolicy {
    pub age_weight: f64,
    /// How many milliseconds of idleness one access "buys back"
    pub frequency_weight: f64,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            age_weight: 1.0,
            frequency_weight: 1000.0,
        }
    }
}

impl EvictionPolicy {
    /// Eviction score: higher means evict sooner.
    #[must_use]
    pub fn score(&self, candidate: &Candidate) -> f64 {
        candidate.idle_ms * self.age_weight
            - candidate.access_count as f64 * self.frequency_weight
    }

    /// Pick victims for one cleanup pass.
    ///
    /// The tier's fraction applies to the full entry count; only candidates
    /// past the tier's idle window qualify unless `waive_min_idle` is set
    /// (over-budget recovery). Returns `(namespace, key)` pairs, worst first.
    #[must_use]
    pub fn select_victims(
        &self,
        candidates: &[Candidate],
        tier: CleanupTier,
        waive_min_idle: bool,
    ) -> Vec<(Namespace, String)> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let min_idle_ms = tier.min_idle().as_millis() as f64;
        let mut scored: Vec<(f64, &Candidate)> = candidates
            .iter()
            .filter(|c| waive_min_idle || c.idle_ms >= min_idle_ms)
            .map(|c| (self.score(c), c))
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let count = ((candidates.len() as f64 * tier.fraction()).ceil() as usize).max(1);
        scored
            .into_iter()
            .take(count)
            .map(|(_, c)| (c.namespace, c.key.clone()))
            .collect()
    }
}
