// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde::Serialize;

/// Overall sync health. Surfaced to the UI as a status indicator instead of
/// modal errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time health snapshot. Recomputed on demand, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SyncDiagnostics {
    pub overall: HealthLevel,
    pub online: bool,
    pub queue_depth: usize,
    pub failed_items: usize,
    pub cache_hit_rate: f64,
    pub cache_used_bytes: usize,
    pub cache_pressure: f64,
    /// Epoch millis of the last clean drain; `None` if never
    pub last_successful_sync: Option<i64>,
    /// 0-100; 100 means no failed items and no unresolved inconsistencies
    pub data_integrity_score: u8,
}

/// Inputs to a diagnostics assessment.
#[derive(Debug, Clone, Copy)]
pub struct HealthInputs {
    pub online: bool,
    pub queue_depth: usize,
    pub queue_depth_warning: usize,
    pub failed_items: usize,
    pub cache_hit_rate: f64,
    pub cache_used_bytes: usize,
    pub cache_pressure: f64,
    pub last_successful_sync: i64,
    /// Issues found but not repaired by the most recent check
    pub unresolved_issues: usize,
    /// Whether the most recent check was degraded
    pub partial_check: bool,
}

impl SyncDiagnostics {
    /// Assess health from component state.
    ///
    /// Each failed item costs 15 integrity points, each unresolved
    /// inconsistency 5, a degraded check 10. `Critical` means data is at
    /// risk; `Warning` means sync is behind but recoverable.
    #[must_use]
    pub fn assess(inputs: HealthInputs) -> Self {
        let penalty = inputs.failed_items.saturating_mul(15)
            + inputs.unresolved_issues.saturating_mul(5)
            + if inputs.partial_check { 10 } else { 0 };
        let score = 100usize.saturating_sub(penalty) as u8;

        let overall = if score < 50 {
            HealthLevel::Critical
        } else if inputs.failed_items > 0
            || inputs.queue_depth > inputs.queue_depth_warning
            || !inputs.online
            || inputs.partial_check
            || score < 100
        {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        };

        Self {
            overall,
            online: inputs.online,
            queue_depth: inputs.queue_depth,
            failed_items: inputs.failed_items,
            cache_hit_rate: inputs.cache_hit_rate,
            cache_used_bytes: inputs.cache_used_bytes,
            cache_pressure: inputs.cache_pressure,
            last_successful_sync: (inputs.last_successful_sync > 0)
                .then_some(inputs.last_successful_sync),
            data_integrity_score: score,
        }
    }
}
