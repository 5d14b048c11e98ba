// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for community-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding application chooses the exporter.
//!
//! # Metric Naming Convention
//! - `community_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size histograms
//!
//! # Labels
//! - `namespace`: messages, notifications, user_presence, social_feed
//! - `status`: hit, miss, delivered, failed, rejected

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a cache operation outcome
pub fn record_cache_op(namespace: &str, operation: &str, status: &str) {
    counter!(
        "community_sync_cache_operations_total",
        "namespace" => namespace.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a delivery attempt outcome
pub fn record_delivery(kind: &str, status: &str) {
    counter!(
        "community_sync_deliveries_total",
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record delivery latency
pub fn record_delivery_latency(duration: Duration) {
    histogram!("community_sync_delivery_seconds").record(duration.as_secs_f64());
}

/// Record eviction event
pub fn record_eviction(count: usize, bytes: usize) {
    counter!("community_sync_evictions_total").increment(count as u64);
    counter!("community_sync_evicted_bytes_total").increment(bytes as u64);
}

/// Record consistency issues found / repaired during a check
pub fn record_consistency_issues(kind: &str, found: usize, repaired: usize) {
    counter!(
        "community_sync_consistency_issues_total",
        "kind" => kind.to_string(),
        "outcome" => "found"
    )
    .increment(found as u64);
    counter!(
        "community_sync_consistency_issues_total",
        "kind" => kind.to_string(),
        "outcome" => "repaired"
    )
    .increment(repaired as u64);
}

/// Set current queue depth (pending + in-flight items)
pub fn set_queue_depth(depth: usize) {
    gauge!("community_sync_queue_depth").set(depth as f64);
}

/// Set current cache size in bytes
pub fn set_cache_bytes(bytes: usize) {
    gauge!("community_sync_cache_bytes").set(bytes as f64);
}

/// Set memory pressure ratio (0.0 - 1.0+)
pub fn set_memory_pressure(pressure: f64) {
    gauge!("community_sync_memory_pressure").set(pressure);
}

/// Set network state (1 = online, 0 = offline)
pub fn set_network_online(online: bool) {
    gauge!("community_sync_network_online").set(if online { 1.0 } else { 0.0 });
}
