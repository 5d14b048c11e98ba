//! Configuration for the sync engine.
//!
//! # Example
//!
//! ```
//! use community_sync::SyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = SyncConfig::default();
//! assert_eq!(config.max_attempts, 3);
//!
//! // Full config
//! let config = SyncConfig {
//!     cache_max_bytes: 8 * 1024 * 1024, // 8 MB
//!     drain_workers: 2,
//!     backoff_base_ms: 250,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;

/// Configuration for the sync engine.
///
/// All fields have sensible defaults tuned for a mobile client.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Maximum delivery attempts before an item becomes terminally `Failed`
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff base delay in milliseconds (delay = base * 2^attempts)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff delay cap in milliseconds
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Per-delivery network timeout in milliseconds
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,

    /// Worker pool size for the drain loop (concurrent conversations)
    #[serde(default = "default_drain_workers")]
    pub drain_workers: usize,

    /// Cache byte budget shared across all namespaces (default: 16 MB)
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: usize,

    /// Default cache entry TTL in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Payloads above this serialized size are compressed (bytes)
    #[serde(default = "default_compression_threshold_bytes")]
    pub compression_threshold_bytes: usize,

    /// Memory pressure ratio that triggers proactive cleanup
    #[serde(default = "default_cleanup_pressure_threshold")]
    pub cleanup_pressure_threshold: f64,

    /// Maximum items per outbound batch
    #[serde(default = "default_batch_max_items")]
    pub batch_max_items: usize,

    /// Prefetch cycle interval in milliseconds
    #[serde(default = "default_prefetch_interval_ms")]
    pub prefetch_interval_ms: u64,

    /// Ring buffer capacity for observed access events per user
    #[serde(default = "default_behavior_ring_capacity")]
    pub behavior_ring_capacity: usize,

    /// Queue depth above which diagnostics report `Warning`
    #[serde(default = "default_queue_depth_warning")]
    pub queue_depth_warning: usize,
}

fn default_max_attempts() -> u32 { 3 }
fn default_backoff_base_ms() -> u64 { 500 }
fn default_backoff_cap_ms() -> u64 { 30_000 }
fn default_delivery_timeout_ms() -> u64 { 5_000 }
fn default_drain_workers() -> usize { 4 }
fn default_cache_max_bytes() -> usize { 16 * 1024 * 1024 } // 16 MB
fn default_cache_ttl_secs() -> u64 { 300 }
fn default_compression_threshold_bytes() -> usize { 1024 }
fn default_cleanup_pressure_threshold() -> f64 { 0.8 }
fn default_batch_max_items() -> usize { 50 }
fn default_prefetch_interval_ms() -> u64 { 15_000 }
fn default_behavior_ring_capacity() -> usize { 64 }
fn default_queue_depth_warning() -> usize { 50 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            drain_workers: default_drain_workers(),
            cache_max_bytes: default_cache_max_bytes(),
            cache_ttl_secs: default_cache_ttl_secs(),
            compression_threshold_bytes: default_compression_threshold_bytes(),
            cleanup_pressure_threshold: default_cleanup_pressure_threshold(),
            batch_max_items: default_batch_max_items(),
            prefetch_interval_ms: default_prefetch_interval_ms(),
            behavior_ring_capacity: default_behavior_ring_capacity(),
            queue_depth_warning: default_queue_depth_warning(),
        }
    }
}
