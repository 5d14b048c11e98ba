//! # Community Sync
//!
//! An offline-first sync, caching and consistency-repair engine for a
//! community messaging client.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SyncCoordinator                        │
//! │  • Only component exposed to the UI layer                  │
//! │  • send_message / diagnostics / network transitions        │
//! │  • Subscription consumers invalidate the cache             │
//! └─────────────────────────────────────────────────────────────┘
//!            │                  │                    │
//!            ▼                  ▼                    ▼
//! ┌──────────────────┐ ┌────────────────┐ ┌───────────────────────┐
//! │    SyncQueue     │ │  TieredCache   │ │  ConsistencyChecker   │
//! │  durable FIFO    │ │  namespaced,   │ │  cross-store scan,    │
//! │  per-convo order │ │  TTL + zstd +  │ │  orphan / divergence  │
//! │  retry/backoff   │ │  pressure      │ │  detection & repair   │
//! │  network gating  │ │  eviction      │ │  (repairs re-queue,   │
//! │                  │ │                │ │  never delete)        │
//! └──────────────────┘ └────────────────┘ └───────────────────────┘
//!            │                  ▲
//!            ▼                  │ (best-effort warming)
//! ┌──────────────────┐ ┌────────────────┐
//! │  Local / Remote  │ │ PrefetchPlanner│
//! │  store traits    │ │  behavior ring │
//! └──────────────────┘ └────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use community_sync::{SyncConfig, SyncCoordinator, TransportType};
//! use community_sync::store::memory::{MemoryLocalStore, MemoryRemoteStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let local = Arc::new(MemoryLocalStore::new());
//!     let remote = Arc::new(MemoryRemoteStore::new());
//!     let coordinator = SyncCoordinator::new(local, remote, &SyncConfig::default());
//!
//!     coordinator.start_user_sync("user-1");
//!
//!     // Writes are accepted unconditionally, online or not
//!     let id = coordinator
//!         .send_message("conv-1", "hello", "user-1")
//!         .await
//!         .expect("precondition failure");
//!     println!("queued as {id}");
//!
//!     // Connectivity transitions drain the queue and reconcile drift
//!     coordinator.handle_network_change(true, TransportType::Wifi).await;
//!
//!     let health = coordinator.get_diagnostics();
//!     println!("sync health: {}", health.overall);
//! }
//! ```
//!
//! ## Guarantees
//!
//! - **Durability**: queued items live in the local store; a restart never
//!   loses an unsent message
//! - **Ordering**: per-conversation FIFO delivery; cross-conversation
//!   delivery is parallel
//! - **At-least-once**: interrupted deliveries are retried; the remote side
//!   deduplicates on the client-generated id
//! - **Compression transparency**: `decompress(compress(x)) == x`, callers
//!   never see the stored representation
//! - **Repair over deletion**: consistency repairs re-queue local orphans;
//!   unsynced user data is never dropped
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`SyncCoordinator`] orchestrating all components
//! - [`queue`]: durable outbound [`SyncQueue`] with retry/backoff
//! - [`cache`]: namespaced [`TieredCache`] with TTL and tiered eviction
//! - [`consistency`]: cross-store [`ConsistencyChecker`]
//! - [`prefetch`]: behavior-driven [`PrefetchPlanner`]
//! - [`store`]: local/remote store traits plus memory and SQLite backends

pub mod cache;
pub mod compression;
pub mod config;
pub mod consistency;
pub mod coordinator;
pub mod metrics;
pub mod prefetch;
pub mod pressure;
pub mod queue;
pub mod queue_item;
pub mod store;

pub use cache::batch::{Batch, BatchPlanner, SizedItem};
pub use cache::entry::{CacheEntry, Namespace};
pub use cache::eviction::{CleanupTier, EvictionPolicy};
pub use cache::{CacheStats, CleanupOutcome, PutOptions, TieredCache};
pub use compression::CompressionError;
pub use config::SyncConfig;
pub use consistency::report::{
    CheckOptions, ConsistencyReport, DivergenceResolution, Issue, IssueKind,
};
pub use consistency::{CheckOutcome, ConsistencyChecker};
pub use coordinator::diagnostics::{HealthLevel, SyncDiagnostics};
pub use coordinator::{OptimizationOutcome, SyncCoordinator, TransportType};
pub use prefetch::{AccessEvent, BehaviorPattern, PrefetchPlanner, PrefetchPreferences};
pub use pressure::PressureLevel;
pub use queue::backoff::BackoffPolicy;
pub use queue::{DrainOutcome, SyncQueue};
pub use queue_item::{FailureKind, ItemKind, ItemStatus, QueuedItem};
pub use store::traits::{
    EntityType, LocalRecord, LocalStore, PublishAck, PublishEvent, QueryFilter, RemoteEvent,
    RemoteRecord, RemoteStore, StoreError, WriteOp,
};
