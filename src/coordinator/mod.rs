// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync orchestration and the UI-facing surface.
//!
//! The [`SyncCoordinator`] composes the queue, cache and consistency checker
//! and is the only component the UI layer talks to. It owns no sync state of
//! its own beyond lifecycle bookkeeping (active users, subscription
//! consumers); its behavior is fully determined by the components it
//! composes, which keeps it cheap to test.
//!
//! Flow: UI writes enter through [`SyncCoordinator::send_message`] and are
//! queued unconditionally; when online a background task drains the queue so
//! the send path never waits on the network. Network transitions drain the
//! queue and follow up with an auto-repair consistency check. Delivered items
//! are written through to the cache; incoming subscription events invalidate
//! it.

pub mod diagnostics;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::entry::Namespace;
use crate::cache::{PutOptions, TieredCache};
use crate::config::SyncConfig;
use crate::consistency::report::{CheckOptions, ConsistencyReport};
use crate::consistency::ConsistencyChecker;
use crate::queue::{DrainOutcome, SyncQueue};
use crate::queue_item::{epoch_millis, ItemKind, QueuedItem};
use crate::store::traits::{EntityType, LocalStore, QueryFilter, RemoteStore, StoreError};

use diagnostics::{HealthInputs, SyncDiagnostics};

/// How the device is connected. `Offline` overrides the `online` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Wifi,
    Cellular,
    Offline,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Wifi => "wifi",
            Self::Cellular => "cellular",
            Self::Offline => "offline",
        };
        write!(f, "{}", s)
    }
}

/// Result of an explicit optimization request.
#[derive(Debug, Clone, Copy)]
pub struct OptimizationOutcome {
    pub cache_optimized: bool,
    pub freed_bytes: usize,
    pub items_removed: usize,
}

pub struct SyncCoordinator {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    queue: Arc<SyncQueue>,
    cache: Arc<TieredCache>,
    checker: ConsistencyChecker,
    queue_depth_warning: usize,

    /// Users with initialized sync state; guards start_user_sync idempotence
    active_users: DashMap<String, i64>,
    /// One consumer task per watched conversation
    watchers: DashMap<String, JoinHandle<()>>,
    /// Most recent check, for the integrity score
    last_report: Mutex<Option<ConsistencyReport>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SyncCoordinator {
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        config: &SyncConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            queue: Arc::new(SyncQueue::new(local.clone(), remote.clone(), config)),
            cache: Arc::new(TieredCache::new(config)),
            checker: ConsistencyChecker::new(local.clone(), remote.clone()),
            queue_depth_warning: config.queue_depth_warning,
            local,
            remote,
            active_users: DashMap::new(),
            watchers: DashMap::new(),
            last_report: Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
        }
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    /// Restore queued items from the local store after a restart.
    pub async fn load_persisted(&self) -> Result<usize, StoreError> {
        self.queue.load_persisted().await
    }

    /// Initialize per-user sync state. Idempotent: the second call for the
    /// same user is a no-op and returns `false`.
    pub fn start_user_sync(&self, user_id: &str) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.active_users.entry(user_id.to_string()) {
            Entry::Occupied(_) => {
                debug!(user = %user_id, "User sync already active");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(epoch_millis());
                info!(user = %user_id, "User sync started");
                true
            }
        }
    }

    /// Single integration point for connectivity changes. Regaining
    /// connectivity drains the queue and follows up with an auto-repair
    /// consistency check.
    #[tracing::instrument(skip(self), fields(online, transport = %transport))]
    pub async fn handle_network_change(&self, online: bool, transport: TransportType) {
        let effective = online && transport != TransportType::Offline;
        info!(online = effective, transport = %transport, "Network state changed");

        if let Some(outcome) = self.queue.set_network_state(effective).await {
            Self::write_through(&self.cache, &outcome);
            self.run_check(CheckOptions {
                auto_repair: true,
                include_orphans: true,
            })
            .await;
        }
    }

    /// Drain everything, run a full auto-repair check, refresh caches
    /// touched by repairs.
    #[tracing::instrument(skip(self))]
    pub async fn force_sync_all(&self) -> ConsistencyReport {
        if self.queue.is_online() {
            let outcome = self.queue.drain().await;
            Self::write_through(&self.cache, &outcome);
        }
        self.run_check(CheckOptions {
            auto_repair: true,
            include_orphans: true,
        })
        .await
    }

    pub async fn perform_consistency_check(&self, options: CheckOptions) -> ConsistencyReport {
        self.run_check(options).await
    }

    /// Queue a message for delivery and return its id. Never fails on network
    /// state, and never waits on it either: when online, delivery happens on
    /// a background drain task. The only synchronous errors are the caller's
    /// own precondition failures.
    #[tracing::instrument(skip(self, content), fields(conversation = %conversation_id))]
    pub async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        sender_id: &str,
    ) -> Result<String, StoreError> {
        if sender_id.is_empty() {
            return Err(StoreError::Rejected("sender_id is empty".into()));
        }

        let payload = json!({
            "content": content,
            "sender_id": sender_id,
        });
        let id = self
            .queue
            .enqueue(conversation_id, payload, ItemKind::Message)
            .await?;

        if self.queue.is_online() {
            let queue = Arc::clone(&self.queue);
            let cache = Arc::clone(&self.cache);
            tokio::spawn(async move {
                let outcome = queue.drain().await;
                Self::write_through(&cache, &outcome);
            });
        }
        Ok(id)
    }

    /// Confirmed messages for a conversation, oldest first. Reads through to
    /// the local store on a cache miss; errors degrade to an empty list.
    pub async fn get_cached_messages(&self, conversation_id: &str) -> Vec<Value> {
        if let Some(Value::Array(items)) = self.cache.get(Namespace::Messages, conversation_id) {
            return items;
        }

        let filter = QueryFilter {
            conversation_id: Some(conversation_id.to_string()),
            confirmed: Some(true),
        };
        match self.local.query(EntityType::Message, &filter).await {
            Ok(records) => {
                let items: Vec<Value> = records.into_iter().map(|r| r.payload).collect();
                if !items.is_empty() {
                    self.cache.put(
                        Namespace::Messages,
                        conversation_id,
                        &Value::Array(items.clone()),
                        PutOptions::default(),
                    );
                }
                items
            }
            Err(e) => {
                warn!(conversation = %conversation_id, error = %e, "Read-through failed");
                Vec::new()
            }
        }
    }

    /// Unsent (and failed) items for a conversation, in enqueue order.
    #[must_use]
    pub fn get_offline_messages(&self, conversation_id: &str) -> Vec<QueuedItem> {
        self.queue.list_pending(conversation_id)
    }

    #[must_use]
    pub fn get_diagnostics(&self) -> SyncDiagnostics {
        let stats = self.cache.stats();
        let (unresolved, partial) = self
            .last_report
            .lock()
            .as_ref()
            .map(|r| {
                (
                    r.issues_found.len().saturating_sub(r.issues_repaired.len()),
                    r.partial,
                )
            })
            .unwrap_or((0, false));

        SyncDiagnostics::assess(HealthInputs {
            online: self.queue.is_online(),
            queue_depth: self.queue.depth(),
            queue_depth_warning: self.queue_depth_warning,
            failed_items: self.queue.failed_count(),
            cache_hit_rate: stats.hit_rate(),
            cache_used_bytes: stats.used_bytes,
            cache_pressure: self.cache.pressure(),
            last_successful_sync: self.queue.last_successful_sync(),
            unresolved_issues: unresolved,
            partial_check: partial,
        })
    }

    /// Run cache cleanup and report whether any action was taken.
    pub fn perform_optimization(&self) -> OptimizationOutcome {
        match self.cache.perform_intelligent_cleanup() {
            Some(outcome) => {
                info!(
                    freed_bytes = outcome.freed_bytes,
                    removed = outcome.items_removed,
                    "Optimization ran cache cleanup"
                );
                OptimizationOutcome {
                    cache_optimized: outcome.items_removed > 0,
                    freed_bytes: outcome.freed_bytes,
                    items_removed: outcome.items_removed,
                }
            }
            None => OptimizationOutcome {
                cache_optimized: false,
                freed_bytes: 0,
                items_removed: 0,
            },
        }
    }

    /// Start consuming a conversation's subscription channel. Each incoming
    /// event invalidates the conversation's cached message list so the next
    /// read pulls fresh state. Idempotent per conversation.
    pub fn watch_conversation(&self, conversation_id: &str) {
        use dashmap::mapref::entry::Entry;
        let slot = match self.watchers.entry(conversation_id.to_string()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => slot,
        };

        let mut events = self.remote.subscribe(conversation_id);
        let mut shutdown = self.shutdown_rx.clone();
        let cache = Arc::clone(&self.cache);
        let conversation = conversation_id.to_string();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => {
                        match event {
                            Some(event) => {
                                debug!(
                                    conversation = %event.conversation_id,
                                    entity = %event.entity,
                                    id = %event.entity_id,
                                    "Incoming event, invalidating cached view"
                                );
                                cache.invalidate(Namespace::Messages, &event.conversation_id);
                            }
                            None => break, // channel closed upstream
                        }
                    }
                }
            }
            debug!(conversation = %conversation, "Conversation watcher stopped");
        });
        slot.insert(handle);
    }

    /// Stop watchers and signal the queue. In-flight deliveries stay
    /// in-flight and resume on the next start.
    pub fn shutdown(&self) {
        info!("Coordinator shutting down");
        let _ = self.shutdown_tx.send(true);
        self.queue.shutdown();
        for watcher in self.watchers.iter() {
            watcher.value().abort();
        }
        self.watchers.clear();
    }

    /// Run a check excluding ids the queue may still deliver, apply its
    /// requeue list, and refresh caches touched by repairs.
    async fn run_check(&self, options: CheckOptions) -> ConsistencyReport {
        let exclude = self.queue.active_ids();
        let outcome = self.checker.perform_check(options, &exclude).await;

        let mut requeued = 0usize;
        for record in &outcome.requeue {
            match self.queue.requeue(record).await {
                Ok(_) => requeued += 1,
                Err(e) => warn!(id = %record.id, error = %e, "Requeue of orphan failed"),
            }
        }
        if requeued > 0 && self.queue.is_online() {
            let drained = self.queue.drain().await;
            Self::write_through(&self.cache, &drained);
        }

        let touched: HashSet<Namespace> = outcome
            .report
            .issues_repaired
            .iter()
            .map(|issue| namespace_for(issue.entity_type))
            .collect();
        for namespace in touched {
            self.cache.invalidate_namespace(namespace);
        }

        *self.last_report.lock() = Some(outcome.report.clone());
        outcome.report
    }

    /// Append freshly delivered messages to their conversations' cached
    /// lists. Conversations with no cached list are left to read-through.
    /// Takes the cache directly so background drain tasks can call it.
    fn write_through(cache: &TieredCache, outcome: &DrainOutcome) {
        let mut by_conversation: HashMap<&str, Vec<&QueuedItem>> = HashMap::new();
        for item in &outcome.delivered {
            if item.kind == ItemKind::Message {
                by_conversation
                    .entry(item.conversation_id.as_str())
                    .or_default()
                    .push(item);
            }
        }

        for (conversation, items) in by_conversation {
            let Some(Value::Array(mut list)) = cache.get(Namespace::Messages, conversation)
            else {
                continue;
            };
            for item in items {
                list.push(item.payload.clone());
            }
            cache.put(
                Namespace::Messages,
                conversation,
                &Value::Array(list),
                PutOptions::default(),
            );
        }
    }
}

fn namespace_for(entity: EntityType) -> Namespace {
    match entity {
        EntityType::Message | EntityType::Reaction | EntityType::QueuedItem => Namespace::Messages,
        EntityType::Presence => Namespace::UserPresence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_item::ItemStatus;
    use crate::store::memory::{MemoryLocalStore, MemoryRemoteStore};
    use crate::store::traits::{RemoteEvent, RemoteRecord};
    use diagnostics::HealthLevel;
    use std::time::Duration;

    fn setup() -> (SyncCoordinator, Arc<MemoryLocalStore>, Arc<MemoryRemoteStore>) {
        let local = Arc::new(MemoryLocalStore::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        let config = SyncConfig {
            backoff_base_ms: 1,
            backoff_cap_ms: 5,
            ..Default::default()
        };
        let coordinator = SyncCoordinator::new(local.clone(), remote.clone(), &config);
        (coordinator, local, remote)
    }

    #[tokio::test]
    async fn test_start_user_sync_is_idempotent() {
        let (coordinator, _, _) = setup();
        assert!(coordinator.start_user_sync("u-1"));
        assert!(!coordinator.start_user_sync("u-1"));
        assert!(coordinator.start_user_sync("u-2"));
    }

    #[tokio::test]
    async fn test_send_message_online_delivers_and_caches() {
        let (coordinator, _, remote) = setup();

        assert!(coordinator.get_cached_messages("c-1").await.is_empty());
        let id = coordinator
            .send_message("c-1", "hello", "u-1")
            .await
            .unwrap();
        // Delivery rides a background drain
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(remote.contains(EntityType::Message, &id));
        let cached = coordinator.get_cached_messages("c-1").await;
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0]["content"], "hello");
        assert!(coordinator.get_offline_messages("c-1").is_empty());
    }

    #[tokio::test]
    async fn test_send_message_offline_queues() {
        let (coordinator, _, remote) = setup();
        remote.set_online(false);
        coordinator
            .handle_network_change(false, TransportType::Offline)
            .await;

        let id = coordinator
            .send_message("c-1", "queued", "u-1")
            .await
            .unwrap();

        assert!(!id.is_empty());
        assert!(remote.is_empty());
        let pending = coordinator.get_offline_messages("c-1");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, ItemStatus::Pending);
    }

    #[tokio::test]
    async fn test_send_message_returns_before_delivery_completes() {
        let (coordinator, _, remote) = setup();
        remote.set_publish_latency(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let id = coordinator
            .send_message("c-1", "over a slow link", "u-1")
            .await
            .unwrap();

        assert!(
            started.elapsed() < Duration::from_millis(100),
            "send must return the queued id without waiting on delivery"
        );
        assert_eq!(coordinator.get_offline_messages("c-1").len(), 1);

        // The background drain lands it once the slow publish completes
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(remote.contains(EntityType::Message, &id));
        assert!(coordinator.get_offline_messages("c-1").is_empty());
    }

    #[tokio::test]
    async fn test_send_message_rejects_missing_sender() {
        let (coordinator, _, _) = setup();
        assert!(matches!(
            coordinator.send_message("c-1", "hi", "").await,
            Err(StoreError::Rejected(_))
        ));
        assert!(matches!(
            coordinator.send_message("", "hi", "u-1").await,
            Err(StoreError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_regaining_connectivity_drains_in_order() {
        let (coordinator, _, remote) = setup();
        remote.set_online(false);
        coordinator
            .handle_network_change(false, TransportType::Offline)
            .await;

        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(
                coordinator
                    .send_message("c-1", &format!("m{i}"), "u-1")
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(coordinator.get_offline_messages("c-1").len(), 3);

        remote.set_online(true);
        coordinator
            .handle_network_change(true, TransportType::Wifi)
            .await;

        assert!(coordinator.get_offline_messages("c-1").is_empty());
        assert_eq!(remote.published_order(), ids);
        let cached = coordinator.get_cached_messages("c-1").await;
        assert_eq!(cached.len(), 3);
        assert_eq!(cached[0]["content"], "m0");
        assert_eq!(cached[2]["content"], "m2");
    }

    #[tokio::test]
    async fn test_force_sync_repairs_local_orphan_by_requeue() {
        let (coordinator, local, remote) = setup();
        local
            .put(crate::store::traits::LocalRecord {
                entity: EntityType::Message,
                id: "orphan-1".into(),
                conversation_id: "c-1".into(),
                payload: json!({"content": "stranded"}),
                confirmed: true,
                updated_at: 1,
            })
            .await
            .unwrap();

        let report = coordinator.force_sync_all().await;

        assert_eq!(report.issues_found.len(), 1);
        // The requeued orphan was drained straight back to the remote
        assert!(remote.contains(EntityType::Message, "orphan-1"));

        // Second pass finds nothing new
        let report = coordinator.force_sync_all().await;
        assert!(report.issues_found.is_empty());
    }

    #[tokio::test]
    async fn test_diagnostics_reflect_queue_state() {
        let (coordinator, _, remote) = setup();
        coordinator.send_message("c-1", "ok", "u-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let d = coordinator.get_diagnostics();
        assert_eq!(d.overall, HealthLevel::Healthy);
        assert_eq!(d.data_integrity_score, 100);

        // Exhaust the retry budget for one item
        remote.fail_next(10);
        coordinator.send_message("c-1", "doomed", "u-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        for _ in 0..3 {
            coordinator.queue().drain().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let d = coordinator.get_diagnostics();
        assert_eq!(d.failed_items, 1);
        assert_eq!(d.overall, HealthLevel::Warning);
        assert!(d.data_integrity_score < 100);
    }

    #[tokio::test]
    async fn test_incoming_event_invalidates_cached_view() {
        let (coordinator, _, remote) = setup();
        coordinator.watch_conversation("c-1");
        coordinator.watch_conversation("c-1"); // idempotent

        coordinator.send_message("c-1", "mine", "u-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.get_cached_messages("c-1").await.len(), 1);

        remote
            .emit(RemoteEvent {
                conversation_id: "c-1".into(),
                entity: EntityType::Message,
                entity_id: "theirs-1".into(),
                payload: json!({"content": "from another device"}),
            })
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Cached list dropped; read-through rebuilds from the local store
        assert_eq!(coordinator.cache().entry_count(Namespace::Messages), 0);
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_optimization_reports_no_action_when_idle() {
        let (coordinator, _, _) = setup();
        let outcome = coordinator.perform_optimization();
        assert!(!outcome.cache_optimized);
        assert_eq!(outcome.freed_bytes, 0);
    }

    #[tokio::test]
    async fn test_orphan_remote_repair_refreshes_cache() {
        let (coordinator, local, remote) = setup();
        // Stale cached view
        coordinator.cache().put(
            Namespace::Messages,
            "c-1",
            &json!([{"content": "stale"}]),
            PutOptions::default(),
        );
        remote.insert_record(RemoteRecord {
            entity: EntityType::Message,
            id: "m-new".into(),
            conversation_id: "c-1".into(),
            payload: json!({"content": "new remote message"}),
            updated_at: 1,
        });

        coordinator.force_sync_all().await;

        // Repair pulled the record down and dropped the stale cached view
        assert!(local.find(EntityType::Message, "m-new").await.unwrap().is_some());
        let cached = coordinator.get_cached_messages("c-1").await;
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0]["content"], "new remote message");
    }
}
