// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Speculative cache warming from observed access patterns.
//!
//! The planner watches which conversations a user opens and periodically
//! warms the messages namespace for the most recent ones, so that returning
//! to a conversation is a cache hit. Strictly best-effort: every failure is
//! swallowed (logged at debug), nothing here may block or fail a foreground
//! operation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::entry::Namespace;
use crate::cache::{PutOptions, TieredCache};
use crate::config::SyncConfig;
use crate::queue_item::epoch_millis;
use crate::store::traits::{EntityType, LocalStore, QueryFilter};

/// How many conversations one warm cycle touches.
const WARM_CANDIDATES: usize = 5;

/// One observed user action.
#[derive(Debug, Clone)]
pub struct AccessEvent {
    pub conversation_id: String,
    pub namespace: Namespace,
    /// Epoch millis, filled in on record
    pub observed_at: i64,
}

impl AccessEvent {
    #[must_use]
    pub fn new(conversation_id: impl Into<String>, namespace: Namespace) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            namespace,
            observed_at: epoch_millis(),
        }
    }
}

/// Which namespaces may be speculatively warmed.
#[derive(Debug, Clone, Copy)]
pub struct PrefetchPreferences {
    pub messages: bool,
    pub notifications: bool,
    pub user_presence: bool,
    pub social_feed: bool,
}

impl Default for PrefetchPreferences {
    fn default() -> Self {
        Self {
            messages: true,
            notifications: true,
            user_presence: false,
            social_feed: false,
        }
    }
}

impl PrefetchPreferences {
    #[must_use]
    pub fn enabled(&self, namespace: Namespace) -> bool {
        match namespace {
            Namespace::Messages => self.messages,
            Namespace::Notifications => self.notifications,
            Namespace::UserPresence => self.user_presence,
            Namespace::SocialFeed => self.social_feed,
        }
    }
}

/// Per-user heuristic state: preferences plus a bounded ring of recent
/// accesses. Never explicitly destroyed; the ring bounds its growth.
#[derive(Debug)]
pub struct BehaviorPattern {
    pub preferences: PrefetchPreferences,
    accesses: VecDeque<AccessEvent>,
    capacity: usize,
}

impl BehaviorPattern {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            preferences: PrefetchPreferences::default(),
            accesses: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, event: AccessEvent) {
        if self.accesses.len() == self.capacity {
            self.accesses.pop_front();
        }
        self.accesses.push_back(event);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.accesses.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accesses.is_empty()
    }

    /// Distinct conversation ids, most recently accessed first, limited to
    /// namespaces the preferences allow.
    #[must_use]
    pub fn recent_conversations(&self, limit: usize) -> Vec<String> {
        let mut seen = Vec::with_capacity(limit);
        for event in self.accesses.iter().rev() {
            if !self.preferences.enabled(event.namespace) {
                continue;
            }
            if seen.iter().any(|c| c == &event.conversation_id) {
                continue;
            }
            seen.push(event.conversation_id.clone());
            if seen.len() == limit {
                break;
            }
        }
        seen
    }
}

/// Best-effort background cache warmer.
pub struct PrefetchPlanner {
    local: Arc<dyn LocalStore>,
    cache: Arc<TieredCache>,
    patterns: DashMap<String, BehaviorPattern>,
    tasks: DashMap<String, JoinHandle<()>>,
    interval: Duration,
    ring_capacity: usize,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PrefetchPlanner {
    pub fn new(local: Arc<dyn LocalStore>, cache: Arc<TieredCache>, config: &SyncConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            local,
            cache,
            patterns: DashMap::new(),
            tasks: DashMap::new(),
            interval: Duration::from_millis(config.prefetch_interval_ms),
            ring_capacity: config.behavior_ring_capacity,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Record one observed access. Creates the user's pattern on first sight.
    pub fn update_user_behavior(&self, user_id: &str, event: AccessEvent) {
        self.patterns
            .entry(user_id.to_string())
            .or_insert_with(|| BehaviorPattern::new(self.ring_capacity))
            .record(event);
    }

    pub fn configure_prefetch_preferences(&self, user_id: &str, prefs: PrefetchPreferences) {
        self.patterns
            .entry(user_id.to_string())
            .or_insert_with(|| BehaviorPattern::new(self.ring_capacity))
            .preferences = prefs;
    }

    /// Begin periodic warm cycles for a user. Idempotent per user.
    pub fn start_prefetching(self: &Arc<Self>, user_id: &str) {
        use dashmap::mapref::entry::Entry;
        let slot = match self.tasks.entry(user_id.to_string()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => slot,
        };

        let planner = Arc::clone(self);
        let user = user_id.to_string();
        let mut shutdown = self.shutdown_rx.clone();
        let interval = self.interval;

        info!(user = %user_id, "Prefetching started");
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick is a no-op
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        planner.warm_user(&user).await;
                    }
                }
            }
            debug!(user = %user, "Prefetch loop stopped");
        });
        slot.insert(handle);
    }

    /// Stop one user's warm loop.
    pub fn stop_prefetching(&self, user_id: &str) {
        if let Some((_, handle)) = self.tasks.remove(user_id) {
            handle.abort();
            info!(user = %user_id, "Prefetching stopped");
        }
    }

    /// Stop everything.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.iter() {
            task.value().abort();
        }
        self.tasks.clear();
    }

    /// One warm cycle: fill cache misses for the user's most recent
    /// conversations. Returns how many entries were warmed. All errors are
    /// swallowed here; a failed warm is just a future cache miss.
    pub async fn warm_user(&self, user_id: &str) -> usize {
        let candidates = match self.patterns.get(user_id) {
            Some(pattern) => pattern.recent_conversations(WARM_CANDIDATES),
            None => return 0,
        };

        let mut warmed = 0usize;
        for conversation_id in candidates {
            if self.cache.get(Namespace::Messages, &conversation_id).is_some() {
                continue; // already hot
            }
            let filter = QueryFilter {
                conversation_id: Some(conversation_id.clone()),
                confirmed: Some(true),
            };
            match self.local.query(EntityType::Message, &filter).await {
                Ok(records) if !records.is_empty() => {
                    let items: Vec<Value> = records.into_iter().map(|r| r.payload).collect();
                    self.cache.put(
                        Namespace::Messages,
                        &conversation_id,
                        &Value::Array(items),
                        PutOptions::default(),
                    );
                    warmed += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(conversation = %conversation_id, error = %e, "Warm skipped");
                }
            }
        }
        if warmed > 0 {
            debug!(user = %user_id, warmed, "Prefetch cycle warmed conversations");
        }
        warmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryLocalStore;
    use crate::store::traits::LocalRecord;
    use serde_json::json;

    fn planner() -> (Arc<PrefetchPlanner>, Arc<MemoryLocalStore>, Arc<TieredCache>) {
        let local = Arc::new(MemoryLocalStore::new());
        let config = SyncConfig {
            behavior_ring_capacity: 4,
            prefetch_interval_ms: 10,
            ..Default::default()
        };
        let cache = Arc::new(TieredCache::new(&config));
        let planner = Arc::new(PrefetchPlanner::new(local.clone(), cache.clone(), &config));
        (planner, local, cache)
    }

    async fn seed_messages(local: &MemoryLocalStore, conversation: &str, n: usize) {
        for i in 0..n {
            local
                .put(LocalRecord {
                    entity: EntityType::Message,
                    id: format!("{conversation}-m{i}"),
                    conversation_id: conversation.to_string(),
                    payload: json!({"content": format!("m{i}")}),
                    confirmed: true,
                    updated_at: i as i64,
                })
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_ring_buffer_is_bounded() {
        let mut pattern = BehaviorPattern::new(3);
        for i in 0..10 {
            pattern.record(AccessEvent::new(format!("c-{i}"), Namespace::Messages));
        }
        assert_eq!(pattern.len(), 3);
        // Oldest entries fell off
        assert_eq!(pattern.recent_conversations(10), vec!["c-9", "c-8", "c-7"]);
    }

    #[test]
    fn test_recent_conversations_dedupes_newest_first() {
        let mut pattern = BehaviorPattern::new(16);
        for c in ["c-1", "c-2", "c-1", "c-3"] {
            pattern.record(AccessEvent::new(c, Namespace::Messages));
        }
        assert_eq!(pattern.recent_conversations(10), vec!["c-3", "c-1", "c-2"]);
    }

    #[test]
    fn test_preferences_filter_namespaces() {
        let mut pattern = BehaviorPattern::new(16);
        pattern.preferences = PrefetchPreferences {
            messages: false,
            ..Default::default()
        };
        pattern.record(AccessEvent::new("c-1", Namespace::Messages));
        pattern.record(AccessEvent::new("c-2", Namespace::Notifications));

        assert_eq!(pattern.recent_conversations(10), vec!["c-2"]);
    }

    #[tokio::test]
    async fn test_warm_fills_cache_misses() {
        let (planner, local, cache) = planner();
        seed_messages(&local, "c-1", 3).await;
        planner.update_user_behavior("u-1", AccessEvent::new("c-1", Namespace::Messages));

        let warmed = planner.warm_user("u-1").await;
        assert_eq!(warmed, 1);

        let value = cache.get(Namespace::Messages, "c-1").unwrap();
        assert_eq!(value.as_array().unwrap().len(), 3);

        // Already hot: second cycle does nothing
        assert_eq!(planner.warm_user("u-1").await, 0);
    }

    #[tokio::test]
    async fn test_warm_unknown_user_is_a_noop() {
        let (planner, _, _) = planner();
        assert_eq!(planner.warm_user("nobody").await, 0);
    }

    #[tokio::test]
    async fn test_warm_skips_disabled_namespace() {
        let (planner, local, cache) = planner();
        seed_messages(&local, "c-1", 1).await;
        planner.configure_prefetch_preferences(
            "u-1",
            PrefetchPreferences {
                messages: false,
                ..Default::default()
            },
        );
        planner.update_user_behavior("u-1", AccessEvent::new("c-1", Namespace::Messages));

        assert_eq!(planner.warm_user("u-1").await, 0);
        assert!(cache.get(Namespace::Messages, "c-1").is_none());
    }

    #[tokio::test]
    async fn test_background_loop_warms_and_stops() {
        let (planner, local, cache) = planner();
        seed_messages(&local, "c-1", 2).await;
        planner.update_user_behavior("u-1", AccessEvent::new("c-1", Namespace::Messages));

        planner.start_prefetching("u-1");
        planner.start_prefetching("u-1"); // idempotent

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get(Namespace::Messages, "c-1").is_some());

        planner.stop_prefetching("u-1");
        planner.shutdown();
    }
}
