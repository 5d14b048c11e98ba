// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory store implementations.
//!
//! [`MemoryLocalStore`] is a DashMap-backed [`LocalStore`] for tests and for
//! callers that accept losing queue durability across restarts.
//!
//! [`MemoryRemoteStore`] doubles as the remote service in tests and local
//! simulation: it supports going offline, injected latency, transient
//! failures and per-item rejection, and it records the order in which
//! publishes landed so ordering guarantees can be asserted.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use super::traits::{
    EntityType, LocalRecord, LocalStore, PublishAck, PublishEvent, QueryFilter, RemoteEvent,
    RemoteRecord, RemoteStore, StoreError, WriteOp,
};

/// DashMap-backed local store. No durability across restarts.
pub struct MemoryLocalStore {
    records: DashMap<(EntityType, String), LocalRecord>,
}

impl MemoryLocalStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for MemoryLocalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn find(&self, entity: EntityType, id: &str) -> Result<Option<LocalRecord>, StoreError> {
        Ok(self
            .records
            .get(&(entity, id.to_string()))
            .map(|r| r.value().clone()))
    }

    async fn query(
        &self,
        entity: EntityType,
        filter: &QueryFilter,
    ) -> Result<Vec<LocalRecord>, StoreError> {
        let mut out: Vec<LocalRecord> = self
            .records
            .iter()
            .filter(|r| r.key().0 == entity)
            .map(|r| r.value().clone())
            .filter(|rec| {
                filter
                    .conversation_id
                    .as_ref()
                    .map_or(true, |c| *c == rec.conversation_id)
                    && filter.confirmed.map_or(true, |c| rec.confirmed == c)
            })
            .collect();
        out.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        // Single-threaded apply over a concurrent map; DashMap gives
        // per-record atomicity and nothing here can fail halfway.
        for op in ops {
            match op {
                WriteOp::Put(record) => {
                    self.records
                        .insert((record.entity, record.id.clone()), record);
                }
                WriteOp::Delete { entity, id } => {
                    self.records.remove(&(entity, id));
                }
            }
        }
        Ok(())
    }
}

/// In-memory remote store double with fault injection.
pub struct MemoryRemoteStore {
    records: DashMap<(EntityType, String), RemoteRecord>,
    online: AtomicBool,
    /// Next N publishes fail with a transient error
    fail_next: AtomicU32,
    /// Item ids the remote permanently rejects (conflict)
    rejected: DashMap<String, String>,
    /// Delay applied to every publish, simulating a slow link
    publish_latency: Mutex<Duration>,
    /// Publish order, for ordering assertions in tests
    publish_log: Mutex<Vec<String>>,
    subscribers: DashMap<String, Vec<mpsc::Sender<RemoteEvent>>>,
}

impl MemoryRemoteStore {
    const SUBSCRIBE_BUFFER: usize = 64;

    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            online: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            rejected: DashMap::new(),
            publish_latency: Mutex::new(Duration::ZERO),
            publish_log: Mutex::new(Vec::new()),
            subscribers: DashMap::new(),
        }
    }

    /// Simulate connectivity loss / restoration.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    /// Make the next `n` publishes fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::Release);
    }

    /// Permanently reject publishes carrying this item id.
    pub fn reject(&self, item_id: &str, reason: &str) {
        self.rejected.insert(item_id.to_string(), reason.to_string());
    }

    /// Delay every subsequent publish, simulating a slow link.
    pub fn set_publish_latency(&self, latency: Duration) {
        *self.publish_latency.lock() = latency;
    }

    /// Seed a record directly (e.g. to construct an orphan-remote).
    pub fn insert_record(&self, record: RemoteRecord) {
        self.records
            .insert((record.entity, record.id.clone()), record);
    }

    /// Remove a record directly (e.g. to construct an orphan-local).
    pub fn remove_record(&self, entity: EntityType, id: &str) {
        self.records.remove(&(entity, id.to_string()));
    }

    #[must_use]
    pub fn contains(&self, entity: EntityType, id: &str) -> bool {
        self.records.contains_key(&(entity, id.to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Item ids in the order their publishes were accepted.
    #[must_use]
    pub fn published_order(&self) -> Vec<String> {
        self.publish_log.lock().clone()
    }

    /// Push an event into a conversation channel, as if another device
    /// published it.
    pub async fn emit(&self, event: RemoteEvent) {
        self.fan_out(event).await;
    }

    async fn fan_out(&self, event: RemoteEvent) {
        let senders = self
            .subscribers
            .get(&event.conversation_id)
            .map(|s| s.value().clone())
            .unwrap_or_default();
        for tx in senders {
            // Slow consumers drop events; pub/sub is best-effort here
            let _ = tx.try_send(event.clone());
        }
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn fetch(
        &self,
        entity: EntityType,
        id: &str,
    ) -> Result<Option<RemoteRecord>, StoreError> {
        if !self.online.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("remote offline".into()));
        }
        Ok(self
            .records
            .get(&(entity, id.to_string()))
            .map(|r| r.value().clone()))
    }

    async fn list_ids(&self, entity: EntityType) -> Result<Vec<String>, StoreError> {
        if !self.online.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("remote offline".into()));
        }
        let mut ids: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.key().0 == entity)
            .map(|r| r.key().1.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn publish(
        &self,
        conversation_id: &str,
        event: PublishEvent,
    ) -> Result<PublishAck, StoreError> {
        if !self.online.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("remote offline".into()));
        }
        let latency = *self.publish_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Unavailable("injected transient failure".into()));
        }
        if let Some(reason) = self.rejected.get(&event.item_id) {
            return Err(StoreError::Rejected(reason.value().clone()));
        }

        // Idempotent on the client-generated id: redelivery is a no-op
        let key = (event.entity, event.item_id.clone());
        let duplicate = self.records.contains_key(&key);
        if !duplicate {
            self.records.insert(
                key,
                RemoteRecord {
                    entity: event.entity,
                    id: event.item_id.clone(),
                    conversation_id: conversation_id.to_string(),
                    payload: event.payload.clone(),
                    updated_at: crate::queue_item::epoch_millis(),
                },
            );
            self.publish_log.lock().push(event.item_id.clone());

            self.fan_out(RemoteEvent {
                conversation_id: conversation_id.to_string(),
                entity: event.entity,
                entity_id: event.item_id.clone(),
                payload: event.payload,
            })
            .await;
        }

        Ok(PublishAck {
            item_id: event.item_id,
            duplicate,
        })
    }

    fn subscribe(&self, conversation_id: &str) -> mpsc::Receiver<RemoteEvent> {
        let (tx, rx) = mpsc::channel(Self::SUBSCRIBE_BUFFER);
        self.subscribers
            .entry(conversation_id.to_string())
            .or_default()
            .push(tx);
        rx
    }
}
