// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable outbound sync queue.
//!
//! The [`SyncQueue`] accepts writes unconditionally: `enqueue` persists the
//! mutation to the local store and returns a stable client-generated id
//! without ever touching the network. A drain pass then attempts delivery:
//!
//! - **FIFO within a conversation**: a reply never reaches the remote store
//!   before the message it replies to. Each conversation is processed by at
//!   most one worker at a time.
//! - **Parallel across conversations**: a semaphore bounds the worker pool.
//! - **At-least-once**: items interrupted mid-attempt stay `InFlight` and are
//!   retried on the next drain; the remote side deduplicates on the item id.
//!
//! Transient failures back off exponentially until the attempt budget is
//! spent, after which the item surfaces as `Failed` for explicit user retry.
//! Remote rejections (conflicts) fail immediately and are never auto-retried.

pub mod backoff;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::queue_item::{epoch_millis, FailureKind, ItemKind, ItemStatus, QueuedItem};
use crate::store::traits::{
    EntityType, LocalRecord, LocalStore, PublishEvent, QueryFilter, RemoteStore, StoreError,
    WriteOp,
};

use backoff::BackoffPolicy;

/// Result of one drain pass.
#[derive(Debug, Default)]
pub struct DrainOutcome {
    /// Items confirmed by the remote store during this pass
    pub succeeded: usize,
    /// Items whose attempt failed during this pass
    pub failed: usize,
    /// The delivered items, for write-through into the cache
    pub delivered: Vec<QueuedItem>,
}

impl DrainOutcome {
    fn merge(&mut self, other: DrainOutcome) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.delivered.extend(other.delivered);
    }
}

/// Durable outbound queue with retry/backoff and network-state gating.
pub struct SyncQueue {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,

    /// In-memory mirror of pending/failed items (source of truth for order)
    items: DashMap<String, QueuedItem>,

    /// Per-conversation mutual exclusion for drain workers
    conversation_locks: DashMap<String, Arc<Mutex<()>>>,

    /// Monotonic enqueue sequence
    seq: AtomicU64,

    online: AtomicBool,

    /// Bounds concurrent conversation drains
    workers: Arc<Semaphore>,

    backoff: BackoffPolicy,
    delivery_timeout: Duration,

    /// Epoch millis of the last drain that completed without failures
    last_success_at: AtomicI64,

    /// Strictly increasing stamp for confirmed records; keeps read-order
    /// stable when several deliveries land in the same millisecond
    confirm_stamp: AtomicI64,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SyncQueue {
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        config: &SyncConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            local,
            remote,
            items: DashMap::new(),
            conversation_locks: DashMap::new(),
            seq: AtomicU64::new(0),
            online: AtomicBool::new(true),
            workers: Arc::new(Semaphore::new(config.drain_workers.max(1))),
            backoff: BackoffPolicy::from_config(config),
            delivery_timeout: Duration::from_millis(config.delivery_timeout_ms),
            last_success_at: AtomicI64::new(0),
            confirm_stamp: AtomicI64::new(0),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Restore queue state from the local store after a restart.
    ///
    /// Items found `InFlight` were interrupted mid-attempt; they stay
    /// in-flight and the next drain retries them.
    pub async fn load_persisted(&self) -> Result<usize, StoreError> {
        let records = self
            .local
            .query(EntityType::QueuedItem, &QueryFilter::default())
            .await?;

        let mut restored = 0usize;
        let mut max_seq = self.seq.load(Ordering::Acquire);
        for record in records {
            match serde_json::from_value::<QueuedItem>(record.payload) {
                Ok(item) => {
                    max_seq = max_seq.max(item.seq);
                    self.items.insert(item.id.clone(), item);
                    restored += 1;
                }
                Err(e) => {
                    warn!(id = %record.id, error = %e, "Skipping unreadable queue record");
                }
            }
        }
        self.seq.store(max_seq, Ordering::Release);

        if restored > 0 {
            info!(restored, "Restored queued items from local store");
        }
        crate::metrics::set_queue_depth(self.depth());
        Ok(restored)
    }

    /// Accept a mutation. Always succeeds locally regardless of network
    /// state; returns the stable client-generated id immediately.
    pub async fn enqueue(
        &self,
        conversation_id: &str,
        payload: Value,
        kind: ItemKind,
    ) -> Result<String, StoreError> {
        if conversation_id.is_empty() {
            return Err(StoreError::Rejected("conversation_id is empty".into()));
        }

        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        let item = QueuedItem::new(conversation_id.to_string(), payload, kind, seq);
        let id = item.id.clone();

        self.persist_item(&item).await?;
        self.items.insert(id.clone(), item);

        crate::metrics::set_queue_depth(self.depth());
        debug!(id = %id, conversation = %conversation_id, kind = %kind, "Item enqueued");
        Ok(id)
    }

    /// Re-queue a local record the consistency checker wants delivered.
    ///
    /// The record's own id is reused so the remote store still deduplicates
    /// if the original delivery half-succeeded.
    pub async fn requeue(&self, record: &LocalRecord) -> Result<String, StoreError> {
        let kind = match record.entity {
            EntityType::Message => ItemKind::Message,
            EntityType::Reaction => ItemKind::Reaction,
            EntityType::Presence => ItemKind::Presence,
            EntityType::QueuedItem => {
                return Err(StoreError::Rejected("queue records cannot be requeued".into()))
            }
        };

        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        let mut item = QueuedItem::new(
            record.conversation_id.clone(),
            record.payload.clone(),
            kind,
            seq,
        );
        item.id = record.id.clone();
        let id = item.id.clone();

        self.persist_item(&item).await?;
        self.items.insert(id.clone(), item);
        crate::metrics::set_queue_depth(self.depth());
        Ok(id)
    }

    /// Transition network state. An offline→online transition triggers an
    /// automatic drain whose outcome is returned.
    pub async fn set_network_state(self: &Arc<Self>, online: bool) -> Option<DrainOutcome> {
        let was_online = self.online.swap(online, Ordering::AcqRel);
        crate::metrics::set_network_online(online);

        if online && !was_online {
            info!("Network regained, draining queue");
            Some(self.drain().await)
        } else {
            if !online && was_online {
                info!("Network lost, queue gated");
            }
            None
        }
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Attempt delivery of all drainable items.
    ///
    /// FIFO within each conversation, parallel across conversations up to the
    /// worker pool size. Returns immediately when offline or shut down.
    pub async fn drain(self: &Arc<Self>) -> DrainOutcome {
        if !self.is_online() || *self.shutdown_rx.borrow() {
            return DrainOutcome::default();
        }

        let conversations: HashSet<String> = self
            .items
            .iter()
            .filter(|r| r.value().is_drainable(self.backoff.max_attempts))
            .map(|r| r.value().conversation_id.clone())
            .collect();

        if conversations.is_empty() {
            self.last_success_at.store(epoch_millis(), Ordering::Release);
            return DrainOutcome::default();
        }

        let mut tasks = JoinSet::new();
        for conversation_id in conversations {
            let queue = Arc::clone(self);
            tasks.spawn(async move { queue.drain_conversation(&conversation_id).await });
        }

        let mut outcome = DrainOutcome::default();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(partial) => outcome.merge(partial),
                Err(e) => warn!(error = %e, "Drain worker panicked or was cancelled"),
            }
        }

        if outcome.failed == 0 {
            self.last_success_at.store(epoch_millis(), Ordering::Release);
        }
        crate::metrics::set_queue_depth(self.depth());
        info!(
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "Drain pass completed"
        );
        outcome
    }

    /// Drain one conversation in enqueue order under its mutex.
    async fn drain_conversation(&self, conversation_id: &str) -> DrainOutcome {
        let mut outcome = DrainOutcome::default();

        let Ok(_permit) = self.workers.acquire().await else {
            return outcome;
        };
        let lock = self
            .conversation_locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let mut ordered: Vec<(u64, String)> = self
            .items
            .iter()
            .filter(|r| r.value().conversation_id == conversation_id)
            .map(|r| (r.value().seq, r.key().clone()))
            .collect();
        ordered.sort_unstable();

        for (_, id) in ordered {
            if *self.shutdown_rx.borrow() {
                debug!(conversation = %conversation_id, "Drain cancelled, leaving items in-flight");
                break;
            }
            if !self.is_online() {
                break;
            }

            let Some(mut item) = self.items.get(&id).map(|r| r.value().clone()) else {
                continue;
            };
            // Terminal failures don't block the rest of the conversation;
            // they only move again via an explicit user retry.
            if item.status == ItemStatus::Failed {
                continue;
            }
            if !item.is_drainable(self.backoff.max_attempts) {
                continue;
            }
            // The head of the line not being backoff-ready stops the pass:
            // attempting a later item first would break FIFO.
            if !self.backoff.is_eligible(&item, epoch_millis()) {
                break;
            }

            item.mark_in_flight();
            self.items.insert(id.clone(), item.clone());
            if let Err(e) = self.persist_item(&item).await {
                warn!(id = %id, error = %e, "Failed to persist in-flight status");
            }

            let event = PublishEvent {
                item_id: item.id.clone(),
                entity: item.kind.entity(),
                conversation_id: item.conversation_id.clone(),
                payload: item.payload.clone(),
            };

            let started = Instant::now();
            let result = tokio::time::timeout(
                self.delivery_timeout,
                self.remote.publish(conversation_id, event),
            )
            .await;
            crate::metrics::record_delivery_latency(started.elapsed());

            match result {
                Ok(Ok(ack)) => {
                    if ack.duplicate {
                        debug!(id = %id, "Remote already had this item (safe redelivery)");
                    }
                    if let Err(e) = self.finish_delivery(&item).await {
                        warn!(id = %id, error = %e, "Delivered item bookkeeping failed");
                    }
                    crate::metrics::record_delivery(item.kind.as_str(), "delivered");
                    outcome.succeeded += 1;
                    outcome.delivered.push(item);
                }
                Ok(Err(StoreError::Rejected(reason))) => {
                    // Conflict: terminal, surfaced for explicit resolution.
                    // Later items in the conversation may still proceed.
                    warn!(id = %id, reason = %reason, "Delivery rejected by remote");
                    item.mark_failed(FailureKind::Conflict, reason);
                    self.items.insert(id.clone(), item.clone());
                    if let Err(e) = self.persist_item(&item).await {
                        warn!(id = %id, error = %e, "Failed to persist conflict status");
                    }
                    crate::metrics::record_delivery(item.kind.as_str(), "rejected");
                    outcome.failed += 1;
                }
                Ok(Err(e)) => {
                    self.note_transient_failure(&mut item, e.to_string()).await;
                    outcome.failed += 1;
                    break;
                }
                Err(_) => {
                    self.note_transient_failure(&mut item, "delivery timed out".to_string())
                        .await;
                    outcome.failed += 1;
                    break;
                }
            }
        }

        outcome
    }

    /// Record a transient failure: back to `Pending` while budget remains,
    /// terminal `Failed` once it is spent.
    async fn note_transient_failure(&self, item: &mut QueuedItem, reason: String) {
        if item.attempts >= self.backoff.max_attempts {
            warn!(
                id = %item.id,
                attempts = item.attempts,
                reason = %reason,
                "Retry budget exhausted, item failed"
            );
            item.mark_failed(FailureKind::Transient, reason);
        } else {
            debug!(
                id = %item.id,
                attempts = item.attempts,
                reason = %reason,
                "Transient delivery failure, will back off"
            );
            item.status = ItemStatus::Pending;
        }
        self.items.insert(item.id.clone(), item.clone());
        if let Err(e) = self.persist_item(item).await {
            warn!(id = %item.id, error = %e, "Failed to persist failure status");
        }
        crate::metrics::record_delivery(item.kind.as_str(), "failed");
    }

    /// Confirmed delivery: write the confirmed entity record and delete the
    /// queue record in one atomic batch, then drop the in-memory entry.
    async fn finish_delivery(&self, item: &QueuedItem) -> Result<(), StoreError> {
        let confirmed = LocalRecord {
            entity: item.kind.entity(),
            id: item.id.clone(),
            conversation_id: item.conversation_id.clone(),
            payload: item.payload.clone(),
            confirmed: true,
            updated_at: self.next_confirm_stamp(),
        };
        self.local
            .write(vec![
                WriteOp::Put(confirmed),
                WriteOp::Delete {
                    entity: EntityType::QueuedItem,
                    id: item.id.clone(),
                },
            ])
            .await?;
        self.items.remove(&item.id);
        Ok(())
    }

    /// Pending, in-flight and failed items for a conversation, in enqueue
    /// order. Failed items are included so the UI can offer a retry.
    #[must_use]
    pub fn list_pending(&self, conversation_id: &str) -> Vec<QueuedItem> {
        let mut items: Vec<QueuedItem> = self
            .items
            .iter()
            .filter(|r| r.value().conversation_id == conversation_id)
            .map(|r| r.value().clone())
            .collect();
        items.sort_unstable_by_key(|i| i.seq);
        items
    }

    /// Explicit user retry of a failed item.
    pub async fn retry_failed(&self, id: &str) -> Result<(), StoreError> {
        let mut item = match self.items.get(id) {
            Some(r) if r.value().status == ItemStatus::Failed => r.value().clone(),
            Some(_) => return Err(StoreError::Rejected("item is not in failed state".into())),
            None => return Err(StoreError::NotFound),
        };
        item.reset_for_retry();
        self.persist_item(&item).await?;
        self.items.insert(id.to_string(), item);
        info!(id = %id, "Failed item reset for retry");
        Ok(())
    }

    /// Items the drain loop may still touch (non-terminal states). The
    /// consistency checker excludes these so it never races a worker.
    #[must_use]
    pub fn active_ids(&self) -> HashSet<String> {
        self.items
            .iter()
            .filter(|r| {
                matches!(
                    r.value().status,
                    ItemStatus::Pending | ItemStatus::InFlight
                )
            })
            .map(|r| r.key().clone())
            .collect()
    }

    /// Pending + in-flight count.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.items
            .iter()
            .filter(|r| {
                matches!(
                    r.value().status,
                    ItemStatus::Pending | ItemStatus::InFlight
                )
            })
            .count()
    }

    /// Terminally failed count.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.items
            .iter()
            .filter(|r| r.value().status == ItemStatus::Failed)
            .count()
    }

    /// Epoch millis of the last clean drain (0 = never).
    #[must_use]
    pub fn last_successful_sync(&self) -> i64 {
        self.last_success_at.load(Ordering::Acquire)
    }

    /// Signal shutdown: drain workers stop between items, in-flight items
    /// stay in-flight and are retried on the next drain.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wall-clock millis, nudged forward so no two confirmations share a
    /// stamp. Confirmed records sort by `updated_at`.
    fn next_confirm_stamp(&self) -> i64 {
        let now = epoch_millis();
        self.confirm_stamp
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(now.max(prev + 1))
            })
            .map(|prev| now.max(prev + 1))
            .unwrap_or(now)
    }

    async fn persist_item(&self, item: &QueuedItem) -> Result<(), StoreError> {
        self.local
            .put(LocalRecord {
                entity: EntityType::QueuedItem,
                id: item.id.clone(),
                conversation_id: item.conversation_id.clone(),
                payload: serde_json::to_value(item)?,
                confirmed: false,
                updated_at: epoch_millis(),
            })
            .await
    }
}
