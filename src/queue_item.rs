// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queued mutation data structure.
//!
//! The [`QueuedItem`] is the unit of outbound work: a pending local mutation
//! waiting to reach the remote store. Its `id` is client-generated and stable
//! across retries, which is what makes redelivery a safe no-op remotely.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::batch::SizedItem;
use crate::store::traits::EntityType;

/// The kind of mutation carried by a queued item.
///
/// A closed set: delivery dispatch matches on this enum rather than
/// inspecting the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Message,
    Reaction,
    Presence,
}

impl ItemKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Reaction => "reaction",
            Self::Presence => "presence",
        }
    }

    /// The entity type the delivered record is stored under.
    #[must_use]
    pub fn entity(&self) -> EntityType {
        match self {
            Self::Message => EntityType::Message,
            Self::Reaction => EntityType::Reaction,
            Self::Presence => EntityType::Presence,
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Delivery status of a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting for delivery
    Pending,
    /// A drain worker is attempting delivery right now (or was interrupted
    /// mid-attempt; stale in-flight items are retried on the next drain)
    InFlight,
    /// Confirmed by the remote store
    Delivered,
    /// Delivery gave up (retry budget exhausted or remote rejection);
    /// retained for explicit user retry, never silently dropped
    Failed,
}

/// Why an item failed, when it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeouts / connection errors; retried until the budget runs out
    Transient,
    /// The remote store rejected the write (e.g. referenced entity deleted);
    /// never auto-retried
    Conflict,
}

/// A pending mutation owned by the sync queue.
///
/// # Example
///
/// ```
/// use community_sync::{QueuedItem, ItemKind, ItemStatus};
/// use serde_json::json;
///
/// let item = QueuedItem::new(
///     "conv-42".into(),
///     json!({"content": "hello", "sender_id": "user-1"}),
///     ItemKind::Message,
///     7,
/// );
///
/// assert_eq!(item.status, ItemStatus::Pending);
/// assert_eq!(item.attempts, 0);
/// assert!(!item.id.is_empty());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedItem {
    /// Client-generated id (UUID v4), stable across retries
    pub id: String,
    /// Monotonic enqueue sequence; per-conversation FIFO key
    pub seq: u64,
    /// Conversation this mutation belongs to
    pub conversation_id: String,
    /// Opaque mutation content
    pub payload: Value,
    pub kind: ItemKind,
    pub status: ItemStatus,
    /// Delivery attempts so far
    pub attempts: u32,
    /// Set when `status == Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Human-readable failure detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Epoch millis
    pub created_at: i64,
    /// Epoch millis of the last delivery attempt (0 = never attempted)
    pub last_attempt_at: i64,
}

impl QueuedItem {
    pub fn new(conversation_id: String, payload: Value, kind: ItemKind, seq: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            seq,
            conversation_id,
            payload,
            kind,
            status: ItemStatus::Pending,
            attempts: 0,
            failure: None,
            failure_reason: None,
            created_at: epoch_millis(),
            last_attempt_at: 0,
        }
    }

    /// Whether the drain loop should still attempt this item.
    ///
    /// Terminal `Failed` items (budget exhausted or conflict) are excluded;
    /// they only move again via an explicit user retry.
    #[must_use]
    pub fn is_drainable(&self, max_attempts: u32) -> bool {
        match self.status {
            ItemStatus::Delivered => false,
            ItemStatus::Failed => false,
            ItemStatus::Pending | ItemStatus::InFlight => self.attempts < max_attempts,
        }
    }

    /// Reset a failed item for explicit user retry.
    pub fn reset_for_retry(&mut self) {
        self.status = ItemStatus::Pending;
        self.attempts = 0;
        self.failure = None;
        self.failure_reason = None;
    }

    pub(crate) fn mark_in_flight(&mut self) {
        self.status = ItemStatus::InFlight;
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt_at = epoch_millis();
    }

    pub(crate) fn mark_failed(&mut self, kind: FailureKind, reason: impl Into<String>) {
        self.status = ItemStatus::Failed;
        self.failure = Some(kind);
        self.failure_reason = Some(reason.into());
    }
}

impl SizedItem for QueuedItem {
    fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.id.len()
            + self.conversation_id.len()
            + self.payload.to_string().len()
            + self.failure_reason.as_ref().map_or(0, String::len)
    }
}

pub(crate) fn epoch_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item() -> QueuedItem {
        QueuedItem::new("conv-1".into(), json!({"content": "hi"}), ItemKind::Message, 1)
    }

    #[test]
    fn test_new_item_is_pending() {
        let item = item();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.attempts, 0);
        assert!(item.failure.is_none());
        assert!(item.created_at > 0);
        assert_eq!(item.last_attempt_at, 0);
    }

    #[test]
    fn test_ids_are_unique_and_stable() {
        let a = item();
        let b = item();
        assert_ne!(a.id, b.id);

        let mut c = a.clone();
        c.mark_in_flight();
        c.mark_failed(FailureKind::Transient, "timeout");
        c.reset_for_retry();
        assert_eq!(c.id, a.id, "id must survive the full retry lifecycle");
    }

    #[test]
    fn test_drainable_transitions() {
        let mut item = item();
        assert!(item.is_drainable(3));

        item.mark_in_flight();
        assert_eq!(item.status, ItemStatus::InFlight);
        assert_eq!(item.attempts, 1);
        // Interrupted in-flight items are still drainable
        assert!(item.is_drainable(3));

        item.mark_failed(FailureKind::Conflict, "referenced entity deleted");
        assert!(!item.is_drainable(3));
        assert_eq!(item.failure, Some(FailureKind::Conflict));
    }

    #[test]
    fn test_attempt_budget_exhaustion() {
        let mut item = item();
        for _ in 0..3 {
            item.mark_in_flight();
            item.status = ItemStatus::Pending; // simulate failed attempt, still retryable
        }
        assert!(!item.is_drainable(3), "budget of 3 is spent");
        assert!(item.is_drainable(5));
    }

    #[test]
    fn test_reset_for_retry() {
        let mut item = item();
        item.mark_in_flight();
        item.mark_failed(FailureKind::Transient, "timeout");

        item.reset_for_retry();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.attempts, 0);
        assert!(item.failure.is_none());
        assert!(item.failure_reason.is_none());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let item = item();
        let json_str = serde_json::to_string(&item).unwrap();
        let back: QueuedItem = serde_json::from_str(&json_str).unwrap();

        assert_eq!(back.id, item.id);
        assert_eq!(back.seq, item.seq);
        assert_eq!(back.status, ItemStatus::Pending);
        assert_eq!(back.payload, item.payload);
    }

    #[test]
    fn test_serialize_skips_none_failure() {
        let item = item();
        let json_str = serde_json::to_string(&item).unwrap();
        assert!(!json_str.contains("failure"));
    }

    #[test]
    fn test_size_bytes() {
        let item = item();
        assert!(item.size_bytes() > std::mem::size_of::<QueuedItem>());
    }
}
