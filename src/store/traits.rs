// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found")]
    NotFound,
    /// Transient: timeouts, connection errors. Retried with backoff.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    /// The remote store refused the write. Never auto-retried.
    #[error("Write rejected: {0}")]
    Rejected(String),
    #[error("Store backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether retrying this error can succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Entity types known to both stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Message,
    Reaction,
    Presence,
    /// Queue bookkeeping records; local-only, never scanned for consistency
    QueuedItem,
}

impl EntityType {
    /// Entity types the consistency checker scans (queue records excluded).
    pub const SCANNED: [EntityType; 3] = [Self::Message, Self::Reaction, Self::Presence];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Reaction => "reaction",
            Self::Presence => "presence",
            Self::QueuedItem => "queued_item",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A record in the device-local store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalRecord {
    pub entity: EntityType,
    pub id: String,
    pub conversation_id: String,
    pub payload: Value,
    /// True once the remote store has acknowledged this record.
    /// Unconfirmed records are local-only writes awaiting sync.
    pub confirmed: bool,
    /// Epoch millis
    pub updated_at: i64,
}

/// A record as seen by the remote store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub entity: EntityType,
    pub id: String,
    pub conversation_id: String,
    pub payload: Value,
    /// Epoch millis
    pub updated_at: i64,
}

/// Filter for [`LocalStore::query`].
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub conversation_id: Option<String>,
    pub confirmed: Option<bool>,
}

/// One mutation inside an atomic write batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put(LocalRecord),
    Delete { entity: EntityType, id: String },
}

/// Device-local persistent store.
///
/// `write` is the scoped-transaction primitive: all ops in the batch apply
/// or none do. Single-record atomicity is assumed from the underlying
/// persistence layer; this trait adds nothing beyond batch atomicity.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn find(&self, entity: EntityType, id: &str) -> Result<Option<LocalRecord>, StoreError>;

    async fn query(
        &self,
        entity: EntityType,
        filter: &QueryFilter,
    ) -> Result<Vec<LocalRecord>, StoreError>;

    /// Apply all ops atomically.
    async fn write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError>;

    /// Convenience: single-record put.
    async fn put(&self, record: LocalRecord) -> Result<(), StoreError> {
        self.write(vec![WriteOp::Put(record)]).await
    }
}

/// An outbound event published to a conversation channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishEvent {
    /// Client-generated id; the remote side deduplicates on it, so
    /// redelivery of an already-delivered event is a safe no-op
    pub item_id: String,
    pub entity: EntityType,
    pub conversation_id: String,
    pub payload: Value,
}

/// Remote acknowledgement of a publish.
#[derive(Debug, Clone)]
pub struct PublishAck {
    pub item_id: String,
    /// True when the remote store had already persisted this id
    pub duplicate: bool,
}

/// An incoming event observed on a conversation channel.
#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub conversation_id: String,
    pub entity: EntityType,
    pub entity_id: String,
    pub payload: Value,
}

/// The remote service: request/response CRUD plus per-conversation pub/sub.
///
/// `publish` is the delivery primitive for the sync queue; `subscribe`
/// returns an explicit channel (bounded mpsc) rather than registering a
/// callback, so ordering and cancellation stay observable.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch(&self, entity: EntityType, id: &str)
        -> Result<Option<RemoteRecord>, StoreError>;

    async fn list_ids(&self, entity: EntityType) -> Result<Vec<String>, StoreError>;

    async fn publish(
        &self,
        conversation_id: &str,
        event: PublishEvent,
    ) -> Result<PublishAck, StoreError>;

    fn subscribe(&self, conversation_id: &str) -> mpsc::Receiver<RemoteEvent>;
}
