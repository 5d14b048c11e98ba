// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed local store.
//!
//! The durable implementation of [`LocalStore`]: queued mutations are
//! ordinary records here, so an unsent message survives a process restart.
//! Cache contents deliberately do not live here; losing them on restart is
//! acceptable.
//!
//! Schema:
//! ```sql
//! CREATE TABLE local_records (
//!   entity TEXT NOT NULL,
//!   id TEXT NOT NULL,
//!   conversation_id TEXT NOT NULL,
//!   payload TEXT NOT NULL,        -- JSON as text
//!   confirmed INTEGER NOT NULL,
//!   updated_at INTEGER NOT NULL,
//!   PRIMARY KEY (entity, id)
//! )
//! ```

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::traits::{EntityType, LocalRecord, LocalStore, QueryFilter, StoreError, WriteOp};

pub struct SqliteLocalStore {
    pool: SqlitePool,
}

impl SqliteLocalStore {
    /// Open (or create) the store at the given path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&url)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let store = Self { pool };
        store.enable_wal_mode().await?;
        store.init_schema().await?;

        info!(path = %path.as_ref().display(), "Local store opened");
        Ok(store)
    }

    /// Enable WAL journal mode (concurrent reads during writes, single fsync).
    async fn enable_wal_mode(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        // WAL mode is safe with synchronous = NORMAL
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS local_records (
                entity TEXT NOT NULL,
                id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                confirmed INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (entity, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_records_conversation \
             ON local_records (entity, conversation_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(())
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<LocalRecord, StoreError> {
        let entity: String = row
            .try_get("entity")
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let payload: String = row
            .try_get("payload")
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(LocalRecord {
            entity: parse_entity(&entity)?,
            id: row
                .try_get("id")
                .map_err(|e| StoreError::Backend(e.to_string()))?,
            conversation_id: row
                .try_get("conversation_id")
                .map_err(|e| StoreError::Backend(e.to_string()))?,
            payload: serde_json::from_str(&payload)?,
            confirmed: row
                .try_get::<i64, _>("confirmed")
                .map_err(|e| StoreError::Backend(e.to_string()))?
                != 0,
            updated_at: row
                .try_get("updated_at")
                .map_err(|e| StoreError::Backend(e.to_string()))?,
        })
    }
}

fn parse_entity(s: &str) -> Result<EntityType, StoreError> {
    match s {
        "message" => Ok(EntityType::Message),
        "reaction" => Ok(EntityType::Reaction),
        "presence" => Ok(EntityType::Presence),
        "queued_item" => Ok(EntityType::QueuedItem),
        other => Err(StoreError::Backend(format!("unknown entity type: {}", other))),
    }
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn find(&self, entity: EntityType, id: &str) -> Result<Option<LocalRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT entity, id, conversation_id, payload, confirmed, updated_at \
             FROM local_records WHERE entity = ? AND id = ?",
        )
        .bind(entity.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn query(
        &self,
        entity: EntityType,
        filter: &QueryFilter,
    ) -> Result<Vec<LocalRecord>, StoreError> {
        let mut sql = String::from(
            "SELECT entity, id, conversation_id, payload, confirmed, updated_at \
             FROM local_records WHERE entity = ?",
        );
        if filter.conversation_id.is_some() {
            sql.push_str(" AND conversation_id = ?");
        }
        if filter.confirmed.is_some() {
            sql.push_str(" AND confirmed = ?");
        }
        sql.push_str(" ORDER BY updated_at, id");

        let mut query = sqlx::query(&sql).bind(entity.as_str());
        if let Some(ref conversation_id) = filter.conversation_id {
            query = query.bind(conversation_id);
        }
        if let Some(confirmed) = filter.confirmed {
            query = query.bind(confirmed as i64);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        // One transaction per batch: all ops apply or none do
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        for op in &ops {
            match op {
                WriteOp::Put(record) => {
                    let payload = serde_json::to_string(&record.payload)?;
                    sqlx::query(
                        "INSERT INTO local_records \
                         (entity, id, conversation_id, payload, confirmed, updated_at) \
                         VALUES (?, ?, ?, ?, ?, ?) \
                         ON CONFLICT (entity, id) DO UPDATE SET \
                         conversation_id = excluded.conversation_id, \
                         payload = excluded.payload, \
                         confirmed = excluded.confirmed, \
                         updated_at = excluded.updated_at",
                    )
                    .bind(record.entity.as_str())
                    .bind(&record.id)
                    .bind(&record.conversation_id)
                    .bind(payload)
                    .bind(record.confirmed as i64)
                    .bind(record.updated_at)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                }
                WriteOp::Delete { entity, id } => {
                    sqlx::query("DELETE FROM local_records WHERE entity = ? AND id = ?")
                        .bind(entity.as_str())
                        .bind(id)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| StoreError::Backend(e.to_string()))?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        debug!(ops = ops.len(), "Local write batch committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> SqliteLocalStore {
        SqliteLocalStore::new(dir.path().join("local.db"))
            .await
            .unwrap()
    }

    fn record(id: &str, confirmed: bool) -> LocalRecord {
        LocalRecord {
            entity: EntityType::Message,
            id: id.to_string(),
            conversation_id: "c-1".into(),
            payload: json!({"content": id}),
            confirmed,
            updated_at: crate::queue_item::epoch_millis(),
        }
    }

    #[tokio::test]
    async fn test_put_find_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.put(record("m-1", false)).await.unwrap();

        let found = store
            .find(EntityType::Message, "m-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.conversation_id, "c-1");
        assert_eq!(found.payload["content"], "m-1");
        assert!(!found.confirmed);
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.put(record("m-1", false)).await.unwrap();
        store.put(record("m-1", true)).await.unwrap();

        let found = store
            .find(EntityType::Message, "m-1")
            .await
            .unwrap()
            .unwrap();
        assert!(found.confirmed);
    }

    #[tokio::test]
    async fn test_query_with_filters() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.put(record("m-1", true)).await.unwrap();
        store.put(record("m-2", false)).await.unwrap();

        let unconfirmed = store
            .query(
                EntityType::Message,
                &QueryFilter {
                    conversation_id: Some("c-1".into()),
                    confirmed: Some(false),
                },
            )
            .await
            .unwrap();
        assert_eq!(unconfirmed.len(), 1);
        assert_eq!(unconfirmed[0].id, "m-2");
    }

    #[tokio::test]
    async fn test_write_batch_is_atomic_unit() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store
            .write(vec![
                WriteOp::Put(record("m-1", false)),
                WriteOp::Put(record("m-2", false)),
                WriteOp::Delete {
                    entity: EntityType::Message,
                    id: "m-1".into(),
                },
            ])
            .await
            .unwrap();

        assert!(store
            .find(EntityType::Message, "m-1")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find(EntityType::Message, "m-2")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir).await;
            store.put(record("m-1", false)).await.unwrap();
        }

        // Reopen the same file: the record must still be there
        let store = open_store(&dir).await;
        let found = store.find(EntityType::Message, "m-1").await.unwrap();
        assert!(found.is_some());
    }
}
