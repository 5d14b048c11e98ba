// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fixed-cap batching for bulk transmission and storage.
//!
//! Callers hand over an arbitrary number of items; the planner splits them
//! into batches of at most the configured cap. Planning never blocks and
//! never fails: excess items simply flow into subsequent batches.
//!
//! # Example
//!
//! ```
//! use community_sync::{BatchPlanner, SizedItem};
//!
//! struct Note(String);
//! impl SizedItem for Note {
//!     fn size_bytes(&self) -> usize { self.0.len() }
//! }
//!
//! let planner = BatchPlanner::new(2);
//! let batches = planner.plan(
//!     vec![Note("a".into()), Note("b".into()), Note("c".into())],
//!     "conv-1",
//! );
//! assert_eq!(batches.len(), 2);
//! assert_eq!(batches[0].items.len(), 2);
//! assert_eq!(batches[1].items.len(), 1);
//! ```

use tracing::debug;

use crate::config::SyncConfig;

/// Items that know their own serialized size.
pub trait SizedItem {
    #[must_use]
    fn size_bytes(&self) -> usize;
}

/// A group of items bound for one conversation.
#[derive(Debug)]
pub struct Batch<T> {
    pub conversation_id: String,
    pub items: Vec<T>,
    pub total_bytes: usize,
}

impl<T> Batch<T> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Splits item sets into fixed-cap batches.
#[derive(Debug, Clone)]
pub struct BatchPlanner {
    cap: usize,
}

impl BatchPlanner {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self { cap: cap.max(1) }
    }

    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.batch_max_items)
    }

    #[must_use]
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Split `items` into batches of at most `cap` items each, preserving
    /// order. An empty input yields no batches.
    pub fn plan<T: SizedItem>(&self, items: Vec<T>, conversation_id: &str) -> Vec<Batch<T>> {
        if items.is_empty() {
            return Vec::new();
        }

        let mut batches = Vec::with_capacity(items.len().div_ceil(self.cap));
        let mut current: Vec<T> = Vec::with_capacity(self.cap.min(items.len()));
        let mut current_bytes = 0usize;

        for item in items {
            current_bytes += item.size_bytes();
            current.push(item);
            if current.len() == self.cap {
                batches.push(Batch {
                    conversation_id: conversation_id.to_string(),
                    items: std::mem::take(&mut current),
                    total_bytes: std::mem::take(&mut current_bytes),
                });
            }
        }
        if !current.is_empty() {
            batches.push(Batch {
                conversation_id: conversation_id.to_string(),
                items: current,
                total_bytes: current_bytes,
            });
        }

        debug!(
            batches = batches.len(),
            conversation = %conversation_id,
            "Batch plan created"
        );
        batches
    }
}

impl Default for BatchPlanner {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}
