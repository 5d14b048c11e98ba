// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde::{Deserialize, Serialize};

use crate::store::traits::EntityType;

/// What a checker run should do.
#[derive(Debug, Clone, Copy)]
pub struct CheckOptions {
    /// Apply repairs instead of only reporting
    pub auto_repair: bool,
    /// Scan for orphans (the expensive cross-store id comparison)
    pub include_orphans: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            auto_repair: false,
            include_orphans: true,
        }
    }
}

/// How divergent payloads are resolved when auto-repair is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DivergenceResolution {
    /// Report only; leave both sides untouched
    #[default]
    Flag,
    /// Last-writer-wins with the remote store as the writer of record
    PreferRemote,
}

/// Kinds of cross-store inconsistency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Present locally, absent remotely
    OrphanLocal,
    /// Present remotely, absent locally
    OrphanRemote,
    /// Present in both with differing payloads
    DivergentField,
    /// A payload references an entity that no longer exists
    MissingReference,
}

impl IssueKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrphanLocal => "orphan_local",
            Self::OrphanRemote => "orphan_remote",
            Self::DivergentField => "divergent_field",
            Self::MissingReference => "missing_reference",
        }
    }
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One detected inconsistency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub detail: String,
}

/// Append-only audit record of one checker run. Never mutated after the run
/// that produced it finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub id: String,
    /// Epoch millis
    pub started_at: i64,
    pub finished_at: i64,
    pub issues_found: Vec<Issue>,
    pub issues_repaired: Vec<Issue>,
    pub auto_repair: bool,
    /// True when one or more entity scans failed and were skipped
    pub partial: bool,
    pub scan_errors: Vec<String>,
}

impl ConsistencyReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.issues_found.is_empty() && !self.partial
    }
}
