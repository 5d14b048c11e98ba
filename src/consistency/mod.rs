// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cross-store consistency checking and repair.
//!
//! The checker compares the device-local store against the remote store and
//! reports orphans, divergent payloads and dangling references. With
//! auto-repair on it fixes what it safely can:
//!
//! - **orphan-local** records are handed back for re-queueing, never deleted;
//!   an unsynced write is user data.
//! - **orphan-remote** records are pulled down and written locally as
//!   confirmed.
//! - **divergent** payloads are flagged by default; last-writer-wins with the
//!   remote as writer of record is opt-in.
//! - **missing references** are backfilled from the remote store when the
//!   referenced entity still exists there.
//!
//! A scan failure on one entity type degrades the run (the report is marked
//! partial) instead of failing it; when only the remote side is unreachable
//! the local-only detectors still run. The checker holds no queue handle; the
//! caller applies the requeue list, which keeps the two components testable
//! in isolation.

pub mod report;

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::queue_item::epoch_millis;
use crate::store::traits::{
    EntityType, LocalRecord, LocalStore, QueryFilter, RemoteStore, StoreError,
};

use report::{CheckOptions, ConsistencyReport, DivergenceResolution, Issue, IssueKind};

/// Report plus the orphan-local records the caller should re-queue.
#[derive(Debug)]
pub struct CheckOutcome {
    pub report: ConsistencyReport,
    pub requeue: Vec<LocalRecord>,
}

pub struct ConsistencyChecker {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    divergence: DivergenceResolution,
}

impl ConsistencyChecker {
    pub fn new(local: Arc<dyn LocalStore>, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            local,
            remote,
            divergence: DivergenceResolution::default(),
        }
    }

    #[must_use]
    pub fn with_divergence_resolution(mut self, resolution: DivergenceResolution) -> Self {
        self.divergence = resolution;
        self
    }

    /// Run one check over all scanned entity types.
    ///
    /// `exclude` holds entity ids the sync queue may still deliver; they are
    /// skipped entirely so the checker never races an in-flight delivery.
    pub async fn perform_check(
        &self,
        options: CheckOptions,
        exclude: &HashSet<String>,
    ) -> CheckOutcome {
        let started_at = epoch_millis();
        let mut run = ScanRun::default();

        for entity in EntityType::SCANNED {
            if let Err(e) = self.scan_entity(entity, options, exclude, &mut run).await {
                warn!(entity = %entity, error = %e, "Entity scan failed, continuing degraded");
                run.scan_errors.push(format!("{}: {}", entity, e));
            }
        }

        for kind in [
            IssueKind::OrphanLocal,
            IssueKind::OrphanRemote,
            IssueKind::DivergentField,
            IssueKind::MissingReference,
        ] {
            let found = run.issues_found.iter().filter(|i| i.kind == kind).count();
            let repaired = run.issues_repaired.iter().filter(|i| i.kind == kind).count();
            if found > 0 || repaired > 0 {
                crate::metrics::record_consistency_issues(kind.as_str(), found, repaired);
            }
        }

        let report = ConsistencyReport {
            id: uuid::Uuid::new_v4().to_string(),
            started_at,
            finished_at: epoch_millis(),
            partial: !run.scan_errors.is_empty(),
            issues_found: run.issues_found,
            issues_repaired: run.issues_repaired,
            auto_repair: options.auto_repair,
            scan_errors: run.scan_errors,
        };
        info!(
            report = %report.id,
            found = report.issues_found.len(),
            repaired = report.issues_repaired.len(),
            partial = report.partial,
            "Consistency check finished"
        );

        CheckOutcome {
            report,
            requeue: run.requeue,
        }
    }

    async fn scan_entity(
        &self,
        entity: EntityType,
        options: CheckOptions,
        exclude: &HashSet<String>,
        run: &mut ScanRun,
    ) -> Result<(), StoreError> {
        let local_records = self.local.query(entity, &QueryFilter::default()).await?;
        let local_ids: HashSet<&str> = local_records.iter().map(|r| r.id.as_str()).collect();

        // A failed remote listing degrades this entity to a local-only scan;
        // the cross-store detectors need the remote id set, the reference
        // detector below does not.
        let remote_ids: Option<HashSet<String>> = match self.remote.list_ids(entity).await {
            Ok(ids) => Some(ids.into_iter().collect()),
            Err(e) => {
                warn!(entity = %entity, error = %e, "Remote listing failed, scanning local side only");
                run.scan_errors.push(format!("{}: {}", entity, e));
                None
            }
        };

        debug!(
            entity = %entity,
            local = local_records.len(),
            remote = remote_ids.as_ref().map_or(0, HashSet::len),
            "Scanning entity"
        );

        if let Some(remote_ids) = &remote_ids {
            if options.include_orphans {
                for record in &local_records {
                    if exclude.contains(&record.id) || remote_ids.contains(&record.id) {
                        continue;
                    }
                    let issue = Issue {
                        kind: IssueKind::OrphanLocal,
                        entity_type: entity,
                        entity_id: record.id.clone(),
                        detail: "present locally, missing from remote store".into(),
                    };
                    run.issues_found.push(issue.clone());
                    if options.auto_repair {
                        // Repair is re-delivery, never deletion
                        run.requeue.push(record.clone());
                        run.issues_repaired.push(issue);
                    }
                }

                for id in remote_ids {
                    if exclude.contains(id) || local_ids.contains(id.as_str()) {
                        continue;
                    }
                    let issue = Issue {
                        kind: IssueKind::OrphanRemote,
                        entity_type: entity,
                        entity_id: id.clone(),
                        detail: "present remotely, missing from local store".into(),
                    };
                    run.issues_found.push(issue.clone());
                    if options.auto_repair && self.pull_remote(entity, id).await {
                        run.issues_repaired.push(issue);
                    }
                }
            }

            // Divergence only applies to confirmed records: an unconfirmed
            // local record legitimately differs from the remote until it
            // syncs.
            for record in &local_records {
                if !record.confirmed
                    || exclude.contains(&record.id)
                    || !remote_ids.contains(&record.id)
                {
                    continue;
                }
                let remote_record = match self.remote.fetch(entity, &record.id).await {
                    Ok(Some(remote_record)) => remote_record,
                    Ok(None) => continue, // deleted between list and fetch
                    Err(e) => {
                        warn!(entity = %entity, id = %record.id, error = %e, "Fetch for comparison failed");
                        continue;
                    }
                };
                if fingerprint(&record.payload) == fingerprint(&remote_record.payload) {
                    continue;
                }

                let issue = Issue {
                    kind: IssueKind::DivergentField,
                    entity_type: entity,
                    entity_id: record.id.clone(),
                    detail: "local and remote payloads differ".into(),
                };
                run.issues_found.push(issue.clone());
                if options.auto_repair && self.divergence == DivergenceResolution::PreferRemote {
                    let repaired = LocalRecord {
                        entity,
                        id: remote_record.id,
                        conversation_id: remote_record.conversation_id,
                        payload: remote_record.payload,
                        confirmed: true,
                        updated_at: epoch_millis(),
                    };
                    if self.local.put(repaired).await.is_ok() {
                        run.issues_repaired.push(issue);
                    }
                }
            }
        }

        if entity == EntityType::Message {
            self.scan_references(&local_records, &local_ids, options, exclude, run)
                .await;
        }

        Ok(())
    }

    /// Flag messages whose `reply_to` points at a message that no longer
    /// exists locally; backfill from the remote store where possible.
    async fn scan_references(
        &self,
        local_records: &[LocalRecord],
        local_ids: &HashSet<&str>,
        options: CheckOptions,
        exclude: &HashSet<String>,
        run: &mut ScanRun,
    ) {
        for record in local_records {
            if exclude.contains(&record.id) {
                continue;
            }
            let Some(target) = record.payload.get("reply_to").and_then(Value::as_str) else {
                continue;
            };
            if local_ids.contains(target) {
                continue;
            }

            let issue = Issue {
                kind: IssueKind::MissingReference,
                entity_type: EntityType::Message,
                entity_id: record.id.clone(),
                detail: format!("reply_to target {} not found locally", target),
            };
            run.issues_found.push(issue.clone());
            if options.auto_repair && self.pull_remote(EntityType::Message, target).await {
                run.issues_repaired.push(issue);
            }
        }
    }

    /// Copy one remote record into the local store as confirmed.
    async fn pull_remote(&self, entity: EntityType, id: &str) -> bool {
        let record = match self.remote.fetch(entity, id).await {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(e) => {
                warn!(entity = %entity, id = %id, error = %e, "Pull for repair failed");
                return false;
            }
        };
        let result = self
            .local
            .put(LocalRecord {
                entity,
                id: record.id,
                conversation_id: record.conversation_id,
                payload: record.payload,
                confirmed: true,
                updated_at: epoch_millis(),
            })
            .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(entity = %entity, id = %id, error = %e, "Local write for repair failed");
                false
            }
        }
    }
}

#[derive(Default)]
struct ScanRun {
    issues_found: Vec<Issue>,
    issues_repaired: Vec<Issue>,
    scan_errors: Vec<String>,
    requeue: Vec<LocalRecord>,
}

/// Content fingerprint over the canonical JSON form.
fn fingerprint(value: &Value) -> String {
    hex::encode(Sha256::digest(value.to_string().as_bytes()))
}
