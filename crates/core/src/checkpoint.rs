//! Checkpoints: a named capture of selected entities plus the audit cursor,
//! later either kept (discarded as a restore point) or recovered (every
//! captured entity put back, atomically).
//!
//! Lifecycle: `created -> kept` or `created -> recovered`. Both ends are
//! terminal.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tether_storage::{Actor, EntityRef, Repository, StoredEntity, Timestamp};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::CheckpointConfig;
use crate::error::WorkflowError;
use crate::metadata::{MetaKey, Metadata, TransitionKind};
use crate::txn::{require_actor, require_non_blank, resolve_at, settle, Transition, NONE_STATE};

/// Entity type under which checkpoints are persisted.
pub const CHECKPOINT_ENTITY: &str = "checkpoint";

// ── Types ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Created,
    Kept,
    Recovered,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Kept => "kept",
            Self::Recovered => "recovered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Created)
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured entity. `state` is present exactly when `existed` is true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub entity_type: String,
    pub entity_id: String,
    pub existed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

impl SnapshotEntry {
    fn capture(entity_ref: &EntityRef, current: Option<StoredEntity>) -> Self {
        Self {
            entity_type: entity_ref.entity_type.clone(),
            entity_id: entity_ref.entity_id.clone(),
            existed: current.is_some(),
            state: current.map(|e| e.value),
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(&self.entity_type, &self.entity_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub name: String,
    pub snapshot_entity_refs: Vec<EntityRef>,
    pub snapshot_entities: Vec<SnapshotEntry>,
    /// Hex SHA-256 of the canonical JSON of `snapshot_entities`.
    pub snapshot_digest: String,
    pub audit_cursor: u64,
    pub rollback_target: String,
    pub status: CheckpointStatus,
    pub created_by: Actor,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered_at: Option<Timestamp>,
}

/// Input to [`CheckpointManager::create`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointRequest {
    pub name: String,
    pub snapshot_entity_refs: Vec<EntityRef>,
    pub audit_cursor: u64,
    pub rollback_target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryResult {
    pub checkpoint: Checkpoint,
    /// Every captured ref, in capture order, whether rewritten or removed.
    pub restored: Vec<EntityRef>,
    pub rollback_target: String,
}

// ── Manager ───────────────────────────────────────────────────────────────────

pub struct CheckpointManager<R> {
    repo: Arc<R>,
    config: CheckpointConfig,
}

impl<R> Clone for CheckpointManager<R> {
    fn clone(&self) -> Self {
        Self {
            repo: self.repo.clone(),
            config: self.config.clone(),
        }
    }
}

impl<R: Repository> CheckpointManager<R> {
    pub fn new(repo: Arc<R>, config: CheckpointConfig) -> Self {
        Self { repo, config }
    }

    /// Capture the current state of every requested ref and persist a new
    /// checkpoint in `created`.
    pub async fn create(
        &self,
        request: CheckpointRequest,
        actor: &Actor,
        at: Option<Timestamp>,
    ) -> Result<Checkpoint, WorkflowError> {
        require_actor(actor)?;
        require_non_blank("checkpoint name", &request.name)?;
        require_non_blank("rollback target", &request.rollback_target)?;
        let refs = self.normalize_refs(request.snapshot_entity_refs)?;
        let at = resolve_at(at);

        let mut snapshot = self.repo.begin_snapshot().await?;
        let outcome = self
            .create_in(
                &mut snapshot,
                request.name,
                refs,
                request.audit_cursor,
                request.rollback_target,
                actor,
                at,
            )
            .await;
        let checkpoint = settle(self.repo.as_ref(), snapshot, outcome).await?;

        info!(
            entity_type = CHECKPOINT_ENTITY,
            entity_id = %checkpoint.id,
            from = NONE_STATE,
            to = "created",
            actor = %actor,
            refs = checkpoint.snapshot_entity_refs.len(),
            "checkpoint created"
        );
        Ok(checkpoint)
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_in(
        &self,
        snapshot: &mut R::Snapshot,
        name: String,
        refs: Vec<EntityRef>,
        audit_cursor: u64,
        rollback_target: String,
        actor: &Actor,
        at: Timestamp,
    ) -> Result<Checkpoint, WorkflowError> {
        let mut entries = Vec::with_capacity(refs.len());
        for entity_ref in &refs {
            let current = self
                .repo
                .get_entity_for_update(snapshot, &entity_ref.entity_type, &entity_ref.entity_id)
                .await?;
            entries.push(SnapshotEntry::capture(entity_ref, current));
        }

        let id = Uuid::new_v4().to_string();
        let checkpoint = Checkpoint {
            snapshot_digest: snapshot_digest(&id, &entries)?,
            id,
            name,
            snapshot_entity_refs: refs,
            snapshot_entities: entries,
            audit_cursor,
            rollback_target,
            status: CheckpointStatus::Created,
            created_by: actor.clone(),
            created_at: at,
            updated_at: at,
            recovered_at: None,
        };
        self.store(snapshot, &checkpoint).await?;

        let transition = Transition::new(
            CHECKPOINT_ENTITY,
            &checkpoint.id,
            NONE_STATE,
            CheckpointStatus::Created.as_str(),
            actor,
            at,
        )
        .reason(format!("checkpoint '{}' created", checkpoint.name))
        .metadata(
            Metadata::new(TransitionKind::CheckpointCreated)
                .with(MetaKey::CheckpointName, checkpoint.name.as_str())
                .with(MetaKey::AuditCursor, checkpoint.audit_cursor.to_string())
                .with(MetaKey::RollbackTarget, checkpoint.rollback_target.as_str())
                .with(MetaKey::RefCount, checkpoint.snapshot_entity_refs.len().to_string()),
        )
        .build();
        self.repo.append_audit_transition(snapshot, transition).await?;
        Ok(checkpoint)
    }

    pub async fn inspect(&self, checkpoint_id: &str) -> Result<Checkpoint, WorkflowError> {
        let stored = self
            .repo
            .get_entity(CHECKPOINT_ENTITY, checkpoint_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found(CHECKPOINT_ENTITY, checkpoint_id))?;
        decode(stored)
    }

    /// Checkpoints, newest `created_at` first, optionally narrowed to one
    /// status.
    pub async fn list(
        &self,
        status: Option<CheckpointStatus>,
    ) -> Result<Vec<Checkpoint>, WorkflowError> {
        let mut checkpoints = Vec::new();
        for stored in self.repo.list_entities(CHECKPOINT_ENTITY).await? {
            let checkpoint = decode(stored)?;
            if status.map_or(true, |s| s == checkpoint.status) {
                checkpoints.push(checkpoint);
            }
        }
        checkpoints.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(checkpoints)
    }

    /// Retire the checkpoint without restoring anything.
    pub async fn keep(
        &self,
        checkpoint_id: &str,
        actor: &Actor,
        at: Option<Timestamp>,
    ) -> Result<Checkpoint, WorkflowError> {
        require_actor(actor)?;
        let at = resolve_at(at);

        let mut snapshot = self.repo.begin_snapshot().await?;
        let outcome = self.keep_in(&mut snapshot, checkpoint_id, actor, at).await;
        let result = settle(self.repo.as_ref(), snapshot, outcome).await;

        match &result {
            Ok(_) => info!(
                entity_type = CHECKPOINT_ENTITY,
                entity_id = checkpoint_id,
                from = "created",
                to = "kept",
                actor = %actor,
                "checkpoint kept"
            ),
            Err(err) => debug!(
                entity_type = CHECKPOINT_ENTITY,
                entity_id = checkpoint_id,
                actor = %actor,
                error = %err,
                "checkpoint keep rejected"
            ),
        }
        result
    }

    async fn keep_in(
        &self,
        snapshot: &mut R::Snapshot,
        checkpoint_id: &str,
        actor: &Actor,
        at: Timestamp,
    ) -> Result<Checkpoint, WorkflowError> {
        let mut checkpoint = self.load_open(snapshot, checkpoint_id).await?;
        checkpoint.status = CheckpointStatus::Kept;
        checkpoint.updated_at = at;
        self.store(snapshot, &checkpoint).await?;

        let transition = Transition::new(
            CHECKPOINT_ENTITY,
            &checkpoint.id,
            CheckpointStatus::Created.as_str(),
            CheckpointStatus::Kept.as_str(),
            actor,
            at,
        )
        .reason(format!("checkpoint '{}' kept", checkpoint.name))
        .metadata(
            Metadata::new(TransitionKind::CheckpointKept)
                .with(MetaKey::CheckpointName, checkpoint.name.as_str()),
        )
        .build();
        self.repo.append_audit_transition(snapshot, transition).await?;
        Ok(checkpoint)
    }

    /// Put every captured entity back the way it was and retire the
    /// checkpoint.
    ///
    /// Entities that did not exist at capture time are removed. All restores,
    /// the status write and the audit append share one snapshot: any failure
    /// leaves entities, checkpoint and trail as they were.
    pub async fn recover(
        &self,
        checkpoint_id: &str,
        actor: &Actor,
        at: Option<Timestamp>,
    ) -> Result<RecoveryResult, WorkflowError> {
        require_actor(actor)?;
        let at = resolve_at(at);

        let mut snapshot = self.repo.begin_snapshot().await?;
        let outcome = self.recover_in(&mut snapshot, checkpoint_id, actor, at).await;
        let result = settle(self.repo.as_ref(), snapshot, outcome).await;

        match &result {
            Ok(recovery) => info!(
                entity_type = CHECKPOINT_ENTITY,
                entity_id = checkpoint_id,
                from = "created",
                to = "recovered",
                actor = %actor,
                restored = recovery.restored.len(),
                rollback_target = %recovery.rollback_target,
                "checkpoint recovered"
            ),
            Err(err) => debug!(
                entity_type = CHECKPOINT_ENTITY,
                entity_id = checkpoint_id,
                actor = %actor,
                error = %err,
                "checkpoint recovery rejected"
            ),
        }
        result
    }

    async fn recover_in(
        &self,
        snapshot: &mut R::Snapshot,
        checkpoint_id: &str,
        actor: &Actor,
        at: Timestamp,
    ) -> Result<RecoveryResult, WorkflowError> {
        let mut checkpoint = self.load_open(snapshot, checkpoint_id).await?;

        if self.config.verify_digest {
            let actual = snapshot_digest(&checkpoint.id, &checkpoint.snapshot_entities)?;
            if actual != checkpoint.snapshot_digest {
                return Err(WorkflowError::corrupted(
                    CHECKPOINT_ENTITY,
                    checkpoint_id,
                    "snapshot digest mismatch",
                ));
            }
        }

        let mut restored = Vec::with_capacity(checkpoint.snapshot_entities.len());
        let mut removed = 0usize;
        for entry in &checkpoint.snapshot_entities {
            match (entry.existed, &entry.state) {
                (true, Some(state)) => {
                    self.repo
                        .save_entity(snapshot, &entry.entity_type, &entry.entity_id, state.clone())
                        .await?;
                }
                (false, _) => {
                    self.repo
                        .remove_entity(snapshot, &entry.entity_type, &entry.entity_id)
                        .await?;
                    removed += 1;
                }
                (true, None) => {
                    return Err(WorkflowError::corrupted(
                        CHECKPOINT_ENTITY,
                        checkpoint_id,
                        format!("snapshot of {} has no captured state", entry.entity_ref()),
                    ))
                }
            }
            restored.push(entry.entity_ref());
        }

        checkpoint.status = CheckpointStatus::Recovered;
        checkpoint.updated_at = at;
        checkpoint.recovered_at = Some(at);
        self.store(snapshot, &checkpoint).await?;

        let transition = Transition::new(
            CHECKPOINT_ENTITY,
            &checkpoint.id,
            CheckpointStatus::Created.as_str(),
            CheckpointStatus::Recovered.as_str(),
            actor,
            at,
        )
        .reason(format!(
            "checkpoint '{}' recovered to {}",
            checkpoint.name, checkpoint.rollback_target
        ))
        .metadata(
            Metadata::new(TransitionKind::CheckpointRecovered)
                .with(MetaKey::CheckpointName, checkpoint.name.as_str())
                .with(MetaKey::RollbackTarget, checkpoint.rollback_target.as_str())
                .with(MetaKey::RestoredCount, restored.len().to_string())
                .with(MetaKey::RemovedCount, removed.to_string()),
        )
        .build();
        self.repo.append_audit_transition(snapshot, transition).await?;

        Ok(RecoveryResult {
            rollback_target: checkpoint.rollback_target.clone(),
            checkpoint,
            restored,
        })
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    /// Collapse duplicates (first occurrence wins) and enforce the ref rules.
    fn normalize_refs(&self, refs: Vec<EntityRef>) -> Result<Vec<EntityRef>, WorkflowError> {
        let mut seen = BTreeSet::new();
        let mut unique = Vec::with_capacity(refs.len());
        for entity_ref in refs {
            require_non_blank("snapshot ref entity type", &entity_ref.entity_type)?;
            require_non_blank("snapshot ref entity id", &entity_ref.entity_id)?;
            if entity_ref.entity_type == CHECKPOINT_ENTITY {
                return Err(WorkflowError::Validation(
                    "a checkpoint cannot capture another checkpoint".into(),
                ));
            }
            if seen.insert(entity_ref.clone()) {
                unique.push(entity_ref);
            }
        }
        if unique.len() > self.config.max_snapshot_refs {
            return Err(WorkflowError::Validation(format!(
                "checkpoint captures {} entities, limit is {}",
                unique.len(),
                self.config.max_snapshot_refs
            )));
        }
        Ok(unique)
    }

    /// Load a checkpoint for update and require it to still be `created`.
    async fn load_open(
        &self,
        snapshot: &mut R::Snapshot,
        checkpoint_id: &str,
    ) -> Result<Checkpoint, WorkflowError> {
        let stored = self
            .repo
            .get_entity_for_update(snapshot, CHECKPOINT_ENTITY, checkpoint_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found(CHECKPOINT_ENTITY, checkpoint_id))?;
        let checkpoint = decode(stored)?;
        if checkpoint.status.is_terminal() {
            return Err(WorkflowError::conflict(
                CHECKPOINT_ENTITY,
                checkpoint_id,
                format!("checkpoint is already {}", checkpoint.status),
            ));
        }
        Ok(checkpoint)
    }

    async fn store(
        &self,
        snapshot: &mut R::Snapshot,
        checkpoint: &Checkpoint,
    ) -> Result<(), WorkflowError> {
        let value = serde_json::to_value(checkpoint).map_err(|e| {
            WorkflowError::corrupted(CHECKPOINT_ENTITY, &checkpoint.id, e.to_string())
        })?;
        self.repo
            .save_entity(snapshot, CHECKPOINT_ENTITY, &checkpoint.id, value)
            .await?;
        Ok(())
    }
}

fn decode(stored: StoredEntity) -> Result<Checkpoint, WorkflowError> {
    serde_json::from_value(stored.value)
        .map_err(|e| WorkflowError::corrupted(CHECKPOINT_ENTITY, &stored.entity_id, e.to_string()))
}

/// Lowercase hex SHA-256 of the canonical JSON encoding of `entries`.
///
/// `serde_json` maps keep their keys sorted, so equal snapshots always
/// encode to the same bytes.
pub fn snapshot_digest(
    checkpoint_id: &str,
    entries: &[SnapshotEntry],
) -> Result<String, WorkflowError> {
    let bytes = serde_json::to_vec(entries)
        .map_err(|e| WorkflowError::corrupted(CHECKPOINT_ENTITY, checkpoint_id, e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}
