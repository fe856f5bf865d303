use async_trait::async_trait;

use crate::error::StorageError;
use crate::record::{AuditQuery, AuditTransition, StoredEntity};

/// The storage trait the workflow core is written against.
///
/// A `Repository` provides keyed entity storage, an append-only audit trail,
/// and a transaction boundary spanning both.
///
/// ## Snapshot Semantics
///
/// All mutating operations take `&mut Self::Snapshot`, a type representing an
/// in-progress transaction. The lifecycle is:
///
/// 1. `begin_snapshot()` -- start a transaction, returns a `Snapshot`
/// 2. Read with `get_entity_for_update`, mutate with `save_entity`,
///    `remove_entity` and `append_audit_transition`
/// 3. `commit_snapshot(snapshot)` -- commit and consume the transaction
///    OR `abort_snapshot(snapshot)` -- roll back and consume the transaction
///
/// If a `Snapshot` is dropped without committing, the underlying transaction
/// MUST be rolled back. Writes staged in a snapshot MUST be invisible to the
/// query operations until commit.
///
/// ## Serialization
///
/// Two snapshots that read and then write the same entity MUST NOT both
/// commit based on the same read. Backends may achieve this by serializing
/// snapshots outright (the in-memory backend does) or with row locks taken by
/// `get_entity_for_update`. A caller therefore must never open a second
/// snapshot while it still holds one on the same task.
///
/// ## Append-only audit
///
/// There is no operation that mutates or deletes an audit transition.
#[async_trait]
pub trait Repository: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this storage backend.
    type Snapshot: Send;

    // ── Snapshot lifecycle ────────────────────────────────────────────────────

    /// Begin a new snapshot (transaction).
    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    /// Commit a snapshot, making all staged writes durable and visible.
    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    /// Abort (roll back) a snapshot, discarding all staged writes.
    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Entity operations (within snapshot) ──────────────────────────────────

    /// Read an entity as seen by this snapshot (its own staged writes
    /// included), locking it against concurrent snapshots.
    ///
    /// Returns `Ok(None)` if the entity does not exist.
    async fn get_entity_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<StoredEntity>, StorageError>;

    /// Insert or replace an entity's value. Returns the new version.
    async fn save_entity(
        &self,
        snapshot: &mut Self::Snapshot,
        entity_type: &str,
        entity_id: &str,
        value: serde_json::Value,
    ) -> Result<i64, StorageError>;

    /// Delete an entity. Returns whether it existed.
    async fn remove_entity(
        &self,
        snapshot: &mut Self::Snapshot,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<bool, StorageError>;

    // ── Audit operations (within snapshot) ───────────────────────────────────

    /// Append one transition to the audit trail.
    ///
    /// Never rejects a transition based on its content. Returns the audit
    /// cursor (trail length) the transition will have produced once the
    /// snapshot commits.
    async fn append_audit_transition(
        &self,
        snapshot: &mut Self::Snapshot,
        transition: AuditTransition,
    ) -> Result<u64, StorageError>;

    // ── Query operations (outside snapshot, committed data only) ─────────────

    /// Read an entity's committed value without locking.
    async fn get_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<StoredEntity>, StorageError>;

    /// List every committed entity of one type, ordered by entity id.
    async fn list_entities(&self, entity_type: &str) -> Result<Vec<StoredEntity>, StorageError>;

    /// Query the committed audit trail.
    ///
    /// Results MUST be ordered newest-first by `(at, id)` descending
    /// (see [`AuditTransition::newest_first`]) with `query.limit` applied
    /// after filtering.
    async fn list_audit_trail(
        &self,
        query: &AuditQuery,
    ) -> Result<Vec<AuditTransition>, StorageError>;

    /// Number of committed audit transitions.
    async fn audit_cursor(&self) -> Result<u64, StorageError>;
}
