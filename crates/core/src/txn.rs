//! Snapshot plumbing shared by every mutating operation.

use tether_storage::{Actor, AuditTransition, Repository, Timestamp};
use tracing::warn;
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::metadata::Metadata;

/// Pseudo-state recorded as `from_state` when an entity is first created.
pub const NONE_STATE: &str = "none";

/// Commit `snapshot` if `outcome` succeeded, otherwise abort it and hand
/// the original error back.
///
/// An abort failure is logged and swallowed: the operation's own error is
/// the one the caller needs, and a dropped snapshot rolls back anyway.
pub(crate) async fn settle<R, T>(
    repo: &R,
    snapshot: R::Snapshot,
    outcome: Result<T, WorkflowError>,
) -> Result<T, WorkflowError>
where
    R: Repository,
{
    match outcome {
        Ok(value) => {
            repo.commit_snapshot(snapshot).await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(abort_err) = repo.abort_snapshot(snapshot).await {
                warn!(error = %abort_err, "snapshot abort failed after operation error");
            }
            Err(err)
        }
    }
}

pub(crate) fn resolve_at(at: Option<Timestamp>) -> Timestamp {
    at.unwrap_or_else(Timestamp::now)
}

/// No implicit actors: every operation gets one explicitly and it must name
/// someone.
pub(crate) fn require_actor(actor: &Actor) -> Result<(), WorkflowError> {
    if actor.id.trim().is_empty() {
        return Err(WorkflowError::Validation("actor id must not be empty".into()));
    }
    Ok(())
}

pub(crate) fn require_non_blank(field: &str, value: &str) -> Result<(), WorkflowError> {
    if value.trim().is_empty() {
        return Err(WorkflowError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Builder for transitions appended by the core.
pub(crate) struct Transition {
    inner: AuditTransition,
}

impl Transition {
    pub(crate) fn new(
        entity_type: &str,
        entity_id: &str,
        from_state: &str,
        to_state: &str,
        actor: &Actor,
        at: Timestamp,
    ) -> Self {
        Self {
            inner: AuditTransition {
                // v7 ids are time-ordered, so equal `at` values still sort in
                // append order under the (at, id) feed rule.
                id: Uuid::now_v7().to_string(),
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
                from_state: from_state.to_string(),
                to_state: to_state.to_string(),
                actor: actor.clone(),
                reason: format!("{} -> {}", from_state, to_state),
                at,
                metadata: Default::default(),
            },
        }
    }

    pub(crate) fn reason(mut self, reason: impl Into<String>) -> Self {
        self.inner.reason = reason.into();
        self
    }

    pub(crate) fn metadata(mut self, metadata: Metadata) -> Self {
        self.inner.metadata = metadata.into_map();
        self
    }

    pub(crate) fn build(self) -> AuditTransition {
        self.inner
    }
}
