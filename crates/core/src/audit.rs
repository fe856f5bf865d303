//! Append-only audit trail over a [`Repository`].

use std::sync::Arc;

use tether_storage::{ActorKind, AuditQuery, AuditTransition, Repository, Timestamp};
use tracing::debug;

use crate::error::WorkflowError;
use crate::txn::settle;

/// Filter for [`AuditTrail::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub actor_kind: Option<ActorKind>,
    /// Restrict to transitions made by `ai` actors.
    pub ai_only: bool,
    pub limit: Option<usize>,
    /// Exclusive upper bound on `at`.
    pub before_at: Option<Timestamp>,
}

impl AuditFilter {
    pub fn for_entity(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            entity_id: Some(entity_id.into()),
            ..Self::default()
        }
    }

    pub fn ai_only() -> Self {
        Self {
            ai_only: true,
            ..Self::default()
        }
    }

    /// Backend query for this filter, or `None` when the filter can match
    /// nothing (`ai_only` with a non-ai `actor_kind`, or `limit = 0`).
    pub fn to_query(&self) -> Option<AuditQuery> {
        let actor_kind = match (self.ai_only, self.actor_kind) {
            (true, Some(kind)) if kind != ActorKind::Ai => return None,
            (true, _) => Some(ActorKind::Ai),
            (false, kind) => kind,
        };
        if self.limit == Some(0) {
            return None;
        }
        Some(AuditQuery {
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
            actor_kind,
            before_at: self.before_at,
            limit: self.limit,
        })
    }
}

/// The single source of historical truth.
///
/// Appends never inspect content; reads come back newest-first.
pub struct AuditTrail<R> {
    repo: Arc<R>,
}

impl<R> Clone for AuditTrail<R> {
    fn clone(&self) -> Self {
        Self {
            repo: self.repo.clone(),
        }
    }
}

impl<R: Repository> AuditTrail<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Append one transition in its own snapshot. Returns the audit cursor
    /// after the append.
    pub async fn append(&self, transition: AuditTransition) -> Result<u64, WorkflowError> {
        let mut snapshot = self.repo.begin_snapshot().await?;
        let outcome = self
            .repo
            .append_audit_transition(&mut snapshot, transition)
            .await
            .map_err(WorkflowError::from);
        let cursor = settle(self.repo.as_ref(), snapshot, outcome).await?;
        debug!(cursor, "audit transition appended");
        Ok(cursor)
    }

    /// Filtered transitions, newest-first by `(at, id)`.
    pub async fn list(&self, filter: &AuditFilter) -> Result<Vec<AuditTransition>, WorkflowError> {
        match filter.to_query() {
            Some(query) => Ok(self.repo.list_audit_trail(&query).await?),
            None => Ok(Vec::new()),
        }
    }

    /// Full history of one entity, newest-first.
    pub async fn history(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditTransition>, WorkflowError> {
        self.list(&AuditFilter::for_entity(entity_type, entity_id))
            .await
    }

    /// Number of committed transitions; what a checkpoint records as its
    /// `audit_cursor`.
    pub async fn cursor(&self) -> Result<u64, WorkflowError> {
        Ok(self.repo.audit_cursor().await?)
    }
}
