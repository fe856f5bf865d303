//! Read-only activity feed composed over the audit trail.

use std::collections::BTreeMap;

use serde::Serialize;
use tether_storage::{ActorKind, AuditTransition, Repository, Timestamp};

use crate::audit::{AuditFilter, AuditTrail};
use crate::error::WorkflowError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityFilter {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub actor_kind: Option<ActorKind>,
    pub ai_only: bool,
    /// Inclusive lower bound on `at`.
    pub since: Option<Timestamp>,
    /// Exclusive upper bound on `at`.
    pub before_at: Option<Timestamp>,
    pub limit: Option<usize>,
}

impl ActivityFilter {
    /// What AI actors did, newest first.
    pub fn ai_only(limit: Option<usize>) -> Self {
        Self {
            ai_only: true,
            limit,
            ..Self::default()
        }
    }

    fn audit_filter(&self, limit: Option<usize>) -> AuditFilter {
        AuditFilter {
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
            actor_kind: self.actor_kind,
            ai_only: self.ai_only,
            limit,
            before_at: self.before_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySummary {
    pub total: usize,
    pub by_actor_kind: BTreeMap<ActorKind, usize>,
    pub latest_at: Option<Timestamp>,
}

pub struct ActivityQuery<R> {
    trail: AuditTrail<R>,
}

impl<R> Clone for ActivityQuery<R> {
    fn clone(&self) -> Self {
        Self {
            trail: self.trail.clone(),
        }
    }
}

impl<R: Repository> ActivityQuery<R> {
    pub fn new(trail: AuditTrail<R>) -> Self {
        Self { trail }
    }

    /// Filtered transitions, newest first, at most `limit` of them.
    pub async fn feed(
        &self,
        filter: &ActivityFilter,
    ) -> Result<Vec<AuditTransition>, WorkflowError> {
        if filter.limit == Some(0) {
            return Ok(Vec::new());
        }
        let Some(since) = filter.since else {
            return self.trail.list(&filter.audit_filter(filter.limit)).await;
        };

        // The lower bound is applied here, so the limit has to wait for it.
        let mut items = self.trail.list(&filter.audit_filter(None)).await?;
        // Newest-first: everything older than `since` sits at the tail.
        let keep = items.iter().take_while(|t| t.at >= since).count();
        items.truncate(keep);
        if let Some(limit) = filter.limit {
            items.truncate(limit);
        }
        Ok(items)
    }

    /// Per-actor-kind totals over the filtered window. `limit` is ignored.
    pub async fn summary(&self, filter: &ActivityFilter) -> Result<ActivitySummary, WorkflowError> {
        let unbounded = ActivityFilter {
            limit: None,
            ..filter.clone()
        };
        let items = self.feed(&unbounded).await?;

        let mut summary = ActivitySummary {
            total: items.len(),
            latest_at: items.first().map(|t| t.at),
            ..ActivitySummary::default()
        };
        for transition in &items {
            *summary.by_actor_kind.entry(transition.actor.kind).or_insert(0) += 1;
        }
        Ok(summary)
    }
}
