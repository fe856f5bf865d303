use std::sync::Arc;

use tether_storage::Repository;

use crate::activity::ActivityQuery;
use crate::approval::{ApprovalGate, OutboundActionPort};
use crate::audit::AuditTrail;
use crate::checkpoint::CheckpointManager;
use crate::config::WorkflowConfig;
use crate::jobs::JobRunTracker;

/// Wires one repository, one outbound port and one config into the five
/// workflow components. Components are cheap handles sharing the same
/// repository.
pub struct Workflow<R> {
    repo: Arc<R>,
    port: Arc<dyn OutboundActionPort>,
    config: WorkflowConfig,
}

impl<R: Repository> Workflow<R> {
    pub fn new(repo: Arc<R>, port: Arc<dyn OutboundActionPort>, config: WorkflowConfig) -> Self {
        Self { repo, port, config }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn audit(&self) -> AuditTrail<R> {
        AuditTrail::new(self.repo.clone())
    }

    pub fn activity(&self) -> ActivityQuery<R> {
        ActivityQuery::new(self.audit())
    }

    pub fn checkpoints(&self) -> CheckpointManager<R> {
        CheckpointManager::new(self.repo.clone(), self.config.checkpoints.clone())
    }

    pub fn approvals(&self) -> ApprovalGate<R> {
        ApprovalGate::new(self.repo.clone(), self.port.clone())
    }

    pub fn jobs(&self) -> JobRunTracker<R> {
        JobRunTracker::new(self.repo.clone())
    }
}
