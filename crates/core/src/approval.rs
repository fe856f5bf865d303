//! Human approval gate in front of outbound side effects.
//!
//! An action moves its entity's gating field `idle -> pending_approval ->
//! terminal`. Only a `user` actor can approve, and the outbound port runs
//! inside the same snapshot as the state check, so two concurrent approvals
//! cannot both reach it.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_storage::{
    Actor, ActorKind, AuditTransition, EntityRef, Repository, StoredEntity, Timestamp,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::error::WorkflowError;
use crate::metadata::{MetaKey, Metadata, TransitionKind};
use crate::txn::{require_actor, require_non_blank, resolve_at, settle, Transition};

pub const PENDING_APPROVAL: &str = "pending_approval";

/// Field written next to the terminal state once the port has run.
pub const EXECUTION_ID_FIELD: &str = "executionId";

// ── Action vocabulary ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CalendarSync,
    DraftExecution,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CalendarSync => "calendar_sync",
            Self::DraftExecution => "draft_execution",
        }
    }

    /// The only entity type that owns this action.
    pub fn entity_type(&self) -> &'static str {
        match self {
            Self::CalendarSync => "event",
            Self::DraftExecution => "draft",
        }
    }

    pub fn gating_field(&self) -> &'static str {
        match self {
            Self::CalendarSync => "syncState",
            Self::DraftExecution => "status",
        }
    }

    pub fn idle_state(&self) -> &'static str {
        match self {
            Self::CalendarSync => "local_only",
            Self::DraftExecution => "draft",
        }
    }

    pub fn terminal_state(&self) -> &'static str {
        match self {
            Self::CalendarSync => "synced",
            Self::DraftExecution => "executed",
        }
    }

    pub fn state_literal(&self, state: GateState) -> &'static str {
        match state {
            GateState::Idle => self.idle_state(),
            GateState::PendingApproval => PENDING_APPROVAL,
            GateState::Terminal => self.terminal_state(),
        }
    }

    /// Current gate state of an entity value. An absent (or null) gating
    /// field reads as idle; an unrecognized literal yields `None`.
    pub fn read_state(&self, value: &Value) -> Option<GateState> {
        match value.get(self.gating_field()) {
            None | Some(Value::Null) => Some(GateState::Idle),
            Some(Value::String(s)) if s == self.idle_state() => Some(GateState::Idle),
            Some(Value::String(s)) if s == PENDING_APPROVAL => Some(GateState::PendingApproval),
            Some(Value::String(s)) if s == self.terminal_state() => Some(GateState::Terminal),
            Some(_) => None,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "calendar_sync" => Ok(Self::CalendarSync),
            "draft_execution" => Ok(Self::DraftExecution),
            other => Err(WorkflowError::Validation(format!(
                "unknown action type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    PendingApproval,
    Terminal,
}

// ── Outbound port ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundAction {
    pub action_type: ActionType,
    pub entity_type: String,
    pub entity_id: String,
    /// `{entity_type}/{entity_id}@v{version}` of the pending entity the
    /// approval was decided on. Stable across approvals whose snapshot
    /// aborted, since an aborted snapshot never bumps the version.
    pub idempotency_key: String,
}

impl OutboundAction {
    fn for_entity(action: ActionType, entity: &StoredEntity) -> Self {
        Self {
            action_type: action,
            entity_type: entity.entity_type.clone(),
            entity_id: entity.entity_id.clone(),
            idempotency_key: format!(
                "{}/{}@v{}",
                entity.entity_type, entity.entity_id, entity.version
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReceipt {
    pub execution_id: String,
}

/// Failure reported by an [`OutboundActionPort`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutionError {
    message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The external side effect behind an approval (calendar push, draft send).
///
/// The gate calls the port before it writes the terminal state, so a
/// storage failure after a successful call leaves the entity pending and a
/// later approval calls the port again with the same
/// [`OutboundAction::idempotency_key`]. Implementations must deduplicate on
/// that key and answer a repeated key with the original receipt. The gate
/// itself never retries.
#[async_trait]
pub trait OutboundActionPort: Send + Sync {
    async fn execute(&self, action: &OutboundAction) -> Result<ExecutionReceipt, ExecutionError>;
}

// ── Gate ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResult {
    pub action_type: ActionType,
    pub entity: EntityRef,
    pub state: String,
    pub execution_id: String,
    pub approved_by: Actor,
    pub approved_at: Timestamp,
}

pub struct ApprovalGate<R> {
    repo: Arc<R>,
    port: Arc<dyn OutboundActionPort>,
}

impl<R> Clone for ApprovalGate<R> {
    fn clone(&self) -> Self {
        Self {
            repo: self.repo.clone(),
            port: self.port.clone(),
        }
    }
}

impl<R: Repository> ApprovalGate<R> {
    pub fn new(repo: Arc<R>, port: Arc<dyn OutboundActionPort>) -> Self {
        Self { repo, port }
    }

    /// Move an idle entity to `pending_approval`. Any actor kind may ask.
    pub async fn request_approval(
        &self,
        action_type: &str,
        entity_type: &str,
        entity_id: &str,
        actor: &Actor,
        at: Option<Timestamp>,
    ) -> Result<AuditTransition, WorkflowError> {
        let action = parse_action(action_type, entity_type, entity_id)?;
        require_actor(actor)?;
        let at = resolve_at(at);

        let mut snapshot = self.repo.begin_snapshot().await?;
        let outcome = self
            .request_in(&mut snapshot, action, entity_id, actor, at)
            .await;
        let result = settle(self.repo.as_ref(), snapshot, outcome).await;

        match &result {
            Ok(t) => info!(
                entity_type = %t.entity_type,
                entity_id = %t.entity_id,
                from = %t.from_state,
                to = %t.to_state,
                actor = %actor,
                "approval requested"
            ),
            Err(err) => debug!(
                action = %action,
                entity_id,
                actor = %actor,
                error = %err,
                "approval request rejected"
            ),
        }
        result
    }

    async fn request_in(
        &self,
        snapshot: &mut R::Snapshot,
        action: ActionType,
        entity_id: &str,
        actor: &Actor,
        at: Timestamp,
    ) -> Result<AuditTransition, WorkflowError> {
        let entity_type = action.entity_type();
        let entity = self
            .repo
            .get_entity_for_update(snapshot, entity_type, entity_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found(entity_type, entity_id))?;

        let from = match action.read_state(&entity.value) {
            Some(GateState::Idle) => action.idle_state(),
            Some(state) => {
                return Err(WorkflowError::conflict(
                    entity_type,
                    entity_id,
                    format!("{} is already {}", action, action.state_literal(state)),
                ))
            }
            None => return Err(unrecognized_state(action, entity_id)),
        };

        let mut value = entity.value;
        set_field(&mut value, action, entity_id, action.gating_field(), PENDING_APPROVAL)?;
        self.repo
            .save_entity(snapshot, entity_type, entity_id, value)
            .await?;

        let transition = Transition::new(entity_type, entity_id, from, PENDING_APPROVAL, actor, at)
            .reason(format!("{} requested", action))
            .metadata(
                Metadata::new(TransitionKind::ApprovalRequested)
                    .with(MetaKey::ActionType, action.as_str()),
            )
            .build();
        self.repo
            .append_audit_transition(snapshot, transition.clone())
            .await?;
        Ok(transition)
    }

    /// Decide on a pending action.
    ///
    /// Checks run in a fixed order: input, existence, authority (`user`
    /// only), pending state, then the decision itself. A rejection
    /// (`approved == false`) fails with a validation error and changes
    /// nothing. An approval invokes the outbound port exactly once and
    /// records the terminal state, the execution id and the transition in
    /// the same snapshot.
    pub async fn approve(
        &self,
        action_type: &str,
        entity_type: &str,
        entity_id: &str,
        approved: bool,
        actor: &Actor,
        at: Option<Timestamp>,
    ) -> Result<ApprovalResult, WorkflowError> {
        let action = parse_action(action_type, entity_type, entity_id)?;
        require_actor(actor)?;
        let at = resolve_at(at);

        let mut snapshot = self.repo.begin_snapshot().await?;
        let outcome = self
            .approve_in(&mut snapshot, action, entity_id, approved, actor, at)
            .await;
        let result = settle(self.repo.as_ref(), snapshot, outcome).await;

        match &result {
            Ok(r) => info!(
                entity_type = %r.entity.entity_type,
                entity_id = %r.entity.entity_id,
                from = PENDING_APPROVAL,
                to = %r.state,
                actor = %actor,
                execution_id = %r.execution_id,
                "outbound action approved and executed"
            ),
            Err(err) => debug!(
                action = %action,
                entity_id,
                actor = %actor,
                approved,
                error = %err,
                "approval rejected"
            ),
        }
        result
    }

    async fn approve_in(
        &self,
        snapshot: &mut R::Snapshot,
        action: ActionType,
        entity_id: &str,
        approved: bool,
        actor: &Actor,
        at: Timestamp,
    ) -> Result<ApprovalResult, WorkflowError> {
        let entity_type = action.entity_type();
        let entity = self
            .repo
            .get_entity_for_update(snapshot, entity_type, entity_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found(entity_type, entity_id))?;

        if actor.kind != ActorKind::User {
            return Err(WorkflowError::Forbidden(format!(
                "{} actors cannot approve {}",
                actor.kind, action
            )));
        }

        match action.read_state(&entity.value) {
            Some(GateState::PendingApproval) => {}
            Some(state) => {
                return Err(WorkflowError::conflict(
                    entity_type,
                    entity_id,
                    format!(
                        "{} is {}, not {}",
                        action.gating_field(),
                        action.state_literal(state),
                        PENDING_APPROVAL
                    ),
                ))
            }
            None => return Err(unrecognized_state(action, entity_id)),
        }

        if !approved {
            return Err(WorkflowError::Validation(format!(
                "{} for {}/{} was rejected",
                action, entity_type, entity_id
            )));
        }

        let request = OutboundAction::for_entity(action, &entity);
        let receipt = self
            .port
            .execute(&request)
            .await
            .map_err(|source| execution_failed(entity_type, entity_id, source))?;
        if receipt.execution_id.trim().is_empty() {
            return Err(execution_failed(
                entity_type,
                entity_id,
                ExecutionError::new("port returned an empty execution id"),
            ));
        }

        let terminal = action.terminal_state();
        let mut value = entity.value;
        set_field(&mut value, action, entity_id, action.gating_field(), terminal)?;
        set_field(
            &mut value,
            action,
            entity_id,
            EXECUTION_ID_FIELD,
            &receipt.execution_id,
        )?;
        self.repo
            .save_entity(snapshot, entity_type, entity_id, value)
            .await?;

        let transition =
            Transition::new(entity_type, entity_id, PENDING_APPROVAL, terminal, actor, at)
                .reason(format!("{} approved", action))
                .metadata(
                    Metadata::new(TransitionKind::ActionExecuted)
                        .with(MetaKey::ActionType, action.as_str())
                        .with(MetaKey::ExecutionId, receipt.execution_id.as_str()),
                )
                .build();
        self.repo.append_audit_transition(snapshot, transition).await?;

        Ok(ApprovalResult {
            action_type: action,
            entity: EntityRef::new(entity_type, entity_id),
            state: terminal.to_string(),
            execution_id: receipt.execution_id,
            approved_by: actor.clone(),
            approved_at: at,
        })
    }
}

fn parse_action(
    action_type: &str,
    entity_type: &str,
    entity_id: &str,
) -> Result<ActionType, WorkflowError> {
    let action: ActionType = action_type.parse()?;
    if action.entity_type() != entity_type {
        return Err(WorkflowError::Validation(format!(
            "{} applies to '{}' entities, not '{}'",
            action,
            action.entity_type(),
            entity_type
        )));
    }
    require_non_blank("entity id", entity_id)?;
    Ok(action)
}

fn set_field(
    value: &mut Value,
    action: ActionType,
    entity_id: &str,
    field: &str,
    literal: &str,
) -> Result<(), WorkflowError> {
    match value.as_object_mut() {
        Some(object) => {
            object.insert(field.to_string(), Value::String(literal.to_string()));
            Ok(())
        }
        None => Err(WorkflowError::corrupted(
            action.entity_type(),
            entity_id,
            "entity value is not a JSON object",
        )),
    }
}

fn unrecognized_state(action: ActionType, entity_id: &str) -> WorkflowError {
    WorkflowError::conflict(
        action.entity_type(),
        entity_id,
        format!("unrecognized {} value", action.gating_field()),
    )
}

fn execution_failed(entity_type: &str, entity_id: &str, source: ExecutionError) -> WorkflowError {
    WorkflowError::Execution {
        entity_type: entity_type.to_string(),
        entity_id: entity_id.to_string(),
        source,
    }
}
